//! Raw Bluetooth RFCOMM socket using libc.
//!
//! ELM327 dongles expose a Serial Port Profile channel, which on Linux is an
//! AF_BLUETOOTH + SOCK_STREAM + BTPROTO_RFCOMM socket. std has no Bluetooth
//! support, so this goes through libc directly.

use crate::error::TransportError;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

// Bluetooth socket constants (from <bluetooth/bluetooth.h> and <bluetooth/rfcomm.h>)
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_RFCOMM: i32 = 3;

/// sockaddr_rc structure for RFCOMM connections.
#[repr(C)]
struct SockaddrRc {
    rc_family: u16,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

/// A connected Bluetooth RFCOMM socket.
///
/// All operations take `&self` (they are fd-level syscalls), so the socket can
/// be shared behind an `Arc` and shut down from another thread to unblock a
/// reader.
pub struct RfcommSocket {
    fd: RawFd,
}

impl RfcommSocket {
    /// Connect to `addr` ("XX:XX:XX:XX:XX:XX") on the given RFCOMM channel.
    ///
    /// The connect itself is bounded by `connect_timeout`; read/write timeouts
    /// start out at the same value and are adjusted afterwards by the caller.
    pub fn connect(addr: &str, channel: u8, connect_timeout: Duration) -> Result<Self, TransportError> {
        let bdaddr = parse_bdaddr(addr)?;

        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_STREAM, BTPROTO_RFCOMM) };
        if fd < 0 {
            return Err(TransportError::Io(io::Error::last_os_error()));
        }
        // From here on the fd is owned by `sock`, so error paths close it.
        let sock = Self { fd };

        // Non-blocking connect so the attempt can be bounded with poll(2);
        // a blocking RFCOMM connect can hang well past any useful deadline
        // when the adapter is out of range.
        sock.set_nonblocking(true)?;

        let sa = SockaddrRc {
            rc_family: AF_BLUETOOTH as u16,
            rc_bdaddr: bdaddr,
            rc_channel: channel,
        };
        let ret = unsafe {
            libc::connect(
                fd,
                &sa as *const SockaddrRc as *const libc::sockaddr,
                std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(TransportError::Io(err));
            }
            sock.wait_connected(connect_timeout)?;
        }

        sock.set_nonblocking(false)?;
        sock.set_timeouts(connect_timeout)?;
        Ok(sock)
    }

    /// Wait for an in-progress connect to finish, then check SO_ERROR.
    fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret == 0 {
            return Err(TransportError::ConnectTimedOut);
        }
        if ret < 0 {
            return Err(TransportError::Io(io::Error::last_os_error()));
        }

        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(TransportError::Io(io::Error::last_os_error()));
        }
        if err != 0 {
            return Err(TransportError::Io(io::Error::from_raw_os_error(err)));
        }
        Ok(())
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        let ret = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Set both receive and send timeouts.
    fn set_timeouts(&self, timeout: Duration) -> io::Result<()> {
        for opt in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
            self.set_timeout_opt(opt, timeout)?;
        }
        Ok(())
    }

    /// Set the receive timeout. A read past the deadline fails with
    /// `WouldBlock`.
    pub fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_timeout_opt(libc::SO_RCVTIMEO, timeout)
    }

    fn set_timeout_opt(&self, opt: libc::c_int, timeout: Duration) -> io::Result<()> {
        // A zero timeval means "block forever", so keep at least 1ms.
        let timeout = timeout.max(Duration::from_millis(1));
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                opt,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Read into `buf`. Returns `Ok(0)` when the peer closed the connection;
    /// a receive timeout surfaces as `WouldBlock`.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Write all of `buf`, handling short writes.
    pub fn send_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = unsafe {
                libc::send(
                    self.fd,
                    buf[sent..].as_ptr() as *const libc::c_void,
                    buf.len() - sent,
                    0,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            sent += n as usize;
        }
        Ok(())
    }

    /// Shut down both directions, waking any thread blocked in `recv`.
    /// The fd itself stays open until drop.
    pub fn shutdown(&self) {
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
    }
}

impl Drop for RfcommSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Parse a Bluetooth address string "XX:XX:XX:XX:XX:XX" into 6 bytes.
/// BlueZ uses reversed byte order (LSB first).
pub fn parse_bdaddr(addr: &str) -> Result<[u8; 6], TransportError> {
    let parts: Vec<&str> = addr.split(':').collect();
    if parts.len() != 6 {
        return Err(TransportError::InvalidTarget(format!(
            "invalid BT address: {addr}"
        )));
    }
    let mut bdaddr = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(TransportError::InvalidTarget(format!(
                "invalid BT address byte: {part}"
            )));
        }
        bdaddr[5 - i] = u8::from_str_radix(part, 16).map_err(|_| {
            TransportError::InvalidTarget(format!("invalid BT address byte: {part}"))
        })?;
    }
    Ok(bdaddr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bdaddr() {
        let addr = parse_bdaddr("AA:BB:CC:DD:EE:FF").unwrap();
        // BlueZ reversed: FF:EE:DD:CC:BB:AA
        assert_eq!(addr, [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_parse_bdaddr_lowercase() {
        let addr = parse_bdaddr("a4:93:40:a0:87:57").unwrap();
        assert_eq!(addr, [0x57, 0x87, 0xA0, 0x40, 0x93, 0xA4]);
    }

    #[test]
    fn test_parse_bdaddr_invalid() {
        assert!(parse_bdaddr("not-an-address").is_err());
        assert!(parse_bdaddr("AA:BB:CC:DD:EE").is_err());
        assert!(parse_bdaddr("AA:BB:CC:DD:EE:XX").is_err());
        assert!(parse_bdaddr("AA:BB:CC:DD:EE:F").is_err());
    }
}
