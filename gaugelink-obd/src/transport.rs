//! Connection targets and the byte-stream transport beneath the engine.
//!
//! A [`Target`] names an adapter: a Bluetooth MAC plus RFCOMM channel, or a
//! TCP host and port (WiFi dongles and simulators). [`Transport`] is the open
//! socket, with the same surface for both kinds: bounded connect, tunable
//! read timeout, and a [`ShutdownHandle`] that can unblock a reader from
//! another thread.

use crate::config::ObdConfig;
use crate::error::TransportError;
use crate::rfcomm::RfcommSocket;
use log::debug;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default TCP port for WiFi ELM327 dongles and simulators.
pub const DEFAULT_TCP_PORT: u16 = 35000;

/// Default RFCOMM channel for Bluetooth SPP adapters.
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// Where to find the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Bluetooth RFCOMM: MAC address plus channel.
    Bluetooth { mac: String, channel: u8 },
    /// TCP: host (name or IP) plus port.
    Tcp { host: String, port: u16 },
}

impl FromStr for Target {
    type Err = TransportError;

    /// Parse a target string.
    ///
    /// A `tcp:` prefix forces TCP. A string with exactly five `:` separators
    /// is a Bluetooth MAC (channel defaults to 1). Anything else is
    /// `host[:port]` with the port defaulting to 35000.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (s, force_tcp) = match s.strip_prefix("tcp:") {
            Some(rest) => (rest, true),
            None => (s, false),
        };
        if s.is_empty() {
            return Err(TransportError::InvalidTarget(s.into()));
        }

        if !force_tcp && s.matches(':').count() == 5 {
            return Ok(Self::Bluetooth {
                mac: s.to_string(),
                channel: DEFAULT_RFCOMM_CHANNEL,
            });
        }

        let mut parts = s.splitn(2, ':');
        let host = parts.next().unwrap_or_default();
        if host.is_empty() {
            return Err(TransportError::InvalidTarget(s.into()));
        }
        let port = match parts.next() {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| TransportError::InvalidTarget(s.into()))?,
            None => DEFAULT_TCP_PORT,
        };
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bluetooth { mac, .. } => write!(f, "{mac}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// An open connection to the adapter.
pub enum Transport {
    Tcp(TcpStream),
    Rfcomm(Arc<RfcommSocket>),
}

impl Transport {
    /// Open a transport to `target`.
    ///
    /// The connect attempt is bounded by the configured connect timeout;
    /// afterwards the read timeout drops to the command timeout. The TCP path
    /// also consumes the adapter's initial prompt banner best-effort, the way
    /// WiFi dongles greet a new client.
    pub fn open(target: &Target, config: &ObdConfig) -> Result<Self, TransportError> {
        match target {
            Target::Tcp { host, port } => {
                let addr = resolve(host, *port)?;
                debug!("TCP connecting to {addr}");
                let stream = TcpStream::connect_timeout(&addr, config.connect_timeout())
                    .map_err(|e| {
                        if e.kind() == io::ErrorKind::TimedOut {
                            TransportError::ConnectTimedOut
                        } else {
                            TransportError::Io(e)
                        }
                    })?;
                stream.set_nodelay(true)?;
                stream.set_read_timeout(Some(config.command_timeout()))?;
                stream.set_write_timeout(Some(config.command_timeout()))?;

                // Some adapters greet with a banner and prompt on connect.
                let mut buf = [0u8; 64];
                if let Ok(n) = (&stream).read(&mut buf) {
                    debug!("Initial banner: {:?}", String::from_utf8_lossy(&buf[..n]));
                }

                Ok(Self::Tcp(stream))
            }
            Target::Bluetooth { mac, channel } => {
                debug!("RFCOMM connecting to {mac} channel {channel}");
                let sock = RfcommSocket::connect(mac, *channel, config.connect_timeout())?;
                sock.set_read_timeout(config.command_timeout())?;
                Ok(Self::Rfcomm(Arc::new(sock)))
            }
        }
    }

    /// Read into `buf`. `Ok(0)` means the peer closed; a timeout surfaces as
    /// `WouldBlock` or `TimedOut` depending on the socket type.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Rfcomm(sock) => sock.recv(buf),
        }
    }

    /// Write all of `buf`.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.write_all(buf),
            Self::Rfcomm(sock) => sock.send_all(buf),
        }
    }

    /// Adjust the read timeout; `timeout` is clamped to at least 1ms.
    pub fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        let timeout = timeout.max(Duration::from_millis(1));
        match self {
            Self::Tcp(stream) => stream.set_read_timeout(Some(timeout)),
            Self::Rfcomm(sock) => sock.set_read_timeout(timeout),
        }
    }

    /// Discard any buffered input, then restore the read timeout to
    /// `restore`. Used before initialization so stale bytes from a previous
    /// session cannot shift response framing.
    pub fn drain(&mut self, restore: Duration) {
        let mut buf = [0u8; 1024];
        if self.set_read_timeout(Duration::from_millis(100)).is_err() {
            return;
        }
        loop {
            match self.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => debug!("Drained {n} stale bytes"),
            }
        }
        let _ = self.set_read_timeout(restore);
    }

    /// A handle that can shut the socket down from another thread without
    /// holding the transport itself.
    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        match self {
            Self::Tcp(stream) => Ok(ShutdownHandle::Tcp(stream.try_clone()?)),
            Self::Rfcomm(sock) => Ok(ShutdownHandle::Rfcomm(Arc::clone(sock))),
        }
    }
}

/// Shuts a [`Transport`] down from outside the transaction lock, so a thread
/// blocked mid-read unwinds promptly on disconnect.
pub enum ShutdownHandle {
    Tcp(TcpStream),
    Rfcomm(Arc<RfcommSocket>),
}

impl ShutdownHandle {
    /// Half-close both directions. Errors are ignored; the socket may
    /// already be gone.
    pub fn shutdown(&self) {
        match self {
            Self::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Self::Rfcomm(sock) => sock.shutdown(),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::InvalidTarget(format!("{host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_is_bluetooth() {
        let target: Target = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(
            target,
            Target::Bluetooth {
                mac: "AA:BB:CC:DD:EE:FF".to_string(),
                channel: 1,
            }
        );
    }

    #[test]
    fn test_parse_host_port() {
        let target: Target = "10.0.0.174:35000".parse().unwrap();
        assert_eq!(
            target,
            Target::Tcp {
                host: "10.0.0.174".to_string(),
                port: 35000,
            }
        );
    }

    #[test]
    fn test_parse_bare_host_gets_default_port() {
        let target: Target = "192.168.0.10".parse().unwrap();
        assert_eq!(
            target,
            Target::Tcp {
                host: "192.168.0.10".to_string(),
                port: DEFAULT_TCP_PORT,
            }
        );
    }

    #[test]
    fn test_tcp_prefix_forces_tcp() {
        let target: Target = "tcp:localhost:4000".parse().unwrap();
        assert_eq!(
            target,
            Target::Tcp {
                host: "localhost".to_string(),
                port: 4000,
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<Target>().is_err());
        assert!("tcp:".parse::<Target>().is_err());
        assert!("host:notaport".parse::<Target>().is_err());
        assert!("host:99999".parse::<Target>().is_err());
        assert!(":5000".parse::<Target>().is_err());
    }

    #[test]
    fn test_display() {
        let bt: Target = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(bt.to_string(), "AA:BB:CC:DD:EE:FF");
        let tcp: Target = "tcp:example.com".parse().unwrap();
        assert_eq!(tcp.to_string(), "example.com:35000");
    }
}
