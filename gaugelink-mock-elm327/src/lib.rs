//! Mock ELM327 adapter for exercising the OBD engine without hardware
//!
//! Implements the adapter side of the wire protocol: per-client AT settings
//! (echo, linefeeds, spaces, headers), Mode 01 replies encoded from a mutable
//! vehicle state, and fault injection for failure-path tests. [`MockAdapter`]
//! serves it over TCP; tests hold shared handles and mutate the vehicle or
//! fault mid-connection.

use log::{debug, info, warn};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const ADAPTER_ID: &str = "ELM327 v1.5";

/// Pause between accept-loop polls and between response chunks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CHUNK_DELAY: Duration = Duration::from_millis(5);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Per-connection adapter settings (ELM327 power-on defaults).
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)] // These are independent ELM327 protocol flags
pub struct AdapterSettings {
    /// Echo received characters back (ATE0/ATE1)
    pub echo_enabled: bool,
    /// Add linefeeds after carriage returns (ATL0/ATL1)
    pub linefeeds_enabled: bool,
    /// Print spaces between response bytes (ATS0/ATS1)
    pub spaces_enabled: bool,
    /// Show header bytes in responses (ATH0/ATH1)
    pub headers_enabled: bool,
    /// Selected protocol (ATSP<n>, 0 = auto)
    pub protocol: u8,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            echo_enabled: true,
            linefeeds_enabled: true,
            spaces_enabled: true,
            headers_enabled: false,
            protocol: 0,
        }
    }
}

impl AdapterSettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Line ending per the linefeeds flag.
    #[must_use]
    pub const fn line_ending(&self) -> &'static str {
        if self.linefeeds_enabled {
            "\r\n"
        } else {
            "\r"
        }
    }

    /// Handle an AT command and return the full reply (line endings and
    /// prompt included). Mutates the settings the command changes.
    ///
    /// `battery_v` feeds the `ATRV` reply.
    pub fn handle_at_command(&mut self, command: &str, battery_v: f32) -> String {
        let cmd = command.to_uppercase();
        let le = self.line_ending();

        let response_text = match cmd.as_str() {
            "ATZ" => {
                *self = Self::default();
                // The reset reply already uses the restored defaults
                let le = self.line_ending();
                return format!("{le}{ADAPTER_ID}{le}>");
            }
            "ATE0" => {
                self.echo_enabled = false;
                "OK".to_string()
            }
            "ATE1" => {
                self.echo_enabled = true;
                "OK".to_string()
            }
            "ATL0" => {
                self.linefeeds_enabled = false;
                "OK".to_string()
            }
            "ATL1" => {
                self.linefeeds_enabled = true;
                "OK".to_string()
            }
            "ATS0" => {
                self.spaces_enabled = false;
                "OK".to_string()
            }
            "ATS1" => {
                self.spaces_enabled = true;
                "OK".to_string()
            }
            "ATH0" => {
                self.headers_enabled = false;
                "OK".to_string()
            }
            "ATH1" => {
                self.headers_enabled = true;
                "OK".to_string()
            }
            "ATI" => ADAPTER_ID.to_string(),
            "AT@1" => "OBDII to RS232 Interpreter".to_string(),
            "ATRV" => format!("{battery_v:.1}V"),
            _ if cmd.starts_with("ATSP") => {
                if let Ok(protocol) = cmd["ATSP".len()..].parse() {
                    self.protocol = protocol;
                }
                "OK".to_string()
            }
            _ => "?".to_string(),
        };

        // Line endings captured before the match: replies to commands that
        // change the linefeed flag still use the old setting
        format!("{le}{response_text}{le}>")
    }

    /// Insert the byte-pair spaces in a compact hex payload when the spaces
    /// flag is on.
    #[must_use]
    pub fn format_payload(&self, compact: &str) -> String {
        if !self.spaces_enabled {
            return compact.to_string();
        }
        compact
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The vehicle the mock reports. All fields live in adapter-native units.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub rpm: u32,
    pub map_kpa: u8,
    pub coolant_c: i32,
    pub speed_kph: u8,
    pub intake_c: i32,
    pub throttle_pct: u8,
    pub pedal_pct: u8,
    pub battery_v: f32,
}

impl Default for VehicleState {
    fn default() -> Self {
        // A warm car idling in the driveway
        Self {
            rpm: 800,
            map_kpa: 101,
            coolant_c: 85,
            speed_kph: 0,
            intake_c: 25,
            throttle_pct: 12,
            pedal_pct: 10,
            battery_v: 13.8,
        }
    }
}

impl VehicleState {
    /// Encode the Mode 01 payload for `pid` as compact hex, or `None` for a
    /// PID this vehicle does not report.
    #[must_use]
    pub fn encode_pid(&self, pid: &str) -> Option<String> {
        match pid {
            "00" => Some("BE3FA813".to_string()), // PIDs supported 01-20
            "05" => Some(format!("{:02X}", (self.coolant_c + 40).clamp(0, 255))),
            "0B" => Some(format!("{:02X}", self.map_kpa)),
            "0C" => Some(format!("{:04X}", self.rpm.saturating_mul(4).min(0xFFFF))),
            "0D" => Some(format!("{:02X}", self.speed_kph)),
            "0F" => Some(format!("{:02X}", (self.intake_c + 40).clamp(0, 255))),
            "11" => Some(format!("{:02X}", encode_percent(self.throttle_pct))),
            "49" | "4A" => Some(format!("{:02X}", encode_percent(self.pedal_pct))),
            _ => None,
        }
    }
}

/// Smallest byte whose truncating `A * 100 / 255` decode gives back `pct`.
fn encode_percent(pct: u8) -> u16 {
    (u16::from(pct.min(100)) * 255 + 99) / 100
}

/// What the mock does to data queries. AT commands always work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    /// Answer normally.
    #[default]
    None,
    /// Answer every data query with `NO DATA`.
    NoData,
    /// Answer every data query with `SEARCHING...`.
    Searching,
    /// Swallow data queries entirely (no reply, no prompt).
    Silent,
    /// Answer `?` to the supported-PIDs probe only; everything else works.
    RejectSupportedPids,
}

/// Reply to one command, or `None` to stay silent.
fn respond(
    command: &str,
    settings: &mut AdapterSettings,
    vehicle: &VehicleState,
    fault: Fault,
) -> Option<String> {
    let le = settings.line_ending();

    if command.starts_with("AT") {
        return Some(settings.handle_at_command(command, vehicle.battery_v));
    }

    if command.starts_with("01") && command.len() >= 4 {
        match fault {
            Fault::Silent => return None,
            Fault::NoData => return Some(format!("NO DATA{le}{le}>")),
            Fault::Searching => return Some(format!("SEARCHING...{le}{le}>")),
            Fault::RejectSupportedPids if command == "0100" => {
                return Some(format!("?{le}{le}>"));
            }
            Fault::None | Fault::RejectSupportedPids => {}
        }

        let pid = &command[2..4];
        return match vehicle.encode_pid(pid) {
            Some(data) => {
                let payload = settings.format_payload(&format!("41{pid}{data}"));
                Some(format!("{payload}{le}{le}>"))
            }
            None => Some(format!("NO DATA{le}{le}>")),
        };
    }

    Some(format!("?{le}{le}>"))
}

/// A TCP server speaking the adapter protocol.
///
/// Tests spawn one on an ephemeral port, point the engine at [`addr`], and
/// twist the shared vehicle/fault/chunking handles while it runs. Dropping
/// the adapter stops the listener.
///
/// [`addr`]: Self::addr
pub struct MockAdapter {
    addr: SocketAddr,
    vehicle: Arc<Mutex<VehicleState>>,
    fault: Arc<Mutex<Fault>>,
    chunk_size: Arc<Mutex<Option<usize>>>,
    stop: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl MockAdapter {
    /// Bind `listen` (e.g. `127.0.0.1:0` for an ephemeral port) and start
    /// serving clients, one thread each.
    pub fn spawn(listen: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen)?;
        let addr = listener.local_addr()?;
        // Non-blocking accept so the loop can notice the stop flag
        listener.set_nonblocking(true)?;
        info!("Mock ELM327 listening on {addr}");

        let vehicle = Arc::new(Mutex::new(VehicleState::default()));
        let fault = Arc::new(Mutex::new(Fault::None));
        let chunk_size = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let vehicle = Arc::clone(&vehicle);
            let fault = Arc::clone(&fault);
            let chunk_size = Arc::clone(&chunk_size);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                accept_loop(&listener, &vehicle, &fault, &chunk_size, &stop);
            })
        };

        Ok(Self {
            addr,
            vehicle,
            fault,
            chunk_size,
            stop,
            accept_thread: Some(accept_thread),
        })
    }

    /// The bound listen address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared handle to the reported vehicle state.
    #[must_use]
    pub fn vehicle(&self) -> Arc<Mutex<VehicleState>> {
        Arc::clone(&self.vehicle)
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock().unwrap() = fault;
    }

    /// Write replies in `size`-byte slices with short pauses, to exercise
    /// partial-read reassembly on the client. `None` writes whole replies.
    pub fn set_chunk_size(&self, size: Option<usize>) {
        *self.chunk_size.lock().unwrap() = size;
    }

    /// Stop accepting and wind down the listener thread. Client handler
    /// threads exit on their own once their peers hang up.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MockAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: &TcpListener,
    vehicle: &Arc<Mutex<VehicleState>>,
    fault: &Arc<Mutex<Fault>>,
    chunk_size: &Arc<Mutex<Option<usize>>>,
    stop: &Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("Client connected: {peer}");
                let vehicle = Arc::clone(vehicle);
                let fault = Arc::clone(fault);
                let chunk_size = Arc::clone(chunk_size);
                let stop = Arc::clone(stop);
                thread::spawn(move || {
                    handle_client(stream, &vehicle, &fault, &chunk_size, &stop);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // No connection waiting, sleep briefly and try again
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                warn!("Error accepting connection: {e}");
                break;
            }
        }
    }
}

fn handle_client(
    mut stream: TcpStream,
    vehicle: &Arc<Mutex<VehicleState>>,
    fault: &Arc<Mutex<Fault>>,
    chunk_size: &Arc<Mutex<Option<usize>>>,
    stop: &Arc<AtomicBool>,
) {
    if stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT)).is_err() {
        return;
    }

    let mut settings = AdapterSettings::new();

    // WiFi dongles greet a fresh client with an identification banner
    let le = settings.line_ending();
    let banner = format!("{le}{ADAPTER_ID}{le}>");
    if stream.write_all(banner.as_bytes()).is_err() {
        return;
    }

    let mut buffer = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) => {
                let ch = byte[0];

                // Echo character if enabled
                if settings.echo_enabled && stream.write_all(&byte).is_err() {
                    break;
                }

                // Carriage return terminates the command
                if ch == b'\r' {
                    let command = String::from_utf8_lossy(&buffer).trim().to_uppercase();
                    if !command.is_empty() {
                        debug!("RX: {command}");
                        let reply = {
                            let vehicle = vehicle.lock().unwrap();
                            respond(&command, &mut settings, &vehicle, *fault.lock().unwrap())
                        };
                        match reply {
                            Some(reply) => {
                                debug!("TX: {}", reply.escape_debug());
                                let chunk = *chunk_size.lock().unwrap();
                                if write_reply(&mut stream, reply.as_bytes(), chunk).is_err() {
                                    break;
                                }
                            }
                            None => debug!("TX: (swallowed)"),
                        }
                    }
                    buffer.clear();
                } else if ch != b'\n' {
                    // Accumulate command bytes (linefeeds are ignored)
                    buffer.push(ch);
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(e) => {
                warn!("Read error: {e}");
                break;
            }
        }
    }
}

fn write_reply(
    stream: &mut TcpStream,
    reply: &[u8],
    chunk_size: Option<usize>,
) -> std::io::Result<()> {
    match chunk_size {
        Some(size) if size > 0 => {
            for chunk in reply.chunks(size) {
                stream.write_all(chunk)?;
                stream.flush()?;
                thread::sleep(CHUNK_DELAY);
            }
            Ok(())
        }
        _ => stream.write_all(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_defaults() {
        let settings = AdapterSettings::default();
        assert!(settings.echo_enabled);
        assert!(settings.linefeeds_enabled);
        assert!(settings.spaces_enabled);
        assert!(!settings.headers_enabled);
        assert_eq!(settings.protocol, 0);
        assert_eq!(settings.line_ending(), "\r\n");
    }

    #[test]
    fn test_at_commands_toggle_settings() {
        let mut settings = AdapterSettings::new();

        let resp = settings.handle_at_command("ATE0", 13.8);
        assert!(resp.contains("OK"));
        assert!(!settings.echo_enabled);

        let resp = settings.handle_at_command("ATL0", 13.8);
        assert!(resp.contains("OK"));
        assert_eq!(settings.line_ending(), "\r");

        let resp = settings.handle_at_command("ATS0", 13.8);
        assert!(resp.contains("OK"));
        assert!(!settings.spaces_enabled);

        settings.handle_at_command("ATSP6", 13.8);
        assert_eq!(settings.protocol, 6);

        // Reset restores every default
        let resp = settings.handle_at_command("ATZ", 13.8);
        assert!(resp.contains("ELM327"));
        assert!(settings.echo_enabled);
        assert!(settings.spaces_enabled);
        assert_eq!(settings.protocol, 0);
    }

    #[test]
    fn test_unknown_at_command() {
        let mut settings = AdapterSettings::new();
        settings.handle_at_command("ATL0", 13.8);
        assert_eq!(settings.handle_at_command("ATXYZ", 13.8), "\r?\r>");
    }

    #[test]
    fn test_atrv_reports_battery() {
        let mut settings = AdapterSettings::new();
        settings.handle_at_command("ATL0", 13.8);
        assert_eq!(settings.handle_at_command("ATRV", 12.6), "\r12.6V\r>");
    }

    #[test]
    fn test_encode_pid() {
        let vehicle = VehicleState {
            rpm: 2500,
            map_kpa: 150,
            coolant_c: 80,
            speed_kph: 100,
            intake_c: 30,
            throttle_pct: 50,
            pedal_pct: 100,
            battery_v: 13.8,
        };
        assert_eq!(vehicle.encode_pid("0C").as_deref(), Some("2710"));
        assert_eq!(vehicle.encode_pid("0B").as_deref(), Some("96"));
        assert_eq!(vehicle.encode_pid("05").as_deref(), Some("78"));
        assert_eq!(vehicle.encode_pid("0D").as_deref(), Some("64"));
        assert_eq!(vehicle.encode_pid("0F").as_deref(), Some("46"));
        assert_eq!(vehicle.encode_pid("11").as_deref(), Some("80"));
        assert_eq!(vehicle.encode_pid("49").as_deref(), Some("FF"));
        assert_eq!(vehicle.encode_pid("FF"), None);
    }

    #[test]
    fn test_encode_pid_clamps() {
        let vehicle = VehicleState {
            rpm: 100_000,
            coolant_c: 400,
            intake_c: -100,
            ..VehicleState::default()
        };
        assert_eq!(vehicle.encode_pid("0C").as_deref(), Some("FFFF"));
        assert_eq!(vehicle.encode_pid("05").as_deref(), Some("FF"));
        assert_eq!(vehicle.encode_pid("0F").as_deref(), Some("00"));
    }

    #[test]
    fn test_encode_percent_round_trips() {
        // Truncating A * 100 / 255 must reproduce the encoded percent
        for pct in 0..=100u8 {
            let a = encode_percent(pct);
            assert_eq!(a * 100 / 255, u16::from(pct), "pct {pct} -> byte {a}");
            assert!(a <= 0xFF);
        }
    }

    #[test]
    fn test_format_payload() {
        let mut settings = AdapterSettings::new();
        assert_eq!(settings.format_payload("410C2710"), "41 0C 27 10");
        settings.spaces_enabled = false;
        assert_eq!(settings.format_payload("410C2710"), "410C2710");
    }

    #[test]
    fn test_respond_data_query() {
        let mut settings = AdapterSettings::new();
        settings.handle_at_command("ATL0", 13.8);
        settings.handle_at_command("ATS0", 13.8);
        let vehicle = VehicleState {
            rpm: 2500,
            ..VehicleState::default()
        };
        let reply = respond("010C", &mut settings, &vehicle, Fault::None);
        assert_eq!(reply.as_deref(), Some("410C2710\r\r>"));
    }

    #[test]
    fn test_respond_with_spaces() {
        let mut settings = AdapterSettings::new();
        settings.handle_at_command("ATL0", 13.8);
        let vehicle = VehicleState {
            rpm: 2500,
            ..VehicleState::default()
        };
        let reply = respond("010C", &mut settings, &vehicle, Fault::None);
        assert_eq!(reply.as_deref(), Some("41 0C 27 10\r\r>"));
    }

    #[test]
    fn test_respond_fault_modes() {
        let mut settings = AdapterSettings::new();
        settings.handle_at_command("ATL0", 13.8);
        let vehicle = VehicleState::default();

        assert_eq!(
            respond("010C", &mut settings, &vehicle, Fault::NoData).as_deref(),
            Some("NO DATA\r\r>")
        );
        assert_eq!(
            respond("010C", &mut settings, &vehicle, Fault::Searching).as_deref(),
            Some("SEARCHING...\r\r>")
        );
        assert_eq!(respond("010C", &mut settings, &vehicle, Fault::Silent), None);

        // RejectSupportedPids only refuses the 0100 probe
        assert_eq!(
            respond("0100", &mut settings, &vehicle, Fault::RejectSupportedPids).as_deref(),
            Some("?\r\r>")
        );
        let normal = respond("010C", &mut settings, &vehicle, Fault::RejectSupportedPids);
        assert!(normal.unwrap().starts_with("41 0C"));

        // AT commands keep working under every fault
        let at = respond("ATI", &mut settings, &vehicle, Fault::Silent);
        assert!(at.unwrap().contains("ELM327"));
    }

    #[test]
    fn test_respond_unknown_command() {
        let mut settings = AdapterSettings::new();
        settings.handle_at_command("ATL0", 13.8);
        let vehicle = VehicleState::default();
        assert_eq!(
            respond("ZZZZ", &mut settings, &vehicle, Fault::None).as_deref(),
            Some("?\r\r>")
        );
    }
}
