//! Connection engine for ELM327-family OBD-II adapters.
//!
//! Architecture:
//! - One `ObdConnection` per adapter: it owns the transport behind the
//!   transaction lock, the connection state machine, and the registered
//!   callbacks
//! - The wire protocol is strictly request/response with no request IDs, so
//!   the transaction lock serializes every exchange; a misattributed response
//!   would corrupt parsing
//! - A background polling thread queries the active PID every cycle and the
//!   whole registry every Nth cycle, publishing samples through the data
//!   callback
//! - `disconnect()` shuts the socket down through a separate handle before
//!   touching the transaction lock, so a blocked read unwinds instead of
//!   stalling teardown

use log::{debug, error, info, warn};
use smallvec::SmallVec;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ObdConfig;
use crate::data::ObdData;
use crate::pid::{AtomicPid, Pid, FULL_QUERY_PIDS};
use crate::transport::{ShutdownHandle, Target, Transport};

/// The adapter's prompt character, terminating every reply.
const PROMPT: u8 = b'>';

/// Initialization sequence; each command carries its own timeout.
const INIT_COMMANDS: [(&str, u64); 6] = [
    ("ATZ", 2000), // Reset - adapter reboots, needs longer timeout
    ("ATE0", 500), // Echo off
    ("ATL0", 500), // Linefeeds off
    ("ATS0", 500), // Spaces off (compact responses)
    ("ATH0", 500), // Headers off
    ("ATSP6", 1000), // Force ISO 15765-4 CAN 11bit/500k
];

/// Timeout for the post-init liveness probes (`0100`, fallback `010C`).
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for the polling thread to acknowledge a stop request.
const STOP_POLLING_TIMEOUT: Duration = Duration::from_secs(2);

/// State messages are truncated to this many bytes for UI display.
const MAX_STATE_MESSAGE_LEN: usize = 96;

/// Small buffer for command/response exchanges; typical replies fit inline.
type ResponseBuffer = SmallVec<[u8; 64]>;

type StateCallback = Box<dyn Fn(&ConnectionState, &str) + Send>;
type DataCallback = Box<dyn Fn(&ObdData) + Send>;

/// Connection lifecycle states.
///
/// `Error` carries the (truncated) diagnostic message. The machine leaves
/// `Error` only through `connect()` or `disconnect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Initializing,
    Connected,
    Error(String),
}

impl ConnectionState {
    /// Short lowercase name for logs and UI captions.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Error(_) => "error",
        }
    }
}

/// Handle on the background polling thread.
struct PollerHandle {
    stop_tx: mpsc::Sender<()>,
    done_rx: oneshot::Receiver<()>,
    thread: thread::JoinHandle<()>,
}

/// Everything the polling thread shares with the owning connection.
struct Shared {
    target: Target,
    config: ObdConfig,
    /// The transaction lock: holding it is holding the wire.
    io: Mutex<Option<Transport>>,
    /// Teardown path that works without the transaction lock.
    shutdown: Mutex<Option<ShutdownHandle>>,
    state: Mutex<ConnectionState>,
    state_callback: Mutex<Option<StateCallback>>,
    data_callback: Mutex<Option<DataCallback>>,
    /// Which PID the fast cycles poll; swappable from the UI thread.
    active_pid: AtomicPid,
    adapter_version: Mutex<String>,
}

/// A connection to one ELM327-family adapter.
///
/// Construct with a [`Target`] and an [`ObdConfig`], register callbacks,
/// then `connect()` and `start_polling()`. Dropping the connection
/// disconnects.
pub struct ObdConnection {
    shared: Arc<Shared>,
    poller: Mutex<Option<PollerHandle>>,
}

impl ObdConnection {
    #[must_use]
    pub fn new(target: Target, mut config: ObdConfig) -> Self {
        config.validate();
        Self {
            shared: Arc::new(Shared {
                target,
                config,
                io: Mutex::new(None),
                shutdown: Mutex::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                state_callback: Mutex::new(None),
                data_callback: Mutex::new(None),
                active_pid: AtomicPid::new(Pid::ThrottlePos),
                adapter_version: Mutex::new(String::new()),
            }),
            poller: Mutex::new(None),
        }
    }

    /// Register the state-change callback: `(new_state, message)`.
    ///
    /// Invoked synchronously on whichever thread drove the transition, with
    /// no internal locks held except the callback slot itself. Callbacks must
    /// be fast and must not call mutating methods on this connection.
    pub fn set_state_callback(&self, callback: impl Fn(&ConnectionState, &str) + Send + 'static) {
        *self.shared.state_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Register the data callback, invoked from the polling thread after
    /// every cycle that decoded at least one PID.
    pub fn set_data_callback(&self, callback: impl Fn(&ObdData) + Send + 'static) {
        *self.shared.data_callback.lock().unwrap() = Some(Box::new(callback));
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// The adapter identification captured from the `ATZ` reply, or empty if
    /// none was seen.
    #[must_use]
    pub fn adapter_version(&self) -> String {
        self.shared.adapter_version.lock().unwrap().clone()
    }

    /// Open the transport and run the initialization handshake.
    ///
    /// Drives the machine through `Connecting` and `Initializing` to
    /// `Connected`, or to `Error` with the failure detail. Returns whether
    /// the connection came up; the detail flows through the state callback
    /// rather than an error return.
    pub fn connect(&self) -> bool {
        if self.is_connected() {
            warn!("Already connected");
            return true;
        }

        let shared = &self.shared;
        shared.set_state(
            ConnectionState::Connecting,
            &format!("Connecting to {}", shared.target),
        );

        let transport = match Transport::open(&shared.target, &shared.config) {
            Ok(transport) => transport,
            Err(e) => {
                let message = match shared.target {
                    Target::Bluetooth { .. } => format!("Bluetooth error: {e}"),
                    Target::Tcp { .. } => format!("TCP error: {e}"),
                };
                error!("{message}");
                // A disconnect() that raced us has already forced
                // Disconnected and stays authoritative.
                if matches!(shared.state(), ConnectionState::Connecting) {
                    shared.set_error(&message);
                }
                return false;
            }
        };

        // Store the teardown handles before the handshake so a concurrent
        // disconnect() can cut the socket out from under us.
        match transport.shutdown_handle() {
            Ok(handle) => *shared.shutdown.lock().unwrap() = Some(handle),
            Err(e) => warn!("No shutdown handle for this transport: {e}"),
        }
        *shared.io.lock().unwrap() = Some(transport);

        // disconnect() may have run while the open was in flight, before the
        // handles were stored; it found nothing to tear down, so finish the
        // job here and stay Disconnected.
        if !matches!(shared.state(), ConnectionState::Connecting) {
            info!("Connect aborted by disconnect");
            shared.teardown_transport();
            return false;
        }

        if shared.initialize() {
            true
        } else {
            shared.teardown_transport();
            if matches!(shared.state(), ConnectionState::Initializing) {
                shared.set_error("Failed to verify OBD connection");
            }
            false
        }
    }

    /// Stop polling, close the transport, and force `Disconnected`.
    ///
    /// Safe from any thread, in any state, including concurrently with an
    /// in-progress `connect()`.
    pub fn disconnect(&self) {
        self.stop_polling();
        self.shared.teardown_transport();
        self.shared
            .set_state(ConnectionState::Disconnected, "Disconnected");
    }

    /// Spawn the background polling thread at `rate_hz` cycles per second.
    ///
    /// A no-op (with a log line) if polling is already running, if the
    /// connection is not `Connected`, or if the rate is not positive and
    /// finite.
    pub fn start_polling(&self, rate_hz: f64) {
        let mut poller = self.poller.lock().unwrap();
        if let Some(handle) = poller.as_ref() {
            if handle.thread.is_finished() {
                // The loop exited on its own (connection lost); reap it
                if let Some(stale) = poller.take() {
                    let _ = stale.thread.join();
                }
            } else {
                warn!("Polling already running");
                return;
            }
        }
        if !self.is_connected() {
            error!("Cannot start polling - not connected");
            return;
        }
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            warn!("Ignoring polling rate {rate_hz} Hz");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let (stop_tx, stop_rx) = mpsc::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let spawned = thread::Builder::new()
            .name("obd-poll".to_string())
            .spawn(move || {
                polling_loop(&shared, rate_hz, &stop_rx);
                let _ = done_tx.send(());
            });
        match spawned {
            Ok(thread) => {
                *poller = Some(PollerHandle {
                    stop_tx,
                    done_rx,
                    thread,
                });
                info!("Started OBD polling at {rate_hz} Hz");
            }
            Err(e) => error!("Failed to spawn polling thread: {e}"),
        }
    }

    /// Signal the polling thread to stop and wait for it, bounded.
    ///
    /// If the thread does not acknowledge within 2 s (wedged on I/O), the
    /// handle is dropped and the thread left to die on its own; shutdown
    /// must not block indefinitely on a background task.
    pub fn stop_polling(&self) {
        let handle = self.poller.lock().unwrap().take();
        let Some(handle) = handle else {
            return;
        };
        let _ = handle.stop_tx.send(());
        match handle.done_rx.recv_timeout(STOP_POLLING_TIMEOUT) {
            Ok(()) | Err(oneshot::RecvTimeoutError::Disconnected) => {
                let _ = handle.thread.join();
                info!("Stopped OBD polling");
            }
            Err(oneshot::RecvTimeoutError::Timeout) => {
                warn!("Polling thread did not stop within 2s, detaching");
            }
        }
    }

    /// Query one PID and decode the reply. `None` outside `Connected`, on
    /// timeout, or when the reply does not parse.
    #[must_use]
    pub fn query_pid(&self, pid: Pid) -> Option<i32> {
        self.shared.query_pid(pid)
    }

    /// Query every tracked PID in registry order, updating `data` sparsely.
    /// Returns how many PIDs decoded.
    pub fn query_all(&self, data: &mut ObdData) -> usize {
        self.shared.query_all(data)
    }

    /// Query only the active PID with the fast timeout. Returns how many
    /// PIDs decoded (0 or 1).
    pub fn query_fast(&self, data: &mut ObdData) -> usize {
        self.shared.query_fast(data)
    }

    /// Choose which PID the fast cycles poll (whichever gauge is visible).
    pub fn set_active_pid(&self, pid: Pid) {
        self.shared.active_pid.store(pid, Ordering::Relaxed);
        info!("Active PID set to {}", pid.label());
    }

    /// Read the adapter's battery voltage via `ATRV` (`13.8V` style reply).
    ///
    /// This is an adapter-local query, available whenever a transport is
    /// open, vehicle or no vehicle.
    #[must_use]
    pub fn battery_voltage(&self) -> Option<f32> {
        let response = self
            .shared
            .send_command("ATRV", self.shared.config.command_timeout())?;
        parse_voltage(&response)
    }
}

impl Drop for ObdConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().clone()
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ConnectionState::Connected)
    }

    /// Update state and notify the callback.
    ///
    /// The state lock is released before the callback runs, so callbacks may
    /// read `state()`. The callback slot lock is held during the call;
    /// replacing a callback from inside a callback would deadlock.
    fn set_state(&self, state: ConnectionState, message: &str) {
        let message = truncate_message(message);
        *self.state.lock().unwrap() = state.clone();
        info!("OBD state: {} - {message}", state.label());
        let callback = self.state_callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            callback(&state, message);
        }
    }

    fn set_error(&self, message: &str) {
        let message = truncate_message(message);
        self.set_state(ConnectionState::Error(message.to_string()), message);
    }

    /// Close the transport without touching the state machine. Shutdown goes
    /// first so a read blocked under the transaction lock unwinds before we
    /// wait on that lock.
    fn teardown_transport(&self) {
        let handle = self.shutdown.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
        let transport = self.io.lock().unwrap().take();
        drop(transport);
    }

    /// Send one command and return the cleaned reply.
    ///
    /// Returns `None` when no transport is open, the write fails, or nothing
    /// at all arrives before the timeout. A reply that cleans to the empty
    /// string is `Some("")` - the adapter answered, it just had nothing to
    /// say.
    fn send_command(&self, command: &str, timeout: Duration) -> Option<String> {
        let mut io = self.io.lock().unwrap();
        let Some(transport) = io.as_mut() else {
            debug!("send_command({command}) with no transport");
            return None;
        };
        match collect_response(transport, command, timeout) {
            Ok(raw) if raw.is_empty() => None,
            Ok(raw) => Some(clean_response(command, &raw)),
            Err(e) => {
                error!("Command error ({command}): {e}");
                None
            }
        }
    }

    /// Drop any stale bytes sitting in the socket buffer.
    fn drain_input(&self) {
        let mut io = self.io.lock().unwrap();
        if let Some(transport) = io.as_mut() {
            transport.drain(self.config.command_timeout());
        }
    }

    /// Run the AT handshake and liveness check; `Connected` on success.
    ///
    /// Configuration commands may go unanswered (logged, not fatal). The
    /// liveness check is two-tier: `0100` must contain the Mode 01 positive
    /// marker, otherwise a plain `010C` with any reply at all counts - some
    /// adapter/vehicle pairs reject the supported-PIDs probe yet answer
    /// individual queries fine.
    fn initialize(&self) -> bool {
        self.set_state(ConnectionState::Initializing, "Initializing ELM327");

        self.drain_input();

        for (cmd, timeout_ms) in INIT_COMMANDS {
            let Some(response) = self.send_command(cmd, Duration::from_millis(timeout_ms)) else {
                warn!("No response to {cmd}");
                continue;
            };
            debug!("{cmd} -> {response:?}");
            if cmd == "ATZ" && response.contains("ELM327") {
                *self.adapter_version.lock().unwrap() = response.trim().to_string();
            }
        }

        let alive = match self.send_command("0100", LIVENESS_TIMEOUT) {
            Some(response) if response.contains("41") => true,
            _ => self.send_command("010C", LIVENESS_TIMEOUT).is_some(),
        };
        if !alive {
            return false;
        }

        let version = self.adapter_version.lock().unwrap().clone();
        let message = if version.is_empty() {
            "Connected".to_string()
        } else {
            format!("Connected - {version}")
        };
        // Keep a disconnect() that raced the handshake authoritative
        if !matches!(self.state(), ConnectionState::Initializing) {
            return false;
        }
        self.set_state(ConnectionState::Connected, &message);
        true
    }

    fn query_pid(&self, pid: Pid) -> Option<i32> {
        self.query_pid_with(pid, self.config.command_timeout())
    }

    fn query_pid_with(&self, pid: Pid, timeout: Duration) -> Option<i32> {
        if !self.is_connected() {
            return None;
        }
        let response = self.send_command(pid.code(), timeout)?;
        pid.decode_response(&response)
    }

    fn query_all(&self, data: &mut ObdData) -> usize {
        let mut decoded = 0;
        for pid in FULL_QUERY_PIDS {
            if let Some(value) = self.query_pid(pid) {
                data.apply(pid, value, self.config.atmospheric_kpa);
                decoded += 1;
            }
        }
        data.touch();
        decoded
    }

    fn query_fast(&self, data: &mut ObdData) -> usize {
        let pid = self.active_pid.load(Ordering::Relaxed);
        let mut decoded = 0;
        if let Some(value) = self.query_pid_with(pid, self.config.fast_command_timeout()) {
            data.apply(pid, value, self.config.atmospheric_kpa);
            decoded = 1;
        }
        data.touch();
        decoded
    }

    fn notify_data(&self, data: &ObdData) {
        let callback = self.data_callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            callback(data);
        }
    }
}

/// Background polling loop.
///
/// Every `full_query_every`th cycle walks the whole registry; the rest poll
/// only the active PID. A cycle that decodes nothing bumps the failure
/// counter; `max_consecutive_failures` empty cycles in a row transition to
/// `Error("Connection lost")` once and end the loop. The inter-cycle sleep
/// waits on the stop channel so `stop_polling()` interrupts it immediately.
fn polling_loop(shared: &Arc<Shared>, rate_hz: f64, stop_rx: &mpsc::Receiver<()>) {
    let interval = Duration::from_secs_f64(1.0 / rate_hz);
    let full_query_every = u64::from(shared.config.full_query_every);
    let max_failures = shared.config.max_consecutive_failures;
    let mut data = ObdData::default();
    let mut cycle: u64 = 0;
    let mut failures: u32 = 0;

    info!("Entering polling loop at {rate_hz} Hz");

    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let start = Instant::now();
        cycle += 1;
        let decoded = if cycle % full_query_every == 0 {
            shared.query_all(&mut data)
        } else {
            shared.query_fast(&mut data)
        };

        if decoded > 0 {
            failures = 0;
            shared.notify_data(&data);
        } else {
            failures += 1;
            warn!("Empty polling cycle ({failures}/{max_failures})");
            if failures >= max_failures {
                error!("Too many empty polling cycles, stopping");
                shared.set_error("Connection lost");
                break;
            }
        }

        // Best-effort cadence: an overrun cycle is not made up
        let remaining = interval.saturating_sub(start.elapsed());
        if !remaining.is_zero() {
            match stop_rx.recv_timeout(remaining) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
    }

    debug!("Polling loop exited after {cycle} cycles");
}

/// Write `command` + CR and accumulate the reply until the prompt shows up
/// or the deadline passes.
///
/// The socket read timeout is re-armed to the remaining window on every
/// iteration, so the deadline holds no matter how the reply fragments.
/// Whatever accumulated by then is returned; only a failed write is an
/// error.
fn collect_response(
    transport: &mut Transport,
    command: &str,
    timeout: Duration,
) -> io::Result<ResponseBuffer> {
    let mut cmd_with_cr: ResponseBuffer = command.as_bytes().into();
    cmd_with_cr.push(b'\r');
    debug!("Sending: {:?}", String::from_utf8_lossy(&cmd_with_cr));
    transport.write_all(&cmd_with_cr)?;

    let mut buffer = [0u8; 64];
    let mut response = ResponseBuffer::new();
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Err(e) = transport.set_read_timeout(remaining) {
            warn!("Failed to set read timeout: {e}");
            break;
        }
        match transport.read(&mut buffer) {
            Ok(0) => {
                debug!("Socket closed while waiting for prompt");
                break;
            }
            Ok(n) => {
                response.extend_from_slice(&buffer[..n]);
                if response.contains(&PROMPT) {
                    debug!("Response: {:?}", String::from_utf8_lossy(&response));
                    break;
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                // The read timeout was the remaining window, so this is the
                // deadline expiring
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("Read error while waiting for prompt: {e}");
                break;
            }
        }
    }

    Ok(response)
}

/// Strip the prompt, carriage returns, and any echo of the sent command.
fn clean_response(command: &str, raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw)
        .replace('>', "")
        .replace('\r', " ");
    let mut text = text.trim();
    // Echo-on adapters send the command back before the reply
    if let Some(prefix) = text.as_bytes().get(..command.len()) {
        if prefix.eq_ignore_ascii_case(command.as_bytes()) {
            text = text[command.len()..].trim_start();
        }
    }
    text.to_string()
}

/// Parse an `ATRV` reply (`13.8V`) into volts.
fn parse_voltage(response: &str) -> Option<f32> {
    response
        .trim()
        .trim_end_matches(['V', 'v'])
        .trim()
        .parse()
        .ok()
}

/// Clip a state message to the UI display limit on a char boundary.
fn truncate_message(message: &str) -> &str {
    if message.len() <= MAX_STATE_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_STATE_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    /// Scripted adapter on loopback: greets with a banner, then answers each
    /// CR-terminated command through `reply`. Returns when the peer closes.
    fn spawn_scripted_adapter(
        reply: impl Fn(&str) -> Vec<u8> + Send + 'static,
    ) -> (std::net::SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            sock.write_all(b"\r\rELM327 v1.5\r\r>").unwrap();
            let mut line = Vec::new();
            let mut buf = [0u8; 64];
            loop {
                let n = match sock.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for &byte in &buf[..n] {
                    if byte != b'\r' {
                        line.push(byte);
                        continue;
                    }
                    let cmd = String::from_utf8_lossy(&line).trim().to_string();
                    line.clear();
                    if !cmd.is_empty() && sock.write_all(&reply(&cmd)).is_err() {
                        return;
                    }
                }
            }
        });
        (addr, handle)
    }

    #[test]
    fn test_clean_response_strips_prompt_and_crs() {
        assert_eq!(clean_response("010C", b"41 0C 27 10\r\r>"), "41 0C 27 10");
    }

    #[test]
    fn test_clean_response_strips_echo() {
        assert_eq!(clean_response("010C", b"010C\r41 0C 27 10\r>"), "41 0C 27 10");
        // Echo may come back in either case
        assert_eq!(clean_response("ATZ", b"atz\rELM327 v1.5\r>"), "ELM327 v1.5");
        // A reply shorter than the command cannot be an echo
        assert_eq!(clean_response("0100", b"41\r>"), "41");
    }

    #[test]
    fn test_clean_response_without_echo_untouched() {
        assert_eq!(clean_response("ATZ", b"ELM327 v1.5\r>"), "ELM327 v1.5");
    }

    #[test]
    fn test_clean_response_empty_reply() {
        // The adapter answered with just a prompt: valid, empty
        assert_eq!(clean_response("ATE0", b"\r>"), "");
    }

    #[test]
    fn test_parse_voltage() {
        assert_eq!(parse_voltage("13.8V"), Some(13.8));
        assert_eq!(parse_voltage("12.6v"), Some(12.6));
        assert_eq!(parse_voltage(" 14.2 V "), Some(14.2));
        assert_eq!(parse_voltage("13.8"), Some(13.8));
        assert_eq!(parse_voltage("NO DATA"), None);
        assert_eq!(parse_voltage(""), None);
    }

    #[test]
    fn test_truncate_message() {
        let short = "Connection lost";
        assert_eq!(truncate_message(short), short);

        let long = "x".repeat(200);
        assert_eq!(truncate_message(&long).len(), MAX_STATE_MESSAGE_LEN);

        // Multibyte char straddling the limit is dropped whole
        let mut tricky = "x".repeat(MAX_STATE_MESSAGE_LEN - 1);
        tricky.push('é');
        let truncated = truncate_message(&tricky);
        assert_eq!(truncated.len(), MAX_STATE_MESSAGE_LEN - 1);
        assert!(truncated.chars().all(|c| c == 'x'));
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(ConnectionState::Disconnected.label(), "disconnected");
        assert_eq!(ConnectionState::Connecting.label(), "connecting");
        assert_eq!(ConnectionState::Initializing.label(), "initializing");
        assert_eq!(ConnectionState::Connected.label(), "connected");
        assert_eq!(ConnectionState::Error("x".into()).label(), "error");
    }

    #[test]
    fn test_new_connection_starts_disconnected() {
        let conn = ObdConnection::new(
            "127.0.0.1:35000".parse().unwrap(),
            ObdConfig::default(),
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
        assert_eq!(conn.adapter_version(), "");
    }

    #[test]
    fn test_query_requires_connected() {
        let conn = ObdConnection::new(
            "127.0.0.1:35000".parse().unwrap(),
            ObdConfig::default(),
        );
        assert_eq!(conn.query_pid(Pid::Rpm), None);
        let mut data = ObdData::default();
        assert_eq!(conn.query_all(&mut data), 0);
    }

    #[test]
    fn test_start_polling_requires_connected() {
        let conn = ObdConnection::new(
            "127.0.0.1:35000".parse().unwrap(),
            ObdConfig::default(),
        );
        conn.start_polling(10.0);
        assert!(conn.poller.lock().unwrap().is_none());
        // And stopping without a poller is a quiet no-op
        conn.stop_polling();
    }

    #[test]
    fn test_connect_refused_leaves_error_state() {
        // Bind then drop to get a port nothing is listening on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ObdConfig {
            connect_timeout_ms: 2000,
            ..ObdConfig::default()
        };
        let conn = ObdConnection::new(format!("127.0.0.1:{port}").parse().unwrap(), config);

        let states = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&states);
        conn.set_state_callback(move |state, message| {
            log.lock().unwrap().push((state.clone(), message.to_string()));
        });

        assert!(!conn.connect());
        // Failure leaves the machine in Error, not Disconnected
        assert!(matches!(conn.state(), ConnectionState::Error(_)));

        let states = states.lock().unwrap();
        assert_eq!(states[0].0, ConnectionState::Connecting);
        assert!(matches!(states.last().unwrap().0, ConnectionState::Error(_)));
    }

    #[test]
    fn test_collect_response_across_partial_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let _ = sock.read(&mut buf).unwrap();
            for chunk in [b"41".as_slice(), b"0C 27".as_slice(), b"10\r\r>".as_slice()] {
                sock.write_all(chunk).unwrap();
                sock.flush().unwrap();
                thread::sleep(Duration::from_millis(20));
            }
        });

        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut transport = Transport::Tcp(stream);
        let raw = collect_response(&mut transport, "010C", Duration::from_secs(2)).unwrap();
        let cleaned = clean_response("010C", &raw);
        assert_eq!(cleaned, "41 0C 27 10");
        assert_eq!(Pid::Rpm.decode_response(&cleaned), Some(2500));
        server.join().unwrap();
    }

    #[test]
    fn test_collect_response_timeout_returns_partial() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let _ = sock.read(&mut buf).unwrap();
            // Never send the prompt
            sock.write_all(b"41 0C").unwrap();
            sock.flush().unwrap();
            thread::sleep(Duration::from_millis(400));
        });

        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut transport = Transport::Tcp(stream);
        let start = Instant::now();
        let raw = collect_response(&mut transport, "010C", Duration::from_millis(200)).unwrap();
        assert!(start.elapsed() < Duration::from_millis(600));
        assert_eq!(&raw[..], b"41 0C");
        server.join().unwrap();
    }

    #[test]
    fn test_liveness_accepts_empty_fallback_reply() {
        let (addr, server) = spawn_scripted_adapter(|cmd| match cmd {
            // Supported-PIDs query rejected outright
            "0100" => b"?\r\r>".to_vec(),
            // The fallback gets a bare prompt back: empty but received
            "010C" => b"\r>".to_vec(),
            _ => b"OK\r\r>".to_vec(),
        });
        let config = ObdConfig {
            command_timeout_ms: 300,
            ..ObdConfig::default()
        };
        let conn =
            ObdConnection::new(format!("127.0.0.1:{}", addr.port()).parse().unwrap(), config);

        // An adapter that answers at all, even with nothing to say, is alive
        assert!(conn.connect());
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.disconnect();
        server.join().unwrap();
    }

    #[test]
    fn test_polling_survives_garbled_replies() {
        let (addr, server) = spawn_scripted_adapter(|cmd| {
            if cmd == "0100" {
                b"4100BE3FA813\r\r>".to_vec()
            } else if let Some(pid) = cmd.strip_prefix("01") {
                // Positive echo followed by raw line noise
                let mut reply = format!("41{pid}").into_bytes();
                reply.extend_from_slice(b"\xFF\xFF\r\r>");
                reply
            } else {
                b"OK\r\r>".to_vec()
            }
        });
        let config = ObdConfig {
            command_timeout_ms: 300,
            fast_command_timeout_ms: 200,
            full_query_every: 1,
            max_consecutive_failures: 3,
            ..ObdConfig::default()
        };
        let conn =
            ObdConnection::new(format!("127.0.0.1:{}", addr.port()).parse().unwrap(), config);

        let messages = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&messages);
        conn.set_state_callback(move |state, message| {
            if matches!(state, ConnectionState::Error(_)) {
                log.lock().unwrap().push(message.to_string());
            }
        });

        assert!(conn.connect());
        conn.start_polling(50.0);

        // Noise decodes to no value, so the failure counter must end the
        // loop; the poller thread itself has to outlive every garbled reply
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !matches!(conn.state(), ConnectionState::Error(_)) {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(
            conn.state(),
            ConnectionState::Error("Connection lost".to_string())
        );
        assert_eq!(messages.lock().unwrap().as_slice(), ["Connection lost"]);

        conn.disconnect();
        server.join().unwrap();
    }
}
