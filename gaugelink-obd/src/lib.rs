//! OBD-II protocol engine for ELM327-family adapters
//!
//! This library connects to an ELM327-compatible adapter over Bluetooth
//! RFCOMM or TCP, runs the AT initialization handshake, polls Mode 01 PIDs
//! from a background thread, and publishes decoded gauge values through
//! state and data callbacks. It is the data source behind the gauge
//! dashboard; rendering lives elsewhere.

pub mod config;
pub mod connection;
pub mod convert;
pub mod data;
pub mod error;
pub mod pid;
pub mod rfcomm;
pub mod transport;

pub use config::{ObdConfig, MAX_COMMAND_TIMEOUT_MS};
pub use connection::{ConnectionState, ObdConnection};
pub use data::ObdData;
pub use error::{ConfigError, TransportError};
pub use pid::{Pid, FULL_QUERY_PIDS};
pub use transport::{Target, DEFAULT_RFCOMM_CHANNEL, DEFAULT_TCP_PORT};
