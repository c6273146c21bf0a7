//! Terminal OBD gauge monitor
//!
//! Connects to an ELM327 adapter over Bluetooth or TCP, prints state
//! transitions and decoded samples, and exercises the full
//! connect/poll/disconnect lifecycle. Handy against a real dongle in the
//! driveway or a `gaugelink-mock-elm327` on localhost.

use anyhow::{bail, Result};
use clap::Parser;
use gaugelink_obd::{
    ConnectionState, ObdConfig, ObdConnection, ObdData, Pid, Target, FULL_QUERY_PIDS,
};
use log::info;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "gaugelink", version, about = "OBD-II gauge monitor for ELM327 adapters")]
struct Args {
    /// Adapter address: Bluetooth MAC (AA:BB:CC:DD:EE:FF) or [tcp:]host[:port]
    target: String,

    /// RFCOMM channel for Bluetooth targets
    #[arg(long, default_value_t = 1)]
    channel: u8,

    /// Polling rate in Hz
    #[arg(long, default_value_t = 10.0)]
    rate: f64,

    /// Seconds to poll before disconnecting (0 = run until killed)
    #[arg(long, default_value_t = 0)]
    duration: u64,

    /// Single full query: print every gauge plus battery voltage, then exit
    #[arg(long)]
    once: bool,

    /// JSON config file (defaults apply when absent)
    #[arg(long)]
    config: Option<PathBuf>,

    /// PID for the fast polling cycles, e.g. 010C or just 0C
    #[arg(long, value_parser = parse_pid, default_value = "0111")]
    active_pid: Pid,

    /// Log debug detail, wire traffic included
    #[arg(short, long)]
    verbose: bool,
}

fn parse_pid(s: &str) -> Result<Pid, String> {
    let code = s.to_uppercase();
    let code = if code.len() == 2 {
        format!("01{code}")
    } else {
        code
    };
    Pid::from_code(&code).ok_or_else(|| format!("unknown PID '{s}' (try a Mode 01 code like 010C)"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut target: Target = args.target.parse()?;
    if let Target::Bluetooth { channel, .. } = &mut target {
        *channel = args.channel;
    }

    let config = match &args.config {
        Some(path) => ObdConfig::load_or_default(path),
        None => ObdConfig::default(),
    };

    let connection = ObdConnection::new(target, config);
    connection.set_state_callback(|state, message| {
        println!("[STATE] {}: {message}", state.label());
    });
    connection.set_data_callback(|data| {
        println!(
            "[DATA] rpm {:>4}  boost {:>5.1} psi  coolant {:>5.1}°F  speed {:>3} mph  throttle {:>3.0}%",
            data.rpm, data.boost_psi, data.coolant_temp_f, data.speed_mph, data.throttle_pos
        );
    });

    if !connection.connect() {
        let detail = match connection.state() {
            ConnectionState::Error(message) => message,
            other => other.label().to_string(),
        };
        bail!("failed to connect: {detail}");
    }
    if let Some(volts) = connection.battery_voltage() {
        info!("Battery: {volts:.1} V");
    }

    if args.once {
        let mut data = ObdData::default();
        let decoded = connection.query_all(&mut data);
        print_gauges(&data);
        println!("{decoded}/{} PIDs answered", FULL_QUERY_PIDS.len());
        connection.disconnect();
        return Ok(());
    }

    connection.set_active_pid(args.active_pid);
    connection.start_polling(args.rate);

    if args.duration > 0 {
        thread::sleep(Duration::from_secs(args.duration));
        let lost = matches!(connection.state(), ConnectionState::Error(_));
        connection.disconnect();
        if lost {
            bail!("connection lost during polling");
        }
        return Ok(());
    }

    // Run until killed; dropping the connection on exit disconnects
    loop {
        thread::sleep(Duration::from_secs(1));
        if let ConnectionState::Error(message) = connection.state() {
            bail!("{message}");
        }
    }
}

fn print_gauges(data: &ObdData) {
    println!("  rpm       {}", data.rpm);
    println!("  boost     {:.1} psi", data.boost_psi);
    println!("  map       {:.1} kPa", data.map_kpa);
    println!(
        "  coolant   {:.0}°C / {:.0}°F",
        data.coolant_temp_c, data.coolant_temp_f
    );
    println!("  speed     {} km/h / {} mph", data.speed_kph, data.speed_mph);
    println!("  intake    {:.0}°C", data.intake_temp_c);
    println!("  throttle  {:.0}%", data.throttle_pos);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid_accepts_short_and_full_codes() {
        assert_eq!(parse_pid("0C"), Ok(Pid::Rpm));
        assert_eq!(parse_pid("010c"), Ok(Pid::Rpm));
        assert_eq!(parse_pid("0111"), Ok(Pid::ThrottlePos));
        assert!(parse_pid("FF").is_err());
        assert!(parse_pid("banana").is_err());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["gaugelink", "10.0.0.174"]);
        assert_eq!(args.target, "10.0.0.174");
        assert_eq!(args.channel, 1);
        assert!((args.rate - 10.0).abs() < f64::EPSILON);
        assert_eq!(args.duration, 0);
        assert!(!args.once);
        assert_eq!(args.active_pid, Pid::ThrottlePos);
    }

    #[test]
    fn test_args_active_pid_flag() {
        let args = Args::parse_from(["gaugelink", "AA:BB:CC:DD:EE:FF", "--active-pid", "0C"]);
        assert_eq!(args.active_pid, Pid::Rpm);
    }
}
