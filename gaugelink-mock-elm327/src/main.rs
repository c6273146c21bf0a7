//! Standalone mock ELM327 server
//!
//! Serves the adapter protocol on TCP and runs a repeating drive cycle so
//! connected gauges have something to show: idle, a pull to redline, and
//! back down. Point the engine (or a phone app) at the listen address.

use anyhow::{Context, Result};
use clap::Parser;
use gaugelink_mock_elm327::{MockAdapter, VehicleState};
use log::info;
use std::thread;
use std::time::{Duration, Instant};

const IDLE_RPM: f32 = 800.0;
const PEAK_RPM: f32 = 6200.0;
const CYCLE_SECS: f32 = 12.0;

#[derive(Parser, Debug)]
#[command(name = "gaugelink-mock-elm327", version, about = "Mock ELM327 adapter over TCP")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:35000")]
    listen: String,

    /// Battery voltage reported by ATRV
    #[arg(long, default_value_t = 13.8)]
    battery: f32,

    /// Hold the vehicle at idle instead of running the drive cycle
    #[arg(long)]
    idle: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let adapter = MockAdapter::spawn(&args.listen)
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    let vehicle = adapter.vehicle();
    vehicle.lock().unwrap().battery_v = args.battery;
    info!("Drive cycle {}", if args.idle { "off" } else { "on" });
    info!("Serving on {} (Ctrl-C to stop)", adapter.addr());

    let start = Instant::now();
    loop {
        if !args.idle {
            let mut vehicle = vehicle.lock().unwrap();
            drive_cycle(&mut vehicle, start.elapsed().as_secs_f32());
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Advance the vehicle through a repeating pull: ramp to redline, hold,
/// fall back, idle. Everything else follows the rev fraction.
fn drive_cycle(vehicle: &mut VehicleState, elapsed_s: f32) {
    let t = elapsed_s % CYCLE_SECS;
    let frac = if t < 5.0 {
        t / 5.0
    } else if t < 7.0 {
        1.0
    } else if t < 10.0 {
        1.0 - (t - 7.0) / 3.0
    } else {
        0.0
    };

    vehicle.rpm = (IDLE_RPM + (PEAK_RPM - IDLE_RPM) * frac) as u32;
    vehicle.speed_kph = (185.0 * frac) as u8;
    vehicle.throttle_pct = (12.0 + 84.0 * frac) as u8;
    vehicle.pedal_pct = (10.0 + 90.0 * frac) as u8;
    // Vacuum at idle, around 1.8 bar absolute on boost
    vehicle.map_kpa = (35.0 + 145.0 * frac) as u8;
    vehicle.coolant_c = 88 + (8.0 * frac) as i32;
    vehicle.intake_c = 25 + (20.0 * frac) as i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_cycle_phases() {
        let mut vehicle = VehicleState::default();

        drive_cycle(&mut vehicle, 0.0);
        assert_eq!(vehicle.rpm, IDLE_RPM as u32);
        assert_eq!(vehicle.speed_kph, 0);

        drive_cycle(&mut vehicle, 6.0);
        assert_eq!(vehicle.rpm, PEAK_RPM as u32);
        assert_eq!(vehicle.speed_kph, 185);

        drive_cycle(&mut vehicle, 11.0);
        assert_eq!(vehicle.rpm, IDLE_RPM as u32);

        // Cycle wraps
        drive_cycle(&mut vehicle, CYCLE_SECS + 6.0);
        assert_eq!(vehicle.rpm, PEAK_RPM as u32);
    }
}
