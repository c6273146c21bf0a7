//! The rolling sensor sample shared with the UI layer.

use crate::convert;
use crate::pid::Pid;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One snapshot of everything the gauges show.
///
/// Updates are sparse: a query that answers only one PID touches only that
/// field and its derived siblings (MAP drives boost, coolant Celsius drives
/// Fahrenheit, km/h drives mph). Unanswered fields keep their last value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObdData {
    /// Gauge pressure relative to the atmospheric baseline.
    pub boost_psi: f64,
    /// Manifold absolute pressure in kPa.
    pub map_kpa: f64,
    pub coolant_temp_c: f64,
    pub coolant_temp_f: f64,
    pub rpm: u32,
    pub speed_kph: u32,
    pub speed_mph: u32,
    pub intake_temp_c: f64,
    /// Throttle position in percent.
    pub throttle_pos: f64,
    /// Unix epoch milliseconds of the last update.
    pub timestamp_ms: u64,
}

impl Default for ObdData {
    fn default() -> Self {
        Self {
            boost_psi: 0.0,
            // Atmospheric baseline, so boost starts at exactly zero
            map_kpa: convert::ATMOSPHERIC_KPA,
            coolant_temp_c: 0.0,
            coolant_temp_f: 32.0,
            rpm: 0,
            speed_kph: 0,
            speed_mph: 0,
            intake_temp_c: 0.0,
            throttle_pos: 0.0,
            timestamp_ms: 0,
        }
    }
}

impl ObdData {
    /// Store one decoded PID value, updating derived fields alongside it.
    ///
    /// `atmospheric_kpa` is the boost baseline. The accelerator pedal PIDs
    /// have no gauge behind them and leave the sample untouched.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // mph is displayed truncated
    pub fn apply(&mut self, pid: Pid, value: i32, atmospheric_kpa: f64) {
        match pid {
            Pid::Map => {
                self.map_kpa = f64::from(value);
                self.boost_psi = convert::map_to_boost_psi(self.map_kpa, atmospheric_kpa);
            }
            Pid::CoolantTemp => {
                self.coolant_temp_c = f64::from(value);
                self.coolant_temp_f = convert::celsius_to_fahrenheit(self.coolant_temp_c);
            }
            Pid::Rpm => {
                self.rpm = u32::try_from(value).unwrap_or(0);
            }
            Pid::VehicleSpeed => {
                self.speed_kph = u32::try_from(value).unwrap_or(0);
                self.speed_mph = convert::kmh_to_mph(f64::from(self.speed_kph)) as u32;
            }
            Pid::IntakeTemp => {
                self.intake_temp_c = f64::from(value);
            }
            Pid::ThrottlePos => {
                self.throttle_pos = f64::from(value);
            }
            Pid::AccelPedalD | Pid::AccelPedalE => {}
        }
    }

    /// Stamp the sample with the current wall-clock time.
    pub fn touch(&mut self) {
        self.timestamp_ms = epoch_ms();
    }
}

#[allow(clippy::cast_possible_truncation)] // millis since 1970 fit in u64
fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
