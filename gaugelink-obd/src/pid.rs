//! Mode 01 PID registry and response parsing.
//!
//! Each supported PID carries its query code, expected payload size, and
//! decode formula. Decoding works on the cleaned response text: sentinel
//! replies are rejected, the `41` + PID echo is located anywhere in the
//! normalized text, and exactly the expected number of payload bytes is
//! sliced out and run through the formula.

use atomic_enum::atomic_enum;
use log::{debug, warn};

/// A supported Mode 01 PID.
///
/// The accelerator pedal pair is defined for completeness (useful from the
/// query API) but is never part of the polling rotation.
#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum Pid {
    /// Manifold absolute pressure, kPa.
    Map,
    /// Engine coolant temperature, °C.
    CoolantTemp,
    /// Engine RPM.
    Rpm,
    /// Vehicle speed, km/h.
    VehicleSpeed,
    /// Intake air temperature, °C.
    IntakeTemp,
    /// Throttle position, percent.
    ThrottlePos,
    /// Accelerator pedal position D, percent.
    AccelPedalD,
    /// Accelerator pedal position E, percent.
    AccelPedalE,
}

/// The PIDs a full query walks, in query order.
pub const FULL_QUERY_PIDS: [Pid; 6] = [
    Pid::Map,
    Pid::CoolantTemp,
    Pid::Rpm,
    Pid::VehicleSpeed,
    Pid::IntakeTemp,
    Pid::ThrottlePos,
];

impl Pid {
    /// The Mode 01 query string sent to the adapter.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Map => "010B",
            Self::CoolantTemp => "0105",
            Self::Rpm => "010C",
            Self::VehicleSpeed => "010D",
            Self::IntakeTemp => "010F",
            Self::ThrottlePos => "0111",
            Self::AccelPedalD => "0149",
            Self::AccelPedalE => "014A",
        }
    }

    /// The PID byte echoed back in a positive response.
    #[must_use]
    pub const fn pid_byte(self) -> u8 {
        match self {
            Self::Map => 0x0B,
            Self::CoolantTemp => 0x05,
            Self::Rpm => 0x0C,
            Self::VehicleSpeed => 0x0D,
            Self::IntakeTemp => 0x0F,
            Self::ThrottlePos => 0x11,
            Self::AccelPedalD => 0x49,
            Self::AccelPedalE => 0x4A,
        }
    }

    /// Number of payload bytes in a positive response.
    #[must_use]
    pub const fn response_bytes(self) -> usize {
        match self {
            Self::Rpm => 2,
            _ => 1,
        }
    }

    /// Short uppercase label for logs and gauge captions.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Map => "MAP",
            Self::CoolantTemp => "ECT",
            Self::Rpm => "RPM",
            Self::VehicleSpeed => "VSS",
            Self::IntakeTemp => "IAT",
            Self::ThrottlePos => "TPS",
            Self::AccelPedalD => "APP_D",
            Self::AccelPedalE => "APP_E",
        }
    }

    /// Look up a PID by its query code ("010C" style, uppercase hex).
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "010B" => Some(Self::Map),
            "0105" => Some(Self::CoolantTemp),
            "010C" => Some(Self::Rpm),
            "010D" => Some(Self::VehicleSpeed),
            "010F" => Some(Self::IntakeTemp),
            "0111" => Some(Self::ThrottlePos),
            "0149" => Some(Self::AccelPedalD),
            "014A" => Some(Self::AccelPedalE),
            _ => None,
        }
    }

    /// Apply the decode formula to a payload of [`response_bytes`] bytes.
    ///
    /// Divisions truncate, matching how the gauges have always displayed
    /// these values. `None` when the payload is shorter than the formula
    /// needs.
    ///
    /// [`response_bytes`]: Self::response_bytes
    #[must_use]
    pub fn decode(self, payload: &[u8]) -> Option<i32> {
        if payload.len() < self.response_bytes() {
            return None;
        }
        let a = i32::from(payload[0]);
        let value = match self {
            Self::Map | Self::VehicleSpeed => a,
            Self::CoolantTemp | Self::IntakeTemp => a - 40,
            Self::Rpm => {
                let b = i32::from(payload[1]);
                (a * 256 + b) / 4
            }
            Self::ThrottlePos | Self::AccelPedalD | Self::AccelPedalE => a * 100 / 255,
        };
        Some(value)
    }

    /// Parse a cleaned adapter response into this PID's value.
    ///
    /// Returns `None` for sentinel replies (`NO DATA`, `SEARCHING`), a
    /// missing `41` + PID prefix, or a payload shorter than expected.
    #[must_use]
    pub fn decode_response(self, response: &str) -> Option<i32> {
        let upper = response.to_uppercase();
        // Sentinels checked before whitespace stripping would miss "NODATA"
        // from a spaces-off adapter, so match both forms.
        if upper.contains("NO DATA") || upper.contains("NODATA") || upper.contains("SEARCHING") {
            return None;
        }

        let clean: String = upper.chars().filter(|c| !c.is_whitespace()).collect();
        let prefix = format!("41{:02X}", self.pid_byte());
        let Some(idx) = clean.find(&prefix) else {
            debug!("Expected {prefix} not in {clean:?}");
            return None;
        };

        let hex_data = &clean[idx + prefix.len()..];
        let need = self.response_bytes() * 2;
        // Line noise survives cleaning as multi-byte replacement characters,
        // so the fixed-offset slice must go through `get`, not indexing.
        let Some(payload_hex) = hex_data.get(..need) else {
            debug!("Insufficient data for {}: {hex_data:?}", self.code());
            return None;
        };

        match hex::decode(payload_hex) {
            Ok(payload) => self.decode(&payload),
            Err(e) => {
                warn!("Bad hex in {} response {hex_data:?}: {e}", self.code());
                None
            }
        }
    }
}
