//! Unit conversions for gauge display.

/// Sea-level standard atmosphere in kPa. Baseline for boost calculation;
/// override per install via `ObdConfig::atmospheric_kpa` at elevation.
pub const ATMOSPHERIC_KPA: f64 = 101.325;

#[must_use]
pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 1.8 + 32.0
}

#[must_use]
pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) / 1.8
}

#[must_use]
pub fn kpa_to_psi(kpa: f64) -> f64 {
    kpa * 0.145_038
}

#[must_use]
pub fn psi_to_kpa(psi: f64) -> f64 {
    psi * 6.894_76
}

#[must_use]
pub fn kpa_to_bar(kpa: f64) -> f64 {
    kpa / 100.0
}

#[must_use]
pub fn bar_to_kpa(bar: f64) -> f64 {
    bar * 100.0
}

#[must_use]
pub fn bar_to_psi(bar: f64) -> f64 {
    bar * 14.503_774
}

#[must_use]
pub fn psi_to_bar(psi: f64) -> f64 {
    psi * 0.068_947_6
}

#[must_use]
pub fn kmh_to_mph(kmh: f64) -> f64 {
    kmh * 0.621_371
}

#[must_use]
pub fn mph_to_kmh(mph: f64) -> f64 {
    mph * 1.609_34
}

/// Boost (gauge pressure) in PSI from an absolute MAP reading.
/// Negative means vacuum, positive means boost.
#[must_use]
pub fn map_to_boost_psi(map_kpa: f64, atmospheric_kpa: f64) -> f64 {
    (map_kpa - atmospheric_kpa) * 0.145_038
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature() {
        assert!((celsius_to_fahrenheit(80.0) - 176.0).abs() < f64::EPSILON);
        assert!((celsius_to_fahrenheit(0.0) - 32.0).abs() < f64::EPSILON);
        assert!((fahrenheit_to_celsius(212.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_pressure() {
        assert!((kpa_to_psi(100.0) - 14.5038).abs() < 1e-4);
        assert!((bar_to_psi(2.0) - 29.0076).abs() < 1e-3);
        assert!((kpa_to_bar(250.0) - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_boost_from_map() {
        // 150 kPa absolute at sea level is about 7.06 PSI of boost
        let boost = map_to_boost_psi(150.0, ATMOSPHERIC_KPA);
        assert!((boost - 7.06).abs() < 0.01);
        // At atmospheric the gauge reads exactly zero
        assert_eq!(map_to_boost_psi(ATMOSPHERIC_KPA, ATMOSPHERIC_KPA), 0.0);
        // Idle vacuum reads negative
        assert!(map_to_boost_psi(35.0, ATMOSPHERIC_KPA) < 0.0);
    }

    #[test]
    fn test_speed() {
        assert!((kmh_to_mph(100.0) - 62.1371).abs() < 1e-4);
        assert!((mph_to_kmh(60.0) - 96.5604).abs() < 1e-4);
    }
}
