//! Moisture-based watering decisions.
//!
//! Pure function of zone + current weather snapshot; the two fallback
//! directions when weather is unavailable are intentional and
//! opposite: schedule skipping fails open (run anyway, see
//! `weather::skip_for_rain`), a critically dry zone fails safe (water
//! a fixed 10 minutes).

use crate::db::Zone;
use crate::weather::WeatherSnapshot;

/// Base watering duration in minutes; also the fail-safe duration
/// when weather is unknown.
const BASE_DURATION_MIN: i64 = 10;

/// Upper bound on any computed watering duration.
const MAX_DURATION_MIN: i64 = 30;

/// Moisture assumed for zones that have never reported a reading;
/// an unknown zone is never considered critically dry.
const UNKNOWN_MOISTURE: i64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub should_water: bool,
    pub reason: String,
    /// Set only when `should_water` is true.
    pub duration_min: Option<i64>,
}

impl Decision {
    fn no(reason: impl Into<String>) -> Self {
        Self {
            should_water: false,
            reason: reason.into(),
            duration_min: None,
        }
    }

    fn water(reason: impl Into<String>, duration_min: i64) -> Self {
        Self {
            should_water: true,
            reason: reason.into(),
            duration_min: Some(duration_min),
        }
    }
}

/// Decide whether `zone` should be watered right now and for how long.
pub fn decide(zone: &Zone, weather: Option<&WeatherSnapshot>, rain_threshold: i64) -> Decision {
    let moisture = zone.moisture.unwrap_or(UNKNOWN_MOISTURE);
    let threshold = zone.moisture_threshold;
    let optimal = zone.moisture_optimal;

    if moisture >= optimal {
        return Decision::no(format!("moisture sufficient ({moisture}%)"));
    }

    if moisture > threshold {
        return Decision::no(format!("above threshold, not yet critical ({moisture}%)"));
    }

    // Critical dryness: consult the forecast.
    let Some(weather) = weather else {
        return Decision::water(
            format!("critically dry ({moisture}%), weather unknown"),
            BASE_DURATION_MIN,
        );
    };

    if weather.rain_today >= rain_threshold {
        return Decision::no(format!("{}% rain expected today", weather.rain_today));
    }

    if weather.rain_tomorrow >= rain_threshold {
        return Decision::no(format!("{}% rain expected tomorrow", weather.rain_tomorrow));
    }

    let duration = ramp_duration(moisture, optimal);
    Decision::water(
        format!("too dry ({moisture}%), no rain in sight"),
        duration,
    )
}

/// Linear ramp: 10 minutes base plus 2 minutes per 5 points of
/// moisture deficit, capped at 30.
fn ramp_duration(moisture: i64, optimal: i64) -> i64 {
    let deficit = optimal - moisture;
    (BASE_DURATION_MIN + (deficit / 5) * 2).min(MAX_DURATION_MIN)
}

// ===========================================================================
// Tests
// ===========================================================================
