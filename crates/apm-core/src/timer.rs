//! Wall-clock timing for requests and spans

use crate::clock::Clock;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use thiserror::Error;

/// Timer errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("Can't get the duration of a running timer")]
    NotStopped,
}

pub type TimerResult<T> = Result<T, TimerError>;

/// Start/stop measurement in fractional seconds since the epoch.
///
/// The stop time is written at most once; later stops are ignored so that
/// duplicate closes coming out of leaf collapsing cannot move it.
#[derive(Debug, Clone, PartialEq)]
pub struct Timer {
    start: f64,
    stop: Option<f64>,
}

impl Timer {
    /// Start a timer now, or at `override_timestamp` when given
    pub fn start(clock: &dyn Clock, override_timestamp: Option<f64>) -> Self {
        Self {
            start: override_timestamp.unwrap_or_else(|| clock.now()),
            stop: None,
        }
    }

    /// Stop the timer. No-op if already stopped.
    pub fn stop(&mut self, clock: &dyn Clock, override_timestamp: Option<f64>) {
        if self.stop.is_some() {
            return;
        }
        self.stop = Some(override_timestamp.unwrap_or_else(|| clock.now()));
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_some()
    }

    pub fn start_seconds(&self) -> f64 {
        self.start
    }

    pub fn stop_seconds(&self) -> Option<f64> {
        self.stop
    }

    /// Elapsed seconds between start and stop
    pub fn duration_seconds(&self) -> TimerResult<f64> {
        self.stop
            .map(|stop| stop - self.start)
            .ok_or(TimerError::NotStopped)
    }

    /// Start time as a wire timestamp
    pub fn start_timestamp(&self) -> String {
        format_timestamp(self.start)
    }

    /// Stop time as a wire timestamp, `None` while running
    pub fn stop_timestamp(&self) -> Option<String> {
        self.stop.map(format_timestamp)
    }
}

/// Render seconds since the epoch as `YYYY-MM-DDTHH:MM:SS.ffffffZ`
pub fn format_timestamp(seconds: f64) -> String {
    let micros = (seconds * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

/// Convert a timestamp of unknown unit (seconds, milliseconds, microseconds
/// or nanoseconds) into seconds.
///
/// The unit is found by comparing against 1 January of the year ten years
/// before `reference_now`, scaled from the most granular unit down. Values
/// older than the cutoff at every scale yield `0.0`.
pub fn normalize_ambiguous_timestamp(value: f64, reference_now: f64) -> f64 {
    let Some(cutoff) = ten_year_cutoff(reference_now) else {
        return 0.0;
    };

    if value > cutoff * 1_000_000_000.0 {
        return value / 1_000_000_000.0;
    }
    if value > cutoff * 1_000_000.0 {
        return value / 1_000_000.0;
    }
    if value > cutoff * 1_000.0 {
        return value / 1_000.0;
    }
    if value > cutoff {
        return value;
    }

    0.0
}

fn ten_year_cutoff(reference_now: f64) -> Option<f64> {
    let now = DateTime::from_timestamp(reference_now.floor() as i64, 0)?;
    let cutoff = Utc
        .with_ymd_and_hms(now.year() - 10, 1, 1, 0, 0, 0)
        .single()?;
    Some(cutoff.timestamp() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedClock;

    const NOW: f64 = 1_700_000_000.0;

    #[test]
    fn test_start_uses_override() {
        let timer = Timer::start(&FixedClock::new(NOW), Some(1_000.0));
        assert_eq!(timer.start_seconds(), 1_000.0);
        assert!(!timer.is_stopped());
    }

    #[test]
    fn test_duration_requires_stop() {
        let timer = Timer::start(&FixedClock::new(NOW), None);
        assert_eq!(timer.duration_seconds(), Err(TimerError::NotStopped));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let clock = FixedClock::new(NOW);
        let mut timer = Timer::start(&clock, None);
        timer.stop(&clock, Some(NOW + 2.5));
        timer.stop(&clock, Some(NOW + 10.0));
        timer.stop(&clock, None);

        assert_eq!(timer.stop_seconds(), Some(NOW + 2.5));
        assert_eq!(timer.duration_seconds(), Ok(2.5));
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(0.0), "1970-01-01T00:00:00.000000Z");
        assert_eq!(
            format_timestamp(1_700_000_000.25),
            "2023-11-14T22:13:20.250000Z"
        );

        let timer = Timer::start(&FixedClock::new(NOW), None);
        assert!(timer.stop_timestamp().is_none());
    }

    #[test]
    fn test_normalize_milliseconds() {
        let seconds = normalize_ambiguous_timestamp(1_700_000_000_000.0, NOW);
        assert!((seconds - NOW).abs() < 1e-3);
    }

    #[test]
    fn test_normalize_each_scale() {
        let ns = normalize_ambiguous_timestamp(1_699_999_999_000_000_000.0, NOW);
        assert!((ns - 1_699_999_999.0).abs() < 1e-3);

        let us = normalize_ambiguous_timestamp(1_699_999_999_000_000.0, NOW);
        assert!((us - 1_699_999_999.0).abs() < 1e-3);

        let s = normalize_ambiguous_timestamp(1_699_999_999.5, NOW);
        assert!((s - 1_699_999_999.5).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_too_old_is_zero() {
        // 2001-09-09, more than ten years before the reference at every scale
        assert_eq!(normalize_ambiguous_timestamp(1_000_000_000.0, NOW), 0.0);
        assert_eq!(normalize_ambiguous_timestamp(0.0, NOW), 0.0);
        assert_eq!(normalize_ambiguous_timestamp(-5.0, NOW), 0.0);
    }
}
