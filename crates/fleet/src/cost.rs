//! GPU-second accounting.

use chrono::{DateTime, Utc};

use crate::models::ResourceUsage;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Whole seconds billed for holding an instance from `start` to `end`.
///
/// Rounded up, never below one second: an instance that was assigned was
/// billed by the provider even if the job failed immediately.
#[must_use]
pub fn billable_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    let millis = u64::try_from((end - start).num_milliseconds()).unwrap_or(0);
    millis.div_ceil(1000).max(1)
}

/// Round a dollar amount to micro-dollars.
#[must_use]
pub fn round_usd(amount: f64) -> f64 {
    (amount * 1_000_000.0).round() / 1_000_000.0
}

/// Usage for `gpu_seconds` at `hourly_rate`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn usage_for(gpu_seconds: u64, hourly_rate: f64) -> ResourceUsage {
    ResourceUsage {
        gpu_seconds,
        hourly_rate,
        cost_usd: round_usd(gpu_seconds as f64 / SECONDS_PER_HOUR * hourly_rate),
    }
}

/// Usage for holding an instance from `start` to `end`.
#[must_use]
pub fn compute_usage(start: DateTime<Utc>, end: DateTime<Utc>, hourly_rate: f64) -> ResourceUsage {
    usage_for(billable_seconds(start, end), hourly_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_billable_seconds_rounds_up() {
        let start = Utc::now();
        assert_eq!(billable_seconds(start, start + Duration::milliseconds(1500)), 2);
        assert_eq!(billable_seconds(start, start + Duration::seconds(90)), 90);
    }

    #[test]
    fn test_billable_seconds_minimum_one() {
        let start = Utc::now();
        assert_eq!(billable_seconds(start, start), 1);
        // Clock skew must not produce zero or negative usage.
        assert_eq!(billable_seconds(start, start - Duration::seconds(5)), 1);
    }

    #[test]
    fn test_cost_is_seconds_times_rate() {
        let usage = usage_for(3600, 0.42);
        assert!((usage.cost_usd - 0.42).abs() < 1e-9);

        let usage = usage_for(90, 0.5);
        assert!((usage.cost_usd - 0.0125).abs() < 1e-9);

        let usage = usage_for(1, 0.33);
        assert!((usage.cost_usd - 0.000_092).abs() < 1e-9);
    }
}
