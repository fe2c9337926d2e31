//! Human-readable rendering of byte counts, transfer rates and durations
//! for verbose output.

use std::time::Duration;

use crate::constants::{GB, KB, MB};

/// Binary-unit thresholds, largest first.
const UNITS: &[(u64, &str)] = &[(GB, "GB"), (MB, "MB"), (KB, "KB")];

#[allow(clippy::cast_precision_loss)]
fn scale_binary(value: u64, suffix: &str) -> String {
    for &(scale, unit) in UNITS {
        if value >= scale {
            return format!("{:.2} {unit}{suffix}", value as f64 / scale as f64);
        }
    }
    format!("{value} B{suffix}")
}

/// Renders a byte count with a binary-unit suffix (B, KB, MB, GB).
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    scale_binary(bytes, "")
}

/// Renders a transfer rate as a byte count per second.
#[must_use]
pub fn format_speed(bytes_per_sec: u64) -> String {
    scale_binary(bytes_per_sec, "/s")
}

/// Renders a duration with the largest unit its magnitude calls for:
/// `0.5s`, `1m 05s`, `1h 01m 05s`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);

    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}.{}s", d.subsec_millis() / 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_pick_the_largest_fitting_unit() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(KB), "1.00 KB");
        assert_eq!(format_bytes(KB + KB / 2), "1.50 KB");
        assert_eq!(format_bytes(MB), "1.00 MB");
        assert_eq!(format_bytes(3 * GB / 2), "1.50 GB");
    }

    #[test]
    fn speed_carries_the_per_second_suffix() {
        assert_eq!(format_speed(2 * MB), "2.00 MB/s");
        assert_eq!(format_speed(100), "100 B/s");
    }

    #[test]
    fn duration_grows_units_with_magnitude() {
        assert_eq!(format_duration(Duration::ZERO), "0.0s");
        assert_eq!(format_duration(Duration::from_millis(500)), "0.5s");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 05s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 01m 05s");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn scaling_never_panics(value in 0u64..u64::MAX) {
                let _ = format_bytes(value);
                let _ = format_speed(value);
            }

            #[test]
            fn duration_rendering_never_panics(millis in 0u64..1_000_000_000) {
                let _ = format_duration(Duration::from_millis(millis));
            }

            #[test]
            fn rendered_bytes_end_with_a_unit(value in 0u64..u64::MAX) {
                let rendered = format_bytes(value);
                prop_assert!(rendered.ends_with('B'));
            }
        }
    }
}
