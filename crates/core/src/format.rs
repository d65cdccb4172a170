//! Human-readable formatting helpers for log and progress output.

const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Format a byte count as a human-readable string with the given number of
/// fractional digits, e.g. `human_bytes(5_242_880, 1)` -> `"5.0 MiB"`.
pub fn human_bytes(bytes: u64, precision: usize) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.precision$} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_stay_integral() {
        assert_eq!(human_bytes(0, 1), "0 B");
        assert_eq!(human_bytes(512, 2), "512 B");
    }

    #[test]
    fn scales_through_units() {
        assert_eq!(human_bytes(1024, 1), "1.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024, 1), "5.0 MiB");
        assert_eq!(human_bytes(25 * 1024 * 1024, 2), "25.00 MiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024, 1), "3.0 GiB");
    }

    #[test]
    fn rounds_partial_values() {
        assert_eq!(human_bytes(1536, 1), "1.5 KiB");
        assert_eq!(human_bytes(1024 * 1024 + 512 * 1024, 1), "1.5 MiB");
    }
}
