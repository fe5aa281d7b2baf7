/// Utility functions and helpers
use std::time::Duration;

/// Generate a random activity id used to correlate the attempts of one request
pub fn generate_activity_id() -> String {
    let value: u128 = rand::random();
    let hex = format!("{:032x}", value);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Format a request charge, e.g. `2.86 RU`
pub fn format_request_units(charge: f64) -> String {
    format!("{:.2} RU", charge)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_activity_id() {
        let id1 = generate_activity_id();
        let id2 = generate_activity_id();

        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36);
        let groups: Vec<usize> = id1.split('-').map(str::len).collect();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h1m1s");
    }

    #[test]
    fn test_format_request_units() {
        assert_eq!(format_request_units(2.857), "2.86 RU");
        assert_eq!(format_request_units(10.0), "10.00 RU");
    }
}
