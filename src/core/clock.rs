use time::{macros::format_description, OffsetDateTime};

/// Seconds since the unix epoch with sub-second precision.
pub fn unix_seconds() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

/// Human-readable `YYYY-MM-DD HH:MM:SS` stamp used in bootstrap reports.
pub fn timestamp() -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_shape() {
        let stamp = timestamp();
        assert_eq!(stamp.len(), 19);
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[10..11], " ");
    }

    #[test]
    fn unix_seconds_is_monotonic_enough() {
        let first = unix_seconds();
        let second = unix_seconds();
        assert!(second >= first);
        assert!(first > 1_600_000_000.0);
    }
}
