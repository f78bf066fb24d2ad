use chrono::{DateTime, Local, Utc};

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Local calendar day for a received_at timestamp, as `YYYY-MM-DD`.
pub fn day_of(received_at_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(received_at_ms)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .with_timezone(&Local)
        .format("%Y-%m-%d")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_of_formats_calendar_date() {
        let day = day_of(now_millis());
        assert_eq!(day.len(), 10);
        assert_eq!(&day[4..5], "-");
        assert_eq!(&day[7..8], "-");
    }
}
