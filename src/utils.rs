// =============================================================================
// Time Utilities
// =============================================================================
//
// Every timestamp in the system is naive UTC. SQLite rows and event-bus
// payloads both use the space-separated `YYYY-MM-DD HH:MM:SS` form; chart
// payloads additionally carry epoch milliseconds.
// =============================================================================

use chrono::{NaiveDateTime, Utc};

/// SQLite / event-bus datetime format (space separator, not `T`).
pub const RECORDING_TIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Current UTC time as a naive datetime (no timezone suffix on the wire).
pub fn utc_now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Format a recording time the way SQLite and the event payloads expect.
pub fn format_recording_time(ts: NaiveDateTime) -> String {
    ts.format(RECORDING_TIME_FMT).to_string()
}

/// Parse a recording time produced by [`format_recording_time`].
pub fn parse_recording_time(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, RECORDING_TIME_FMT).ok()
}

/// Epoch milliseconds for chart payloads.
pub fn epoch_ms(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_time_round_trip() {
        let now = utc_now();
        let formatted = format_recording_time(now);
        let parsed = parse_recording_time(&formatted).unwrap();
        // Sub-second precision is intentionally dropped by the wire format.
        assert_eq!(formatted, format_recording_time(parsed));
    }

    #[test]
    fn format_has_no_t_separator() {
        let formatted = format_recording_time(utc_now());
        assert!(!formatted.contains('T'));
        assert_eq!(formatted.len(), 19);
    }

    #[test]
    fn epoch_ms_is_milliseconds() {
        let ts = parse_recording_time("2025-01-01 00:00:00").unwrap();
        assert_eq!(epoch_ms(ts), 1_735_689_600_000);
    }
}
