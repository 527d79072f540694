use chrono::Utc;

/// Milliseconds since the unix epoch, as used by telemetry timestamps
/// and credential validation marks.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
