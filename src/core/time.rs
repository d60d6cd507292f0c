//! Shared timestamp and identifier helpers.

use chrono::{DateTime, SecondsFormat, Utc};
use ulid::Ulid;

/// Returns unix-epoch seconds.
pub fn now_epoch() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns the current instant as an RFC 3339 string with second precision
/// (e.g. `2026-08-01T09:30:00Z`). This is the timestamp format used in all
/// API payloads and persisted records.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Formats unix-epoch seconds as RFC 3339. Out-of-range values clamp to epoch.
pub fn epoch_to_iso(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Compact `YYYYMMDD` date token for the given epoch seconds (UTC).
///
/// Used when deriving sacred-plan verification codes; must stay stable
/// across restarts for codes to keep verifying.
pub fn date_token(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format("%Y%m%d")
        .to_string()
}

/// New ULID for events, tasks, and request correlation.
pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Short, URL-safe identifier with a type prefix, derived from a v4 UUID
/// (e.g. `proj_9f2c1ab3`, `plan_04d1e99a`).
pub fn short_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..8])
}
