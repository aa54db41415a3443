//! Shared timestamp/event helpers for deterministic envelopes.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use ulid::Ulid;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", now_epoch_secs())
}

pub fn now_epoch_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Parses an epoch-`Z` stamp back into seconds.
pub fn parse_epoch_z(ts: &str) -> Option<u64> {
    ts.trim_end_matches('Z').parse().ok()
}

/// Calendar date (UTC) of an epoch-`Z` stamp. Used as the "as of" date for
/// temporal checks so a report depends on the group, not on the wall clock.
pub fn date_of_epoch_z(ts: &str) -> Option<NaiveDate> {
    let secs = parse_epoch_z(ts)?;
    DateTime::<Utc>::from_timestamp(i64::try_from(secs).ok()?, 0).map(|dt| dt.date_naive())
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Standard command response envelope shape used across CLI surfaces.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}
