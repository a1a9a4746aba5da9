//! Artifact names: `<job>-<YYYYMMDDTHHMMSSmmm>Z<suffix>`
//!
//! The embedded timestamp is the artifact's creation time, so retention can
//! order artifacts without trusting remote modification times.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

const STAMP_LEN: usize = 19;

/// Listing prefix shared by every artifact of a job
pub fn artifact_prefix(job: &str) -> String {
    format!("{}-", job)
}

/// Name for an artifact created at `created_at`; `suffix` includes the dot
pub fn artifact_name(job: &str, created_at: DateTime<Utc>, suffix: &str) -> String {
    format!(
        "{}{}{:03}Z{}",
        artifact_prefix(job),
        created_at.format("%Y%m%dT%H%M%S"),
        created_at.timestamp_subsec_millis(),
        suffix
    )
}

/// Creation time embedded in `name`, if it is an artifact under `prefix`
pub fn parse_timestamp(prefix: &str, name: &str) -> Option<DateTime<Utc>> {
    let rest = name.strip_prefix(prefix)?;
    let stamp = rest.get(..STAMP_LEN)?;
    if !stamp.is_ascii() || !stamp.ends_with('Z') {
        return None;
    }
    if !stamp[15..18].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let seconds = NaiveDateTime::parse_from_str(&stamp[..15], "%Y%m%dT%H%M%S").ok()?;
    let millis: i64 = stamp[15..18].parse().ok()?;
    Some(Utc.from_utc_datetime(&seconds) + chrono::Duration::milliseconds(millis))
}

/// Creation time embedded in `name` when the job is not known
pub fn embedded_timestamp(name: &str) -> Option<DateTime<Utc>> {
    name.match_indices('-')
        .find_map(|(i, _)| parse_timestamp(&name[..=i], name))
}

/// Whether `name` was produced for the job owning `prefix`
pub fn is_artifact(prefix: &str, name: &str) -> bool {
    parse_timestamp(prefix, name).is_some()
}

/// Hidden staging name used while an upload is in flight
pub fn staging_name(name: &str, token: &str) -> String {
    format!(".{}.{}.partial", name, token)
}

pub fn is_staging(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".partial")
}
