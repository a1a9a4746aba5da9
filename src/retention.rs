//! Retention selection
//!
//! Pure and deterministic: artifacts are ordered newest first by creation
//! time, ties broken by name, and the artifact produced by the current run
//! is never selected.

use crate::report::ArtifactDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which prior artifacts to keep at a destination.
///
/// An artifact is deleted when it falls outside `keep_last` or is older than
/// `max_age_days`. With neither set, nothing is deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    /// Keep the newest N artifacts, the new one included
    pub keep_last: Option<usize>,
    /// Delete artifacts older than this many days
    pub max_age_days: Option<u32>,
}

impl RetentionRule {
    pub fn keep_last(n: usize) -> Self {
        Self {
            keep_last: Some(n),
            max_age_days: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.keep_last.is_none() && self.max_age_days.is_none()
    }
}

/// Select the artifacts to delete, oldest first.
///
/// `new_artifact` is treated as present even if the listing missed it.
pub fn select_for_deletion(
    existing: &[ArtifactDescriptor],
    new_artifact: &ArtifactDescriptor,
    rule: &RetentionRule,
    now: DateTime<Utc>,
) -> Vec<ArtifactDescriptor> {
    if rule.is_noop() {
        return Vec::new();
    }

    let mut all: Vec<&ArtifactDescriptor> = existing
        .iter()
        .filter(|a| a.name != new_artifact.name)
        .collect();
    all.push(new_artifact);
    all.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });

    let cutoff = rule
        .max_age_days
        .map(|days| now - chrono::Duration::days(i64::from(days)));

    let mut doomed: Vec<ArtifactDescriptor> = all
        .iter()
        .enumerate()
        .filter(|(_, a)| a.name != new_artifact.name)
        .filter(|(position, a)| {
            let beyond_count = rule.keep_last.is_some_and(|n| *position >= n);
            let too_old = cutoff.is_some_and(|c| a.created_at < c);
            beyond_count || too_old
        })
        .map(|(_, a)| (*a).clone())
        .collect();

    doomed.reverse();
    doomed
}
