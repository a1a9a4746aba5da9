//! Tests for retention selection

use chrono::{DateTime, Utc};
use db_backup::report::{ArtifactDescriptor, ArtifactStatus};
use db_backup::retention::{select_for_deletion, RetentionRule};
use rstest::rstest;
use test_utils::{artifact_at, days_before_start, run_start};

fn descriptor(created_at: DateTime<Utc>) -> ArtifactDescriptor {
    ArtifactDescriptor {
        name: artifact_at("nightly", created_at),
        size_bytes: 10,
        checksum: None,
        created_at,
        destination: "disk".to_string(),
        status: ArtifactStatus::Succeeded,
    }
}

/// Daily artifacts, newest first, the first one being today's run
fn history(days: i64) -> Vec<ArtifactDescriptor> {
    (0..days).map(|d| descriptor(days_before_start(d))).collect()
}

#[rstest]
#[case(1, 9)]
#[case(3, 7)]
#[case(10, 0)]
#[case(15, 0)]
fn test_keep_last_deletes_the_rest(#[case] keep: usize, #[case] expected: usize) {
    let existing = history(10);
    let doomed = select_for_deletion(&existing, &existing[0], &RetentionRule::keep_last(keep), run_start());
    assert_eq!(doomed.len(), expected);
}

#[test]
fn test_oldest_deleted_first() {
    let existing = history(5);
    let doomed = select_for_deletion(&existing, &existing[0], &RetentionRule::keep_last(2), run_start());
    let names: Vec<&str> = doomed.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, [existing[4].name.as_str(), existing[3].name.as_str(), existing[2].name.as_str()]);
}

#[test]
fn test_new_artifact_never_selected() {
    // clock skew: the new artifact looks older than everything listed
    let new = descriptor(days_before_start(30));
    let mut existing = history(3);
    existing.push(new.clone());

    let rule = RetentionRule {
        keep_last: Some(1),
        max_age_days: Some(7),
    };
    let doomed = select_for_deletion(&existing, &new, &rule, run_start());
    assert!(doomed.iter().all(|a| a.name != new.name));
}

#[test]
fn test_new_artifact_counted_when_listing_missed_it() {
    let existing = history(4);
    let new = descriptor(run_start() + chrono::Duration::hours(1));
    let doomed = select_for_deletion(&existing, &new, &RetentionRule::keep_last(2), run_start());
    // new + newest listed survive
    assert_eq!(doomed.len(), 3);
}

#[rstest]
#[case(Some(3), Some(5), 7)]
#[case(Some(8), Some(5), 4)]
#[case(None, Some(5), 4)]
#[case(None, None, 0)]
fn test_count_and_age_combined(
    #[case] keep_last: Option<usize>,
    #[case] max_age_days: Option<u32>,
    #[case] expected: usize,
) {
    let existing = history(10);
    let rule = RetentionRule {
        keep_last,
        max_age_days,
    };
    let doomed = select_for_deletion(&existing, &existing[0], &rule, run_start());
    assert_eq!(doomed.len(), expected);
}

#[test]
fn test_selection_is_deterministic() {
    let existing = history(6);
    let mut shuffled = existing.clone();
    shuffled.reverse();
    shuffled.swap(1, 4);

    let rule = RetentionRule::keep_last(3);
    let a = select_for_deletion(&existing, &existing[0], &rule, run_start());
    let b = select_for_deletion(&shuffled, &existing[0], &rule, run_start());
    assert_eq!(a, b);
}
