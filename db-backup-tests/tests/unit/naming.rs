//! Tests for artifact naming

use db_backup::destinations::naming::{self, artifact_prefix, is_artifact};
use rstest::rstest;
use test_utils::{artifact_at, run_start};

#[test]
fn test_names_sort_by_creation_time() {
    let earlier = artifact_at("nightly", run_start());
    let later = artifact_at("nightly", run_start() + chrono::Duration::milliseconds(1));
    assert!(earlier < later);
}

#[test]
fn test_similar_job_names_do_not_collide() {
    let other = artifact_at("nightly-full", run_start());
    assert!(!is_artifact(&artifact_prefix("nightly"), &other));
    assert!(is_artifact(&artifact_prefix("nightly-full"), &other));
}

#[rstest]
#[case("nightly-20260501T030000000Z.sql", true)]
#[case("nightly-20260501T030000000Z.sql.gz.enc", true)]
#[case("nightly-latest.sql", false)]
#[case("nightly-2026050", false)]
#[case("README", false)]
#[case(".nightly-20260501T030000000Z.sql.ab12.partial", false)]
fn test_recognised_artifacts(#[case] name: &str, #[case] expected: bool) {
    assert_eq!(is_artifact("nightly-", name), expected);
}

#[test]
fn test_staging_names_are_hidden() {
    let staging = naming::staging_name(&artifact_at("nightly", run_start()), "ab12");
    assert!(naming::is_staging(&staging));
    assert!(!naming::is_staging(&artifact_at("nightly", run_start())));
}
