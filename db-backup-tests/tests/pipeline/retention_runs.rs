//! Retention across consecutive runs

use test_utils::{
    artifact_at, days_before_start, run_start, DestinationState, ErrorKind, JobStatus,
    MockDestination, TestContext,
};

#[tokio::test]
async fn test_keep_last_two_over_three_runs() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("offsite"))
        .with_destination(MockDestination::new("cloud"));
    let job = ctx.job().keep_last(2).build();

    let mut names = Vec::new();
    for _ in 0..3 {
        let report = ctx.run(&job).await;
        assert_eq!(report.status, JobStatus::AllSucceeded);
        assert_eq!(report.destinations.len(), 2);
        names.push(report.artifact.unwrap().name);
        ctx.advance_hours(24);
    }

    // every destination prunes on its own and ends with the two newest
    for destination in ["offsite", "cloud"] {
        assert_eq!(
            ctx.destination(destination).object_names(),
            names[1..].to_vec(),
            "{}",
            destination
        );
    }
}

#[tokio::test]
async fn test_prior_artifacts_pruned_oldest_first() {
    let mut disk = MockDestination::new("disk");
    for days in 1..=4 {
        disk = disk.with_object(
            &artifact_at("nightly", days_before_start(days)),
            b"old",
            days_before_start(days),
        );
    }
    let ctx = TestContext::new().with_destination(disk);
    let job = ctx.job().keep_last(3).build();

    let report = ctx.run(&job).await;

    let deleted: Vec<_> = report.result("disk").unwrap().deleted.iter().map(|a| a.name.clone()).collect();
    assert_eq!(
        deleted,
        vec![
            artifact_at("nightly", days_before_start(4)),
            artifact_at("nightly", days_before_start(3)),
        ]
    );
    assert_eq!(ctx.destination("disk").object_names().len(), 3);
}

#[tokio::test]
async fn test_max_age_prunes_old_artifacts() {
    let ctx = TestContext::new().with_destination(
        MockDestination::new("disk")
            .with_object(&artifact_at("nightly", days_before_start(2)), b"x", days_before_start(2))
            .with_object(&artifact_at("nightly", days_before_start(40)), b"x", days_before_start(40)),
    );
    let job = ctx.job().max_age_days(30).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.result("disk").unwrap().deleted.len(), 1);
    assert_eq!(
        ctx.destination("disk").object_names(),
        vec![
            artifact_at("nightly", days_before_start(2)),
            artifact_at("nightly", run_start()),
        ]
    );
}

#[tokio::test]
async fn test_foreign_objects_ignored() {
    let ctx = TestContext::new().with_destination(
        MockDestination::new("disk")
            .with_object("nightly-notes.txt", b"keep me", days_before_start(100))
            .with_object(&artifact_at("weekly", days_before_start(50)), b"x", days_before_start(50)),
    );
    let job = ctx.job().keep_last(1).max_age_days(1).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllSucceeded);
    assert!(report.result("disk").unwrap().deleted.is_empty());
    assert_eq!(ctx.destination("disk").object_names().len(), 3);
}

#[tokio::test]
async fn test_failed_delete_keeps_verified_state() {
    let ctx = TestContext::new().with_destination(
        MockDestination::new("disk")
            .failing_deletes()
            .with_object(&artifact_at("nightly", days_before_start(1)), b"x", days_before_start(1)),
    );
    let job = ctx.job().keep_last(1).build();

    let report = ctx.run(&job).await;

    let disk = report.result("disk").unwrap();
    assert_eq!(disk.state, DestinationState::Succeeded);
    assert_eq!(disk.error.as_ref().unwrap().kind, ErrorKind::Transfer);
    assert!(disk.artifact.is_some());
    // verified but not pruned counts as a partial result
    assert_eq!(report.status, JobStatus::PartialFailure);
}

#[tokio::test]
async fn test_retention_runs_per_destination() {
    let old = artifact_at("nightly", days_before_start(1));
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk").with_object(&old, b"x", days_before_start(1)))
        .with_destination(
            MockDestination::new("cloud")
                .with_object(&old, b"x", days_before_start(1))
                .failing_permanently(),
        );
    let job = ctx.job().keep_last(1).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::PartialFailure);
    assert!(!ctx.destination("disk").object_names().contains(&old));
    // a failed destination keeps everything it had
    assert_eq!(ctx.destination("cloud").object_names(), vec![old]);
}
