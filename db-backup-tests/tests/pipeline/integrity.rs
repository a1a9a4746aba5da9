//! Corrupted uploads are detected and never left listable

use test_utils::{
    artifact_at, days_before_start, DestinationState, ErrorKind, JobStatus, MockDestination,
    TestContext,
};

#[tokio::test]
async fn test_corrupted_upload_rejected_and_removed() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk"))
        .with_destination(MockDestination::new("flaky").corrupting());
    let job = ctx.job().max_attempts(3).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::PartialFailure);
    let flaky = report.result("flaky").unwrap();
    assert_eq!(flaky.state, DestinationState::Failed);
    assert_eq!(flaky.error.as_ref().unwrap().kind, ErrorKind::Integrity);
    // integrity errors are not transient
    assert_eq!(flaky.attempts, 1);
    assert!(flaky.artifact.is_none());
    assert!(ctx.destination("flaky").object_names().is_empty());
}

#[tokio::test]
async fn test_corruption_leaves_prior_artifacts_alone() {
    let prior = artifact_at("nightly", days_before_start(1));
    let ctx = TestContext::new().with_destination(
        MockDestination::new("flaky")
            .corrupting()
            .with_object(&prior, b"yesterday", days_before_start(1)),
    );
    let job = ctx.job().keep_last(1).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllFailed);
    // retention never runs without a verified artifact
    assert_eq!(ctx.destination("flaky").object_names(), vec![prior]);
    assert!(report.result("flaky").unwrap().deleted.is_empty());
}

#[tokio::test]
async fn test_report_checksum_matches_stored_bytes() {
    let ctx = TestContext::new().with_destination(MockDestination::new("disk"));
    let job = ctx.job().build();

    let report = ctx.run(&job).await;

    let artifact = report.artifact.as_ref().unwrap();
    let stored = report.result("disk").unwrap().artifact.as_ref().unwrap();
    assert_eq!(stored.checksum.as_deref(), Some(artifact.checksum.as_str()));
    assert_eq!(stored.size_bytes, artifact.size_bytes);
    assert_eq!(
        artifact.checksum,
        db_backup::utils::sha256_hex(&ctx.destination("disk").object(&artifact.name).unwrap().data)
    );
}
