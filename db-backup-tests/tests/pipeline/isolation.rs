//! One destination failing never affects the others

use test_utils::{DestinationState, ErrorKind, JobStatus, MockDestination, TestContext};

#[tokio::test]
async fn test_failed_destination_does_not_block_others() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk"))
        .with_destination(MockDestination::new("offsite").failing_permanently())
        .with_destination(MockDestination::new("cloud"));
    let job = ctx.job().keep_last(5).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::PartialFailure);
    assert_eq!(report.exit_code(), 2);

    let offsite = report.result("offsite").unwrap();
    assert_eq!(offsite.state, DestinationState::Failed);
    assert_eq!(offsite.error.as_ref().unwrap().kind, ErrorKind::Authentication);
    // authentication failures are not retried
    assert_eq!(offsite.attempts, 1);

    let artifact = report.artifact.as_ref().unwrap();
    for name in ["disk", "cloud"] {
        assert_eq!(report.result(name).unwrap().state, DestinationState::RetentionApplied);
        let stored = ctx.destination(name).object(&artifact.name).unwrap();
        assert_eq!(stored.data.len() as u64, artifact.size_bytes);
    }
    assert!(ctx.destination("offsite").object_names().is_empty());
}

#[tokio::test]
async fn test_results_keep_configuration_order() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("zeta"))
        .with_destination(MockDestination::new("alpha").failing_permanently())
        .with_destination(MockDestination::new("mid"));
    let job = ctx.job().build();

    let report = ctx.run(&job).await;

    let order: Vec<_> = report.destinations.iter().map(|d| d.destination.as_str()).collect();
    assert_eq!(order, ["zeta", "alpha", "mid"]);
}

#[tokio::test]
async fn test_missing_credentials_fail_only_that_destination() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk"))
        .with_destination(MockDestination::new("cloud"))
        .with_missing_credentials("cloud");
    let job = ctx.job().build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::PartialFailure);
    let cloud = report.result("cloud").unwrap();
    assert_eq!(cloud.state, DestinationState::Failed);
    assert_eq!(cloud.error.as_ref().unwrap().kind, ErrorKind::Credential);
    assert_eq!(report.result("disk").unwrap().state, DestinationState::RetentionApplied);
}

#[tokio::test]
async fn test_every_destination_failing_is_all_failed() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("a").failing_permanently())
        .with_destination(MockDestination::new("b").failing_permanently());
    let job = ctx.job().build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllFailed);
    assert_eq!(report.exit_code(), 1);
    // the artifact was produced even though nobody stored it
    assert!(report.artifact.is_some());
    assert!(report.fatal_error.is_none());
}
