//! Transient failures are retried up to the attempt limit

use rstest::rstest;
use test_utils::{
    DestinationCall, DestinationState, ErrorKind, JobStatus, MockDestination, TestContext,
};

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
#[tokio::test]
async fn test_transient_upload_failures_recovered(#[case] failures: u32) {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk").with_transient_failures(failures));
    let job = ctx.job().max_attempts(4).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllSucceeded);
    let disk = report.result("disk").unwrap();
    assert_eq!(disk.attempts, failures + 1);
    assert_eq!(ctx.destination("disk").put_count() as u32, failures + 1);
    assert_eq!(ctx.destination("disk").object_names().len(), 1);
    assert_eq!(ctx.destination("disk").staging_count(), 0);
}

#[tokio::test]
async fn test_attempts_exhausted() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk").with_transient_failures(10));
    let job = ctx.job().max_attempts(3).build();

    let report = ctx.run(&job).await;

    let disk = report.result("disk").unwrap();
    assert_eq!(disk.state, DestinationState::Failed);
    assert_eq!(disk.attempts, 3);
    assert_eq!(disk.error.as_ref().unwrap().kind, ErrorKind::Transfer);
    assert_eq!(ctx.destination("disk").put_count(), 3);
    assert!(ctx.destination("disk").object_names().is_empty());
}

#[tokio::test]
async fn test_connect_failures_retried() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk").with_connect_failures(2));
    let job = ctx.job().max_attempts(3).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllSucceeded);
    let connects = ctx
        .destination("disk")
        .get_calls()
        .into_iter()
        .filter(|c| *c == DestinationCall::Connect)
        .count();
    assert_eq!(connects, 3);
}

#[tokio::test]
async fn test_failed_verification_removes_artifact_then_retries() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk").with_verify_failures(1));
    let job = ctx.job().max_attempts(2).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllSucceeded);
    let disk = ctx.destination("disk");
    assert_eq!(disk.put_count(), 2);
    // the unverified copy from the first attempt was deleted
    assert_eq!(disk.delete_count(), 1);
    assert_eq!(disk.object_names(), vec![report.artifact.unwrap().name]);
}

#[tokio::test]
async fn test_no_retry_with_single_attempt() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk").with_transient_failures(1));
    let job = ctx.job().max_attempts(1).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllFailed);
    assert_eq!(report.result("disk").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_each_retry_is_reported() {
    use db_backup::managers::events::ProgressEvent;

    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk").with_transient_failures(2));
    let job = ctx.job().max_attempts(3).build();

    let (report, events) = ctx.run_with_events(&job).await;

    assert_eq!(report.status, JobStatus::AllSucceeded);
    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::RetryScheduled { attempt, error, .. } => {
                assert_eq!(error.kind, ErrorKind::Transfer);
                Some(*attempt)
            }
            _ => None,
        })
        .collect();
    assert_eq!(attempts, [1, 2]);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::JobFinished { status: JobStatus::AllSucceeded })
    ));
}
