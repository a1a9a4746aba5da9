//! Cancellation and timeouts stop in-flight transfers cleanly

use serial_test::serial;
use std::time::Duration;
use test_utils::{
    CancelHandle, DestinationState, ErrorKind, JobStatus, MockDestination, SourceCall,
    TestContext,
};

#[tokio::test]
#[serial]
async fn test_timeout_fails_hanging_destination_only() {
    let ctx = TestContext::new()
        .with_destination(MockDestination::new("disk"))
        .with_destination(MockDestination::new("tape").hanging());
    let job = ctx.job().keep_last(3).timeout(Duration::from_millis(300)).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::PartialFailure);
    assert_eq!(report.result("disk").unwrap().state, DestinationState::RetentionApplied);

    let tape = report.result("tape").unwrap();
    assert_eq!(tape.state, DestinationState::Failed);
    assert_eq!(tape.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    // nothing partial is left behind
    assert_eq!(ctx.destination("tape").staging_count(), 0);
    assert!(ctx.destination("tape").object_names().is_empty());
    assert_eq!(ctx.spool_leftovers(), 0);
}

#[tokio::test]
#[serial]
async fn test_operator_cancel_during_transfer() {
    let ctx = TestContext::new().with_destination(MockDestination::new("tape").hanging());
    let job = ctx.job().build();
    let (handle, signal) = CancelHandle::new();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });
    let report = ctx.run_with_cancel(&job, &signal).await;
    canceller.await.unwrap();

    assert_eq!(report.status, JobStatus::AllFailed);
    let tape = report.result("tape").unwrap();
    assert_eq!(tape.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(tape.attempts, 1);
    assert_eq!(ctx.destination("tape").staging_count(), 0);
}

#[tokio::test]
async fn test_cancelled_before_start_touches_nothing() {
    let ctx = TestContext::new().with_destination(MockDestination::new("disk"));
    let job = ctx.job().build();
    let (handle, signal) = CancelHandle::new();
    handle.cancel();

    let report = ctx.run_with_cancel(&job, &signal).await;

    assert_eq!(report.status, JobStatus::AllFailed);
    assert_eq!(report.fatal_error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(ctx.source().count(&SourceCall::StreamDump), 0);
    assert_eq!(ctx.destination("disk").put_count(), 0);
}
