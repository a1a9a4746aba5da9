//! Failures before fan-out abort the whole run

use db_backup::credentials::{SecretKind, StaticCredentials};
use test_utils::{
    large_dump, DestinationState, ErrorKind, JobStatus, MockDestination, MockSource, SourceCall,
    TestContext,
};

#[tokio::test]
async fn test_dump_failure_reaches_no_destination() {
    let ctx = TestContext::new()
        .with_source(MockSource::new(large_dump(64 * 1024)).failing_after(8 * 1024))
        .with_destination(MockDestination::new("disk"))
        .with_destination(MockDestination::new("cloud"));
    let job = ctx.job().build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllFailed);
    assert_eq!(report.fatal_error.as_ref().unwrap().kind, ErrorKind::Source);
    assert!(report.artifact.is_none());
    for result in &report.destinations {
        assert_eq!(result.state, DestinationState::Failed);
        assert_eq!(result.attempts, 0);
    }
    assert!(ctx.destination("disk").get_calls().is_empty());
    assert!(ctx.destination("cloud").get_calls().is_empty());
    assert_eq!(ctx.source().count(&SourceCall::Close), 1);
    assert_eq!(ctx.spool_leftovers(), 0);
}

#[tokio::test]
async fn test_rejected_database_credentials_not_retried() {
    let ctx = TestContext::new()
        .with_source(MockSource::new(b"x".to_vec()).rejecting_auth())
        .with_destination(MockDestination::new("disk"));
    let job = ctx.job().max_attempts(5).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.fatal_error.as_ref().unwrap().kind, ErrorKind::Authentication);
    assert_eq!(ctx.source().count(&SourceCall::Connect), 1);
}

#[tokio::test]
async fn test_unreachable_database_after_retries() {
    let ctx = TestContext::new()
        .with_source(MockSource::new(b"x".to_vec()).with_connect_failures(10))
        .with_destination(MockDestination::new("disk"));
    let job = ctx.job().max_attempts(3).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.fatal_error.as_ref().unwrap().kind, ErrorKind::Connection);
    assert_eq!(ctx.source().count(&SourceCall::Connect), 3);
    assert_eq!(ctx.source().count(&SourceCall::StreamDump), 0);
}

#[tokio::test]
async fn test_missing_encryption_key_is_fatal() {
    let ctx = TestContext::new()
        .with_credentials(StaticCredentials::new().with(SecretKind::DatabasePassword, "main", "pw"))
        .with_destination(MockDestination::new("disk"));
    let job = ctx.job().encrypted("vault").build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllFailed);
    assert_eq!(report.fatal_error.as_ref().unwrap().kind, ErrorKind::Encryption);
    assert!(ctx.source().get_calls().is_empty());
}
