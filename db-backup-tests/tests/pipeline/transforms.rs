//! Artifacts carry the job's transform chain end to end

use db_backup::credentials::{SecretKind, StaticCredentials};
use flate2::read::GzDecoder;
use std::io::Read;
use test_utils::{large_dump, sample_dump, JobStatus, MockDestination, MockSource, TestContext};

#[tokio::test]
async fn test_compressed_artifact_round_trips() {
    let ctx = TestContext::new().with_destination(MockDestination::new("disk"));
    let job = ctx.job().compressed(6).build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllSucceeded);
    let name = report.artifact.unwrap().name;
    assert!(name.ends_with(".sql.gz"), "{}", name);

    let stored = ctx.destination("disk").object(&name).unwrap().data;
    let mut plain = Vec::new();
    GzDecoder::new(stored.as_slice()).read_to_end(&mut plain).unwrap();
    assert_eq!(plain, sample_dump());
}

#[tokio::test]
async fn test_encrypted_artifact_hides_plaintext() {
    let payload = large_dump(200 * 1024);
    let ctx = TestContext::new()
        .with_source(MockSource::new(payload.clone()).with_chunk_size(4096))
        .with_credentials(StaticCredentials::new().with(
            SecretKind::EncryptionKey,
            "vault",
            "correct horse battery staple",
        ))
        .with_destination(MockDestination::new("disk"))
        .with_destination(MockDestination::new("cloud"));
    let job = ctx.job().encrypted("vault").build();

    let report = ctx.run(&job).await;

    assert_eq!(report.status, JobStatus::AllSucceeded);
    let artifact = report.artifact.unwrap();
    assert!(artifact.name.ends_with(".sql.enc"), "{}", artifact.name);

    let disk = ctx.destination("disk").object(&artifact.name).unwrap().data;
    let cloud = ctx.destination("cloud").object(&artifact.name).unwrap().data;
    // one spool, identical bytes everywhere
    assert_eq!(disk, cloud);
    assert_eq!(disk.len() as u64, artifact.size_bytes);
    assert!(disk.len() > payload.len());
    assert!(!disk.windows(64).any(|w| w == &payload[..64]));
}
