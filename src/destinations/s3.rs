//! S3-compatible object storage destination
//!
//! Small artifacts go up in one `PutObject`; larger ones through a multipart
//! upload that only becomes visible on `CompleteMultipartUpload`. Each part
//! carries its SHA-256 so the service rejects parts corrupted in transit.

use super::{check_digest, naming, DestinationAdapter};
use crate::config::S3DestinationConfig;
use crate::credentials::Secret;
use crate::error::{BackupError, Result};
use crate::report::{ArtifactDescriptor, ArtifactStatus};
use crate::sources::ArtifactStream;
use crate::utils::cancel::CancelSignal;
use crate::utils::checksum::Checksum;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Smallest part size S3 accepts for all but the last part
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

pub struct S3Destination {
    name: String,
    bucket: String,
    prefix: String,
    region: String,
    endpoint: Option<String>,
    path_style: bool,
    access_key: Secret,
    secret_key: Secret,
    part_size: usize,
    client: Option<Client>,
}

/// Open multipart session
struct Multipart {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

impl S3Destination {
    pub fn new(
        name: &str,
        config: &S3DestinationConfig,
        access_key: Secret,
        secret_key: Secret,
    ) -> Result<Self> {
        let part_size = config.part_size_mb * 1024 * 1024;
        if part_size < MIN_PART_SIZE {
            return Err(BackupError::Config(format!(
                "Destination '{}': part size must be at least 5 MiB",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            path_style: config.path_style,
            access_key,
            secret_key,
            part_size,
            client: None,
        })
    }

    fn object_key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Inverse of [`Self::object_key`]
    fn artifact_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            Some(key)
        } else {
            key.strip_prefix(&self.prefix)?.strip_prefix('/')
        }
    }

    fn client(&self) -> Result<Client> {
        self.client.clone().ok_or_else(|| {
            BackupError::Connection(format!("Destination '{}' is not connected", self.name))
        })
    }

    async fn upload(
        &self,
        client: &Client,
        key: &str,
        stream: &mut ArtifactStream,
        cancel: &mut CancelSignal,
        session: &mut Option<Multipart>,
    ) -> Result<Checksum> {
        let mut checksum = Checksum::new();
        let mut buf: Vec<u8> = Vec::with_capacity(self.part_size);

        while let Some(chunk) = cancel.guard(stream.next_chunk()).await? {
            checksum.update(&chunk);
            buf.extend_from_slice(&chunk);

            while buf.len() >= self.part_size {
                let part: Vec<u8> = buf.drain(..self.part_size).collect();
                if session.is_none() {
                    *session = Some(self.start_multipart(client, key).await?);
                }
                if let Some(mp) = session.as_mut() {
                    let completed = cancel
                        .guard(self.upload_part(client, key, mp, part))
                        .await?;
                    mp.parts.push(completed);
                }
            }
        }

        match session.as_mut() {
            None => {
                // whole artifact fits in one part
                let digest = STANDARD.encode(Sha256::digest(&buf));
                client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .checksum_sha256(digest)
                    .body(ByteStream::from(buf))
                    .send()
                    .await
                    .map_err(|e| classify(e, BackupError::Transfer))?;
            }
            Some(mp) => {
                if !buf.is_empty() {
                    let completed = cancel.guard(self.upload_part(client, key, mp, buf)).await?;
                    mp.parts.push(completed);
                }
                let completion = CompletedMultipartUpload::builder()
                    .set_parts(Some(mp.parts.clone()))
                    .build();
                client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&mp.upload_id)
                    .multipart_upload(completion)
                    .send()
                    .await
                    .map_err(|e| classify(e, BackupError::Transfer))?;
                // completed uploads cannot be aborted
                *session = None;
            }
        }

        // the commit itself is never interrupted; a cancel that landed
        // meanwhile means the object will not be verified
        if cancel.is_cancelled() {
            self.discard(client, key).await;
            return Err(BackupError::Cancelled);
        }
        Ok(checksum)
    }

    async fn start_multipart(&self, client: &Client, key: &str) -> Result<Multipart> {
        let out = client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .send()
            .await
            .map_err(|e| classify(e, BackupError::Transfer))?;

        let upload_id = out
            .upload_id()
            .ok_or_else(|| BackupError::Transfer("S3 returned no upload id".to_string()))?
            .to_string();
        debug!("Started multipart upload {} for {}", upload_id, key);

        Ok(Multipart {
            upload_id,
            parts: Vec::new(),
        })
    }

    async fn upload_part(
        &self,
        client: &Client,
        key: &str,
        mp: &Multipart,
        data: Vec<u8>,
    ) -> Result<CompletedPart> {
        let part_number = mp.parts.len() as i32 + 1;
        let digest = STANDARD.encode(Sha256::digest(&data));

        let out = client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&mp.upload_id)
            .part_number(part_number)
            .checksum_sha256(&digest)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(e, BackupError::Transfer))?;

        Ok(CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(out.e_tag().map(str::to_string))
            .checksum_sha256(out.checksum_sha256().unwrap_or(&digest))
            .build())
    }

    /// Best-effort removal of an object committed by a cancelled upload
    async fn discard(&self, client: &Client, key: &str) {
        let result = client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(_) => info!("Removed unverified object {} after cancellation", key),
            Err(e) => warn!(
                "Failed to remove unverified object {}: {}",
                key,
                DisplayErrorContext(&e)
            ),
        }
    }

    async fn abort(&self, client: &Client, key: &str, mp: &Multipart) {
        let result = client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&mp.upload_id)
            .send()
            .await;
        match result {
            Ok(_) => debug!("Aborted multipart upload {}", mp.upload_id),
            Err(e) => warn!(
                "Failed to abort multipart upload {} for {}: {}",
                mp.upload_id,
                key,
                DisplayErrorContext(&e)
            ),
        }
    }
}

#[async_trait]
impl DestinationAdapter for S3Destination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<()> {
        let credentials = Credentials::new(
            self.access_key.expose(),
            self.secret_key.expose(),
            None,
            None,
            "db-backup",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(self.path_style);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = Client::from_conf(builder.build());

        client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if missing {
                    BackupError::Config(format!("Bucket '{}' does not exist", self.bucket))
                } else {
                    classify(e, BackupError::Connection)
                }
            })?;

        info!("Connected to S3 bucket {} for destination {}", self.bucket, self.name);
        self.client = Some(client);
        Ok(())
    }

    async fn put_stream(
        &mut self,
        name: &str,
        mut stream: ArtifactStream,
        cancel: &CancelSignal,
    ) -> Result<ArtifactDescriptor> {
        let client = self.client()?;
        let key = self.object_key(name);
        let mut cancel = cancel.clone();
        let mut session: Option<Multipart> = None;

        let result = self
            .upload(&client, &key, &mut stream, &mut cancel, &mut session)
            .await;

        let checksum = match result {
            Ok(checksum) => checksum,
            Err(e) => {
                if let Some(mp) = &session {
                    self.abort(&client, &key, mp).await;
                }
                return Err(e);
            }
        };

        let size_bytes = checksum.bytes();
        info!("Uploaded s3://{}/{} ({} bytes)", self.bucket, key, size_bytes);

        Ok(ArtifactDescriptor {
            name: name.to_string(),
            size_bytes,
            checksum: Some(checksum.finalize()),
            created_at: naming::embedded_timestamp(name).unwrap_or_else(Utc::now),
            destination: self.name.clone(),
            status: ArtifactStatus::Succeeded,
        })
    }

    async fn verify_checksum(&mut self, descriptor: &ArtifactDescriptor) -> Result<()> {
        let client = self.client()?;
        let key = self.object_key(&descriptor.name);

        let out = client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    BackupError::Integrity(format!("{} is missing after upload", key))
                } else {
                    classify(e, BackupError::Transfer)
                }
            })?;

        let mut body = out.body;
        let mut checksum = Checksum::new();
        while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|e| {
                BackupError::Transfer(format!("Failed reading s3://{}/{}: {}", self.bucket, key, e))
            })?;
            checksum.update(&bytes);
        }

        let size = checksum.bytes();
        check_digest(descriptor, &checksum.finalize(), size)
    }

    async fn list_existing(&mut self, prefix: &str) -> Result<Vec<ArtifactDescriptor>> {
        let client = self.client()?;
        let key_prefix = self.object_key(prefix);
        let mut found = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let out = client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&key_prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| classify(e, BackupError::Transfer))?;

            for object in out.contents() {
                let Some(name) = object.key().and_then(|k| self.artifact_name(k)) else {
                    continue;
                };
                if name.contains('/') {
                    continue;
                }
                let modified = object
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()));
                found.push(ArtifactDescriptor {
                    name: name.to_string(),
                    size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    checksum: None,
                    created_at: naming::parse_timestamp(prefix, name)
                        .or(modified)
                        .unwrap_or_else(Utc::now),
                    destination: self.name.clone(),
                    status: ArtifactStatus::Succeeded,
                });
            }

            match out.next_continuation_token() {
                Some(next) if out.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(found)
    }

    async fn delete_existing(&mut self, descriptor: &ArtifactDescriptor) -> Result<()> {
        let client = self.client()?;
        let key = self.object_key(&descriptor.name);

        client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify(e, BackupError::Transfer))?;

        // DeleteObject succeeds for absent keys, so confirm with a HEAD
        match client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Err(BackupError::Transfer(format!(
                "s3://{}/{} still present after delete",
                self.bucket, key
            ))),
            Err(e) if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) => Ok(()),
            Err(e) => Err(classify(e, BackupError::Transfer)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

/// Map an SDK failure onto the error taxonomy. Network-level failures use
/// `transient` (connection or transfer, depending on the phase).
fn classify<E, R>(err: SdkError<E, R>, transient: fn(String) -> BackupError) -> BackupError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let detail = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::ConstructionFailure(_) => BackupError::Config(detail),
        SdkError::ServiceError(_) => match err.code() {
            Some("AccessDenied")
            | Some("Forbidden")
            | Some("InvalidAccessKeyId")
            | Some("SignatureDoesNotMatch") => BackupError::Authentication(detail),
            Some("NoSuchBucket") => BackupError::Config(detail),
            _ => transient(detail),
        },
        _ => transient(detail),
    }
}
