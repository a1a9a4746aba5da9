//! Building adapters from resolved configuration
//!
//! Credentials are resolved here, one adapter at a time, so a missing secret
//! only affects the adapter that needs it.

use crate::config::{BackupJob, DestinationConfig, DestinationTarget, Engine};
use crate::credentials::{CredentialProvider, SecretKind};
use crate::destinations::{
    DestinationAdapter, LocalDestination, S3Destination, SftpAuth, SftpDestination,
};
use crate::error::{BackupError, Result};
use crate::sources::{MySqlSource, PostgresSource, SourceAdapter};

pub trait AdapterFactory: Send + Sync {
    fn source(
        &self,
        job: &BackupJob,
        credentials: &dyn CredentialProvider,
    ) -> Result<Box<dyn SourceAdapter>>;

    fn destination(
        &self,
        target: &DestinationTarget,
        credentials: &dyn CredentialProvider,
    ) -> Result<Box<dyn DestinationAdapter>>;
}

/// Factory for the real database and storage backends
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn source(
        &self,
        job: &BackupJob,
        credentials: &dyn CredentialProvider,
    ) -> Result<Box<dyn SourceAdapter>> {
        let password = job
            .source
            .password_ref
            .as_deref()
            .map(|id| credentials.resolve(SecretKind::DatabasePassword, id))
            .transpose()?;

        let source: Box<dyn SourceAdapter> = match job.source.engine {
            Engine::Mysql => Box::new(MySqlSource::new(&job.source, password)?),
            Engine::Postgres => Box::new(PostgresSource::new(&job.source, password)?),
        };
        Ok(source)
    }

    fn destination(
        &self,
        target: &DestinationTarget,
        credentials: &dyn CredentialProvider,
    ) -> Result<Box<dyn DestinationAdapter>> {
        let destination: Box<dyn DestinationAdapter> = match &target.config {
            DestinationConfig::Local(local) => {
                Box::new(LocalDestination::new(&target.name, &local.path))
            }
            DestinationConfig::S3(s3) => {
                let access = credentials.resolve(SecretKind::CloudAccessKey, &s3.access_key_ref)?;
                let secret = credentials.resolve(SecretKind::CloudSecretKey, &s3.secret_key_ref)?;
                Box::new(S3Destination::new(&target.name, s3, access, secret)?)
            }
            DestinationConfig::Sftp(sftp) => {
                let auth = if let Some(key_ref) = &sftp.private_key_ref {
                    let key = credentials.resolve(SecretKind::SshPrivateKey, key_ref)?;
                    // an unencrypted key has no passphrase entry
                    let passphrase = match credentials.resolve(SecretKind::SshKeyPassphrase, key_ref) {
                        Ok(p) => Some(p),
                        Err(BackupError::Credential { .. }) => None,
                        Err(e) => return Err(e),
                    };
                    SftpAuth::PrivateKey { key, passphrase }
                } else if let Some(password_ref) = &sftp.password_ref {
                    SftpAuth::Password(credentials.resolve(SecretKind::SshPassword, password_ref)?)
                } else {
                    return Err(BackupError::Config(format!(
                        "Destination '{}': sftp needs password_ref or private_key_ref",
                        target.name
                    )));
                };
                Box::new(SftpDestination::new(&target.name, sftp, auth))
            }
        };
        Ok(destination)
    }
}

/// Factory handing out pre-built mock adapters
#[allow(dead_code)]
pub mod mock {
    use super::*;
    use crate::destinations::mock::MockDestination;
    use crate::sources::mock::MockSource;
    use std::collections::{HashMap, HashSet};

    pub struct MockAdapterFactory {
        source: MockSource,
        destinations: HashMap<String, MockDestination>,
        missing_credentials: HashSet<String>,
    }

    impl MockAdapterFactory {
        pub fn new(source: MockSource) -> Self {
            Self {
                source,
                destinations: HashMap::new(),
                missing_credentials: HashSet::new(),
            }
        }

        /// Register a destination under its own name
        pub fn with_destination(mut self, destination: MockDestination) -> Self {
            self.destinations
                .insert(destination.name().to_string(), destination);
            self
        }

        /// Make credential resolution fail for `destination`
        pub fn with_missing_credentials(mut self, destination: &str) -> Self {
            self.missing_credentials.insert(destination.to_string());
            self
        }

        pub fn mock_source(&self) -> &MockSource {
            &self.source
        }

        pub fn mock_destination(&self, name: &str) -> Option<&MockDestination> {
            self.destinations.get(name)
        }
    }

    impl AdapterFactory for MockAdapterFactory {
        fn source(
            &self,
            _job: &BackupJob,
            _credentials: &dyn CredentialProvider,
        ) -> Result<Box<dyn SourceAdapter>> {
            Ok(Box::new(self.source.clone()))
        }

        fn destination(
            &self,
            target: &DestinationTarget,
            _credentials: &dyn CredentialProvider,
        ) -> Result<Box<dyn DestinationAdapter>> {
            if self.missing_credentials.contains(&target.name) {
                return Err(BackupError::Credential {
                    kind: SecretKind::CloudSecretKey.to_string(),
                    id: target.name.clone(),
                    reason: "not found".to_string(),
                });
            }
            let destination = self.destinations.get(&target.name).ok_or_else(|| {
                BackupError::Config(format!("No mock registered for '{}'", target.name))
            })?;
            Ok(Box::new(destination.clone()))
        }
    }
}
