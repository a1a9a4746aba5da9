//! Credential resolution
//!
//! The pipeline never looks up secrets on its own. Every secret (database
//! password, cloud keys, SSH material, encryption passphrase) is requested
//! from a [`CredentialProvider`] passed in at construction time.

use crate::error::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use zeroize::Zeroizing;

/// The kind of secret being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    DatabasePassword,
    CloudAccessKey,
    CloudSecretKey,
    SshPassword,
    SshPrivateKey,
    SshKeyPassphrase,
    EncryptionKey,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::DatabasePassword => "database_password",
            SecretKind::CloudAccessKey => "cloud_access_key",
            SecretKind::CloudSecretKey => "cloud_secret_key",
            SecretKind::SshPassword => "ssh_password",
            SecretKind::SshPrivateKey => "ssh_private_key",
            SecretKind::SshKeyPassphrase => "ssh_key_passphrase",
            SecretKind::EncryptionKey => "encryption_key",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let kind = match name {
            "database_password" => SecretKind::DatabasePassword,
            "cloud_access_key" => SecretKind::CloudAccessKey,
            "cloud_secret_key" => SecretKind::CloudSecretKey,
            "ssh_password" => SecretKind::SshPassword,
            "ssh_private_key" => SecretKind::SshPrivateKey,
            "ssh_key_passphrase" => SecretKind::SshKeyPassphrase,
            "encryption_key" => SecretKind::EncryptionKey,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved secret value, wiped from memory on drop
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Source of connection secrets
pub trait CredentialProvider: Send + Sync {
    /// Resolve a secret, failing with [`BackupError::Credential`] if unknown
    fn resolve(&self, kind: SecretKind, id: &str) -> Result<Secret>;
}

/// In-memory provider keyed by (kind, identifier)
#[derive(Default, Clone)]
pub struct StaticCredentials {
    secrets: HashMap<(SecretKind, String), Secret>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: SecretKind, id: &str, value: &str) {
        self.secrets
            .insert((kind, id.to_string()), Secret::new(value));
    }

    /// Builder-style variant of [`StaticCredentials::insert`]
    pub fn with(mut self, kind: SecretKind, id: &str, value: &str) -> Self {
        self.insert(kind, id, value);
        self
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Parse a secrets file: one TOML table per secret kind, mapping
    /// identifiers to values.
    ///
    /// ```toml
    /// [database_password]
    /// main = "hunter2"
    /// ```
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let tables: HashMap<String, HashMap<String, String>> = toml::from_str(contents)
            .map_err(|e| BackupError::Config(format!("Invalid secrets file: {}", e)))?;

        let mut creds = Self::new();
        for (kind_name, entries) in tables {
            let kind = SecretKind::parse(&kind_name).ok_or_else(|| {
                BackupError::Config(format!("Unknown secret kind in secrets file: {}", kind_name))
            })?;
            for (id, value) in entries {
                creds.insert(kind, &id, &value);
            }
        }
        Ok(creds)
    }

    /// Load a secrets file from disk. Used by the command-line front end only.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("Failed to read secrets file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&contents)
    }
}

impl CredentialProvider for StaticCredentials {
    fn resolve(&self, kind: SecretKind, id: &str) -> Result<Secret> {
        self.secrets
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| BackupError::Credential {
                kind: kind.to_string(),
                id: id.to_string(),
                reason: "not found".to_string(),
            })
    }
}
