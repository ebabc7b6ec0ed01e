//! Credential store: persists the device identity record between runs.
//!
//! The file store keeps a JSON array of identity records and hands out the first one,
//! so a file written by an older multi-record layout still loads.

use crate::device::DeviceIdentity;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("reading credential store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential store {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing credential store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read/write access to the persisted device identity.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// First available identity record, if any.
    async fn get_identity(&self) -> Result<Option<DeviceIdentity>, StoreError>;
    /// Store the identity, replacing any record with the same device id.
    async fn put_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError>;
}

/// Credential store backed by a JSON file.
pub struct FileCredentialStore {
    path: PathBuf,
    entries: RwLock<Option<Vec<DeviceIdentity>>>,
}

impl FileCredentialStore {
    /// The file is read lazily on first access.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<Vec<DeviceIdentity>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(s) if s.trim().is_empty() => Ok(Vec::new()),
            Ok(s) => serde_json::from_str(&s).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(StoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn save(&self, entries: &[DeviceIdentity]) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::write(&self.path, json).await.map_err(write_err)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        if let Some(entries) = self.entries.read().await.as_ref() {
            return Ok(entries.first().cloned());
        }
        let mut guard = self.entries.write().await;
        if guard.is_none() {
            *guard = Some(self.read_file().await?);
        }
        Ok(guard.as_ref().and_then(|e| e.first().cloned()))
    }

    async fn put_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        let mut guard = self.entries.write().await;
        let previous = match guard.take() {
            Some(e) => e,
            None => self.read_file().await?,
        };
        let mut entries = previous.clone();
        if let Some(e) = entries.iter_mut().find(|e| e.device_id == identity.device_id) {
            *e = identity.clone();
        } else {
            entries.push(identity.clone());
        }
        match self.save(&entries).await {
            Ok(()) => {
                *guard = Some(entries);
                Ok(())
            }
            Err(e) => {
                *guard = Some(previous);
                Err(e)
            }
        }
    }
}
