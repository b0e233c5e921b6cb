//! JSON file store for the claimed resource.
//!
//! Writes go to a sibling temp file which is synced and renamed over the
//! target, then the directory is synced, so a crash leaves either the old
//! record or the new one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zoneclaim_id::ResourceId;

use crate::model::ResourceKind;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt state file {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The resource this node claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStateRecord {
    pub resource_id: ResourceId,
    pub kind: ResourceKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    /// Unix seconds of the claim that produced this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,

    /// False while a resource this node created still awaits its first
    /// preparation. Records without the field predate it and count as
    /// prepared.
    #[serde(default = "prepared")]
    pub initialized: bool,
}

fn prepared() -> bool {
    true
}

impl LocalStateRecord {
    pub fn new(resource_id: ResourceId, kind: ResourceKind) -> Self {
        Self {
            resource_id,
            kind,
            zone: None,
            claimed_at: None,
            initialized: true,
        }
    }
}

/// File-backed cache of the claimed resource.
#[derive(Debug, Clone)]
pub struct LocalStateCache {
    path: PathBuf,
}

impl LocalStateCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record. `None` if no record was ever saved.
    pub fn load(&self) -> Result<Option<LocalStateRecord>, StateStoreError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No local state");
                return Ok(None);
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let record = serde_json::from_slice(&data).map_err(|e| StateStoreError::Corrupt {
            path: self.path.clone(),
            detail: e.to_string(),
        })?;
        Ok(Some(record))
    }

    /// Durably replace the record.
    pub fn save(&self, record: &LocalStateRecord) -> Result<(), StateStoreError> {
        let data = serde_json::to_vec_pretty(record)?;
        let dir = self.dir();
        fs::create_dir_all(&dir).map_err(|e| self.io_error(e))?;

        let tmp = self.tmp_path();
        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)?;
            File::open(&dir)?.sync_all()
        };
        write().map_err(|e| self.io_error(e))?;

        debug!(
            path = %self.path.display(),
            resource_id = %record.resource_id,
            "Saved local state"
        );
        Ok(())
    }

    /// Remove the record. Clearing an absent record is not an error.
    pub fn clear(&self) -> Result<(), StateStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Cleared local state");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: io::Error) -> StateStoreError {
        StateStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
