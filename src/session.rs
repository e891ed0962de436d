use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const USER_INFO_KEY: &str = "SA-ZHKQ-USERINFO";
pub const TIMESTAMP_KEY: &str = "SA-ZHKQ-TIMESTAMP";
pub const DEFAULT_EXPIRY_HOURS: i64 = 4;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not access session store {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session store {} is not valid JSON: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode stored user: {0}")]
    Encode(#[from] serde_json::Error),
}

/// File-backed string map, the on-disk stand-in for browser local storage.
/// Values are opaque blobs.
#[derive(Debug, Clone)]
pub struct BlobStore {
    path: PathBuf,
}

impl BlobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_all()?.remove(key))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUser {
    pub token: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_code: String,
    /// Device code the backend issued at login, sent as `phone_code`.
    #[serde(default)]
    pub client_id: String,
}

/// The logged-in user kept in a [`BlobStore`], with an expiry window measured
/// from the moment it was saved.
#[derive(Debug, Clone)]
pub struct SessionStore {
    blobs: BlobStore,
    expiry: Duration,
}

impl SessionStore {
    pub fn new(blobs: BlobStore) -> Self {
        Self {
            blobs,
            expiry: Duration::hours(DEFAULT_EXPIRY_HOURS),
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn path(&self) -> &Path {
        self.blobs.path()
    }

    pub fn save_user(&self, user: &StoredUser, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.blobs.set(USER_INFO_KEY, &serde_json::to_string(user)?)?;
        self.blobs
            .set(TIMESTAMP_KEY, &now.timestamp_millis().to_string())?;
        debug!(path = %self.path().display(), "saved session");
        Ok(())
    }

    /// The stored user, if any. A blob that does not decode is treated as no
    /// user.
    pub fn load_user(&self) -> Result<Option<StoredUser>, StoreError> {
        let Some(blob) = self.blobs.get(USER_INFO_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&blob) {
            Ok(user) => Ok(Some(user)),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable stored user");
                Ok(None)
            }
        }
    }

    pub fn saved_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .blobs
            .get(TIMESTAMP_KEY)?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(match self.saved_at()? {
            Some(saved) => now - saved > self.expiry,
            None => true,
        })
    }

    pub fn clear_user(&self) -> Result<(), StoreError> {
        self.blobs.remove(USER_INFO_KEY)?;
        self.blobs.remove(TIMESTAMP_KEY)
    }

    /// Session key of the stored user, unless missing, blank or expired.
    pub fn session_key(&self, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        let Some(user) = self.load_user()? else {
            return Ok(None);
        };
        if self.is_expired(now)? {
            debug!("stored session has expired");
            return Ok(None);
        }
        Ok(Some(user.token).filter(|token| !token.trim().is_empty()))
    }
}
