// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable credential persistence.
//!
//! [`CredentialStore`] is the on-disk counterpart to the in-memory rotation
//! state in [`crate::credential`]. The JSON-file implementation stores rows
//! equivalent to the `{id, provider, credential_type, data, created_at,
//! updated_at}` table a SQLite-backed store would use, without depending on
//! SQLite itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credential::{Credential, Provider};

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("credential store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential store file is corrupt: {0}")]
    Corrupt(String),
}

/// A persisted credential row. `id` is stable across loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRow {
    pub id: u64,
    pub provider: Provider,
    pub credential: Credential,
    pub created_at: i64,
    pub updated_at: i64,
}

pub trait CredentialStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<(Provider, Credential)>, CredentialStoreError>;
    fn upsert(&mut self, provider: Provider, credential: Credential) -> Result<u64, CredentialStoreError>;
    fn delete(&mut self, id: u64) -> Result<(), CredentialStoreError>;
}

/// In-memory store, primarily useful for tests and for callers that manage
/// their own persistence layer.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    rows: HashMap<u64, CredentialRow>,
    next_id: u64,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn load_all(&self) -> Result<Vec<(Provider, Credential)>, CredentialStoreError> {
        Ok(self
            .rows
            .values()
            .map(|r| (r.provider.clone(), r.credential.clone()))
            .collect())
    }

    fn upsert(&mut self, provider: Provider, credential: Credential) -> Result<u64, CredentialStoreError> {
        let id = self.next_id;
        self.next_id += 1;
        self.rows.insert(
            id,
            CredentialRow {
                id,
                provider,
                credential,
                created_at: 0,
                updated_at: 0,
            },
        );
        Ok(id)
    }

    fn delete(&mut self, id: u64) -> Result<(), CredentialStoreError> {
        self.rows.remove(&id);
        Ok(())
    }
}

/// JSON-file-backed store. The file and its parent directory are created
/// with restrictive permissions (`0600`/`0700`) on Unix, matching the
/// expectation that the file holds plaintext secrets.
pub struct JsonFileCredentialStore {
    path: PathBuf,
    rows: Vec<CredentialRow>,
    next_id: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OnDisk {
    rows: Vec<CredentialRow>,
}

impl JsonFileCredentialStore {
    /// Open (creating if necessary) a credential store backed by `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialStoreError> {
        let path = path.into();
        let rows = if path.is_file() {
            let text = std::fs::read_to_string(&path).map_err(|source| CredentialStoreError::Io {
                path: path.clone(),
                source,
            })?;
            let on_disk: OnDisk = serde_json::from_str(&text)
                .map_err(|e| CredentialStoreError::Corrupt(e.to_string()))?;
            on_disk.rows
        } else {
            Vec::new()
        };
        let next_id = rows.iter().map(|r| r.id + 1).max().unwrap_or(0);
        let mut store = Self {
            path,
            rows,
            next_id,
        };
        store.persist()?;
        Ok(store)
    }

    fn persist(&self) -> Result<(), CredentialStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| CredentialStoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
                set_dir_permissions(parent)?;
            }
        }
        let on_disk = OnDisk {
            rows: self.rows.clone(),
        };
        let text = serde_json::to_string_pretty(&on_disk)
            .map_err(|e| CredentialStoreError::Corrupt(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|source| CredentialStoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        set_file_permissions(&self.path)?;
        debug!(path = %self.path.display(), rows = self.rows.len(), "persisted credential store");
        Ok(())
    }
}

impl CredentialStore for JsonFileCredentialStore {
    fn load_all(&self) -> Result<Vec<(Provider, Credential)>, CredentialStoreError> {
        Ok(self
            .rows
            .iter()
            .map(|r| (r.provider.clone(), r.credential.clone()))
            .collect())
    }

    fn upsert(&mut self, provider: Provider, credential: Credential) -> Result<u64, CredentialStoreError> {
        let id = self.next_id;
        self.next_id += 1;
        self.rows.push(CredentialRow {
            id,
            provider,
            credential,
            created_at: 0,
            updated_at: 0,
        });
        self.persist()?;
        Ok(id)
    }

    fn delete(&mut self, id: u64) -> Result<(), CredentialStoreError> {
        self.rows.retain(|r| r.id != id);
        self.persist()
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CredentialStoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|source| {
        CredentialStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CredentialStoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), CredentialStoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).map_err(|source| {
        CredentialStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), CredentialStoreError> {
    Ok(())
}

/// Durable store for `credentials set-override` / `clear-override`: a flat
/// `provider -> key` map that takes unconditional precedence over rotation,
/// mirroring [`crate::credential::CredentialRotator::set_runtime_override`]
/// but surviving across process invocations. Same restrictive-permissions
/// JSON-file shape as [`JsonFileCredentialStore`].
pub struct OverrideStore {
    path: PathBuf,
    overrides: HashMap<Provider, String>,
}

impl OverrideStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialStoreError> {
        let path = path.into();
        let overrides = if path.is_file() {
            let text = std::fs::read_to_string(&path).map_err(|source| CredentialStoreError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|e| CredentialStoreError::Corrupt(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(Self { path, overrides })
    }

    pub fn get(&self, provider: &str) -> Option<&str> {
        self.overrides.get(provider).map(String::as_str)
    }

    pub fn all(&self) -> &HashMap<Provider, String> {
        &self.overrides
    }

    pub fn set(&mut self, provider: &str, key: String) -> Result<(), CredentialStoreError> {
        self.overrides.insert(provider.to_string(), key);
        self.persist()
    }

    pub fn clear(&mut self, provider: &str) -> Result<(), CredentialStoreError> {
        self.overrides.remove(provider);
        self.persist()
    }

    fn persist(&self) -> Result<(), CredentialStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| CredentialStoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
                set_dir_permissions(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&self.overrides)
            .map_err(|e| CredentialStoreError::Corrupt(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|source| CredentialStoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        set_file_permissions(&self.path)?;
        debug!(path = %self.path.display(), providers = self.overrides.len(), "persisted credential overrides");
        Ok(())
    }
}
