// LibriVault - Secure Reading for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! File-backed and in-memory stores
//!
//! `FileStore` keeps entries in a single JSON document under an app-private
//! directory, written with owner-only permissions. `MemoryStore` backs tests
//! and the CLI self-test where nothing should touch disk.

use crate::error::{DrmError, Result};
use crate::storage::ProtectedStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;

/// JSON-file key-value store with owner-only permissions
///
/// All entries live in one document that is rewritten on every mutation.
/// Writes go through a temp file and rename so a crash mid-write leaves the
/// previous document intact.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileStore {
    /// Open a store at the given path, creating parent directories as needed
    ///
    /// # Errors
    /// Returns `StorageUnavailable` if the directory cannot be created, the
    /// file cannot be read, or an existing document is corrupt.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                DrmError::storage(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let entries = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                DrmError::storage(format!("corrupt store document {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(DrmError::storage(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Open a store at the platform default location
    pub async fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?).await
    }

    /// Platform default path: `<data dir>/librivault/device_store.json`
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::data_dir()
            .ok_or_else(|| DrmError::storage("no platform data directory available"))?;
        Ok(base.join("librivault").join("device_store.json"))
    }

    /// Path of the backing document
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn save(&self, entries: &HashMap<String, String>) -> Result<()> {
        let raw = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");

        fs::write(&tmp, raw.as_bytes()).await.map_err(|e| {
            DrmError::storage(format!("cannot write {}: {}", tmp.display(), e))
        })?;

        // Secrets live in this document; nobody but the owning user reads it
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| {
                    DrmError::storage(format!("cannot set permissions on {}: {}", tmp.display(), e))
                })?;
        }

        fs::rename(&tmp, &self.path).await.map_err(|e| {
            DrmError::storage(format!("cannot replace {}: {}", self.path.display(), e))
        })?;

        Ok(())
    }
}

#[async_trait]
impl ProtectedStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            self.save(&entries).await?;
        }
        Ok(())
    }
}

/// In-memory store for tests and self-checks
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProtectedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}

// ===== TESTS =====
