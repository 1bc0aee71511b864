// LibriVault - Secure Reading for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Protected local storage
//!
//! The DRM core persists small secrets (device id, device keypair) through
//! the `ProtectedStore` trait. The host platform is expected to mount this
//! over storage that is private to the app and encrypted at rest; this crate
//! ships a file-backed implementation with owner-only permissions and an
//! in-memory implementation for tests.

pub mod file_store;

pub use file_store::{FileStore, MemoryStore};

use crate::error::Result;
use async_trait::async_trait;

/// Storage keys used by the DRM core
pub mod keys {
    /// Persisted device fingerprint
    pub const DEVICE_ID: &str = "device.id";
    /// Random per-installation nonce mixed into the fingerprint
    pub const DEVICE_NONCE: &str = "device.install_nonce";
    /// Device private key, PKCS#8 PEM
    pub const DEVICE_PRIVATE_KEY: &str = "device.private_key";
    /// Device public key, SPKI PEM
    pub const DEVICE_PUBLIC_KEY: &str = "device.public_key";
}

/// Key-value storage for device secrets
///
/// Implementations must be safe for concurrent use. Values are small
/// strings (hex digests, PEM documents); large payloads do not belong here.
#[async_trait]
pub trait ProtectedStore: Send + Sync {
    /// Read a value, `None` if the key has never been written
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write or replace a value
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value; removing an absent key is not an error
    async fn remove(&self, key: &str) -> Result<()>;
}
