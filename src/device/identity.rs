// LibriVault - Secure Reading for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Device fingerprinting for license binding
//!
//! The license server keys every license to a device id. The id is a SHA-256
//! digest over a canonical set of stable device attributes plus a random
//! per-installation nonce, so two installs on identical hardware still get
//! distinct ids and an explicit refresh produces a new one.

use crate::error::Result;
use crate::storage::{keys, ProtectedStore};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::env;
use std::sync::Arc;
use tracing::info;

/// Canonical device attributes that feed the fingerprint
///
/// The host app supplies real values on mobile (manufacturer, model, build id
/// from the platform APIs); `PlatformAttributes` fills in what a desktop
/// environment can offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttributes {
    /// Platform name ("android", "ios", "linux", ...)
    pub platform: String,
    /// OS version string
    pub os_version: String,
    /// OS build identifier
    pub build_id: String,
    /// Hardware manufacturer
    pub manufacturer: String,
    /// Hardware model
    pub model: String,
    /// Hardware unique id (machine id, hardware UUID)
    pub hardware_id: String,
}

impl DeviceAttributes {
    /// Deterministic concatenation fed to the digest
    ///
    /// Field order is part of the fingerprint contract and must not change.
    pub fn canonical_string(&self) -> String {
        [
            self.platform.as_str(),
            self.os_version.as_str(),
            self.build_id.as_str(),
            self.manufacturer.as_str(),
            self.model.as_str(),
            self.hardware_id.as_str(),
        ]
        .join("|")
    }
}

/// Source of device attributes, injectable for tests and host shells
pub trait AttributeSource: Send + Sync {
    fn collect(&self) -> DeviceAttributes;
}

/// Default attribute collector reading platform sources
#[derive(Debug, Default)]
pub struct PlatformAttributes;

impl AttributeSource for PlatformAttributes {
    fn collect(&self) -> DeviceAttributes {
        DeviceAttributes {
            platform: env::consts::OS.to_string(),
            os_version: get_os_version(),
            build_id: get_os_build_id(),
            manufacturer: "generic".to_string(),
            model: get_hostname(),
            hardware_id: get_machine_id().unwrap_or_else(get_hostname),
        }
    }
}

/// Fixed attributes, for host shells that collect their own and for tests
#[derive(Debug, Clone)]
pub struct StaticAttributes(pub DeviceAttributes);

impl AttributeSource for StaticAttributes {
    fn collect(&self) -> DeviceAttributes {
        self.0.clone()
    }
}

/// Derives and persists the per-installation device id
///
/// # Example
/// ```rust,no_run
/// use reader_core::device::{DeviceIdentity, PlatformAttributes};
/// use reader_core::storage::MemoryStore;
/// use std::sync::Arc;
///
/// # async fn example() -> reader_core::error::Result<()> {
/// let store = Arc::new(MemoryStore::new());
/// let identity = DeviceIdentity::new(store, Box::new(PlatformAttributes));
/// let id = identity.device_id().await?;
/// assert_eq!(id, identity.device_id().await?);
/// # Ok(())
/// # }
/// ```
pub struct DeviceIdentity {
    store: Arc<dyn ProtectedStore>,
    source: Box<dyn AttributeSource>,
}

impl DeviceIdentity {
    pub fn new(store: Arc<dyn ProtectedStore>, source: Box<dyn AttributeSource>) -> Self {
        Self { store, source }
    }

    /// Get the device id, deriving and persisting it on first use
    ///
    /// Idempotent: once derived, the same id is returned until an explicit
    /// `refresh_device_id` or device reset.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` if the backing store cannot be read or
    /// written.
    pub async fn device_id(&self) -> Result<String> {
        if let Some(id) = self.store.get(keys::DEVICE_ID).await? {
            return Ok(id);
        }

        let nonce = match self.store.get(keys::DEVICE_NONCE).await? {
            Some(n) => n,
            None => {
                let n = generate_nonce();
                self.store.put(keys::DEVICE_NONCE, &n).await?;
                n
            }
        };

        let id = self.derive_id(&nonce);
        self.store.put(keys::DEVICE_ID, &id).await?;
        info!(device_id = %redact(&id), "Device id derived");
        Ok(id)
    }

    /// Force a new device id (deauthorize-device path only)
    ///
    /// Rotates the installation nonce so the derived id changes even on
    /// unchanged hardware. All licenses bound to the old id become useless.
    pub async fn refresh_device_id(&self) -> Result<String> {
        let nonce = generate_nonce();
        self.store.put(keys::DEVICE_NONCE, &nonce).await?;

        let id = self.derive_id(&nonce);
        self.store.put(keys::DEVICE_ID, &id).await?;
        info!(device_id = %redact(&id), "Device id refreshed");
        Ok(id)
    }

    fn derive_id(&self, nonce: &str) -> String {
        let attrs = self.source.collect();

        let mut hasher = Sha256::new();
        hasher.update(attrs.canonical_string().as_bytes());
        hasher.update(b"|");
        hasher.update(nonce.as_bytes());

        hex::encode(hasher.finalize())
    }
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// First 8 chars only; full ids never go to the log
fn redact(id: &str) -> &str {
    &id[..id.len().min(8)]
}

fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn get_os_version() -> String {
    #[cfg(target_os = "macos")]
    {
        std::fs::read_to_string("/System/Library/CoreServices/SystemVersion.plist")
            .ok()
            .map(|_| "macos".to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(target_os = "linux")]
    {
        read_os_release_field("VERSION_ID").unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        "unknown".to_string()
    }
}

fn get_os_build_id() -> String {
    #[cfg(target_os = "linux")]
    {
        read_os_release_field("BUILD_ID")
            .or_else(|| read_os_release_field("VERSION"))
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(not(target_os = "linux"))]
    {
        "unknown".to_string()
    }
}

#[cfg(target_os = "linux")]
fn read_os_release_field(field: &str) -> Option<String> {
    let content = std::fs::read_to_string("/etc/os-release").ok()?;
    let prefix = format!("{}=", field);
    content
        .lines()
        .find(|l| l.starts_with(&prefix))
        .map(|l| l[prefix.len()..].trim_matches('"').to_string())
}

fn get_machine_id() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .find(|l| l.contains("IOPlatformUUID"))
                    .and_then(|l| l.split('"').nth(3))
                    .map(String::from)
            })
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn fixed_attributes() -> DeviceAttributes {
        DeviceAttributes {
            platform: "android".to_string(),
            os_version: "14".to_string(),
            build_id: "UP1A.231005.007".to_string(),
            manufacturer: "Acme".to_string(),
            model: "Tablet X".to_string(),
            hardware_id: "f3a9c0de".to_string(),
        }
    }

    fn identity_over(store: Arc<MemoryStore>) -> DeviceIdentity {
        DeviceIdentity::new(store, Box::new(StaticAttributes(fixed_attributes())))
    }

    #[test]
    fn test_canonical_string_field_order() {
        let attrs = fixed_attributes();
        assert_eq!(
            attrs.canonical_string(),
            "android|14|UP1A.231005.007|Acme|Tablet X|f3a9c0de"
        );
    }

    #[tokio::test]
    async fn test_device_id_is_stable() {
        let store = Arc::new(MemoryStore::new());
        let identity = identity_over(store);

        let first = identity.device_id().await.unwrap();
        let second = identity.device_id().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_device_id_survives_restart() {
        let store = Arc::new(MemoryStore::new());

        let first = identity_over(Arc::clone(&store)).device_id().await.unwrap();
        let second = identity_over(store).device_id().await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_refresh_changes_device_id() {
        let store = Arc::new(MemoryStore::new());
        let identity = identity_over(store);

        let before = identity.device_id().await.unwrap();
        let refreshed = identity.refresh_device_id().await.unwrap();
        let after = identity.device_id().await.unwrap();

        assert_ne!(before, refreshed);
        assert_eq!(refreshed, after);
    }

    #[tokio::test]
    async fn test_two_installs_get_distinct_ids() {
        let first = identity_over(Arc::new(MemoryStore::new()))
            .device_id()
            .await
            .unwrap();
        let second = identity_over(Arc::new(MemoryStore::new()))
            .device_id()
            .await
            .unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_platform_attributes_collects_something() {
        let attrs = PlatformAttributes.collect();
        assert!(!attrs.platform.is_empty());
        assert!(!attrs.hardware_id.is_empty());
    }
}
