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


//! Device keypair vault
//!
//! Every installation owns exactly one RSA-2048 keypair. The server wraps
//! content keys against the public half; the private half never leaves the
//! device and is persisted as PKCS#8 PEM in protected storage. Generation is
//! lazy (first read flow triggers it) and runs on a blocking worker because
//! RSA keygen is CPU-bound.

use crate::error::{DrmError, Result};
use crate::storage::{keys, ProtectedStore};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// RSA modulus size for device keypairs
const RSA_KEY_BITS: usize = 2048;

/// The device's asymmetric keypair
///
/// Holds the parsed keys plus the SPKI PEM of the public half, which is what
/// license requests transmit.
pub struct DeviceKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    public_key_pem: String,
}

impl DeviceKeyPair {
    fn from_private(private_key: RsaPrivateKey) -> Result<Self> {
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| DrmError::keygen(format!("cannot encode public key: {}", e)))?;

        Ok(Self {
            private_key,
            public_key,
            public_key_pem,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Public key as SPKI PEM, safe to transmit
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }
}

// Key material must never leak through Debug output
impl fmt::Debug for DeviceKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeyPair").finish_non_exhaustive()
    }
}

/// Lazily generated, persisted device keypair
///
/// An explicitly constructed, injectable service: callers own the instance
/// and tests substitute stores with deterministic key material. Both failure
/// modes (`StorageUnavailable`, `KeyGenerationFailed`) abort the read flow
/// before any network call.
///
/// # Example
/// ```rust,no_run
/// use reader_core::device::KeyVault;
/// use reader_core::storage::MemoryStore;
/// use std::sync::Arc;
///
/// # async fn example() -> reader_core::error::Result<()> {
/// let vault = KeyVault::new(Arc::new(MemoryStore::new()));
/// let pair = vault.initialize().await?;
/// println!("{}", pair.public_key_pem());
/// # Ok(())
/// # }
/// ```
pub struct KeyVault {
    store: Arc<dyn ProtectedStore>,
    cached: RwLock<Option<Arc<DeviceKeyPair>>>,
}

impl KeyVault {
    pub fn new(store: Arc<dyn ProtectedStore>) -> Self {
        Self {
            store,
            cached: RwLock::new(None),
        }
    }

    /// Load or lazily generate the device keypair
    ///
    /// The first call on a fresh install generates RSA-2048 key material and
    /// persists it; every later call returns the same pair unchanged.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the store cannot be read/written or holds a
    ///   corrupt key document
    /// - `KeyGenerationFailed` if RSA generation or encoding fails
    pub async fn initialize(&self) -> Result<Arc<DeviceKeyPair>> {
        if let Some(pair) = self.cached.read().await.as_ref() {
            return Ok(Arc::clone(pair));
        }

        let mut cached = self.cached.write().await;
        // Another caller may have initialized while we waited for the lock
        if let Some(pair) = cached.as_ref() {
            return Ok(Arc::clone(pair));
        }

        let pair = match self.store.get(keys::DEVICE_PRIVATE_KEY).await? {
            Some(pem) => {
                let private = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| {
                    DrmError::storage(format!("corrupt persisted device key: {}", e))
                })?;
                Arc::new(DeviceKeyPair::from_private(private)?)
            }
            None => {
                let pair = Arc::new(Self::generate().await?);

                let private_pem = pair
                    .private_key()
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| DrmError::keygen(format!("cannot encode private key: {}", e)))?;
                self.store
                    .put(keys::DEVICE_PRIVATE_KEY, &private_pem)
                    .await?;
                self.store
                    .put(keys::DEVICE_PUBLIC_KEY, pair.public_key_pem())
                    .await?;

                info!(bits = RSA_KEY_BITS, "Device keypair generated");
                pair
            }
        };

        *cached = Some(Arc::clone(&pair));
        Ok(pair)
    }

    /// Destroy the keypair and the device identity together
    ///
    /// This is the deauthorize-device path: every license the server issued
    /// against the old key or id becomes permanently unusable.
    pub async fn reset(&self) -> Result<()> {
        self.store.remove(keys::DEVICE_PRIVATE_KEY).await?;
        self.store.remove(keys::DEVICE_PUBLIC_KEY).await?;
        self.store.remove(keys::DEVICE_ID).await?;
        self.store.remove(keys::DEVICE_NONCE).await?;

        *self.cached.write().await = None;
        info!("Device keys and identity reset");
        Ok(())
    }

    // RSA-2048 generation takes whole seconds on mobile hardware; keep it
    // off the async worker threads.
    async fn generate() -> Result<DeviceKeyPair> {
        let private = tokio::task::spawn_blocking(|| {
            let mut rng = rand::rngs::OsRng;
            RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        })
        .await
        .map_err(|e| DrmError::internal(format!("key generation task failed: {}", e)))?
        .map_err(|e| DrmError::keygen(format!("RSA generation failed: {}", e)))?;

        DeviceKeyPair::from_private(private)
    }
}

impl fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyVault").finish_non_exhaustive()
    }
}

// ===== TESTS =====
