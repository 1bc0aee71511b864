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


//! Content key wrap and unwrap
//!
//! The license server encrypts each title's content key against the device
//! public key with RSA-OAEP (SHA-256). Unwrapping with a non-matching
//! private key (key rotated, device reset, license issued to another device)
//! fails cleanly with `UnwrapFailed`; the engine treats that as an invalid
//! license, not a crash.

use crate::error::{DrmError, Result};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// RSA-2048 produces 256-byte ciphertext
const WRAPPED_KEY_LEN: usize = 256;

/// Raw symmetric content key recovered from a license
///
/// Exists only in memory for the duration of one decrypt operation and is
/// wiped on drop. Never cached, never persisted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ContentKey(Vec<u8>);

impl ContentKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Key bytes must never leak through Debug output
impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({} bytes)", self.0.len())
    }
}

/// Unwrap a server-wrapped content key with the device private key
///
/// # Arguments
/// * `wrapped` - RSA-OAEP ciphertext from the license (256 bytes for RSA-2048)
/// * `private_key` - This device's private key
///
/// # Errors
/// Returns `UnwrapFailed` if the ciphertext has the wrong size or the
/// private key does not match the key the server wrapped against.
pub fn unwrap_content_key(wrapped: &[u8], private_key: &RsaPrivateKey) -> Result<ContentKey> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(DrmError::unwrap_failed(format!(
            "wrapped key must be {} bytes, got {}",
            WRAPPED_KEY_LEN,
            wrapped.len()
        )));
    }

    let padding = Oaep::new::<Sha256>();
    let key = private_key
        .decrypt(padding, wrapped)
        .map_err(|_| DrmError::unwrap_failed("device key cannot unwrap this license"))?;

    Ok(ContentKey::new(key))
}

/// Wrap a content key against a device public key
///
/// The inverse of `unwrap_content_key`. The server side owns this operation
/// in production; it lives here for the CLI self-test and test fixtures.
pub fn wrap_content_key(key: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>> {
    let padding = Oaep::new::<Sha256>();
    public_key
        .encrypt(&mut rand::rngs::OsRng, padding, key)
        .map_err(|e| DrmError::internal(format!("key wrap failed: {}", e)))
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);

        let key = b"0123456789abcdef0123456789abcdef";
        let wrapped = wrap_content_key(key, &public).unwrap();
        assert_eq!(wrapped.len(), WRAPPED_KEY_LEN);

        let unwrapped = unwrap_content_key(&wrapped, &private).unwrap();
        assert_eq!(unwrapped.as_bytes(), key);
    }

    #[test]
    fn test_unwrap_with_wrong_key_fails() {
        let issued_to = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public = RsaPublicKey::from(&issued_to);
        let other_device = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();

        let wrapped = wrap_content_key(b"0123456789abcdef0123456789abcdef", &public).unwrap();
        let result = unwrap_content_key(&wrapped, &other_device);

        assert!(matches!(result, Err(DrmError::UnwrapFailed { .. })));
    }

    #[test]
    fn test_unwrap_rejects_wrong_size() {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();

        let result = unwrap_content_key(&[0u8; 128], &private);
        assert!(matches!(result, Err(DrmError::UnwrapFailed { .. })));
    }

    #[test]
    fn test_content_key_debug_redacts_bytes() {
        let key = ContentKey::new(vec![0xAA; 32]);
        let rendered = format!("{:?}", key);
        assert_eq!(rendered, "ContentKey(32 bytes)");
        assert!(!rendered.contains("170"));
    }
}
