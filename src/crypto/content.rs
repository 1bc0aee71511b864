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


//! Content blob decryption
//!
//! Encrypted content arrives as `salt(16) || iv(12) || ciphertext+tag`. The
//! working AES-256 key is derived from the license's content key and the
//! blob's salt via PBKDF2-HMAC-SHA256, then the payload is opened with
//! AES-256-GCM. A failed tag check yields `IntegrityCheckFailed` and no
//! plaintext; GCM releases nothing on authentication failure.

use crate::crypto::detect::{detect_content_type, ContentType};
use crate::crypto::unwrap::ContentKey;
use crate::error::{DrmError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Salt prefix length in the blob layout
const SALT_LEN: usize = 16;

/// AES-GCM nonce length in the blob layout
const IV_LEN: usize = 12;

/// AES-GCM authentication tag length
const TAG_LEN: usize = 16;

/// PBKDF2-HMAC-SHA256 rounds for the working key derivation
const PBKDF2_ITERATIONS: u32 = 210_000;

/// Derived AES-256 key length
const DERIVED_KEY_LEN: usize = 32;

/// Decrypted plaintext plus its detected format
#[derive(Debug)]
pub struct DecryptedContent {
    pub plaintext: Vec<u8>,
    pub content_type: ContentType,
}

/// Decrypt a content blob and identify its format
///
/// CPU-bound (KDF plus AEAD); callers on an async runtime should run this
/// via `spawn_blocking`.
///
/// # Arguments
/// * `blob` - `salt(16) || iv(12) || ciphertext+tag` as fetched from the server
/// * `content_key` - Raw key recovered by unwrapping the license
/// * `filename_hint` - Server-declared filename, advisory only
///
/// # Errors
/// - `MalformedBlob` if the blob is too short to contain salt, iv and tag
/// - `IntegrityCheckFailed` if the ciphertext or tag was tampered with
/// - `UnsupportedContentType` if the plaintext matches no known signature
pub fn decrypt_content(
    blob: &[u8],
    content_key: &ContentKey,
    filename_hint: Option<&str>,
) -> Result<DecryptedContent> {
    if blob.len() < SALT_LEN + IV_LEN + TAG_LEN {
        return Err(DrmError::malformed(format!(
            "blob of {} bytes cannot hold salt, iv and tag",
            blob.len()
        )));
    }

    let (salt, rest) = blob.split_at(SALT_LEN);
    let (iv, ciphertext) = rest.split_at(IV_LEN);

    let derived = derive_working_key(content_key.as_bytes(), salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(derived.as_slice()));

    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| DrmError::IntegrityCheckFailed)?;

    let content_type = detect_content_type(&plaintext, filename_hint)?;

    Ok(DecryptedContent {
        plaintext,
        content_type,
    })
}

/// Seal plaintext into the blob layout `decrypt_content` opens
///
/// Exact inverse of `decrypt_content` minus format detection. The server
/// owns sealing in production; this exists for the CLI self-test and test
/// fixtures, and picks a fresh random salt and iv per call.
pub fn encrypt_content(plaintext: &[u8], content_key: &ContentKey) -> Result<Vec<u8>> {
    let mut rng = rand::rngs::OsRng;

    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let derived = derive_working_key(content_key.as_bytes(), &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(derived.as_slice()));

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| DrmError::internal(format!("seal failed: {}", e)))?;

    let mut blob = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn derive_working_key(content_key: &[u8], salt: &[u8]) -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    pbkdf2_hmac::<Sha256>(content_key, salt, PBKDF2_ITERATIONS, key.as_mut_slice());
    key
}

// ===== TESTS =====
