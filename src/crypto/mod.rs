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


//! Content protection primitives
//!
//! Three layers sit between a license and readable bytes:
//!
//! 1. `unwrap` recovers the raw content key from the server's RSA-OAEP
//!    wrapped blob using the device private key.
//! 2. `content` derives the working AES key from the content key and the
//!    blob's salt, then opens the AES-256-GCM ciphertext.
//! 3. `detect` identifies the plaintext's real format from its leading byte
//!    signature.
//!
//! The KDF and AEAD steps are CPU-bound; the engine runs them on a blocking
//! worker thread.

pub mod content;
pub mod detect;
pub mod unwrap;

pub use content::{decrypt_content, encrypt_content, DecryptedContent};
pub use detect::{detect_content_type, ContentType};
pub use unwrap::{unwrap_content_key, wrap_content_key, ContentKey};
