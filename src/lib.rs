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


//! Device-bound DRM core for the LibriVault reading apps
//!
//! Every title is encrypted per device: the license server wraps the content
//! key against an RSA keypair that never leaves the installation, and a
//! session heartbeat lets the server pull a running session out from under
//! us. This crate owns that whole flow and exposes a plain Rust API to the
//! host app shell:
//!
//! - [`device`] - device fingerprint and the RSA keypair vault
//! - [`api`] - license server client (license, heartbeat, content fetch)
//! - [`license`] - license cache and the session heartbeat state machine
//! - [`crypto`] - content key unwrap, blob decryption, format detection
//! - [`content`] - sinks for decrypted plaintext (session dir, memory)
//! - [`engine`] - the orchestrating [`DrmEngine`] and [`ReadingSession`]
//! - [`storage`] - protected key-value store for device secrets
//!
//! # Quick start
//!
//! ```rust,no_run
//! use reader_core::api::{ClientConfig, LicenseServerClient, StaticTokenProvider};
//! use reader_core::content::SessionDirSink;
//! use reader_core::engine::{DrmEngine, OpenOptions};
//! use reader_core::storage::FileStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> reader_core::Result<()> {
//! let store = Arc::new(FileStore::open_default().await?);
//! let auth = Arc::new(StaticTokenProvider::new("bearer-token"));
//! let client = Arc::new(LicenseServerClient::with_config(auth, ClientConfig::default())?);
//!
//! let engine = DrmEngine::new(store, client);
//! let sink = Arc::new(SessionDirSink::new("/data/app/librivault/sessions"));
//!
//! let session = engine.open_content("42", sink, OpenOptions::default()).await?;
//! // hand session.handle() to the viewer ...
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod content;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod error;
pub mod license;
pub mod storage;

pub use content::{ContentHandle, ContentSink};
pub use engine::{CancelToken, DrmEngine, OpenOptions, ReadingSession};
pub use error::{DrmError, Result};
pub use license::SessionState;
