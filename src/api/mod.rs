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


//! License server client
//!
//! Talks to the LibriVault license server: request a license, keep its
//! session alive with heartbeats, fetch the encrypted content it covers.
//! The `LicenseApi` trait is the seam between the DRM flow and the network;
//! production code uses [`LicenseServerClient`], tests substitute a scripted
//! fake.

pub mod auth;
pub mod client;
pub mod license;

// Re-export commonly used types
pub use auth::{AuthProvider, StaticTokenProvider};
pub use client::{ClientConfig, LicenseServerClient};
pub use license::{ContentDownload, HeartbeatResponse, LicenseResponse};

use crate::error::Result;
use crate::license::License;
use async_trait::async_trait;

/// Download progress callback: (bytes_downloaded, total_bytes)
///
/// `total_bytes` is 0 when the server did not declare a content length.
pub type ProgressFn = Box<dyn FnMut(u64, u64) + Send>;

/// The license server operations the DRM flow depends on
///
/// One implementation speaks HTTP ([`LicenseServerClient`]); test doubles
/// script outcomes without a network. Methods translate server decisions
/// into the error taxonomy: denial and revocation arrive as `LicenseDenied`
/// and `LicenseRevoked`, both terminal.
#[async_trait]
pub trait LicenseApi: Send + Sync {
    /// Request a license for a content id, binding it to this device
    async fn request_license(
        &self,
        content_id: &str,
        public_key_pem: &str,
        device_id: &str,
    ) -> Result<License>;

    /// Send one liveness ping for an active session (single attempt)
    async fn send_heartbeat(&self, session_token: &str) -> Result<HeartbeatResponse>;

    /// Fetch the encrypted content blob authorized by a session token
    async fn fetch_content(
        &self,
        content_id: &str,
        session_token: &str,
        progress: Option<ProgressFn>,
    ) -> Result<ContentDownload>;
}
