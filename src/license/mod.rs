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


//! License lifecycle management
//!
//! A license is the server's grant to read one title on one device: a session
//! token for content fetch and heartbeats, a wrapped content key only this
//! device can open, and an expiry. This module owns the in-memory cache of
//! granted licenses and the heartbeat state machine that keeps a reading
//! session alive.
//!
//! Licenses are never mutated after issue; a re-acquisition replaces the
//! cached entry wholesale.

pub mod cache;
pub mod heartbeat;

pub use cache::LicenseCache;
pub use heartbeat::{HeartbeatConfig, SessionHeartbeat, SessionState};

use chrono::{DateTime, Utc};
use std::fmt;

/// A server-issued grant binding a content id to this device
#[derive(Clone)]
pub struct License {
    /// Server-assigned license identifier
    pub license_id: String,

    /// Content id this license covers
    pub content_id: String,

    /// Short-lived credential authorizing content fetch and heartbeats
    pub session_token: String,

    /// Content key encrypted against this device's public key
    pub wrapped_content_key: Vec<u8>,

    /// Moment after which the license must be re-acquired
    pub expires_at: DateTime<Utc>,
}

impl License {
    /// Whether the license can no longer authorize a session
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

// The session token is a credential; keep it out of logs
impl fmt::Debug for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("License")
            .field("license_id", &self.license_id)
            .field("content_id", &self.content_id)
            .field("session_token", &"<redacted>")
            .field(
                "wrapped_content_key",
                &format_args!("{} bytes", self.wrapped_content_key.len()),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn license_expiring_in(seconds: i64) -> License {
        License {
            license_id: "lic-1".to_string(),
            content_id: "42".to_string(),
            session_token: "abc".to_string(),
            wrapped_content_key: vec![0u8; 256],
            expires_at: Utc::now() + Duration::seconds(seconds),
        }
    }

    #[test]
    fn test_license_expiry() {
        assert!(!license_expiring_in(3600).is_expired());
        assert!(license_expiring_in(-1).is_expired());
    }

    #[test]
    fn test_debug_redacts_session_token() {
        let rendered = format!("{:?}", license_expiring_in(3600));
        assert!(!rendered.contains("abc"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("256 bytes"));
    }
}
