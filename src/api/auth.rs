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


//! Authentication collaborator interface
//!
//! The host application owns login, token storage, and session expiry; this
//! crate only needs a bearer token to attach to license-server requests. The
//! `AuthProvider` trait is that seam. When the server answers 401 the client
//! asks the provider to refresh exactly once before surfacing `Unauthorized`
//! to the caller, which is the host's cue to send the user back to login.

use crate::error::{DrmError, Result};
use async_trait::async_trait;

/// Supplies the bearer token for license-server requests
///
/// Implementations must be cheap to call per request; the client does not
/// cache tokens itself, so a provider backed by expensive storage should keep
/// its own copy warm.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current bearer token
    async fn bearer_token(&self) -> Result<String>;

    /// Obtain a replacement token after the server rejected the current one
    ///
    /// Called at most once per request. A provider that cannot refresh
    /// (static tokens, logged-out state) returns `Unauthorized`, which ends
    /// the request.
    async fn refresh(&self) -> Result<String>;
}

/// Fixed-token provider for tests and the CLI
///
/// Never refreshes; a 401 with this provider surfaces immediately.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String> {
        Err(DrmError::unauthorized(
            "static token was rejected and cannot be refreshed",
        ))
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_returns_token() {
        let provider = StaticTokenProvider::new("token-123");
        assert_eq!(provider.bearer_token().await.unwrap(), "token-123");
    }

    #[tokio::test]
    async fn test_static_provider_cannot_refresh() {
        let provider = StaticTokenProvider::new("token-123");
        let err = provider.refresh().await.unwrap_err();
        assert!(err.is_auth_error());
    }
}
