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


//! Error types for LibriVault
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are categorized by domain (device, license, crypto, content, session)
//! for better error handling and reporting.

use thiserror::Error;

/// Result type alias using our DrmError type
pub type Result<T> = std::result::Result<T, DrmError>;

/// Main error type for the LibriVault DRM core
///
/// Each variant includes descriptive error messages and relevant context.
/// Categorization helpers (`is_retryable`, `is_terminal`, `is_auth_error`)
/// drive retry and teardown decisions in the engine and heartbeat loop.
#[derive(Error, Debug)]
pub enum DrmError {
    // ===== Device & Key Errors =====

    /// Protected local storage could not be opened or written
    #[error("Protected storage unavailable: {message}")]
    StorageUnavailable {
        message: String,
    },

    /// Device keypair generation failed
    #[error("Device key generation failed: {message}")]
    KeyGenerationFailed {
        message: String,
    },

    // ===== License Server Errors =====

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// Bearer token rejected by the license server (HTTP 401)
    #[error("Unauthorized: {message}")]
    Unauthorized {
        message: String,
    },

    /// License server refused to issue a license for this device/content pair (HTTP 403)
    #[error("License denied for content '{content_id}'")]
    LicenseDenied {
        content_id: String,
        /// Server-supplied denial reason if available
        reason: Option<String>,
    },

    /// Active session revoked by the license server
    #[error("License revoked: {message}")]
    LicenseRevoked {
        message: String,
    },

    /// Generic request failure with status context
    #[error("Request failed: {message}")]
    RequestFailed {
        message: String,
        /// HTTP status code if available
        status_code: Option<u16>,
        /// Endpoint that failed
        endpoint: Option<String>,
    },

    /// Server returned a response that could not be parsed
    #[error("Invalid server response: {message}")]
    InvalidResponse {
        message: String,
        /// Response body snippet for debugging
        response_body: Option<String>,
    },

    /// Server rate limiting (HTTP 429)
    #[error("Rate limit exceeded. Retry after {retry_after_seconds} seconds")]
    RateLimited {
        retry_after_seconds: u64,
        endpoint: String,
    },

    // ===== Crypto Errors =====

    /// Device private key could not unwrap the content key
    #[error("Content key unwrap failed: {message}")]
    UnwrapFailed {
        message: String,
    },

    /// Ciphertext authentication failed, content is corrupt or tampered
    #[error("Content integrity check failed")]
    IntegrityCheckFailed,

    /// Encrypted blob is too short or structurally invalid
    #[error("Malformed content blob: {message}")]
    MalformedBlob {
        message: String,
    },

    /// Decrypted content does not match any supported format signature
    #[error("Unsupported content type: {reason}")]
    UnsupportedContentType {
        reason: String,
    },

    // ===== State Errors =====

    /// Operation attempted in an invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    Internal(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// Helper methods for creating common errors
impl DrmError {
    /// Create a StorageUnavailable error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        DrmError::StorageUnavailable {
            message: message.into(),
        }
    }

    /// Create a KeyGenerationFailed error
    pub fn keygen<S: Into<String>>(message: S) -> Self {
        DrmError::KeyGenerationFailed {
            message: message.into(),
        }
    }

    /// Create a NetworkError
    pub fn network<S: Into<String>>(message: S, is_transient: bool) -> Self {
        DrmError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Create an Unauthorized error
    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        DrmError::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a LicenseDenied error
    pub fn denied<S: Into<String>>(content_id: S, reason: Option<String>) -> Self {
        DrmError::LicenseDenied {
            content_id: content_id.into(),
            reason,
        }
    }

    /// Create a LicenseRevoked error
    pub fn revoked<S: Into<String>>(message: S) -> Self {
        DrmError::LicenseRevoked {
            message: message.into(),
        }
    }

    /// Create a RequestFailed error
    pub fn request_failed<S: Into<String>>(
        message: S,
        status_code: Option<u16>,
        endpoint: Option<String>,
    ) -> Self {
        DrmError::RequestFailed {
            message: message.into(),
            status_code,
            endpoint,
        }
    }

    /// Create an UnwrapFailed error
    pub fn unwrap_failed<S: Into<String>>(message: S) -> Self {
        DrmError::UnwrapFailed {
            message: message.into(),
        }
    }

    /// Create a MalformedBlob error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        DrmError::MalformedBlob {
            message: message.into(),
        }
    }

    /// Create an Internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        DrmError::Internal(message.into())
    }

    /// Check if error is retryable (network errors, 5xx, rate limiting)
    ///
    /// Returns `true` for transient errors that might succeed on retry.
    /// Terminal license outcomes and crypto failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DrmError::NetworkError { is_transient: true, .. }
                | DrmError::RequestFailed { status_code: Some(500..=599), .. }
                | DrmError::RateLimited { .. }
        )
    }

    /// Check if error is a terminal license outcome
    ///
    /// Terminal outcomes must never be retried: the server's decision is
    /// authoritative and the caller must tear down any decrypted content.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DrmError::LicenseDenied { .. } | DrmError::LicenseRevoked { .. }
        )
    }

    /// Check if error is due to authentication
    ///
    /// Returns `true` when the account token was rejected and the auth
    /// collaborator should refresh credentials.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, DrmError::Unauthorized { .. })
    }

    /// Check if error is related to DRM/crypto operations
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            DrmError::UnwrapFailed { .. }
                | DrmError::IntegrityCheckFailed
                | DrmError::MalformedBlob { .. }
                | DrmError::KeyGenerationFailed { .. }
        )
    }

    /// Get retry delay in seconds for rate-limited requests
    ///
    /// Returns `Some(seconds)` only when the server supplied explicit retry
    /// timing. Callers implement their own backoff otherwise.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            DrmError::RateLimited { retry_after_seconds, .. } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Get user-friendly error message suitable for display
    ///
    /// Returns actionable messages for end users with technical details
    /// omitted. Sensitive material (tokens, key bytes) never appears here.
    pub fn user_message(&self) -> String {
        match self {
            DrmError::StorageUnavailable { .. } => {
                "This device's secure storage is unavailable. Please restart the app and try again.".to_string()
            }
            DrmError::KeyGenerationFailed { .. } => {
                "Could not prepare this device for reading. Please restart the app and try again.".to_string()
            }
            DrmError::NetworkError { .. } => {
                "A network error occurred. Please check your connection and try again.".to_string()
            }
            DrmError::Unauthorized { .. } => {
                "Your session has expired. Please log in again.".to_string()
            }
            DrmError::LicenseDenied { reason, .. } => match reason {
                Some(r) => format!("This title cannot be opened on this device: {}", r),
                None => "This title cannot be opened on this device. It may be checked out on too many devices.".to_string(),
            },
            DrmError::LicenseRevoked { .. } => {
                "Access to this title has been revoked. It may have been returned or recalled.".to_string()
            }
            DrmError::RateLimited { retry_after_seconds, .. } => {
                format!("Too many requests. Please wait {} seconds and try again.", retry_after_seconds)
            }
            DrmError::UnwrapFailed { .. } => {
                "This title's license is no longer valid for this device. Please try opening it again.".to_string()
            }
            DrmError::IntegrityCheckFailed => {
                "This title's content failed verification and cannot be opened. Please re-download it.".to_string()
            }
            DrmError::MalformedBlob { .. } => {
                "This title's content is damaged and cannot be opened. Please re-download it.".to_string()
            }
            DrmError::UnsupportedContentType { .. } => {
                "This title is in a format this app cannot display.".to_string()
            }
            DrmError::Cancelled => "Opening was cancelled.".to_string(),
            _ => self.to_string(),
        }
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DrmError::network("connection reset", true).is_retryable());
        assert!(!DrmError::network("dns failure", false).is_retryable());
        assert!(DrmError::request_failed("server error", Some(503), None).is_retryable());
        assert!(!DrmError::request_failed("not found", Some(404), None).is_retryable());
        assert!(!DrmError::denied("book-1", None).is_retryable());
        assert!(!DrmError::revoked("returned").is_retryable());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(DrmError::denied("book-1", None).is_terminal());
        assert!(DrmError::revoked("recalled").is_terminal());
        assert!(!DrmError::network("timeout", true).is_terminal());
        assert!(!DrmError::unauthorized("expired token").is_terminal());
    }

    #[test]
    fn test_user_message_omits_detail() {
        let err = DrmError::unwrap_failed("rsa decrypt error: invalid padding");
        let msg = err.user_message();
        assert!(!msg.contains("rsa"));
        assert!(!msg.contains("padding"));
    }
}
