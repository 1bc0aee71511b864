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


//! DRM endpoints of the license server
//!
//! Three endpoints make up the whole DRM surface:
//!
//! - **License request**: `POST /v1/content/{content_id}/license` with
//!   `{public_key, content_id, device_id}` → license grant. 403 means the
//!   server refused this (device, content) pair; that outcome is terminal
//!   and is mapped to `LicenseDenied`.
//! - **Heartbeat**: `POST /v1/sessions/heartbeat` with `{session_token}`.
//!   403 is an authoritative revocation (`LicenseRevoked`), never retried.
//! - **Content fetch**: `GET /v1/content/{content_id}/data` authorized by
//!   the session token header; returns the encrypted blob plus content-type
//!   and content-disposition headers.
//!
//! This module owns the wire DTOs and the status-to-error translation; the
//! transport behavior (auth, retry, backoff) lives in
//! [`crate::api::client`].

use crate::api::client::LicenseServerClient;
use crate::api::{LicenseApi, ProgressFn};
use crate::error::{DrmError, Result};
use crate::license::License;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::info;

/// Header carrying the session token on content fetches
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

const HEARTBEAT_ENDPOINT: &str = "/v1/sessions/heartbeat";

fn license_endpoint(content_id: &str) -> String {
    format!("/v1/content/{}/license", content_id)
}

fn content_endpoint(content_id: &str) -> String {
    format!("/v1/content/{}/data", content_id)
}

// ============================================================================
// WIRE STRUCTURES
// ============================================================================

/// License request body
#[derive(Debug, Clone, Serialize)]
pub struct LicenseRequestBody {
    /// Device public key (SPKI PEM) the server wraps the content key against
    #[serde(rename = "public_key")]
    pub public_key: String,

    /// Content id being licensed
    #[serde(rename = "content_id")]
    pub content_id: String,

    /// Device fingerprint for seat accounting
    #[serde(rename = "device_id")]
    pub device_id: String,
}

/// License grant as the server returns it
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LicenseResponse {
    #[serde(rename = "license_id")]
    pub license_id: String,

    /// Credential for content fetch and heartbeats
    #[serde(rename = "session_token")]
    pub session_token: String,

    #[serde(rename = "expires_at")]
    pub expires_at: DateTime<Utc>,

    /// Content key wrapped against the device public key, base64
    #[serde(rename = "wrapped_content_key")]
    pub wrapped_content_key: String,
}

impl LicenseResponse {
    /// Convert the wire grant into the domain license
    ///
    /// # Errors
    /// Returns `InvalidResponse` if the wrapped key is not valid base64.
    pub fn into_license(self, content_id: &str) -> Result<License> {
        let wrapped = general_purpose::STANDARD
            .decode(&self.wrapped_content_key)
            .map_err(|e| DrmError::InvalidResponse {
                message: format!("wrapped content key is not valid base64: {}", e),
                response_body: None,
            })?;

        Ok(License {
            license_id: self.license_id,
            content_id: content_id.to_string(),
            session_token: self.session_token,
            wrapped_content_key: wrapped,
            expires_at: self.expires_at,
        })
    }
}

/// Heartbeat request body
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRequest {
    #[serde(rename = "session_token")]
    pub session_token: String,
}

/// Heartbeat acknowledgment
///
/// Any 2xx acknowledgment means the session stays alive; revocation arrives
/// as a 403, not in this body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatResponse {
    #[serde(rename = "status")]
    pub status: String,

    #[serde(rename = "server_time", skip_serializing_if = "Option::is_none")]
    pub server_time: Option<DateTime<Utc>>,
}

/// Encrypted content blob plus the advisory headers that came with it
#[derive(Debug)]
pub struct ContentDownload {
    /// The encrypted blob: salt || iv || ciphertext+tag
    pub bytes: Vec<u8>,

    /// Server-declared content type, advisory only
    pub content_type: Option<String>,

    /// Filename from content-disposition, advisory only
    pub filename_hint: Option<String>,
}

// ============================================================================
// ENDPOINT IMPLEMENTATIONS
// ============================================================================

#[async_trait]
impl LicenseApi for LicenseServerClient {
    /// Request a license binding a content id to this device
    ///
    /// # Errors
    /// - `LicenseDenied` - server refused this (device, content) pair (403)
    /// - `Unauthorized` - bearer token rejected and refresh did not help
    /// - `NetworkError` / `RequestFailed` - transport failure after retries
    /// - `InvalidResponse` - grant body did not parse
    async fn request_license(
        &self,
        content_id: &str,
        public_key_pem: &str,
        device_id: &str,
    ) -> Result<License> {
        let endpoint = license_endpoint(content_id);
        let body = LicenseRequestBody {
            public_key: public_key_pem.to_string(),
            content_id: content_id.to_string(),
            device_id: device_id.to_string(),
        };

        let response: LicenseResponse = match self.post_json(&endpoint, &body).await {
            Ok(response) => response,
            Err(DrmError::RequestFailed {
                status_code: Some(403),
                message,
                ..
            }) => {
                return Err(DrmError::denied(content_id, denial_reason(&message)));
            }
            Err(e) => return Err(e),
        };

        info!(
            content_id = %content_id,
            license_id = %response.license_id,
            expires_at = %response.expires_at,
            "license issued"
        );
        response.into_license(content_id)
    }

    /// Send one liveness ping for an active session
    ///
    /// Single network attempt: the heartbeat state machine owns the failure
    /// budget.
    ///
    /// # Errors
    /// - `LicenseRevoked` - server revoked the session (403); authoritative,
    ///   never retried
    /// - `NetworkError` - transport failure, counts toward the caller's
    ///   failure budget
    async fn send_heartbeat(&self, session_token: &str) -> Result<HeartbeatResponse> {
        let body = HeartbeatRequest {
            session_token: session_token.to_string(),
        };

        match self.post_json_once(HEARTBEAT_ENDPOINT, &body).await {
            Ok(response) => Ok(response),
            Err(DrmError::RequestFailed {
                status_code: Some(403),
                ..
            }) => Err(DrmError::revoked("session revoked by license server")),
            Err(e) => Err(e),
        }
    }

    /// Fetch the encrypted content blob for a licensed title
    ///
    /// # Errors
    /// - `LicenseRevoked` - session token rejected (403)
    /// - `NetworkError` - transport or stream failure
    async fn fetch_content(
        &self,
        content_id: &str,
        session_token: &str,
        progress: Option<ProgressFn>,
    ) -> Result<ContentDownload> {
        let endpoint = content_endpoint(content_id);

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(SESSION_TOKEN_HEADER),
            HeaderValue::from_str(session_token).map_err(|e| DrmError::InvalidResponse {
                message: format!("session token is not header-safe: {}", e),
                response_body: None,
            })?,
        );

        let response = match self.get_binary(&endpoint, headers, progress).await {
            Ok(response) => response,
            Err(DrmError::RequestFailed {
                status_code: Some(403),
                ..
            }) => {
                return Err(DrmError::revoked(
                    "session token rejected during content fetch",
                ));
            }
            Err(e) => return Err(e),
        };

        info!(
            content_id = %content_id,
            size_bytes = response.bytes.len(),
            content_type = response.content_type.as_deref().unwrap_or("unknown"),
            "encrypted content fetched"
        );

        let filename_hint = response
            .content_disposition
            .as_deref()
            .and_then(filename_from_content_disposition);

        Ok(ContentDownload {
            bytes: response.bytes,
            content_type: response.content_type,
            filename_hint,
        })
    }
}

// ============================================================================
// HEADER PARSING
// ============================================================================

/// Pull the filename out of a content-disposition header value
///
/// Handles both `filename="book.epub"` and the bare-token and
/// `filename*=UTF-8''...` forms. The result is advisory; the sink sanitizes
/// it before use.
fn filename_from_content_disposition(value: &str) -> Option<String> {
    static FILENAME_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = FILENAME_RE
        .get_or_init(|| Regex::new(r#"filename\*?\s*=\s*(?:"([^"]*)"|([^;\s]+))"#).ok())
        .as_ref()?;

    let caps = re.captures(value)?;
    let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();

    // filename*=UTF-8''name carries a charset prefix before the name
    let name = raw.rsplit("''").next().unwrap_or(raw);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Best-effort extraction of a denial reason from an error body
fn denial_reason(message: &str) -> Option<String> {
    let start = message.find('{')?;
    let value: serde_json::Value = serde_json::from_str(&message[start..]).ok()?;
    value
        .get("reason")
        .or_else(|| value.get("error"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_license_request_body_field_names() {
        let body = LicenseRequestBody {
            public_key: "-----BEGIN PUBLIC KEY-----".to_string(),
            content_id: "42".to_string(),
            device_id: "deadbeef".to_string(),
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["public_key"], "-----BEGIN PUBLIC KEY-----");
        assert_eq!(json["content_id"], "42");
        assert_eq!(json["device_id"], "deadbeef");
    }

    #[test]
    fn test_license_response_into_license() {
        let wrapped = general_purpose::STANDARD.encode([7u8; 256]);
        let json = format!(
            r#"{{
                "license_id": "lic-1",
                "session_token": "abc",
                "expires_at": "2030-01-01T00:00:00Z",
                "wrapped_content_key": "{}"
            }}"#,
            wrapped
        );

        let response: LicenseResponse = serde_json::from_str(&json).unwrap();
        let license = response.into_license("42").unwrap();

        assert_eq!(license.license_id, "lic-1");
        assert_eq!(license.content_id, "42");
        assert_eq!(license.session_token, "abc");
        assert_eq!(license.wrapped_content_key, vec![7u8; 256]);
        assert!(!license.is_expired());
    }

    #[test]
    fn test_license_response_rejects_bad_base64() {
        let response = LicenseResponse {
            license_id: "lic-1".to_string(),
            session_token: "abc".to_string(),
            expires_at: Utc::now(),
            wrapped_content_key: "not base64 !!!".to_string(),
        };

        let err = response.into_license("42").unwrap_err();
        assert!(matches!(err, DrmError::InvalidResponse { .. }));
    }

    #[test]
    fn test_filename_from_content_disposition() {
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="book.epub""#),
            Some("book.epub".to_string())
        );
        assert_eq!(
            filename_from_content_disposition("attachment; filename=report.pdf"),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            filename_from_content_disposition("attachment; filename*=UTF-8''novel.docx"),
            Some("novel.docx".to_string())
        );
        assert_eq!(filename_from_content_disposition("inline"), None);
    }

    #[test]
    fn test_denial_reason_parsing() {
        assert_eq!(
            denial_reason(r#"license server rejected request: {"reason": "seat_limit_reached"}"#),
            Some("seat_limit_reached".to_string())
        );
        assert_eq!(
            denial_reason(r#"license server rejected request: {"error": "device_blocked"}"#),
            Some("device_blocked".to_string())
        );
        assert_eq!(denial_reason("plain text failure"), None);
    }

    #[test]
    fn test_endpoint_paths() {
        assert_eq!(license_endpoint("42"), "/v1/content/42/license");
        assert_eq!(content_endpoint("42"), "/v1/content/42/data");
        assert_eq!(HEARTBEAT_ENDPOINT, "/v1/sessions/heartbeat");
    }
}
