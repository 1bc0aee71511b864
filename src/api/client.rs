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


//! HTTP transport for the license server
//!
//! Wraps `reqwest::Client` with the behavior every DRM endpoint shares:
//! - Bearer authentication via the injected [`AuthProvider`]
//! - One token refresh on 401, then `Unauthorized` surfaces
//! - Bounded retry with exponential backoff for transient failures
//! - Rate-limit (429) reporting with the server's retry-after timing
//! - A concurrency cap so a burst of opens cannot flood the server
//!
//! Endpoint semantics (which status means denied vs revoked) live with the
//! endpoint methods in [`crate::api::license`], not here.

use crate::api::auth::AuthProvider;
use crate::error::{DrmError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

/// Maximum number of concurrent license-server requests
const MAX_CONCURRENCY: usize = 4;

/// Maximum attempts for retriable requests (1 initial + 2 retries)
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Initial retry delay in seconds (exponential backoff: 1s, 2s, 4s)
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Configuration for LicenseServerClient
/// Provides a builder pattern for client customization
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.librivault.app".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: MAX_RETRY_ATTEMPTS,
            user_agent: "LibriVault/1.0 (reader-core)".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

/// Builder for ClientConfig
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary response body plus the headers the DRM flow cares about
#[derive(Debug)]
pub struct BinaryResponse {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

/// HTTP client for the LibriVault license server
///
/// # Example
/// ```rust,no_run
/// use reader_core::api::auth::StaticTokenProvider;
/// use reader_core::api::client::{ClientConfig, LicenseServerClient};
/// use std::sync::Arc;
///
/// # fn example() -> reader_core::error::Result<()> {
/// let config = ClientConfig::builder()
///     .base_url("https://api.librivault.app")
///     .build();
/// let auth = Arc::new(StaticTokenProvider::new("bearer-token"));
/// let client = LicenseServerClient::with_config(auth, config)?;
/// # Ok(())
/// # }
/// ```
pub struct LicenseServerClient {
    /// Underlying HTTP client
    client: Client,
    /// Supplies and refreshes the bearer token
    auth: Arc<dyn AuthProvider>,
    /// Base URL without trailing slash
    base_url: String,
    /// Client configuration
    config: ClientConfig,
    /// Semaphore for concurrency control
    semaphore: Arc<Semaphore>,
}

impl LicenseServerClient {
    /// Create a client with default configuration
    pub fn new(auth: Arc<dyn AuthProvider>) -> Result<Self> {
        Self::with_config(auth, ClientConfig::default())
    }

    /// Create a client with custom configuration
    ///
    /// # Errors
    /// Returns an error if the base URL does not parse or the HTTP client
    /// cannot be built.
    pub fn with_config(auth: Arc<dyn AuthProvider>, config: ClientConfig) -> Result<Self> {
        let parsed = Url::parse(&config.base_url)
            .map_err(|e| DrmError::internal(format!("invalid license server URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DrmError::internal(format!(
                "unsupported license server URL scheme '{}'",
                parsed.scheme()
            )));
        }
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| DrmError::internal(format!("invalid user agent: {}", e)))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .pool_max_idle_per_host(MAX_CONCURRENCY)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            auth,
            base_url,
            config,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENCY)),
        })
    }

    /// Create a builder for custom client configuration
    pub fn builder() -> ClientConfigBuilder {
        ClientConfig::builder()
    }

    /// Get the license server base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body with retry on transient failures
    ///
    /// # Errors
    /// - `Unauthorized` - bearer token rejected and refresh did not help
    /// - `RateLimited` - server asked us to back off (never retried here)
    /// - `NetworkError` / `RequestFailed` - after the retry budget is spent
    /// - `InvalidResponse` - 2xx body that did not parse
    pub async fn post_json<T, B>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        B: Serialize,
    {
        self.request_json(endpoint, body, self.config.max_retries)
            .await
    }

    /// POST a JSON body exactly once, no retries
    ///
    /// Heartbeats use this: their caller owns the failure budget, and a
    /// transport-level retry loop underneath it would double-count.
    pub async fn post_json_once<T, B>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        B: Serialize,
    {
        self.request_json(endpoint, body, 1).await
    }

    /// Execute a JSON POST with bounded retry and exponential backoff
    ///
    /// Retries on: transient network errors, 5xx responses.
    /// No retry on: 2xx, 4xx (401 gets one token refresh, 429 surfaces
    /// immediately with the server's timing).
    async fn request_json<T, B>(&self, endpoint: &str, body: &B, max_attempts: u32) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        B: Serialize,
    {
        let url = format!("{}{}", self.base_url, endpoint);

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DrmError::internal("request semaphore closed"))?;

        let mut attempts: u32 = 0;
        let mut refreshed_token = false;

        loop {
            let headers = self.build_auth_headers().await?;
            debug!(endpoint = %endpoint, attempt = attempts + 1, "license server request");

            match self
                .client
                .post(&url)
                .headers(headers)
                .json(body)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();

                    match status {
                        s if s.is_success() => {
                            return self.parse_json_response(response).await;
                        }

                        // 401 Unauthorized - try token refresh once
                        StatusCode::UNAUTHORIZED => {
                            if refreshed_token {
                                return Err(DrmError::unauthorized(
                                    "bearer token rejected after refresh",
                                ));
                            }
                            refreshed_token = true;
                            debug!(endpoint = %endpoint, "401 response, refreshing bearer token");
                            self.auth.refresh().await?;
                            continue;
                        }

                        // 429 Rate Limiting - respect Retry-After header
                        StatusCode::TOO_MANY_REQUESTS => {
                            return Err(DrmError::RateLimited {
                                retry_after_seconds: extract_retry_after(&response),
                                endpoint: endpoint.to_string(),
                            });
                        }

                        // 5xx Server Error - retry with backoff
                        s if s.is_server_error() => {
                            attempts += 1;
                            let error_body = response.text().await.unwrap_or_default();
                            let failure = DrmError::request_failed(
                                format!("server error: {}", error_body),
                                Some(s.as_u16()),
                                Some(endpoint.to_string()),
                            );
                            if attempts >= max_attempts {
                                return Err(failure);
                            }
                            let delay = backoff_delay(attempts);
                            warn!(
                                endpoint = %endpoint,
                                status = s.as_u16(),
                                retry_in_secs = delay.as_secs(),
                                "server error, backing off"
                            );
                            sleep(delay).await;
                            continue;
                        }

                        // Other statuses - endpoint methods translate these
                        _ => {
                            return Err(self.error_from_response(endpoint, response).await);
                        }
                    }
                }

                Err(e) => {
                    let transient = is_retryable_network_error(&e);
                    attempts += 1;
                    if !transient || attempts >= max_attempts {
                        return Err(DrmError::network(
                            format!("request to {} failed: {}", endpoint, e),
                            transient,
                        ));
                    }
                    let delay = backoff_delay(attempts);
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "network error, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// GET a binary body, streaming it into memory with optional progress
    ///
    /// `extra_headers` carries per-request credentials such as the session
    /// token. Single network attempt; the caller decides whether a transient
    /// failure is worth a fresh call.
    ///
    /// # Arguments
    /// * `endpoint` - Endpoint path (e.g. "/v1/content/42/data")
    /// * `extra_headers` - Headers appended after the bearer token
    /// * `progress` - Optional callback with (bytes_downloaded, total_bytes)
    pub async fn get_binary<F>(
        &self,
        endpoint: &str,
        extra_headers: HeaderMap,
        mut progress: Option<F>,
    ) -> Result<BinaryResponse>
    where
        F: FnMut(u64, u64),
    {
        let url = format!("{}{}", self.base_url, endpoint);

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DrmError::internal("request semaphore closed"))?;

        let mut refreshed_token = false;
        let response = loop {
            let mut headers = self.build_auth_headers().await?;
            headers.extend(extra_headers.clone());

            let response = self
                .client
                .get(&url)
                .headers(headers)
                .send()
                .await
                .map_err(|e| {
                    DrmError::network(
                        format!("request to {} failed: {}", endpoint, e),
                        is_retryable_network_error(&e),
                    )
                })?;

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed_token {
                refreshed_token = true;
                debug!(endpoint = %endpoint, "401 response, refreshing bearer token");
                self.auth.refresh().await?;
                continue;
            }
            break response;
        };

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                return Err(DrmError::unauthorized("bearer token rejected after refresh"));
            }
            return Err(self.error_from_response(endpoint, response).await);
        }

        let content_type = header_string(response.headers(), CONTENT_TYPE.as_str());
        let content_disposition = header_string(response.headers(), CONTENT_DISPOSITION.as_str());

        let total_size = response.content_length().unwrap_or(0);
        let mut downloaded: u64 = 0;
        let mut bytes = Vec::with_capacity(total_size as usize);

        let mut stream = response.bytes_stream();
        use futures_util::StreamExt;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                DrmError::network(format!("content stream from {} failed: {}", endpoint, e), true)
            })?;
            bytes.extend_from_slice(&chunk);
            downloaded += chunk.len() as u64;

            if let Some(ref mut callback) = progress {
                callback(downloaded, total_size);
            }
        }

        Ok(BinaryResponse {
            bytes,
            content_type,
            content_disposition,
        })
    }

    /// Build authentication headers with the current bearer token
    async fn build_auth_headers(&self) -> Result<HeaderMap> {
        let token = self.auth.bearer_token().await?;
        let mut headers = HeaderMap::new();

        let auth_value = format!("Bearer {}", token);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value)
                .map_err(|e| DrmError::unauthorized(format!("bearer token not header-safe: {}", e)))?,
        );

        Ok(headers)
    }

    /// Parse a successful JSON response
    async fn parse_json_response<T>(&self, response: Response) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status();
        let url = response.url().clone();

        // Read the text first so a parse failure can carry context
        let response_text = response.text().await.map_err(|e| {
            DrmError::request_failed(
                format!("failed to read response body: {}", e),
                Some(status.as_u16()),
                Some(url.path().to_string()),
            )
        })?;

        match serde_json::from_str::<T>(&response_text) {
            Ok(data) => Ok(data),
            Err(e) => {
                let error_col = e.column();
                let mut end = (error_col + 200).min(response_text.len());
                let mut start = error_col.saturating_sub(200).min(end);
                while !response_text.is_char_boundary(start) {
                    start -= 1;
                }
                while !response_text.is_char_boundary(end) {
                    end += 1;
                }
                let context = &response_text[start..end];

                Err(DrmError::InvalidResponse {
                    message: format!("parse error: {} at col {}. Context: ...{}...", e, error_col, context),
                    response_body: Some(response_text),
                })
            }
        }
    }

    /// Turn a non-2xx response into a RequestFailed with status context
    async fn error_from_response(&self, endpoint: &str, response: Response) -> DrmError {
        let status = response.status();
        let error_body = response.text().await.unwrap_or_default();

        DrmError::request_failed(
            format!("license server rejected request: {}", error_body),
            Some(status.as_u16()),
            Some(endpoint.to_string()),
        )
    }
}

impl fmt::Debug for LicenseServerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LicenseServerClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.config.timeout)
            .field("max_retries", &self.config.max_retries)
            .finish_non_exhaustive()
    }
}

/// Check if a network error is worth retrying
fn is_retryable_network_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Extract retry-after delay from response headers (in seconds)
fn extract_retry_after(response: &Response) -> u64 {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(60)
}

/// Exponential backoff delay for the given failure count (1-based)
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(INITIAL_RETRY_DELAY_SECS * 2_u64.pow(attempt.saturating_sub(1)))
}

/// Read a header value as an owned string if present and valid UTF-8
fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

// ===== TESTS =====
