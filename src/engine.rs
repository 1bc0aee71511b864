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


//! DRM engine orchestration
//!
//! `DrmEngine` wires the leaf components into the open-content flow:
//!
//! 1. Device identity and keypair exist (created lazily on first use).
//! 2. A license covers the title, either validated from the cache or freshly
//!    requested. At most one request is in flight per content id.
//! 3. The content key is unwrapped with the device private key; a stale
//!    cached license that no longer unwraps is replaced once.
//! 4. The encrypted blob is fetched, authorized by the session token.
//! 5. Decryption runs on a blocking worker and the plaintext lands in the
//!    caller's [`ContentSink`].
//! 6. A [`SessionHeartbeat`] keeps the session alive; a monitor task tears
//!    the plaintext down the moment the server ends the session.
//!
//! The caller gets back a [`ReadingSession`] owning steps 5 and 6 until
//! `close()` is called. Cancellation is cooperative through [`CancelToken`]:
//! once cancelled, no further network call starts and nothing is written to
//! the sink.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{LicenseApi, ProgressFn};
use crate::content::{ContentHandle, ContentSink};
use crate::crypto::{decrypt_content, unwrap_content_key, ContentKey, DecryptedContent};
use crate::device::{DeviceIdentity, DeviceKeyPair, KeyVault, PlatformAttributes};
use crate::error::{DrmError, Result};
use crate::license::{HeartbeatConfig, License, LicenseCache, SessionHeartbeat, SessionState};
use crate::storage::ProtectedStore;

// ===== CANCELLATION =====

/// Cooperative cancellation for an in-flight `open_content` call.
///
/// Cloning is cheap; every clone observes the same flag. Cancellation is
/// sticky and one-way.
#[derive(Clone, Debug)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once cancellation is requested; pends forever otherwise.
    async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DrmError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call options for [`DrmEngine::open_content`].
#[derive(Default)]
pub struct OpenOptions {
    /// Token the caller can trip to abandon the open mid-flight.
    pub cancel: Option<CancelToken>,
    /// Download progress callback `(bytes_downloaded, total_bytes)`.
    pub progress: Option<ProgressFn>,
}

// ===== ENGINE =====

/// Orchestrates license acquisition, decryption and session lifecycle.
///
/// One engine serves the whole app; each opened title gets its own
/// [`ReadingSession`]. The engine holds no per-session state beyond the
/// license cache.
///
/// # Example
///
/// ```rust,no_run
/// use reader_core::api::{ClientConfig, LicenseServerClient, StaticTokenProvider};
/// use reader_core::content::SessionDirSink;
/// use reader_core::engine::{DrmEngine, OpenOptions};
/// use reader_core::storage::FileStore;
/// use std::sync::Arc;
///
/// # async fn example() -> reader_core::error::Result<()> {
/// let store = Arc::new(FileStore::open_default().await?);
/// let auth = Arc::new(StaticTokenProvider::new("token"));
/// let client = Arc::new(LicenseServerClient::with_config(auth, ClientConfig::default())?);
///
/// let engine = DrmEngine::new(store, client);
/// let sink = Arc::new(SessionDirSink::new("/data/app/librivault/sessions"));
///
/// let session = engine.open_content("42", sink, OpenOptions::default()).await?;
/// println!("open at {:?}", session.handle().path());
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct DrmEngine {
    identity: DeviceIdentity,
    vault: KeyVault,
    cache: Arc<LicenseCache>,
    api: Arc<dyn LicenseApi>,
    heartbeat_config: HeartbeatConfig,
}

impl DrmEngine {
    /// Creates an engine over protected storage and a license server client,
    /// with platform attribute collection and default heartbeat tuning.
    pub fn new(store: Arc<dyn ProtectedStore>, api: Arc<dyn LicenseApi>) -> Self {
        Self::with_parts(
            DeviceIdentity::new(Arc::clone(&store), Box::new(PlatformAttributes)),
            KeyVault::new(store),
            Arc::new(LicenseCache::new()),
            api,
            HeartbeatConfig::default(),
        )
    }

    /// Creates an engine from explicitly constructed components.
    pub fn with_parts(
        identity: DeviceIdentity,
        vault: KeyVault,
        cache: Arc<LicenseCache>,
        api: Arc<dyn LicenseApi>,
        heartbeat_config: HeartbeatConfig,
    ) -> Self {
        Self {
            identity,
            vault,
            cache,
            api,
            heartbeat_config,
        }
    }

    /// Returns this installation's device id, deriving it on first use.
    pub async fn device_id(&self) -> Result<String> {
        self.identity.device_id().await
    }

    /// Opens a title for reading.
    ///
    /// Runs the full flow described in the module docs and returns a
    /// [`ReadingSession`] whose handle points at the decrypted content. The
    /// session's heartbeat is already running when this returns.
    ///
    /// # Arguments
    ///
    /// * `content_id` - The title to open
    /// * `sink` - Where the decrypted plaintext goes
    /// * `options` - Cancellation token and progress callback
    ///
    /// # Errors
    ///
    /// Any [`DrmError`] from the underlying steps; [`DrmError::Cancelled`] if
    /// the token was tripped before completion.
    pub async fn open_content(
        &self,
        content_id: &str,
        sink: Arc<dyn ContentSink>,
        options: OpenOptions,
    ) -> Result<ReadingSession> {
        let OpenOptions { cancel, progress } = options;
        let cancel = cancel.unwrap_or_default();
        cancel.ensure_live()?;

        let device_id = self.identity.device_id().await?;
        let keypair = self.vault.initialize().await?;
        cancel.ensure_live()?;

        // Single-flight: concurrent opens of the same title await the first
        // acquisition instead of racing the server's seat limit
        let guard = self.cache.begin_acquisition(content_id).await;
        cancel.ensure_live()?;

        let (license, content_key) = self
            .acquire_and_unwrap(content_id, &keypair, &device_id)
            .await?;
        drop(guard);
        cancel.ensure_live()?;

        let download = tokio::select! {
            _ = cancel.cancelled() => return Err(DrmError::Cancelled),
            result = self.api.fetch_content(content_id, &license.session_token, progress) => result?,
        };

        let decrypted = tokio::select! {
            _ = cancel.cancelled() => return Err(DrmError::Cancelled),
            result = run_decrypt(download.bytes, content_key, download.filename_hint.clone()) => result?,
        };
        cancel.ensure_live()?;

        let handle = sink
            .persist(
                &decrypted.plaintext,
                decrypted.content_type,
                download.filename_hint.as_deref(),
            )
            .await?;

        let heartbeat = SessionHeartbeat::new(
            Arc::clone(&self.api),
            content_id,
            license.session_token.as_str(),
            self.heartbeat_config.clone(),
        );
        let states = heartbeat.subscribe();
        heartbeat.start()?;

        let monitor = spawn_teardown_monitor(
            states,
            Arc::clone(&sink),
            Arc::clone(&self.cache),
            content_id.to_string(),
        );

        info!(
            content_id = %content_id,
            content_type = %decrypted.content_type,
            "Reading session opened"
        );

        Ok(ReadingSession {
            content_id: content_id.to_string(),
            handle,
            heartbeat,
            sink,
            monitor: Some(monitor),
            closed: false,
        })
    }

    /// Deauthorizes this installation.
    ///
    /// Clears the license cache and destroys the device keypair and id
    /// together. Every license the server issued to this device becomes
    /// permanently unusable; the next open starts from a blank identity.
    pub async fn deauthorize_device(&self) -> Result<()> {
        self.cache.clear().await;
        self.vault.reset().await?;
        info!("Device deauthorized");
        Ok(())
    }

    /// Produces a license and the unwrapped content key for one title.
    ///
    /// A cached license is trusted only after one validation heartbeat. A
    /// cached license whose wrapped key no longer opens under the current
    /// device key is discarded and replaced by exactly one fresh request.
    async fn acquire_and_unwrap(
        &self,
        content_id: &str,
        keypair: &DeviceKeyPair,
        device_id: &str,
    ) -> Result<(License, ContentKey)> {
        let (license, from_cache) = self.acquire_license(content_id, keypair, device_id).await?;

        match unwrap_content_key(&license.wrapped_content_key, keypair.private_key()) {
            Ok(key) => Ok((license, key)),
            Err(e) if from_cache => {
                warn!(
                    content_id = %content_id,
                    error = %e,
                    "Cached license does not unwrap under current device key, re-acquiring"
                );
                self.cache.invalidate(content_id).await;

                let license = self.request_and_cache(content_id, keypair, device_id).await?;
                let key = unwrap_content_key(&license.wrapped_content_key, keypair.private_key())?;
                Ok((license, key))
            }
            Err(e) => Err(e),
        }
    }

    async fn acquire_license(
        &self,
        content_id: &str,
        keypair: &DeviceKeyPair,
        device_id: &str,
    ) -> Result<(License, bool)> {
        if let Some(cached) = self.cache.get(content_id).await {
            match self.api.send_heartbeat(&cached.session_token).await {
                Ok(_) => {
                    debug!(content_id = %content_id, "Reusing validated cached license");
                    return Ok((cached, true));
                }
                Err(e) => {
                    warn!(
                        content_id = %content_id,
                        error = %e,
                        "Cached license failed validation, re-acquiring"
                    );
                    self.cache.invalidate(content_id).await;
                }
            }
        }

        let license = self.request_and_cache(content_id, keypair, device_id).await?;
        Ok((license, false))
    }

    async fn request_and_cache(
        &self,
        content_id: &str,
        keypair: &DeviceKeyPair,
        device_id: &str,
    ) -> Result<License> {
        let license = self
            .api
            .request_license(content_id, keypair.public_key_pem(), device_id)
            .await?;
        self.cache.put(license.clone()).await;
        Ok(license)
    }
}

impl fmt::Debug for DrmEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmEngine")
            .field("heartbeat_config", &self.heartbeat_config)
            .finish_non_exhaustive()
    }
}

/// KDF plus AEAD on a blocking worker; the async caller only awaits.
async fn run_decrypt(
    blob: Vec<u8>,
    content_key: ContentKey,
    filename_hint: Option<String>,
) -> Result<DecryptedContent> {
    tokio::task::spawn_blocking(move || {
        decrypt_content(&blob, &content_key, filename_hint.as_deref())
    })
    .await
    .map_err(|e| DrmError::internal(format!("decrypt task failed: {}", e)))?
}

// ===== READING SESSION =====

/// One open title: decrypted content handle plus the live heartbeat.
///
/// Owns the sink and heartbeat until [`close`](Self::close). If the server
/// revokes or expires the session first, the engine's monitor task discards
/// the plaintext without waiting for the caller.
pub struct ReadingSession {
    content_id: String,
    handle: ContentHandle,
    heartbeat: SessionHeartbeat,
    sink: Arc<dyn ContentSink>,
    monitor: Option<JoinHandle<()>>,
    closed: bool,
}

impl ReadingSession {
    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    /// Handle the viewer opens. Valid until the session ends.
    pub fn handle(&self) -> &ContentHandle {
        &self.handle
    }

    /// Current heartbeat state.
    pub fn state(&self) -> SessionState {
        self.heartbeat.state()
    }

    /// Observe heartbeat transitions, including revocation.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.heartbeat.subscribe()
    }

    /// Ends the session: stops the heartbeat and destroys the plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`DrmError::StorageUnavailable`] if stored plaintext could not
    /// be removed. The heartbeat is stopped regardless.
    pub async fn close(mut self) -> Result<()> {
        self.heartbeat.stop();
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        self.closed = true;

        let result = self.sink.discard().await;
        info!(content_id = %self.content_id, "Reading session closed");
        result
    }
}

// Backstop for sessions dropped without close(): the ping task dies with the
// heartbeat and the plaintext discard is spawned if a runtime is available.
impl Drop for ReadingSession {
    fn drop(&mut self) {
        self.heartbeat.stop();
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }

        if !self.closed {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                let sink = Arc::clone(&self.sink);
                rt.spawn(async move {
                    let _ = sink.discard().await;
                });
            }
        }
    }
}

impl fmt::Debug for ReadingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadingSession")
            .field("content_id", &self.content_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ===== TEARDOWN MONITOR =====

/// Watches heartbeat states and destroys the plaintext on a server-decided
/// end. Exits quietly on `STOPPED`; `close()` owns that teardown.
fn spawn_teardown_monitor(
    mut states: watch::Receiver<SessionState>,
    sink: Arc<dyn ContentSink>,
    cache: Arc<LicenseCache>,
    content_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();

            if state.is_terminal() {
                warn!(
                    content_id = %content_id,
                    state = %state,
                    "Session ended by server, discarding decrypted content"
                );
                if state == SessionState::Revoked {
                    cache.invalidate(&content_id).await;
                }
                if let Err(e) = sink.discard().await {
                    error!(
                        content_id = %content_id,
                        error = %e,
                        "Failed to discard decrypted content"
                    );
                }
                break;
            }

            if state == SessionState::Stopped {
                break;
            }
        }
    })
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ContentDownload, HeartbeatResponse};
    use crate::content::MemorySink;
    use crate::crypto::{encrypt_content, wrap_content_key};
    use crate::device::StaticAttributes;
    use crate::storage::{keys, MemoryStore};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex as StdMutex, OnceLock};
    use std::time::Duration;

    const CONTENT_ID: &str = "42";
    const PLAINTEXT_LEN: usize = 1024;

    fn fixture_plaintext() -> Vec<u8> {
        let mut bytes = b"%PDF-1.7\n".to_vec();
        bytes.resize(PLAINTEXT_LEN, 0x20);
        bytes
    }

    /// In-process license server: wraps the real content key against
    /// whatever public key the device presents, serves a sealed fixture
    /// blob, and answers heartbeats from a script (empty script = ack).
    struct FakeServer {
        content_key: Vec<u8>,
        blob: Vec<u8>,
        license_requests: AtomicUsize,
        heartbeats: AtomicUsize,
        fetches: AtomicUsize,
        heartbeat_script: StdMutex<VecDeque<Result<HeartbeatResponse>>>,
        wrap_against: StdMutex<Option<RsaPublicKey>>,
    }

    impl FakeServer {
        fn new() -> Self {
            let content_key = vec![0x42u8; 32];
            let blob = encrypt_content(
                &fixture_plaintext(),
                &ContentKey::new(content_key.clone()),
            )
            .unwrap();

            Self {
                content_key,
                blob,
                license_requests: AtomicUsize::new(0),
                heartbeats: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
                heartbeat_script: StdMutex::new(VecDeque::new()),
                wrap_against: StdMutex::new(None),
            }
        }

        fn script_heartbeats(&self, outcomes: Vec<Result<HeartbeatResponse>>) {
            *self.heartbeat_script.lock().unwrap() = outcomes.into();
        }

        fn ack() -> Result<HeartbeatResponse> {
            Ok(HeartbeatResponse {
                status: "active".to_string(),
                server_time: None,
            })
        }
    }

    #[async_trait]
    impl LicenseApi for FakeServer {
        async fn request_license(
            &self,
            content_id: &str,
            public_key_pem: &str,
            _device_id: &str,
        ) -> Result<License> {
            self.license_requests.fetch_add(1, Ordering::SeqCst);

            let presented = RsaPublicKey::from_public_key_pem(public_key_pem)
                .map_err(|e| DrmError::internal(format!("bad public key: {}", e)));
            let target = match self.wrap_against.lock().unwrap().clone() {
                Some(stale) => stale,
                None => presented?,
            };

            Ok(License {
                license_id: format!(
                    "lic-{}",
                    self.license_requests.load(Ordering::SeqCst)
                ),
                content_id: content_id.to_string(),
                session_token: "abc".to_string(),
                wrapped_content_key: wrap_content_key(&self.content_key, &target)?,
                expires_at: Utc::now() + ChronoDuration::hours(1),
            })
        }

        async fn send_heartbeat(&self, _session_token: &str) -> Result<HeartbeatResponse> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            self.heartbeat_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(Self::ack)
        }

        async fn fetch_content(
            &self,
            _content_id: &str,
            _session_token: &str,
            mut progress: Option<ProgressFn>,
        ) -> Result<ContentDownload> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(cb) = progress.as_mut() {
                cb(self.blob.len() as u64, self.blob.len() as u64);
            }
            Ok(ContentDownload {
                bytes: self.blob.clone(),
                content_type: Some("application/octet-stream".to_string()),
                filename_hint: Some("fixture.pdf".to_string()),
            })
        }
    }

    /// RSA keygen is too slow to repeat per test; generate one device key
    /// per test binary and seed stores with it.
    fn device_key_pems() -> &'static (String, String) {
        static KEYS: OnceLock<(String, String)> = OnceLock::new();
        KEYS.get_or_init(|| {
            let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
            let private_pem = private.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
            let public_pem = RsaPublicKey::from(&private)
                .to_public_key_pem(LineEnding::LF)
                .unwrap();
            (private_pem, public_pem)
        })
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let (private_pem, public_pem) = device_key_pems();
        let store = Arc::new(MemoryStore::new());
        store
            .put(keys::DEVICE_PRIVATE_KEY, private_pem)
            .await
            .unwrap();
        store.put(keys::DEVICE_PUBLIC_KEY, public_pem).await.unwrap();
        store
    }

    fn test_attributes() -> StaticAttributes {
        StaticAttributes(crate::device::DeviceAttributes {
            platform: "test".to_string(),
            os_version: "1".to_string(),
            build_id: "t1".to_string(),
            manufacturer: "Acme".to_string(),
            model: "Bench".to_string(),
            hardware_id: "0000".to_string(),
        })
    }

    async fn engine_over(server: Arc<FakeServer>) -> (DrmEngine, Arc<LicenseCache>) {
        let store = seeded_store().await;
        let cache = Arc::new(LicenseCache::new());
        let engine = DrmEngine::with_parts(
            DeviceIdentity::new(
                Arc::clone(&store) as Arc<dyn ProtectedStore>,
                Box::new(test_attributes()),
            ),
            KeyVault::new(store),
            Arc::clone(&cache),
            server,
            HeartbeatConfig::default(),
        );
        (engine, cache)
    }

    #[tokio::test]
    async fn test_open_content_end_to_end() {
        let server = Arc::new(FakeServer::new());
        let (engine, _) = engine_over(Arc::clone(&server)).await;

        let sink = Arc::new(MemorySink::new());
        let session = engine
            .open_content(CONTENT_ID, sink, OpenOptions::default())
            .await
            .unwrap();

        assert_eq!(session.content_id(), CONTENT_ID);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.handle().bytes().unwrap(), fixture_plaintext());
        assert_eq!(
            session.handle().content_type(),
            crate::crypto::ContentType::Pdf
        );
        assert_eq!(server.license_requests.load(Ordering::SeqCst), 1);
        assert_eq!(server.fetches.load(Ordering::SeqCst), 1);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_open_reuses_validated_cached_license() {
        let server = Arc::new(FakeServer::new());
        let (engine, _) = engine_over(Arc::clone(&server)).await;

        let first = engine
            .open_content(CONTENT_ID, Arc::new(MemorySink::new()), OpenOptions::default())
            .await
            .unwrap();
        first.close().await.unwrap();
        assert_eq!(server.heartbeats.load(Ordering::SeqCst), 0);

        let second = engine
            .open_content(CONTENT_ID, Arc::new(MemorySink::new()), OpenOptions::default())
            .await
            .unwrap();

        // One license ever issued; the second open validated the cached one
        assert_eq!(server.license_requests.load(Ordering::SeqCst), 1);
        assert_eq!(server.heartbeats.load(Ordering::SeqCst), 1);

        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_validation_forces_fresh_license() {
        let server = Arc::new(FakeServer::new());
        let (engine, cache) = engine_over(Arc::clone(&server)).await;

        let first = engine
            .open_content(CONTENT_ID, Arc::new(MemorySink::new()), OpenOptions::default())
            .await
            .unwrap();
        first.close().await.unwrap();

        // Server revoked the session out-of-band; validation must fail once
        server.script_heartbeats(vec![Err(DrmError::revoked("session revoked"))]);

        let second = engine
            .open_content(CONTENT_ID, Arc::new(MemorySink::new()), OpenOptions::default())
            .await
            .unwrap();

        assert_eq!(server.license_requests.load(Ordering::SeqCst), 2);
        assert!(cache.get(CONTENT_ID).await.is_some());

        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_cached_wrap_reacquires_once() {
        let server = Arc::new(FakeServer::new());
        let (engine, cache) = engine_over(Arc::clone(&server)).await;

        // Cache a license wrapped against a key this device never had
        let rogue = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        cache
            .put(License {
                license_id: "stale".to_string(),
                content_id: CONTENT_ID.to_string(),
                session_token: "stale-token".to_string(),
                wrapped_content_key: wrap_content_key(
                    &server.content_key,
                    &RsaPublicKey::from(&rogue),
                )
                .unwrap(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
            })
            .await;

        let session = engine
            .open_content(CONTENT_ID, Arc::new(MemorySink::new()), OpenOptions::default())
            .await
            .unwrap();

        // Validation passed but the unwrap forced one fresh request
        assert_eq!(server.license_requests.load(Ordering::SeqCst), 1);
        assert_eq!(session.handle().bytes().unwrap(), fixture_plaintext());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fresh_license_that_cannot_unwrap_surfaces() {
        let server = Arc::new(FakeServer::new());
        let rogue = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        *server.wrap_against.lock().unwrap() = Some(RsaPublicKey::from(&rogue));

        let (engine, _) = engine_over(Arc::clone(&server)).await;

        let result = engine
            .open_content(CONTENT_ID, Arc::new(MemorySink::new()), OpenOptions::default())
            .await;

        assert!(matches!(result, Err(DrmError::UnwrapFailed { .. })));
        // No second request: re-asking cannot fix a server-side wrap mismatch
        assert_eq!(server.license_requests.load(Ordering::SeqCst), 1);
        assert_eq!(server.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_any_network_call() {
        let server = Arc::new(FakeServer::new());
        let (engine, _) = engine_over(Arc::clone(&server)).await;

        let cancel = CancelToken::new();
        cancel.cancel();

        let result = engine
            .open_content(
                CONTENT_ID,
                Arc::new(MemorySink::new()),
                OpenOptions {
                    cancel: Some(cancel),
                    progress: None,
                },
            )
            .await;

        assert!(matches!(result, Err(DrmError::Cancelled)));
        assert_eq!(server.license_requests.load(Ordering::SeqCst), 0);
        assert_eq!(server.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_tick_tears_down_and_invalidates() {
        let server = Arc::new(FakeServer::new());
        let (engine, cache) = engine_over(Arc::clone(&server)).await;

        let session = engine
            .open_content(CONTENT_ID, Arc::new(MemorySink::new()), OpenOptions::default())
            .await
            .unwrap();
        assert!(cache.get(CONTENT_ID).await.is_some());

        // First scheduled ping comes back revoked
        server.script_heartbeats(vec![Err(DrmError::revoked("session revoked"))]);
        let mut states = session.subscribe();

        tokio::time::sleep(Duration::from_secs(31)).await;
        while !states.borrow_and_update().is_terminal() {
            states.changed().await.unwrap();
        }
        assert_eq!(session.state(), SessionState::Revoked);

        // Monitor invalidates the license so the next open starts fresh
        let mut invalidated = false;
        for _ in 0..50 {
            if cache.get(CONTENT_ID).await.is_none() {
                invalidated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(invalidated);
    }

    #[tokio::test]
    async fn test_progress_callback_reports_download() {
        let server = Arc::new(FakeServer::new());
        let (engine, _) = engine_over(Arc::clone(&server)).await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let progress: ProgressFn = Box::new(move |done, total| {
            recorder.lock().unwrap().push((done, total));
        });

        let session = engine
            .open_content(
                CONTENT_ID,
                Arc::new(MemorySink::new()),
                OpenOptions {
                    cancel: None,
                    progress: Some(progress),
                },
            )
            .await
            .unwrap();

        let blob_len = server.blob.len() as u64;
        assert_eq!(*seen.lock().unwrap(), vec![(blob_len, blob_len)]);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_deauthorize_clears_cache_and_identity() {
        let server = Arc::new(FakeServer::new());
        let (engine, cache) = engine_over(Arc::clone(&server)).await;

        let before = engine.device_id().await.unwrap();
        let session = engine
            .open_content(CONTENT_ID, Arc::new(MemorySink::new()), OpenOptions::default())
            .await
            .unwrap();
        session.close().await.unwrap();
        assert!(!cache.is_empty().await);

        engine.deauthorize_device().await.unwrap();

        assert!(cache.is_empty().await);
        assert_ne!(engine.device_id().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_cancel_token_observed_by_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());

        // Resolves immediately once tripped
        clone.cancelled().await;
    }
}
