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


//! Sinks for decrypted plaintext
//!
//! A sink receives the decrypted bytes of exactly one reading session and
//! hands back an opaque [`ContentHandle`] the viewer can open. Discarding
//! the sink destroys the plaintext; discard is idempotent so teardown paths
//! (session close, revocation, process shutdown) can all call it without
//! coordinating.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::detect::ContentType;
use crate::error::{DrmError, Result};

// ===== CONSTANTS =====

/// Directory created under the sink base for each reading session.
const SESSION_DIR_PREFIX: &str = "session-";

/// Filename used when no usable hint accompanies the download.
const DEFAULT_FILE_STEM: &str = "content";

// ===== CONTENT HANDLE =====

/// Opaque reference to decrypted content, returned by [`ContentSink::persist`].
///
/// The viewer layer matches on the variant to decide how to open the title;
/// everything else treats the handle as a token that is only valid until the
/// sink is discarded.
#[derive(Debug, Clone)]
pub enum ContentHandle {
    /// Plaintext written to a private, session-scoped file.
    File {
        path: PathBuf,
        content_type: ContentType,
    },
    /// Plaintext held in memory, for platforms without private storage.
    Memory {
        bytes: Arc<Vec<u8>>,
        content_type: ContentType,
    },
}

impl ContentHandle {
    /// Returns the detected type of the decrypted content.
    pub fn content_type(&self) -> ContentType {
        match self {
            ContentHandle::File { content_type, .. } => *content_type,
            ContentHandle::Memory { content_type, .. } => *content_type,
        }
    }

    /// Returns the backing file path, if the content was persisted to disk.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ContentHandle::File { path, .. } => Some(path),
            ContentHandle::Memory { .. } => None,
        }
    }

    /// Returns the in-memory plaintext, if the content was kept in memory.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            ContentHandle::File { .. } => None,
            ContentHandle::Memory { bytes, .. } => Some(bytes),
        }
    }
}

// ===== SINK TRAIT =====

/// Destination for the decrypted bytes of a single reading session.
///
/// Implementations own the lifetime of the plaintext: `persist` makes it
/// reachable through a [`ContentHandle`], `discard` destroys it. A sink is
/// expected to serve one session; persisting twice replaces the earlier
/// content.
#[async_trait]
pub trait ContentSink: Send + Sync {
    /// Stores decrypted plaintext and returns a handle the viewer can open.
    ///
    /// # Arguments
    ///
    /// * `plaintext` - The decrypted content bytes
    /// * `content_type` - Detected type, which fixes the handle's extension
    /// * `filename_hint` - Optional display name from the download, untrusted
    ///
    /// # Errors
    ///
    /// Returns [`DrmError::StorageError`] if the plaintext cannot be stored.
    async fn persist(
        &self,
        plaintext: &[u8],
        content_type: ContentType,
        filename_hint: Option<&str>,
    ) -> Result<ContentHandle>;

    /// Destroys any plaintext held by this sink.
    ///
    /// Idempotent: discarding an empty or already-discarded sink succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`DrmError::StorageError`] if stored plaintext exists but
    /// cannot be removed.
    async fn discard(&self) -> Result<()>;
}

// ===== SESSION DIRECTORY SINK =====

/// Sink that writes plaintext into a private per-session directory.
///
/// Each sink owns `<base>/session-<uuid>/`. The directory is created with
/// owner-only permissions on Unix and removed wholesale on discard, so no
/// decrypted bytes outlive the session.
///
/// # Example
///
/// ```rust,no_run
/// use reader_core::content::{ContentSink, SessionDirSink};
/// use reader_core::crypto::detect::ContentType;
///
/// # async fn example() -> reader_core::error::Result<()> {
/// let sink = SessionDirSink::new("/data/app/librivault/sessions");
/// let handle = sink
///     .persist(b"%PDF-1.7 ...", ContentType::Pdf, Some("My Book.pdf"))
///     .await?;
/// println!("viewer path: {:?}", handle.path());
/// sink.discard().await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionDirSink {
    session_dir: PathBuf,
}

impl SessionDirSink {
    /// Creates a sink rooted at a fresh session directory under `base_dir`.
    ///
    /// Nothing is written until [`ContentSink::persist`] is called.
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        let session_dir = base_dir
            .into()
            .join(format!("{}{}", SESSION_DIR_PREFIX, Uuid::new_v4()));

        Self { session_dir }
    }

    /// Returns the session directory this sink writes into.
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    async fn create_session_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.session_dir).await.map_err(|e| {
            DrmError::storage(format!(
                "failed to create session directory {}: {}",
                self.session_dir.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            fs::set_permissions(&self.session_dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|e| {
                    DrmError::storage(format!(
                        "failed to restrict session directory permissions: {}",
                        e
                    ))
                })?;
        }

        Ok(())
    }
}

#[async_trait]
impl ContentSink for SessionDirSink {
    async fn persist(
        &self,
        plaintext: &[u8],
        content_type: ContentType,
        filename_hint: Option<&str>,
    ) -> Result<ContentHandle> {
        self.create_session_dir().await?;

        let filename = viewer_filename(filename_hint, content_type);
        let path = self.session_dir.join(&filename);

        fs::write(&path, plaintext).await.map_err(|e| {
            DrmError::storage(format!(
                "failed to write decrypted content to {}: {}",
                path.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| {
                    DrmError::storage(format!("failed to restrict content permissions: {}", e))
                })?;
        }

        info!(
            "Persisted decrypted content: {} ({} bytes, {})",
            filename,
            plaintext.len(),
            content_type
        );

        Ok(ContentHandle::File { path, content_type })
    }

    async fn discard(&self) -> Result<()> {
        match fs::remove_dir_all(&self.session_dir).await {
            Ok(()) => {
                debug!("Removed session directory {}", self.session_dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DrmError::storage(format!(
                "failed to remove session directory {}: {}",
                self.session_dir.display(),
                e
            ))),
        }
    }
}

// ===== MEMORY SINK =====

/// Sink that keeps plaintext in process memory only.
///
/// Fallback for platforms where no app-private directory is available. The
/// plaintext is dropped on discard; the handle's `Arc` keeps already-open
/// viewers working until they release it.
#[derive(Default)]
pub struct MemorySink {
    stored: RwLock<Option<Arc<Vec<u8>>>>,
}

impl MemorySink {
    /// Creates an empty in-memory sink.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentSink for MemorySink {
    async fn persist(
        &self,
        plaintext: &[u8],
        content_type: ContentType,
        _filename_hint: Option<&str>,
    ) -> Result<ContentHandle> {
        let bytes = Arc::new(plaintext.to_vec());
        *self.stored.write().await = Some(Arc::clone(&bytes));

        info!(
            "Holding decrypted content in memory ({} bytes, {})",
            bytes.len(),
            content_type
        );

        Ok(ContentHandle::Memory {
            bytes,
            content_type,
        })
    }

    async fn discard(&self) -> Result<()> {
        self.stored.write().await.take();
        Ok(())
    }
}

// ===== FILENAME SANITIZATION =====

/// Builds the viewer-facing filename from an untrusted hint.
///
/// The hint contributes only its file stem; the extension always comes from
/// the detected content type so a mislabeled download still opens in the
/// right viewer.
fn viewer_filename(hint: Option<&str>, content_type: ContentType) -> String {
    let stem = hint
        .map(sanitize_filename)
        .and_then(|name| {
            Path::new(&name)
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_FILE_STEM.to_string());

    format!("{}.{}", stem, content_type.extension())
}

/// Reduces an untrusted filename to a safe basename.
///
/// Path separators and parent references are stripped, characters that are
/// unsafe in filenames are replaced, and surrounding whitespace and dots are
/// trimmed. An empty result falls back to a generic name.
fn sanitize_filename(name: &str) -> String {
    // Keep only the last path component so traversal hints cannot escape
    // the session directory
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let replaced: String = base
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim().trim_matches('.').trim();

    if trimmed.is_empty() {
        DEFAULT_FILE_STEM.to_string()
    } else {
        trimmed.to_string()
    }
}

// ===== TESTS =====
