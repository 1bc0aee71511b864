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


//! In-memory license cache
//!
//! Maps content id → license for the short window in which a grant can be
//! reused. Entries hold only the wrapped content key and session metadata;
//! the unwrapped symmetric key is never cached and is re-derived per session.
//!
//! The cache also arbitrates license acquisition: at most one in-flight
//! license request per content id. Concurrent openers of the same title take
//! a per-content-id async lock around their check-then-request section, so
//! the second caller finds the first caller's result instead of racing the
//! server's seat limit.

use crate::license::License;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

/// Holds the per-content-id acquisition lock for one caller.
///
/// Dropping the guard releases the content id for the next acquirer.
pub type AcquisitionGuard = OwnedMutexGuard<()>;

/// Short-TTL store of issued licenses, keyed by content id
pub struct LicenseCache {
    entries: RwLock<HashMap<String, License>>,
    acquisitions: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LicenseCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            acquisitions: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a still-valid license for a content id
    ///
    /// Returns `None` for both a missing and an expired entry; an expired
    /// entry is dropped on the spot so it cannot be observed again.
    pub async fn get(&self, content_id: &str) -> Option<License> {
        {
            let entries = self.entries.read().await;
            match entries.get(content_id) {
                Some(license) if !license.is_expired() => return Some(license.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(content_id).is_some_and(|l| l.is_expired()) {
            debug!(content_id = %content_id, "dropping expired license from cache");
            entries.remove(content_id);
        }
        None
    }

    /// Store a freshly issued license, replacing any previous entry
    pub async fn put(&self, license: License) {
        let mut entries = self.entries.write().await;
        debug!(
            content_id = %license.content_id,
            license_id = %license.license_id,
            expires_at = %license.expires_at,
            "caching license"
        );
        entries.insert(license.content_id.clone(), license);
    }

    /// Drop a license that the server no longer honors
    ///
    /// Returns whether an entry was present.
    pub async fn invalidate(&self, content_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(content_id).is_some();
        if removed {
            debug!(content_id = %content_id, "invalidated cached license");
        }
        removed
    }

    /// Drop every cached license (device reset path)
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Take the acquisition lock for a content id
    ///
    /// Callers wrap their get-or-request sequence in this guard; whoever
    /// holds it is the single in-flight acquirer for that title. Waiters
    /// re-check the cache once the guard is theirs.
    pub async fn begin_acquisition(&self, content_id: &str) -> AcquisitionGuard {
        let slot = {
            let mut acquisitions = self.acquisitions.lock().await;
            Arc::clone(acquisitions.entry(content_id.to_string()).or_default())
        };
        slot.lock_owned().await
    }

    /// Number of cached licenses (expired entries included until observed)
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for LicenseCache {
    fn default() -> Self {
        Self::new()
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn license(content_id: &str, expires_in_seconds: i64) -> License {
        License {
            license_id: format!("lic-{}", content_id),
            content_id: content_id.to_string(),
            session_token: "token".to_string(),
            wrapped_content_key: vec![1u8; 256],
            expires_at: Utc::now() + Duration::seconds(expires_in_seconds),
        }
    }

    #[tokio::test]
    async fn test_get_on_empty_cache() {
        let cache = LicenseCache::new();
        assert!(cache.get("42").await.is_none());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = LicenseCache::new();
        cache.put(license("42", 3600)).await;

        let found = cache.get("42").await.expect("license should be cached");
        assert_eq!(found.license_id, "lic-42");
        assert_eq!(found.content_id, "42");
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped() {
        let cache = LicenseCache::new();
        cache.put(license("42", -10)).await;
        assert_eq!(cache.len().await, 1);

        assert!(cache.get("42").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_put_replaces_existing_entry() {
        let cache = LicenseCache::new();
        cache.put(license("42", 3600)).await;

        let mut replacement = license("42", 7200);
        replacement.license_id = "lic-42-renewed".to_string();
        cache.put(replacement).await;

        assert_eq!(cache.len().await, 1);
        let found = cache.get("42").await.expect("replacement should be cached");
        assert_eq!(found.license_id, "lic-42-renewed");
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = LicenseCache::new();
        cache.put(license("42", 3600)).await;

        assert!(cache.invalidate("42").await);
        assert!(cache.get("42").await.is_none());
        assert!(!cache.invalidate("42").await);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = LicenseCache::new();
        cache.put(license("42", 3600)).await;
        cache.put(license("43", 3600)).await;

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_acquisition_per_content_id() {
        let cache = Arc::new(LicenseCache::new());
        let requests = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let requests = Arc::clone(&requests);
            handles.push(tokio::spawn(async move {
                let _guard = cache.begin_acquisition("42").await;
                if cache.get("42").await.is_none() {
                    // Stand-in for the license server round trip
                    requests.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    cache.put(license("42", 3600)).await;
                }
            }));
        }
        for handle in handles {
            handle.await.expect("acquirer task panicked");
        }

        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_content_ids_do_not_serialize() {
        let cache = Arc::new(LicenseCache::new());

        let guard_a = cache.begin_acquisition("42").await;
        // A held lock on one title must not block another title
        let guard_b = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            cache.begin_acquisition("43"),
        )
        .await
        .expect("acquisition of a different content id should not block");

        drop(guard_a);
        drop(guard_b);
    }
}
