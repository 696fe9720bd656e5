//! Storage key signing for file-backed cameras

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{AppError, Result};

/// Signatures are reused until this long before they expire
const CACHE_MARGIN: Duration = Duration::from_secs(60);

/// Turns a storage key into a time-limited location a capture backend can open
pub trait UrlSigner: Send + Sync {
    fn sign(&self, key: &str, expires: Duration) -> Result<String>;
}

/// Signer for media kept on the local filesystem
///
/// Keys are resolved under `media_root`. Absolute paths and URLs with a
/// scheme are passed through unchanged.
pub struct LocalPathSigner {
    media_root: PathBuf,
}

impl LocalPathSigner {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
        }
    }
}

impl UrlSigner for LocalPathSigner {
    fn sign(&self, key: &str, _expires: Duration) -> Result<String> {
        let key = key.trim();
        if key.is_empty() {
            return Err(AppError::BadRequest("empty storage key".to_string()));
        }
        if key.contains("://") || Path::new(key).is_absolute() {
            return Ok(key.to_string());
        }
        if Path::new(key)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(AppError::BadRequest(format!(
                "storage key escapes media root: {}",
                key
            )));
        }
        Ok(self.media_root.join(key).to_string_lossy().to_string())
    }
}

/// Caches signatures keyed by `(key, expires)`
pub struct SignedUrlCache<S> {
    inner: S,
    entries: Mutex<HashMap<(String, u64), (Instant, String)>>,
}

impl<S: UrlSigner> SignedUrlCache<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<S: UrlSigner> UrlSigner for SignedUrlCache<S> {
    fn sign(&self, key: &str, expires: Duration) -> Result<String> {
        let cache_key = (key.to_string(), expires.as_secs());
        let now = Instant::now();
        {
            let mut entries = self.entries.lock();
            if let Some((valid_until, url)) = entries.get(&cache_key) {
                if now < *valid_until {
                    return Ok(url.clone());
                }
                entries.remove(&cache_key);
            }
        }

        let url = self.inner.sign(key, expires)?;
        let lifetime = expires.saturating_sub(CACHE_MARGIN);
        if !lifetime.is_zero() {
            debug!("Caching signed location for {} ({}s)", key, lifetime.as_secs());
            self.entries
                .lock()
                .insert(cache_key, (now + lifetime, url.clone()));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSigner(AtomicUsize);

    impl UrlSigner for CountingSigner {
        fn sign(&self, key: &str, expires: Duration) -> Result<String> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("https://bucket/{}?exp={}&n={}", key, expires.as_secs(), n))
        }
    }

    #[test]
    fn test_local_signer() {
        let signer = LocalPathSigner::new("/srv/media");
        let hour = Duration::from_secs(3600);
        assert_eq!(signer.sign("a/b.mp4", hour).unwrap(), "/srv/media/a/b.mp4");
        assert_eq!(signer.sign("/tmp/x.mp4", hour).unwrap(), "/tmp/x.mp4");
        assert_eq!(
            signer.sign("http://host/x.mp4", hour).unwrap(),
            "http://host/x.mp4"
        );
        assert!(signer.sign("../etc/passwd", hour).is_err());
        assert!(signer.sign("", hour).is_err());
    }

    #[test]
    fn test_cache_reuses_signature() {
        let cache = SignedUrlCache::new(CountingSigner(AtomicUsize::new(0)));
        let hour = Duration::from_secs(3600);
        let first = cache.sign("clip.mp4", hour).unwrap();
        let second = cache.sign("clip.mp4", hour).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);

        // Different lifetime is a different entry
        let other = cache.sign("clip.mp4", Duration::from_secs(7200)).unwrap();
        assert_ne!(first, other);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_short_lived_signature_not_cached() {
        let cache = SignedUrlCache::new(CountingSigner(AtomicUsize::new(0)));
        let short = Duration::from_secs(30);
        let first = cache.sign("clip.mp4", short).unwrap();
        let second = cache.sign("clip.mp4", short).unwrap();
        assert_ne!(first, second);
        assert!(cache.is_empty());
    }
}
