//! Persistent on-disk memo cache.
//!
//! Entries live one per file under a directory, named by the SHA-256 hex
//! digest of their key. An entry older than the configured expiration is a
//! miss and is removed on lookup.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;

use crate::types::Result;

/// Directory-backed key/value cache with age-based expiry.
#[derive(Debug, Clone)]
pub struct PersistentCache {
    dir: PathBuf,
    expiration: Duration,
}

impl PersistentCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>, expiration: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir, expiration })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Hash a key into the file name it is stored under.
    pub fn hash_key(key: &str) -> String {
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(Self::hash_key(key))
    }

    /// Look up `key`. Expired or unreadable entries are misses.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let path = self.path_for(key);
        let metadata = fs::metadata(&path).await.ok()?;
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();
        if age > self.expiration {
            if let Err(err) = fs::remove_file(&path).await {
                tracing::debug!("cache_evict_failed: path={}, error={}", path.display(), err);
            }
            return None;
        }
        fs::read(&path).await.ok().map(Bytes::from)
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, value).await?;
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}
