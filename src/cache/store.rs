//! Filesystem-backed cache storage.
//!
//! Raw entries live directly under the cache root (nested when the key holds
//! `/`), JSON entries share the root with a `-JSON` filename suffix, and
//! append-only logs are plain files next to them. Freshness of raw entries is
//! derived from the file's modification time.

use std::{
    io,
    path::{Component, Path, PathBuf},
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use super::error::CacheError;

const JSON_SUFFIX: &str = "-JSON";
const DEFAULT_JSON_TTL_SECS: i64 = 10;
#[cfg(unix)]
const ENTRY_MODE: u32 = 0o774;

#[derive(Serialize, Deserialize)]
struct JsonEnvelope<T> {
    expires: i64,
    json: T,
}

/// Key/value persistence rooted at a single directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the cache root if needed and returns it.
    pub async fn ensure_root(&self) -> Result<PathBuf, CacheError> {
        create_dir_tolerant(&self.root).await?;
        Ok(self.root.clone())
    }

    /// Stores `content` under `key` after collapsing whitespace runs.
    pub async fn set(&self, key: &str, content: &[u8]) -> Result<(), CacheError> {
        let path = self.prepare(key).await?;
        write_entry(&path, &collapse_whitespace(content)).await
    }

    /// Returns the entry when it exists and is younger than `max_age`.
    pub async fn get(&self, key: &str, max_age: Duration) -> Option<Bytes> {
        let path = self.readable_path(key).await?;

        let metadata = fs::metadata(&path).await.ok()?;
        if !metadata.is_file() {
            return None;
        }

        let age = match metadata.modified() {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
            Err(err) => {
                debug!(key, error = %err, "modification time unavailable, treating entry as stale");
                return None;
            }
        };
        if age >= max_age {
            debug!(key, age_secs = age.as_secs(), "cache entry expired");
            return None;
        }

        match fs::read(&path).await {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(err) => {
                debug!(key, error = %err, "failed to read cache entry");
                None
            }
        }
    }

    /// Appends a line to the log stored under `key`.
    ///
    /// Failures are logged and swallowed.
    pub async fn append(&self, key: &str, line: &str) {
        if let Err(err) = self.try_append(key, line).await {
            warn!(key, error = %err, kind = err.kind(), "failed to append to cache log");
        }
    }

    async fn try_append(&self, key: &str, line: &str) -> Result<(), CacheError> {
        let path = self.prepare(key).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| CacheError::write_failed(&path, err))?;
        let record = format!("\n{line}");
        file.write_all(record.as_bytes())
            .await
            .map_err(|err| CacheError::write_failed(&path, err))?;
        file.flush()
            .await
            .map_err(|err| CacheError::write_failed(&path, err))
    }

    /// Stores a JSON value that expires at `expires_at`, or ten seconds from now.
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<(), CacheError> {
        let expires = expires_at
            .map(OffsetDateTime::unix_timestamp)
            .unwrap_or_else(|| now_unix() + DEFAULT_JSON_TTL_SECS);
        let encoded = serde_json::to_vec(&JsonEnvelope {
            expires,
            json: value,
        })
        .map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;

        let path = self.prepare(&json_key(key)).await?;
        write_entry(&path, &encoded).await
    }

    /// Returns the JSON value stored under `key` while it has not expired.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.readable_path(&json_key(key)).await?;
        let raw = fs::read(&path).await.ok()?;

        let envelope: JsonEnvelope<T> = match serde_json::from_slice(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(key, error = %err, "malformed JSON cache entry, treating as absent");
                return None;
            }
        };

        (now_unix() < envelope.expires).then_some(envelope.json)
    }

    /// Deletes every entry under the cache root and returns how many were removed.
    pub async fn release(&self) -> Result<usize, CacheError> {
        let root = self.ensure_root().await?;
        let mut entries = fs::read_dir(&root)
            .await
            .map_err(|err| CacheError::storage_unavailable(&root, err))?;

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => return Err(CacheError::storage_unavailable(&root, err)),
            };
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            let result = if is_dir {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(CacheError::PurgeFailed { path, source: err });
                }
            }
        }

        debug!(root = %root.display(), removed, "cache released");
        Ok(removed)
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty() {
            return Err(CacheError::invalid_key(key, "key must not be empty"));
        }
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(CacheError::invalid_key(
                key,
                "key must be a relative path without `.` or `..` segments",
            ));
        }
        Ok(self.root.join(relative))
    }

    /// Resolves a key for writing, creating the root and the parent directory.
    async fn prepare(&self, key: &str) -> Result<PathBuf, CacheError> {
        let root = self.ensure_root().await?;
        let path = self.entry_path(key)?;
        if let Some(parent) = path.parent().filter(|parent| *parent != root.as_path()) {
            create_dir_tolerant(parent).await?;
        }
        Ok(path)
    }

    async fn readable_path(&self, key: &str) -> Option<PathBuf> {
        if let Err(err) = self.ensure_root().await {
            warn!(key, error = %err, "cache root unavailable, treating entry as absent");
            return None;
        }
        match self.entry_path(key) {
            Ok(path) => Some(path),
            Err(err) => {
                debug!(key, error = %err, "rejecting cache key");
                None
            }
        }
    }
}

/// Collapses every run of two or more ASCII whitespace bytes into one space.
///
/// Operates on bytes so non-UTF-8 payloads pass through; whitespace bytes never
/// occur inside multi-byte UTF-8 sequences.
pub fn collapse_whitespace(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len());
    let mut index = 0;
    while index < content.len() {
        let byte = content[index];
        if !is_space(byte) {
            out.push(byte);
            index += 1;
            continue;
        }

        let run_end = content[index..]
            .iter()
            .position(|b| !is_space(*b))
            .map_or(content.len(), |offset| index + offset);
        if run_end - index >= 2 {
            out.push(b' ');
        } else {
            out.push(byte);
        }
        index = run_end;
    }
    out
}

fn is_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

fn json_key(key: &str) -> String {
    format!("{key}{JSON_SUFFIX}")
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

async fn create_dir_tolerant(dir: &Path) -> Result<(), CacheError> {
    match fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let exists = fs::metadata(dir)
                .await
                .map(|metadata| metadata.is_dir())
                .unwrap_or(false);
            if exists {
                Ok(())
            } else {
                Err(CacheError::storage_unavailable(dir, err))
            }
        }
    }
}

async fn write_entry(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    fs::write(path, bytes)
        .await
        .map_err(|err| CacheError::write_failed(path, err))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if let Err(err) =
            fs::set_permissions(path, std::fs::Permissions::from_mode(ENTRY_MODE)).await
        {
            debug!(path = %path.display(), error = %err, "failed to set cache entry permissions");
        }
    }

    Ok(())
}
