//! Filesystem-backed store for conditional GETs.
//!
//! Entries are keyed by request URL and hold the last `ETag` together with
//! the response body, so a revalidated `304 Not Modified` can re-serve the
//! body without re-downloading it (and without spending rate limit). Only
//! responses from the configured API hosts are stored; everything else is
//! do-not-cache.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CachedResponse {
    pub etag: String,
    pub body: String,
}

#[derive(Clone, Debug)]
pub struct HttpCache {
    dir: PathBuf,
    hosts: Vec<String>,
}

impl HttpCache {
    pub fn new(dir: PathBuf, hosts: Vec<String>) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, hosts })
    }

    fn cacheable(&self, url: &str) -> bool {
        let host = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .map(|rest| rest.split(['/', '?']).next().unwrap_or(""))
            .unwrap_or("");
        self.hosts.iter().any(|allowed| allowed == host)
    }

    fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.json", blake3::hash(url.as_bytes()).to_hex()))
    }

    pub fn load(&self, url: &str) -> Option<CachedResponse> {
        if !self.cacheable(url) {
            return None;
        }
        let path = self.path_for(url);
        let raw = fs::read(&path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "dropping corrupt cache entry");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    pub fn store(&self, url: &str, etag: &str, body: &str) {
        if !self.cacheable(url) {
            return;
        }
        let entry = CachedResponse {
            etag: etag.to_string(),
            body: body.to_string(),
        };
        let path = self.path_for(url);
        // Cache writes are best-effort; a failed write only costs a refetch.
        match serde_json::to_vec(&entry) {
            Ok(raw) => {
                if let Err(e) = fs::write(&path, raw) {
                    debug!(path = %path.display(), error = %e, "failed to write cache entry");
                }
            }
            Err(e) => debug!(error = %e, "failed to encode cache entry"),
        }
    }
}
