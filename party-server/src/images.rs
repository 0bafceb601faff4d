//! Image asset plumbing: the placeholder pool the dispatcher falls back to
//! when every upstream has failed, and the loading of depth-conditioning
//! initial images from the assets directory.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// A 1x1 PNG used when the placeholder directory is empty, so the fallback
/// pool is never empty.
const EMBEDDED_PLACEHOLDER: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

/// Loads every file below `dir` as a base64 payload. Errors only degrade the
/// pool; a completely unreadable directory leaves us with the embedded
/// fallback image.
pub async fn load_placeholder_pool(dir: &Path) -> Vec<String> {
    let mut pool = Vec::new();
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => match tokio::fs::read(entry.path()).await {
                    Ok(bytes) => pool.push(BASE64.encode(bytes)),
                    Err(error) => {
                        tracing::warn!(?error, path = %entry.path().display(), "Skipping unreadable placeholder.");
                    }
                },
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(?error, "Stopped scanning placeholder directory.");
                    break;
                }
            }
        },
        Err(error) => {
            tracing::warn!(?error, dir = %dir.display(), "No placeholder directory.");
        }
    }
    if pool.is_empty() {
        pool.push(EMBEDDED_PLACEHOLDER.to_string());
    }
    tracing::info!(count = pool.len(), "Placeholder pool ready.");
    pool
}

/// Loads and caches asset files as base64, used for the initial images of
/// depth-conditioned requests. The cache never invalidates; assets are
/// immutable for the lifetime of the process.
pub struct AssetCache {
    root: PathBuf,
    cached: tokio::sync::Mutex<HashMap<String, String>>,
}

impl AssetCache {
    pub fn new(root: PathBuf) -> Self {
        AssetCache {
            root,
            cached: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the base64 payload of an asset, loading it on first use.
    /// Paths are interpreted relative to the assets root; an absolute or
    /// escaping path is refused.
    pub async fn load(&self, relative: &str) -> io::Result<String> {
        if Path::new(relative).is_absolute() || relative.split('/').any(|part| part == "..") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("illegal asset path {relative}"),
            ));
        }
        let mut cached = self.cached.lock().await;
        if let Some(found) = cached.get(relative) {
            return Ok(found.clone());
        }
        let bytes = tokio::fs::read(self.root.join(relative)).await?;
        let encoded = BASE64.encode(bytes);
        cached.insert(relative.to_string(), encoded.clone());
        Ok(encoded)
    }
}
