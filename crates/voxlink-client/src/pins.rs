use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::data_dir;
use crate::trust::{CertDigest, MemoryPinStore, PinStore};

#[derive(Debug, Error)]
pub enum PinStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed pin file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Pinned certificate digests persisted as `pins.json`:
/// `{ "host:port": "<sha1 hex>", ... }`.
///
/// The session only ever reads pins. Adding one is the caller's decision.
#[derive(Debug)]
pub struct FilePinStore {
    path: PathBuf,
    pins: MemoryPinStore,
}

impl FilePinStore {
    /// `pins.json` in the voxlink data directory.
    pub fn default_path() -> Option<PathBuf> {
        data_dir().map(|d| d.join("pins.json"))
    }

    /// Load pins from `path`. A missing file is an empty store; unparsable
    /// entries are skipped.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PinStoreError> {
        let path = path.into();
        let pins = MemoryPinStore::default();

        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self { path, pins });
            }
            Err(source) => return Err(PinStoreError::Io { path, source }),
        };

        let map: BTreeMap<String, String> = match serde_json::from_str(&data) {
            Ok(map) => map,
            Err(source) => return Err(PinStoreError::Json { path, source }),
        };

        for (key, value) in map {
            let Some((host, port)) = parse_key(&key) else {
                warn!(entry = %key, "ignoring pin with malformed host:port key");
                continue;
            };
            match value.parse::<CertDigest>() {
                Ok(digest) => pins.insert(host, port, digest),
                Err(e) => warn!(entry = %key, "ignoring pin with bad digest: {}", e),
            }
        }

        Ok(Self { path, pins })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `digest` for `(host, port)` and write the file back atomically.
    pub fn pin(&self, host: &str, port: u16, digest: CertDigest) -> Result<(), PinStoreError> {
        self.pins.insert(host, port, digest);
        self.save()?;
        info!(host, port, %digest, "pinned server certificate");
        Ok(())
    }

    fn save(&self) -> Result<(), PinStoreError> {
        let map: BTreeMap<String, String> = self
            .pins
            .entries()
            .into_iter()
            .map(|((host, port), digest)| (format!("{host}:{port}"), digest.to_hex()))
            .collect();
        let json = serde_json::to_string_pretty(&map).map_err(|source| PinStoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        let io_err = |source: std::io::Error| PinStoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(io_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl PinStore for FilePinStore {
    fn lookup_pinned_digest(&self, host: &str, port: u16) -> Option<CertDigest> {
        self.pins.lookup_pinned_digest(host, port)
    }
}

fn parse_key(key: &str) -> Option<(&str, u16)> {
    let (host, port) = key.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}
