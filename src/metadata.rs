use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A cached object's metadata: everything needed to replay a response
/// without re-fetching the origin, plus the bookkeeping fields the cache
/// engine's maintenance operations need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    /// Cache key: `<host>/<bucket-relative path>`.
    pub filename: String,
    pub size: i64,
    pub mod_time: i64,
    pub status_code: u16,
    pub header: BTreeMap<String, Vec<String>>,
    pub created_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata store busy: {0}")]
    Busy(String),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("metadata serialization error: {0}")]
    Serialize(#[from] bincode::Error),
}

/// Embedded key-value store backing `FileMeta` lookups. Wraps three
/// logical views over a single `sled::Db`:
///
/// - `files`: `Filename -> FileMeta`, the primary lookup table.
/// - `by_created_at`: `CreatedAt(big-endian) ++ Filename -> Filename`, an
///   ascending index used to walk entries oldest-first for `shrinkTo`.
/// - `files.scan_prefix`: sled's native ordered-key prefix scan, used
///   directly for `purgePrefix` with no separate index needed.
pub struct MetadataStore {
    db: sled::Db,
    files: sled::Tree,
    by_created_at: sled::Tree,
}

impl MetadataStore {
    /// Opens the store, retrying for up to 10 seconds if another process
    /// holds the exclusive file lock sled takes on its directory.
    pub async fn open(path: &Path) -> Result<Self, MetadataError> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut last_err = None;

        loop {
            match sled::open(path) {
                Ok(db) => {
                    let files = db.open_tree("files")?;
                    let by_created_at = db.open_tree("by_created_at")?;
                    return Ok(Self {
                        db,
                        files,
                        by_created_at,
                    });
                }
                Err(e) => {
                    last_err = Some(e);
                    if Instant::now() >= deadline {
                        break;
                    }
                    warn!("metadata store locked, retrying");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }

        Err(MetadataError::Busy(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    pub fn get(&self, filename: &str) -> Result<Option<FileMeta>, MetadataError> {
        match self.files.get(filename)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, meta: &FileMeta) -> Result<(), MetadataError> {
        let bytes = bincode::serialize(meta)?;
        self.files.insert(meta.filename.as_str(), bytes)?;
        self.by_created_at
            .insert(created_at_index_key(meta.created_at, &meta.filename), meta.filename.as_str())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn delete(&self, filename: &str) -> Result<Option<FileMeta>, MetadataError> {
        let removed = self.files.remove(filename)?;
        let meta = match removed {
            Some(bytes) => Some(bincode::deserialize::<FileMeta>(&bytes)?),
            None => None,
        };
        if let Some(meta) = &meta {
            self.by_created_at
                .remove(created_at_index_key(meta.created_at, &meta.filename))?;
        }
        self.db.flush()?;
        Ok(meta)
    }

    /// All entries under `prefix`, via sled's native ordered-key prefix
    /// scan (no secondary index required).
    pub fn find_by_filename_prefix(&self, prefix: &str) -> Result<Vec<FileMeta>, MetadataError> {
        let mut out = Vec::new();
        for entry in self.files.scan_prefix(prefix) {
            let (_, bytes) = entry?;
            out.push(bincode::deserialize(&bytes)?);
        }
        Ok(out)
    }

    /// All entries ordered ascending by `created_at`, oldest first. Stale
    /// index entries (whose primary row was deleted separately) are
    /// skipped rather than surfaced as errors.
    pub fn iter_by_created_at_asc(&self) -> Result<Vec<FileMeta>, MetadataError> {
        let mut out = Vec::new();
        for entry in self.by_created_at.iter() {
            let (_, filename_bytes) = entry?;
            let filename = String::from_utf8_lossy(&filename_bytes).into_owned();
            if let Some(meta) = self.get(&filename)? {
                out.push(meta);
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn flush(&self) -> Result<(), MetadataError> {
        self.db.flush()?;
        info!("metadata store flushed");
        Ok(())
    }
}

fn created_at_index_key(created_at: i64, filename: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + filename.len());
    key.extend_from_slice(&created_at.to_be_bytes());
    key.extend_from_slice(filename.as_bytes());
    key
}
