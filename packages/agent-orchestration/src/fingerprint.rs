//! File fingerprints with BLAKE3 content hashing

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Observed state of a file: metadata plus authoritative content hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: String,
    /// Modification time, fractional seconds since the Unix epoch
    pub mtime: f64,
    pub size: u64,
    /// Hex BLAKE3 digest of the content
    pub content_hash: String,
}

/// Cheap metadata check (no content read)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileStat {
    pub mtime: f64,
    pub size: u64,
}

impl FileStat {
    pub fn of(path: impl AsRef<Path>) -> io::Result<Self> {
        let metadata = path.as_ref().metadata()?;
        Ok(Self {
            mtime: system_time_to_epoch(metadata.modified()?),
            size: metadata.len(),
        })
    }
}

impl FileFingerprint {
    /// Stat and hash `path`
    pub fn compute(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let stat = FileStat::of(path)?;
        let content_hash = hash_file(path)?;
        Ok(Self {
            path: path.to_string_lossy().into_owned(),
            mtime: stat.mtime,
            size: stat.size,
            content_hash,
        })
    }
}

/// Hash file content in chunks
pub fn hash_file(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = blake3::Hasher::new();

    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

pub fn hash_bytes(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

pub(crate) fn system_time_to_epoch(t: SystemTime) -> f64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        // Pre-epoch mtimes are legal on some filesystems
        Err(e) => -e.duration().as_secs_f64(),
    }
}
