//! Persisted reservation snapshot.
//!
//! The scheduler recomputes the whole reservation set on every pass, so the
//! snapshot is always a whole-state replace: serialize to a sibling temp
//! file, then rename over the previous snapshot. Callers hold the
//! scheduler's pass lock, so there is never more than one writer.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use thiserror::Error;

use super::Reservation;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Whole-state reservation snapshot on disk.
#[derive(Debug)]
pub struct ReserveStore {
    path: PathBuf,
}

impl ReserveStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load the snapshot. A missing file is an empty set (first start);
    /// a corrupt file is logged and treated the same, since the next pass
    /// rebuilds everything except manual reservations anyway.
    pub fn load(&self) -> Result<Vec<Reservation>, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&raw) {
            Ok(reservations) => Ok(reservations),
            Err(e) => {
                warn!(
                    "Reservation snapshot {} is corrupt, starting empty: {}",
                    self.path.display(),
                    e
                );
                Ok(Vec::new())
            }
        }
    }

    /// Atomically replace the snapshot.
    pub fn save(&self, reservations: &[Reservation]) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(reservations)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
