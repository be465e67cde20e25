use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::indexer::checkpoint::Checkpoint;
use crate::models::datasets::payloads::PayloadRecord;
use crate::models::datasets::transactions::TransactionRecord;
use crate::models::errors::PublishError;

fn io_error(path: &Path, source: std::io::Error) -> PublishError {
    PublishError::Io {
        path: path.display().to_string(),
        source,
    }
}

// Write to a sibling temp file, then rename over the target
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PublishError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| io_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error(path, e))
}

/// Which phase produced a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLabel {
    Transactions,
    Logs,
}

impl PageLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageLabel::Transactions => "transactions",
            PageLabel::Logs => "logs",
        }
    }
}

#[derive(Serialize)]
struct RangeArtifact<'a> {
    phase: &'static str,
    from_block: u64,
    to_block: u64,
    events: &'a [TransactionRecord],
    payloads: &'a [PayloadRecord],
}

/// One JSON file per processed page, kept as a local durability aid.
///
/// Files are named `{phase}_blocks_{from}_{to}_{seq}.json`; `seq` is the first number not
/// already taken, so pages with the same span never replace each other.
#[derive(Debug, Clone)]
pub struct LocalArtifacts {
    dir: PathBuf,
}

impl LocalArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, label: PageLabel, (from, to): (u64, u64), seq: u32) -> PathBuf {
        self.dir
            .join(format!("{}_blocks_{}_{}_{:04}.json", label.as_str(), from, to, seq))
    }

    async fn free_path(&self, label: PageLabel, range: (u64, u64)) -> Result<PathBuf, PublishError> {
        let mut seq = 0;
        loop {
            let path = self.path_for(label, range, seq);
            match tokio::fs::try_exists(&path).await {
                Ok(false) => return Ok(path),
                Ok(true) => seq += 1,
                Err(e) => return Err(io_error(&path, e)),
            }
        }
    }

    pub async fn write_range(
        &self,
        label: PageLabel,
        range: (u64, u64),
        events: &[TransactionRecord],
        payloads: &[PayloadRecord],
    ) -> Result<PathBuf, PublishError> {
        let path = self.free_path(label, range).await?;
        let artifact = RangeArtifact {
            phase: label.as_str(),
            from_block: range.0,
            to_block: range.1,
            events,
            payloads,
        };
        let bytes = serde_json::to_vec_pretty(&artifact)?;
        write_atomic(&path, &bytes).await?;
        debug!("Wrote artifact {}", path.display());
        Ok(path)
    }
}

/// Loads and saves the per-chain [`Checkpoint`] file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored checkpoint for `chain_id`, or a fresh one when the file is missing, unreadable,
    /// or belongs to another chain.
    pub async fn load(&self, chain_id: u64) -> Checkpoint {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No checkpoint at {}, starting fresh", self.path.display());
                return Checkpoint::new(chain_id);
            }
            Err(e) => {
                warn!("Failed to read checkpoint {}: {}", self.path.display(), e);
                return Checkpoint::new(chain_id);
            }
        };

        match serde_json::from_slice::<Checkpoint>(&bytes) {
            Ok(checkpoint) if checkpoint.chain_id == chain_id => {
                info!(
                    "Resuming chain {} from checkpoint (high water block {}, {} solvers)",
                    chain_id,
                    checkpoint.high_water_block,
                    checkpoint.solvers.len()
                );
                checkpoint
            }
            Ok(checkpoint) => {
                warn!(
                    "Checkpoint {} belongs to chain {}, not {}; starting fresh",
                    self.path.display(),
                    checkpoint.chain_id,
                    chain_id
                );
                Checkpoint::new(chain_id)
            }
            Err(e) => {
                warn!("Corrupt checkpoint {}: {}; starting fresh", self.path.display(), e);
                Checkpoint::new(chain_id)
            }
        }
    }

    pub async fn save(&self, checkpoint: &mut Checkpoint) -> Result<(), PublishError> {
        checkpoint.touch();
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&self.path, &bytes).await
    }
}
