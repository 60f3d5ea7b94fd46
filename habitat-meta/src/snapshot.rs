use crate::error::{HdbError, Result};
use crate::log_store::{create_private_dir, write_private_file};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub term: u64,
    pub index: u64,
    pub created_at: DateTime<Utc>,
}

impl SnapshotMeta {
    fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.snap",
            self.term,
            self.index,
            self.created_at.timestamp_millis()
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    meta: SnapshotMeta,
    state: String,
}

/// Point-in-time dumps of a database's canonical state.
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>, retain: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_private_dir(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    pub fn create(&self, meta: SnapshotMeta, state: &[u8]) -> Result<PathBuf> {
        let state = String::from_utf8(state.to_vec())
            .map_err(|error| HdbError::Serialization(format!("state is not UTF-8: {}", error)))?;
        let path = self.dir.join(meta.file_name());
        let contents = serde_json::to_vec(&SnapshotFile { meta, state })?;
        write_private_file(&path, &contents)?;
        self.prune()?;
        Ok(path)
    }

    /// Snapshot files, newest first
    pub fn list(&self) -> Result<Vec<(SnapshotMeta, PathBuf)>> {
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("snap") {
                continue;
            }
            let Some(meta) = parse_file_name(&path) else {
                tracing::warn!("Ignoring unrecognised snapshot file {}", path.display());
                continue;
            };
            snapshots.push((meta, path));
        }

        snapshots.sort_by(|(a, _), (b, _)| {
            (b.index, b.term, b.created_at).cmp(&(a.index, a.term, a.created_at))
        });
        Ok(snapshots)
    }

    /// The newest snapshot that can be read back. Unreadable files are skipped.
    pub fn latest(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>> {
        for (_, path) in self.list()? {
            match read_snapshot(&path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(error) => {
                    tracing::warn!("Skipping unreadable snapshot {}: {}", path.display(), error);
                }
            }
        }
        Ok(None)
    }

    fn prune(&self) -> Result<()> {
        for (meta, path) in self.list()?.into_iter().skip(self.retain) {
            tracing::debug!("Removing snapshot {} at index {}", path.display(), meta.index);
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn parse_file_name(path: &Path) -> Option<SnapshotMeta> {
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.splitn(3, '-');
    let term = parts.next()?.parse().ok()?;
    let index = parts.next()?.parse().ok()?;
    let millis = parts.next()?.parse().ok()?;
    let created_at = DateTime::from_timestamp_millis(millis)?;
    Some(SnapshotMeta {
        term,
        index,
        created_at,
    })
}

fn read_snapshot(path: &Path) -> Result<(SnapshotMeta, Vec<u8>)> {
    let contents = std::fs::read(path)?;
    let file: SnapshotFile = serde_json::from_slice(&contents)?;
    Ok((file.meta, file.state.into_bytes()))
}
