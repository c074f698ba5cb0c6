//! Checkpoint storage backends

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Checkpoint, CheckpointError, CheckpointResult};

/// Where checkpoints are kept
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint
    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()>;

    /// Most recently saved checkpoint, if any
    async fn latest(&self) -> CheckpointResult<Option<Checkpoint>>;

    /// All checkpoints, oldest first
    async fn list(&self) -> CheckpointResult<Vec<Checkpoint>>;
}

/// One pretty-printed JSON file per checkpoint.
///
/// File names start with a zero-padded timestamp and sequence number so a
/// directory listing sorts oldest first.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    sequence: Mutex<u64>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequence: Mutex::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(&self, checkpoint: &Checkpoint) -> String {
        let mut seq = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        *seq += 1;
        format!(
            "{:013}-{:06}-{}.json",
            checkpoint.created_at.timestamp_millis(),
            *seq,
            checkpoint.id
        )
    }

    async fn checkpoint_paths(&self) -> CheckpointResult<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&self.dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CheckpointError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn read(path: &Path) -> CheckpointResult<Checkpoint> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CheckpointError::io(path, e))?;
        Checkpoint::from_json(&json)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CheckpointError::io(&self.dir, e))?;

        let json = checkpoint.to_json()?;
        let path = self.dir.join(self.file_name(checkpoint));
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| CheckpointError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CheckpointError::io(&path, e))?;

        debug!(path = %path.display(), trigger = %checkpoint.trigger, "Checkpoint written");
        Ok(())
    }

    async fn latest(&self) -> CheckpointResult<Option<Checkpoint>> {
        let paths = self.checkpoint_paths().await?;
        for path in paths.iter().rev() {
            match Self::read(path).await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(None)
    }

    async fn list(&self) -> CheckpointResult<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for path in self.checkpoint_paths().await? {
            match Self::read(&path).await {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(checkpoints)
    }
}

/// In-process store, mainly for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(checkpoint.clone());
        Ok(())
    }

    async fn latest(&self) -> CheckpointResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned())
    }

    async fn list(&self) -> CheckpointResult<Vec<Checkpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunSnapshot;

    fn checkpoint(trigger: &str, version: u64) -> Checkpoint {
        Checkpoint::new(
            trigger,
            RunSnapshot {
                version,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_file_store_save_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));

        assert!(store.latest().await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());

        store.save(&checkpoint("phase.ended", 3)).await.unwrap();
        store.save(&checkpoint("run.ended", 9)).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].trigger, "phase.ended");
        assert_eq!(all[1].trigger, "run.ended");

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.version(), 9);
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        store.save(&checkpoint("manual", 1)).await.unwrap();
        std::fs::write(dir.path().join("9999999999999-999999-broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.trigger, "manual");
    }

    #[tokio::test]
    async fn test_file_store_save_fails_on_unwritable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, "a file, not a directory").unwrap();

        let store = FileCheckpointStore::new(&blocker);
        let err = store.save(&checkpoint("manual", 1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        assert!(store.is_empty());

        store.save(&checkpoint("manual", 1)).await.unwrap();
        store.save(&checkpoint("run.ended", 2)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.latest().await.unwrap().unwrap().version(), 2);
        assert_eq!(store.list().await.unwrap()[0].trigger, "manual");
    }
}
