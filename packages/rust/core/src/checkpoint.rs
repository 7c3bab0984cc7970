//! Durable run state: `<output_dir>/checkpoint.json`.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use councilgen_shared::{CURRENT_SCHEMA_VERSION, Checkpoint, CouncilgenError, Result};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Write `bytes` to `path` via a sibling temp file and a rename, so readers
/// see either the old or the new content.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let persist_err = |e: std::io::Error| CouncilgenError::persistence(path, e.to_string());

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await.map_err(persist_err)?;
    file.write_all(bytes).await.map_err(persist_err)?;
    // Content must be on disk before the rename makes it visible.
    file.sync_all().await.map_err(persist_err)?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(persist_err)?;
    Ok(())
}

/// Single writer for the checkpoint file.
pub struct CheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(CHECKPOINT_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, or an empty one if none exists yet.
    pub async fn load(&self) -> Result<Checkpoint> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint, starting fresh");
                return Ok(Checkpoint::default());
            }
            Err(e) => return Err(CouncilgenError::io(&self.path, e)),
        };

        let checkpoint: Checkpoint = serde_json::from_str(&raw).map_err(|e| {
            CouncilgenError::parse(format!("{}: {e}", self.path.display()))
        })?;

        if checkpoint.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(CouncilgenError::validation(format!(
                "checkpoint schema_version {} is newer than supported {}",
                checkpoint.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }
        if !checkpoint.is_consistent() {
            return Err(CouncilgenError::validation(format!(
                "{}: an entity is both completed and failed",
                self.path.display()
            )));
        }
        Ok(checkpoint)
    }

    /// Replace the on-disk checkpoint.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| CouncilgenError::persistence(&self.path, e.to_string()))?;
        write_atomic(&self.path, &bytes).await?;
        debug!(
            completed = checkpoint.completed.len(),
            failed = checkpoint.failed.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Delete the checkpoint. Returns whether one existed.
    pub async fn reset(&self) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "checkpoint reset");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CouncilgenError::persistence(&self.path, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use councilgen_shared::GenerationResult;
    use std::time::Duration;
    use uuid::Uuid;

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("cg_ckpt_{}", Uuid::now_v7()))
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let store = CheckpointStore::new(&scratch());
        let ckpt = store.load().await.unwrap();
        assert!(ckpt.completed.is_empty());
        assert_eq!(ckpt.next_batch_index(), 0);
    }

    #[tokio::test]
    async fn save_then_load_and_reset() {
        let dir = scratch();
        let store = CheckpointStore::new(&dir);
        let ckpt = Checkpoint::default().with_batch(
            0,
            &[
                GenerationResult::success("a", 0.01, 200, Duration::from_secs(2)),
                GenerationResult::failed("b", "fetch returned HTTP 503", 0.0, Duration::from_secs(1)),
            ],
        );
        store.save(&ckpt).await.unwrap();
        assert!(!dir.join("checkpoint.json.tmp").exists());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, ckpt);

        assert!(store.reset().await.unwrap());
        assert!(!store.reset().await.unwrap());
        assert!(store.load().await.unwrap().completed.is_empty());
    }

    #[tokio::test]
    async fn unknown_fields_are_ignored() {
        let dir = scratch();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(CHECKPOINT_FILE),
            r#"{"completed":["a"],"failed":[],"total_cost":1.5,"last_batch_index":3,"operator":"ci"}"#,
        )
        .unwrap();

        let ckpt = CheckpointStore::new(&dir).load().await.unwrap();
        assert!(ckpt.is_completed("a"));
        assert_eq!(ckpt.next_batch_index(), 4);
        assert_eq!(ckpt.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn rejects_inconsistent_or_future_checkpoints() {
        let dir = scratch();
        std::fs::create_dir_all(&dir).unwrap();
        let store = CheckpointStore::new(&dir);

        std::fs::write(store.path(), r#"{"completed":["a"],"failed":["a"]}"#).unwrap();
        assert!(store.load().await.is_err());

        std::fs::write(store.path(), r#"{"schema_version":99}"#).unwrap();
        assert!(store.load().await.is_err());

        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load().await, Err(CouncilgenError::Parse { .. })));
    }

    #[tokio::test]
    async fn atomic_write_replaces_content_and_leaves_no_temp_file() {
        let dir = scratch();
        let path = dir.join("nested").join("state.json");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.join("nested").join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn unwritable_location_is_persistence_error() {
        let file = scratch();
        std::fs::write(&file, "not a directory").unwrap();
        let store = CheckpointStore::new(&file);
        let err = store.save(&Checkpoint::default()).await.unwrap_err();
        assert!(matches!(err, CouncilgenError::Persistence { .. }));
    }
}
