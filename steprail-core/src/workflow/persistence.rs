//! Pipeline snapshot persistence using JSON file storage

use crate::models::workflow::PipelineSnapshot;
use crate::services::logging::log_error;
use crate::workflow::pipeline::StepCompletion;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One saved checkpoint of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredSnapshot {
    /// Caller-chosen run identifier
    pub run_id: String,
    /// Pipeline name or manifest the run came from
    #[serde(default)]
    pub label: String,
    pub saved_at: DateTime<Utc>,
    pub snapshot: PipelineSnapshot,
}

impl StoredSnapshot {
    pub fn status(&self) -> &str {
        self.snapshot.status()
    }
}

/// Root JSON document
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SnapshotFile {
    snapshots: Vec<StoredSnapshot>,
}

/// Latest snapshot per run, kept in a single JSON file
pub struct SnapshotStore {
    store_path: PathBuf,
    store: Arc<Mutex<SnapshotFile>>,
}

impl SnapshotStore {
    /// Open the store at `store_path`, creating its directory if needed
    pub fn new<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create snapshot store directory")?;
        }

        let store = if store_path.exists() {
            Self::load_store(&store_path)?
        } else {
            SnapshotFile::default()
        };

        Ok(Self {
            store_path,
            store: Arc::new(Mutex::new(store)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.store_path
    }

    fn lock(&self) -> MutexGuard<'_, SnapshotFile> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load JSON store from file with file locking
    fn load_store(path: &Path) -> Result<SnapshotFile> {
        let file = File::open(path).context("Failed to open snapshot store file")?;

        file.lock_shared()
            .context("Failed to acquire read lock on snapshot store")?;

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(file);
        reader
            .read_to_string(&mut contents)
            .context("Failed to read snapshot store")?;
        drop(reader);

        if contents.trim().is_empty() {
            return Ok(SnapshotFile::default());
        }

        serde_json::from_str(&contents).context("Failed to parse snapshot store JSON")
    }

    /// Save JSON store to file with file locking
    fn save_store(&self, store: &SnapshotFile) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.store_path)
            .context("Failed to open snapshot store file for writing")?;

        file.lock_exclusive()
            .context("Failed to acquire write lock on snapshot store")?;

        let json = serde_json::to_string_pretty(store).context("Failed to serialize snapshot store")?;

        let mut writer = std::io::BufWriter::new(file);
        writer
            .write_all(json.as_bytes())
            .context("Failed to write snapshot store")?;
        writer
            .flush()
            .context("Failed to flush snapshot store to disk")?;

        Ok(())
    }

    /// Insert or replace the snapshot for `run_id`
    pub fn save(&self, run_id: &str, label: &str, snapshot: &PipelineSnapshot) -> Result<()> {
        let mut store = self.lock();
        let entry = StoredSnapshot {
            run_id: run_id.to_string(),
            label: label.to_string(),
            saved_at: Utc::now(),
            snapshot: snapshot.clone(),
        };

        match store.snapshots.iter().position(|s| s.run_id == run_id) {
            Some(index) => store.snapshots[index] = entry,
            None => store.snapshots.push(entry),
        }

        self.save_store(&store)?;
        tracing::debug!(
            run_id,
            status = snapshot.status(),
            index = snapshot.current_step_index,
            "Snapshot saved"
        );
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Option<StoredSnapshot> {
        self.lock()
            .snapshots
            .iter()
            .find(|s| s.run_id == run_id)
            .cloned()
    }

    /// Every stored run, most recently saved first
    pub fn list(&self) -> Vec<StoredSnapshot> {
        let mut snapshots = self.lock().snapshots.clone();
        snapshots.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        snapshots
    }

    /// Delete the snapshot for `run_id`; false when there was none
    pub fn remove(&self, run_id: &str) -> Result<bool> {
        let mut store = self.lock();
        let before = store.snapshots.len();
        store.snapshots.retain(|s| s.run_id != run_id);
        if store.snapshots.len() == before {
            return Ok(false);
        }
        self.save_store(&store)?;
        Ok(true)
    }

    /// Hook for `Pipeline::on_step_complete` that checkpoints every finished step
    ///
    /// Write failures are logged, not propagated; a missed checkpoint only
    /// means a resume repeats more work.
    pub fn checkpoint_hook(
        self: &Arc<Self>,
        run_id: impl Into<String>,
        label: impl Into<String>,
    ) -> impl Fn(&StepCompletion) + Send + Sync + 'static {
        let store = Arc::clone(self);
        let run_id = run_id.into();
        let label = label.into();

        move |completion: &StepCompletion| {
            if let Err(e) = store.save(&run_id, &label, &completion.snapshot) {
                log_error(
                    &format!("{:#}", e),
                    Some(&format!("checkpoint after step '{}'", completion.step_name)),
                );
            }
        }
    }
}
