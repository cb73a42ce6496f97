//! Per-run storage directory
//!
//! Layout under `<runs_dir>/<run_id>/`:
//! - `metadata.json` — run record, rewritten atomically on every transition
//! - `logs.jsonl` — captured container output (created even when empty)
//! - `network.jsonl` — one record per intercepted request
//! - `secrets.jsonl` — which grants were bound (names only)
//! - `audit.db` — tamper-resistant audit trail
//! - `dockerfile` — the generated build recipe, when an image was built
//! - `ca/`, `staging/`, `snapshots/` — mounted CA dir, provider staging,
//!   workspace snapshots

use crate::run::RunRecord;
use crate::{CoreError, Result};
use moat_runtime::LogEntry;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write a file atomically: temp file in the same directory, then rename
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Handle to one run's storage directory
#[derive(Debug, Clone)]
pub struct RunStorage {
    dir: PathBuf,
}

impl RunStorage {
    /// Create the directory tree for a new run
    pub fn create(runs_root: &Path, run_id: &str) -> Result<Self> {
        let dir = runs_root.join(run_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(dir.join("snapshots"))?;
        Ok(Self { dir })
    }

    /// Open an existing run directory
    pub fn open(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join("metadata.json")
    }

    pub fn logs_path(&self) -> PathBuf {
        self.dir.join("logs.jsonl")
    }

    pub fn network_log_path(&self) -> PathBuf {
        self.dir.join("network.jsonl")
    }

    pub fn secrets_log_path(&self) -> PathBuf {
        self.dir.join("secrets.jsonl")
    }

    pub fn audit_db_path(&self) -> PathBuf {
        self.dir.join("audit.db")
    }

    pub fn dockerfile_path(&self) -> PathBuf {
        self.dir.join("dockerfile")
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.dir.join("ca")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join("staging")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.dir.join("snapshots")
    }

    /// Persist the run record atomically
    pub fn save_metadata(&self, record: &RunRecord) -> Result<()> {
        let content = serde_json::to_vec_pretty(record)?;
        atomic_write(&self.metadata_path(), &content)
            .map_err(|e| CoreError::PersistenceFailed(e.to_string()))
    }

    /// Load the run record from a run directory
    pub fn load_metadata(dir: &Path) -> Result<RunRecord> {
        let content = std::fs::read_to_string(dir.join("metadata.json"))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write captured logs. The file is created even when `entries` is empty.
    pub fn write_logs(&self, entries: &[LogEntry]) -> Result<()> {
        let mut out = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut out, entry)?;
            out.push(b'\n');
        }
        atomic_write(&self.logs_path(), &out)
            .map_err(|e| CoreError::PersistenceFailed(e.to_string()))
    }

    /// Read captured logs back, skipping unparseable lines
    pub fn read_logs(&self) -> Result<Vec<LogEntry>> {
        let path = self.logs_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Append one JSON object to a JSONL file
    pub fn append_jsonl(&self, path: &Path, value: &serde_json::Value) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        serde_json::to_writer(&mut file, value)?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// All run directories under a root, in no particular order
    pub fn list_runs(runs_root: &Path) -> Result<Vec<PathBuf>> {
        if !runs_root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(runs_root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.path().join("metadata.json").exists() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Remove the whole run directory
    pub fn remove(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}
