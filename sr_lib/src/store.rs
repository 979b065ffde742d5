//! Last recorded lifecycle status of every run.
use anyhow::{bail, Context, Result};
use chrono::Local;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sr_types::RunStatus;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct StatusRecord {
    pub status: RunStatus,
    pub updated: String,
}

impl StatusRecord {
    fn now(status: RunStatus) -> StatusRecord {
        StatusRecord {
            status,
            updated: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }
}

/// External store of run statuses, keyed by run id.
pub trait StatusStore {
    /// Add a run. Fails if the run is already known.
    fn create(&mut self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Replace the status of a known run.
    fn update(&mut self, run_id: &str, status: RunStatus) -> Result<()>;

    fn get(&self, run_id: &str) -> Result<Option<StatusRecord>>;
}

/// Record `status` for `run_id` if it differs from the stored one. A status
/// preceding the stored one is refused with a warning. Returns true if the
/// store was written.
pub fn record_status(store: &mut dyn StatusStore, run_id: &str, status: RunStatus) -> Result<bool> {
    match store.get(run_id)? {
        None => store.create(run_id, status)?,
        Some(record) if record.status == status => return Ok(false),
        Some(record) if record.status > status => {
            warn!(
                "{run_id}: not recording {status}, the run is already {}",
                record.status
            );
            return Ok(false);
        }
        Some(_) => store.update(run_id, status)?,
    }
    info!("{run_id}: status is now {status}");
    Ok(true)
}

#[derive(Default, Debug)]
pub struct MemoryStatusStore {
    records: BTreeMap<String, StatusRecord>,
}

impl StatusStore for MemoryStatusStore {
    fn create(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        if self.records.contains_key(run_id) {
            bail!("Run {run_id} is already in the status store");
        }
        self.records
            .insert(run_id.to_string(), StatusRecord::now(status));
        Ok(())
    }

    fn update(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        let Some(record) = self.records.get_mut(run_id) else {
            bail!("Run {run_id} is not in the status store");
        };
        *record = StatusRecord::now(status);
        Ok(())
    }

    fn get(&self, run_id: &str) -> Result<Option<StatusRecord>> {
        Ok(self.records.get(run_id).cloned())
    }
}

/// Exclusive advisory lock next to a store file, held until dropped.
struct StoreLock {
    _file: File,
}

impl StoreLock {
    fn acquire(store: &Path) -> Result<StoreLock> {
        let path = store.with_extension("json.lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| path.display().to_string())?;
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("locking {}", path.display()));
        }
        Ok(StoreLock { _file: file })
    }
}

/// Status store persisted as one JSON object. Every change re-reads the
/// file and rewrites it through a temporary file while holding a lock, so
/// concurrent invocations never drop each other's records.
#[derive(Debug)]
pub struct JsonStatusStore {
    path: PathBuf,
}

impl JsonStatusStore {
    pub fn open(path: &Path) -> Result<JsonStatusStore> {
        let store = JsonStatusStore {
            path: path.to_path_buf(),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<MemoryStatusStore> {
        let path = &self.path;
        let records = match fs::read_to_string(path) {
            Ok(contents) => {
                serde_json::from_str(&contents).with_context(|| path.display().to_string())?
            }
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err).with_context(|| path.display().to_string()),
        };
        Ok(MemoryStatusStore { records })
    }

    /// Apply `change` to the records on disk.
    fn modify(&self, change: impl FnOnce(&mut MemoryStatusStore) -> Result<()>) -> Result<()> {
        let _lock = StoreLock::acquire(&self.path)?;
        let mut store = self.load()?;
        change(&mut store)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&store.records)?)
            .with_context(|| tmp.display().to_string())?;
        fs::rename(&tmp, &self.path).with_context(|| self.path.display().to_string())
    }
}

impl StatusStore for JsonStatusStore {
    fn create(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        self.modify(|store| store.create(run_id, status))
    }

    fn update(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        self.modify(|store| store.update(run_id, status))
    }

    fn get(&self, run_id: &str) -> Result<Option<StatusRecord>> {
        self.load()?.get(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_status_skips_unchanged_and_regressions() -> Result<()> {
        let mut store = MemoryStatusStore::default();
        assert!(record_status(&mut store, "run", RunStatus::Sequencing)?);
        assert!(!record_status(&mut store, "run", RunStatus::Sequencing)?);
        assert!(record_status(&mut store, "run", RunStatus::Demultiplexing)?);
        assert!(!record_status(&mut store, "run", RunStatus::ReadyToDemux)?);
        assert_eq!(store.get("run")?.unwrap().status, RunStatus::Demultiplexing);
        assert!(store.get("other")?.is_none());
        Ok(())
    }

    #[test]
    fn test_create_and_update_contracts() {
        let mut store = MemoryStatusStore::default();
        assert!(store.update("run", RunStatus::Sequencing).is_err());
        assert!(store.create("run", RunStatus::Sequencing).is_ok());
        assert!(store.create("run", RunStatus::Sequencing).is_err());
    }

    #[test]
    fn test_json_store_persists() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("status.json");
        {
            let mut store = JsonStatusStore::open(&path)?;
            record_status(&mut store, "run", RunStatus::Transferring)?;
            record_status(&mut store, "run", RunStatus::Archived)?;
        }
        let store = JsonStatusStore::open(&path)?;
        assert_eq!(store.get("run")?.unwrap().status, RunStatus::Archived);
        assert!(fs::read_to_string(&path)?.contains("\"ARCHIVED\""));
        Ok(())
    }

    #[test]
    fn test_json_stores_sharing_a_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("status.json");
        let mut a = JsonStatusStore::open(&path)?;
        let mut b = JsonStatusStore::open(&path)?;

        record_status(&mut b, "run_b", RunStatus::Archived)?;
        record_status(&mut a, "run_a", RunStatus::Sequencing)?;
        assert_eq!(a.get("run_b")?.unwrap().status, RunStatus::Archived);

        let store = JsonStatusStore::open(&path)?;
        assert_eq!(store.get("run_a")?.unwrap().status, RunStatus::Sequencing);
        assert_eq!(store.get("run_b")?.unwrap().status, RunStatus::Archived);
        Ok(())
    }

    #[test]
    fn test_concurrent_json_writers() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("status.json");
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let path = path.clone();
                std::thread::spawn(move || -> Result<()> {
                    let mut store = JsonStatusStore::open(&path)?;
                    for r in 0..10 {
                        store.create(&format!("run_{w}_{r}"), RunStatus::Sequencing)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap()?;
        }
        let records: BTreeMap<String, StatusRecord> =
            serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(records.len(), 40);
        Ok(())
    }
}
