//! Record of completed transfers and the in-progress marker.
//!
//! The ledger is an append-only text file of `<run id>\t<timestamp>` lines;
//! presence of a run id, not the number of lines, means "transferred". The
//! marker is a file in the run directory which exists for the duration of a
//! transfer attempt. Both are shared with other invocations through the
//! filesystem only.
use anyhow::{Context, Result};
use chrono::Local;
use log::warn;
use sr_types::Run;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Clone, Debug)]
pub struct TransferLedger {
    path: PathBuf,
}

impl TransferLedger {
    pub fn new(path: &Path) -> TransferLedger {
        TransferLedger {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if `run_id` has a completion record. A missing ledger holds none.
    pub fn is_transferred(&self, run_id: &str) -> Result<bool> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err).with_context(|| self.path.display().to_string()),
        };
        Ok(contents
            .lines()
            .any(|line| line.split('\t').next() == Some(run_id)))
    }

    /// Append a completion record for `run_id`. Existing lines are never rewritten.
    pub fn record_completion(&self, run_id: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| self.path.display().to_string())?;
        writeln!(file, "{run_id}\t{}", Local::now().format(TIMESTAMP_FORMAT))
            .with_context(|| self.path.display().to_string())
    }
}

/// Ownership of the transfer marker of a run.
///
/// There is no `Drop` impl: the marker must outlive a crashed or aborted
/// attempt so the next poll sees the transfer as ongoing. It is removed only
/// by [`TransferMarker::release`].
#[derive(Debug)]
#[must_use]
pub struct TransferMarker {
    path: PathBuf,
}

impl TransferMarker {
    /// Create the marker of `run`. Returns `None` if it already exists, in
    /// which case another attempt owns the transfer.
    pub fn acquire(run: &Run) -> Result<Option<TransferMarker>> {
        let path = run.transfer_marker_path();
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(err).with_context(|| path.display().to_string()),
        };
        write_owner(&mut file).with_context(|| path.display().to_string())?;
        Ok(Some(TransferMarker { path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) -> Result<()> {
        fs::remove_file(&self.path).with_context(|| self.path.display().to_string())
    }
}

fn write_owner(file: &mut File) -> std::io::Result<()> {
    writeln!(
        file,
        "{}\t{}",
        std::process::id(),
        Local::now().format(TIMESTAMP_FORMAT)
    )
}

/// True if a transfer attempt of `run` holds the marker. A marker left on a
/// run which already has a completion record is stale: it is removed and the
/// run is reported as not ongoing.
pub fn transfer_ongoing(run: &Run, ledger: &TransferLedger) -> Result<bool> {
    let marker = run.transfer_marker_path();
    if fs::symlink_metadata(&marker).is_err() {
        return Ok(false);
    }
    if ledger.is_transferred(&run.id)? {
        warn!(
            "{run}: removing stale transfer marker {}, the run is already transferred",
            marker.display()
        );
        fs::remove_file(&marker).with_context(|| marker.display().to_string())?;
        return Ok(false);
    }
    Ok(true)
}
