//! Run status derived from marker files and demultiplexing output.
use crate::demux::read_job_plan;
use crate::manifest::local_manifests;
use anyhow::Result;
use sr_types::{DemuxStatus, Run, RunStatus};

pub fn sequencing_done(run: &Run) -> bool {
    run.sequencing_marker_path().exists()
}

/// Number of sub-jobs a run is split into: the recorded job plan, or one
/// per local manifest for runs started without a plan.
fn expected_sub_jobs(run: &Run) -> Result<usize> {
    match read_job_plan(run)? {
        Some(jobs) => Ok(jobs.len()),
        None => Ok(local_manifests(run)?.len()),
    }
}

/// `finished` once the canonical final statistics file exists, or every
/// expected numbered sub-job exists and holds its own; `ongoing` while any
/// demultiplexing directory exists; `not_started` otherwise.
pub fn demultiplexing_status(run: &Run) -> Result<DemuxStatus> {
    let demux_dir = run.demux_dir();
    if run.final_stats_path(&demux_dir).is_file() {
        return Ok(DemuxStatus::Finished);
    }
    let sub_jobs = run.sub_demux_dirs()?;
    if !sub_jobs.is_empty()
        && sub_jobs.len() >= expected_sub_jobs(run)?
        && sub_jobs
            .iter()
            .all(|dir| run.final_stats_path(dir).is_file())
    {
        return Ok(DemuxStatus::Finished);
    }
    if demux_dir.is_dir() || !sub_jobs.is_empty() {
        return Ok(DemuxStatus::Ongoing);
    }
    Ok(DemuxStatus::NotStarted)
}

/// Status of a run as seen on the filesystem. Transfer and archival are not
/// visible here; they are tracked by the ledger and the status store.
pub fn derive_status(run: &Run) -> Result<RunStatus> {
    if !sequencing_done(run) {
        return Ok(RunStatus::Sequencing);
    }
    if !run.config.demultiplex {
        return Ok(RunStatus::DemuxComplete);
    }
    Ok(match demultiplexing_status(run)? {
        DemuxStatus::NotStarted => RunStatus::ReadyToDemux,
        DemuxStatus::Ongoing => RunStatus::Demultiplexing,
        DemuxStatus::Finished => RunStatus::DemuxComplete,
    })
}
