//! Assembly of the canonical demultiplexing tree of a run from its
//! sub-jobs.
//!
//! The canonical statistics directory is the completion signal: it is built
//! in a staging directory next to it and renamed into place as the last
//! step, so an interrupted aggregation is never mistaken for a finished one.
pub mod html;
pub mod merge;

use crate::aggregate::html::{merge_lane_report, LaneRows};
use crate::aggregate::merge::{merge_adapter_trimming, merge_flowcell_xml, merge_stats_json};
use anyhow::{Context, Result};
use itertools::Itertools;
use log::{info, warn};
use sr_types::{AggregationError, Run};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

pub const DEMUX_STATS_XML: &str = "DemultiplexingStats.xml";
pub const CONVERSION_STATS_XML: &str = "ConversionStats.xml";
pub const ADAPTER_TRIMMING: &str = "AdapterTrimming.txt";
const REPORTS_DIR: &str = "Reports";
const STATS_STAGING: &str = ".Stats.partial";
const REPORTS_STAGING: &str = ".Reports.partial";

/// What `aggregate_demux_results` did.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Aggregation {
    /// A single job wrote directly into the canonical directory.
    InPlace,
    /// The canonical statistics were already assembled.
    AlreadyComplete,
    /// The statistics of the only sub-job were linked.
    Linked,
    /// The statistics of several sub-jobs were merged.
    Merged { sub_jobs: usize },
}

/// The statistics files every demultiplexing job must produce.
pub fn required_stats_files(run: &Run) -> [&str; 4] {
    [
        DEMUX_STATS_XML,
        CONVERSION_STATS_XML,
        ADAPTER_TRIMMING,
        run.config.final_stats_file.as_str(),
    ]
}

fn check_stats_files(run: &Run, demux_dir: &Path) -> Result<()> {
    let stats_dir = demux_dir.join(&run.config.stats_dir);
    for name in required_stats_files(run) {
        let path = stats_dir.join(name);
        if !path.is_file() {
            return Err(AggregationError::MissingStatsFile { path }.into());
        }
    }
    Ok(())
}

/// Create `link -> target` unless the very same link already exists.
fn link_entry(target: &Path, link: &Path, owners: &mut BTreeMap<PathBuf, PathBuf>) -> Result<()> {
    let name = link.display().to_string();
    if let Some(first) = owners.get(link) {
        return Err(AggregationError::Conflict {
            name,
            first: first.clone(),
            second: target.to_path_buf(),
        }
        .into());
    }
    match fs::read_link(link) {
        Ok(existing) if existing == target => {}
        Ok(existing) => {
            return Err(AggregationError::Conflict {
                name,
                first: existing,
                second: target.to_path_buf(),
            }
            .into())
        }
        Err(_) if fs::symlink_metadata(link).is_ok() => {
            return Err(AggregationError::Conflict {
                name,
                first: link.to_path_buf(),
                second: target.to_path_buf(),
            }
            .into())
        }
        Err(_) => symlink(target, link).with_context(|| name.clone())?,
    }
    owners.insert(link.to_path_buf(), target.to_path_buf());
    Ok(())
}

fn is_undetermined(name: &str) -> bool {
    name.starts_with("Undetermined")
}

/// Link the project directories (sample by sample) and the undetermined
/// reads of every sub-job into the canonical directory.
fn link_sub_job_outputs(run: &Run, sub_jobs: &[PathBuf], canonical: &Path) -> Result<()> {
    let mut owners = BTreeMap::new();
    for sub_job in sub_jobs {
        let entries: Vec<_> = fs::read_dir(sub_job)
            .with_context(|| sub_job.display().to_string())?
            .map_ok(|e| e.path())
            .try_collect()?;
        for path in entries.into_iter().sorted() {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if name == run.config.stats_dir || name == REPORTS_DIR || name.starts_with('.') {
                continue;
            }
            let dest = canonical.join(&name);
            if path.is_dir() {
                fs::create_dir_all(&dest).with_context(|| dest.display().to_string())?;
                for sample in fs::read_dir(&path).with_context(|| path.display().to_string())? {
                    let sample = sample?.path();
                    let Some(sample_name) = sample.file_name() else {
                        continue;
                    };
                    link_entry(&sample, &dest.join(sample_name), &mut owners)?;
                }
            } else if is_undetermined(&name) {
                if let Some(first) = owners.get(&dest) {
                    warn!(
                        "{run}: keeping {} for {name}, ignoring {}",
                        first.display(),
                        path.display()
                    );
                    continue;
                }
                link_entry(&path, &dest, &mut owners)?;
            }
        }
    }
    Ok(())
}

fn read_all(paths: &[PathBuf]) -> Result<Vec<(PathBuf, String)>> {
    paths
        .iter()
        .map(|p| {
            let text = fs::read_to_string(p).with_context(|| p.display().to_string())?;
            Ok((p.clone(), text))
        })
        .collect()
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| path.display().to_string())
}

fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).with_context(|| path.display().to_string())
        }
        Ok(_) => fs::remove_file(path).with_context(|| path.display().to_string()),
        Err(_) => Ok(()),
    }
}

fn build_merged_stats(run: &Run, sub_jobs: &[PathBuf], staging: &Path) -> Result<()> {
    let stats_of = |name: &str| -> Vec<PathBuf> {
        sub_jobs
            .iter()
            .map(|dir| dir.join(&run.config.stats_dir).join(name))
            .collect()
    };

    let mut json_docs = Vec::new();
    for (path, text) in read_all(&stats_of(&run.config.final_stats_file))? {
        let doc = serde_json::from_str(&text).map_err(|e| AggregationError::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        json_docs.push((path, doc));
    }
    let merged = merge_stats_json(&json_docs)?;
    write_file(
        &staging.join(&run.config.final_stats_file),
        &serde_json::to_string_pretty(&merged)?,
    )?;

    for name in [DEMUX_STATS_XML, CONVERSION_STATS_XML] {
        let merged = merge_flowcell_xml(&read_all(&stats_of(name))?)?;
        write_file(&staging.join(name), &merged)?;
    }
    let merged = merge_adapter_trimming(&read_all(&stats_of(ADAPTER_TRIMMING))?)?;
    write_file(&staging.join(ADAPTER_TRIMMING), &merged)?;

    // per-lane summaries and the like are linked as they are
    let merged_files = required_stats_files(run);
    let mut owners = BTreeMap::new();
    for sub_job in sub_jobs {
        let source = sub_job.join(&run.config.stats_dir);
        let entries: Vec<_> = fs::read_dir(&source)
            .with_context(|| source.display().to_string())?
            .map_ok(|e| e.path())
            .try_collect()?;
        for path in entries.into_iter().sorted() {
            let Some(name) = path.file_name() else {
                continue;
            };
            if merged_files.iter().any(|merged| name == *merged) {
                continue;
            }
            link_entry(&path, &staging.join(name), &mut owners)?;
        }
    }
    Ok(())
}

/// Merge the lane reports of every sub-job into `canonical/Reports`. Reports
/// are found as `Reports/html/<flowcell>/all/all/all/*.html`.
fn build_merged_reports(sub_jobs: &[PathBuf], canonical: &Path) -> Result<()> {
    let mut reports: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for sub_job in sub_jobs {
        let reports_dir = sub_job.join(REPORTS_DIR);
        let pattern = reports_dir.join("html/*/all/all/all/*.html");
        for path in glob::glob(&pattern.to_string_lossy())? {
            let path = path?;
            let rel = path.strip_prefix(&reports_dir)?.to_path_buf();
            reports.entry(rel).or_default().push(path);
        }
    }
    if reports.is_empty() {
        return Ok(());
    }

    let staging = canonical.join(REPORTS_STAGING);
    remove_path(&staging)?;
    for (rel, paths) in &reports {
        let dest = staging.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| parent.display().to_string())?;
        }
        let name = rel.file_name().unwrap_or_default().to_string_lossy();
        match LaneRows::for_report(&name) {
            Some(mode) => write_file(&dest, &merge_lane_report(&read_all(paths)?, mode)?)?,
            None => {
                fs::copy(&paths[0], &dest).with_context(|| dest.display().to_string())?;
            }
        }
    }
    let reports_dir = canonical.join(REPORTS_DIR);
    remove_path(&reports_dir)?;
    fs::rename(&staging, &reports_dir).with_context(|| reports_dir.display().to_string())
}

/// Assemble the canonical demultiplexing directory of `run`.
///
/// Every sub-job must hold the required statistics files; otherwise an
/// [`AggregationError`] is returned before anything is written.
pub fn aggregate_demux_results(run: &Run) -> Result<Aggregation> {
    let canonical = run.demux_dir();
    let sub_jobs = run.sub_demux_dirs()?;
    if sub_jobs.is_empty() {
        check_stats_files(run, &canonical)?;
        return Ok(Aggregation::InPlace);
    }
    let stats_dir = canonical.join(&run.config.stats_dir);
    if run.final_stats_path(&canonical).is_file() {
        return Ok(Aggregation::AlreadyComplete);
    }
    for sub_job in &sub_jobs {
        check_stats_files(run, sub_job)?;
    }

    info!("{run}: aggregating {} demultiplexing jobs", sub_jobs.len());
    fs::create_dir_all(&canonical).with_context(|| canonical.display().to_string())?;
    link_sub_job_outputs(run, &sub_jobs, &canonical)?;

    let staging = canonical.join(STATS_STAGING);
    remove_path(&staging)?;
    fs::create_dir(&staging).with_context(|| staging.display().to_string())?;
    let result = if let [sub_job] = sub_jobs.as_slice() {
        let source = sub_job.join(&run.config.stats_dir);
        for entry in fs::read_dir(&source).with_context(|| source.display().to_string())? {
            let entry = entry?;
            symlink(entry.path(), staging.join(entry.file_name()))
                .with_context(|| entry.path().display().to_string())?;
        }
        let reports = sub_job.join(REPORTS_DIR);
        let reports_link = canonical.join(REPORTS_DIR);
        if reports.is_dir() && fs::symlink_metadata(&reports_link).is_err() {
            symlink(&reports, &reports_link).with_context(|| reports_link.display().to_string())?;
        }
        Aggregation::Linked
    } else {
        build_merged_stats(run, &sub_jobs, &staging)?;
        build_merged_reports(&sub_jobs, &canonical)?;
        Aggregation::Merged {
            sub_jobs: sub_jobs.len(),
        }
    };

    remove_path(&stats_dir)?;
    fs::rename(&staging, &stats_dir).with_context(|| stats_dir.display().to_string())?;
    info!("{run}: aggregation successful");
    Ok(result)
}
