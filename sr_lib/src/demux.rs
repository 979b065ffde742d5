//! Launching the external demultiplexing tool.
use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use sr_types::config::DemuxCommand;
use sr_types::Run;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Jobs of a run split over several output directories, written to the
/// canonical directory before any of them is created.
pub const JOB_PLAN_FILE: &str = "DemuxJobs.json";

/// One invocation of the demultiplexing tool.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct DemuxJob {
    pub manifest: PathBuf,
    pub output_dir: PathBuf,
    /// `--use-bases-mask` values, one per lane.
    pub base_masks: Vec<String>,
}

impl DemuxJob {
    /// The same job with its paths relative to the run directory, which
    /// moves when the run is archived.
    fn relative_to(&self, run: &Run) -> DemuxJob {
        let rel = |p: &Path| p.strip_prefix(&run.run_dir).unwrap_or(p).to_path_buf();
        DemuxJob {
            manifest: rel(&self.manifest),
            output_dir: rel(&self.output_dir),
            base_masks: self.base_masks.clone(),
        }
    }
}

/// Record the jobs about to be started for `run`.
pub fn write_job_plan(run: &Run, jobs: &[DemuxJob]) -> Result<()> {
    let path = run.demux_dir().join(JOB_PLAN_FILE);
    let tmp = path.with_extension("json.tmp");
    let jobs: Vec<_> = jobs.iter().map(|job| job.relative_to(run)).collect();
    fs::write(&tmp, serde_json::to_string_pretty(&jobs)?)
        .with_context(|| tmp.display().to_string())?;
    fs::rename(&tmp, &path).with_context(|| path.display().to_string())
}

/// The jobs recorded by [`write_job_plan`], with paths relative to the run
/// directory, or `None` if the run has no plan.
pub fn read_job_plan(run: &Run) -> Result<Option<Vec<DemuxJob>>> {
    let path = run.demux_dir().join(JOB_PLAN_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| path.display().to_string()),
    };
    let jobs = serde_json::from_str(&contents).with_context(|| path.display().to_string())?;
    Ok(Some(jobs))
}

pub trait DemuxLauncher {
    /// Start `job` for `run` without waiting for it to finish.
    fn launch(&self, run: &Run, job: &DemuxJob) -> Result<()>;
}

/// Spawns a configured program, detached, with its output redirected to
/// `demux.out` and `demux.err` in the job's output directory.
pub struct CommandDemuxLauncher {
    pub command: DemuxCommand,
}

impl CommandDemuxLauncher {
    pub fn args(&self, run: &Run, job: &DemuxJob) -> Vec<String> {
        let path = |p: &Path| p.to_string_lossy().into_owned();
        let mut args = self.command.args.clone();
        args.extend([
            "--runfolder-dir".to_string(),
            path(&run.run_dir),
            "--output-dir".to_string(),
            path(&job.output_dir),
            "--sample-sheet".to_string(),
            path(&job.manifest),
        ]);
        for mask in &job.base_masks {
            args.push("--use-bases-mask".to_string());
            args.push(mask.clone());
        }
        args
    }
}

impl DemuxLauncher for CommandDemuxLauncher {
    fn launch(&self, run: &Run, job: &DemuxJob) -> Result<()> {
        let open = |name: &str| -> Result<File> {
            let path = job.output_dir.join(name);
            File::create(&path).with_context(|| path.display().to_string())
        };
        let args = self.args(run, job);
        let child = Command::new(&self.command.program)
            .args(&args)
            .current_dir(&run.run_dir)
            .stdin(Stdio::null())
            .stdout(open("demux.out")?)
            .stderr(open("demux.err")?)
            .spawn()
            .with_context(|| format!("running {} {}", self.command.program, args.join(" ")))?;
        info!(
            "{run}: started {} (pid {}) for {}",
            self.command.program,
            child.id(),
            job.manifest.display()
        );
        Ok(())
    }
}
