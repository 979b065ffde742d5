//! The run lifecycle state machine and the poll cycle.
//!
//! ```text
//! SEQUENCING -> READY_TO_DEMUX -> DEMULTIPLEXING -> DEMUX_COMPLETE
//!            -> TRANSFERRING -> TRANSFERRED -> ARCHIVED
//! ```
//!
//! Every poll derives the status of each run from the filesystem and takes
//! at most the actions that status calls for. Concurrent invocations are
//! kept apart by the transfer marker and the ledger only.
use crate::aggregate::aggregate_demux_results;
use crate::archive::{archive_run, is_archived, sync_metadata};
use crate::base_mask::BaseMaskPlan;
use crate::demux::{write_job_plan, CommandDemuxLauncher, DemuxJob, DemuxLauncher};
use crate::detector::derive_status;
use crate::ledger::{transfer_ongoing, TransferLedger, TransferMarker};
use crate::manifest::{parse_manifest, write_manifest, FsManifestProvider, ManifestProvider};
use crate::notify::{CommandNotifier, LogNotifier, Notifier};
use crate::store::{record_status, JsonStatusStore, MemoryStatusStore, StatusStore};
use anyhow::{Context, Result};
use itertools::Itertools;
use log::{info, warn};
use sr_transfer::{
    RsyncAgent, SymlinkError, TransferAgent, TransferError, TransferExecutionError,
    TransferValidationError,
};
use sr_types::config::RsyncConfig;
use sr_types::{Config, Run, RunStatus};
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

/// Builds the agent moving a run to its destination.
pub trait TransferFactory {
    fn agent(&self, run: &Run) -> Result<Box<dyn TransferAgent>>;
}

impl<F> TransferFactory for F
where
    F: Fn(&Run) -> Result<Box<dyn TransferAgent>>,
{
    fn agent(&self, run: &Run) -> Result<Box<dyn TransferAgent>> {
        self(run)
    }
}

/// rsync transfers configured by the `[transfer]` table.
pub struct RsyncTransfer {
    pub config: RsyncConfig,
}

impl TransferFactory for RsyncTransfer {
    fn agent(&self, run: &Run) -> Result<Box<dyn TransferAgent>> {
        let config = &self.config;
        let mut agent = RsyncAgent::new(&run.run_dir, config.dest_path.as_deref())
            .remote(config.remote_host.as_deref(), config.remote_user.as_deref())
            .with_run_filters(&run.config.demux_dir, &config.include_patterns);
        agent.validate = config.validate;
        agent.log_dir = Some(run.run_dir.clone());
        // rsync recreates the run directory under the destination
        if let (Some(dest), Some(digest)) = (&config.dest_path, &config.digest_file) {
            agent.digest_file = Some(dest.join(&run.id).join(digest));
        }
        Ok(Box::new(agent))
    }
}

/// The result of advancing one run by one poll.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Step {
    /// Nothing to do until an external process progresses.
    Waiting(RunStatus),
    /// No manifest could be located; the run stays ready to demultiplex.
    MissingManifest,
    /// Demultiplexing was launched with this many jobs.
    DemuxStarted { jobs: usize },
    /// Another attempt holds the transfer marker.
    TransferOngoing,
    /// Transferred and moved to its archive location.
    Archived(PathBuf),
    /// Nothing left to do.
    AlreadyArchived,
    /// Recorded as transferred but still in place. Left for an operator.
    TransferredNotArchived,
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Waiting(status) => write!(f, "waiting ({status})"),
            Step::MissingManifest => write!(f, "no manifest"),
            Step::DemuxStarted { jobs } => write!(f, "started {jobs} demultiplexing jobs"),
            Step::TransferOngoing => write!(f, "transfer ongoing"),
            Step::Archived(path) => write!(f, "archived to {}", path.display()),
            Step::AlreadyArchived => write!(f, "already archived"),
            Step::TransferredNotArchived => write!(f, "transferred but not archived"),
        }
    }
}

/// A run processed through the lifecycle. Instrument differences are
/// carried by the run's configuration.
pub trait RunLifecycle {
    fn status(&self) -> Result<RunStatus>;

    fn advance(&self, controller: &mut RunController) -> Result<Step>;
}

impl RunLifecycle for Run {
    fn status(&self) -> Result<RunStatus> {
        derive_status(self)
    }

    fn advance(&self, controller: &mut RunController) -> Result<Step> {
        controller.advance(self)
    }
}

#[derive(Debug)]
pub struct RunFailure {
    pub run: String,
    pub error: anyhow::Error,
}

#[derive(Debug, Default)]
pub struct PollReport {
    pub steps: Vec<(String, Step)>,
    pub failures: Vec<RunFailure>,
}

/// Errors of a transfer attempt after which the marker is released: the
/// attempt is over and nothing is in flight.
fn is_handled_transfer_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TransferError>().is_some()
        || err.downcast_ref::<TransferExecutionError>().is_some()
        || err.downcast_ref::<TransferValidationError>().is_some()
        || err.downcast_ref::<SymlinkError>().is_some()
}

/// Collect the full chain of an error, one cause per line.
pub fn error_chain(err: &anyhow::Error) -> String {
    err.chain().map(ToString::to_string).join("\n\tCaused by: ")
}

pub struct RunController {
    pub config: Config,
    pub store: Box<dyn StatusStore>,
    pub ledger: TransferLedger,
    pub manifests: Box<dyn ManifestProvider>,
    pub launcher: Box<dyn DemuxLauncher>,
    pub transfers: Box<dyn TransferFactory>,
    pub notifier: Box<dyn Notifier>,
}

impl RunController {
    /// A controller using the collaborators named by `config`.
    pub fn from_config(config: Config) -> Result<RunController> {
        let store: Box<dyn StatusStore> = match &config.status_db {
            Some(path) => Box::new(JsonStatusStore::open(path)?),
            None => Box::<MemoryStatusStore>::default(),
        };
        let notifier: Box<dyn Notifier> = match &config.mail.command {
            Some(program) => Box::new(CommandNotifier {
                program: program.clone(),
            }),
            None => Box::new(LogNotifier),
        };
        Ok(RunController {
            ledger: TransferLedger::new(&config.transfer_log),
            manifests: Box::new(FsManifestProvider {
                manifest_dirs: config.manifest_dirs.clone(),
            }),
            launcher: Box::new(CommandDemuxLauncher {
                command: config.demux.clone(),
            }),
            transfers: Box::new(RsyncTransfer {
                config: config.transfer.clone(),
            }),
            store,
            notifier,
            config,
        })
    }

    /// Run directories under the data directories, sorted by name.
    pub fn discover_runs(&self) -> Result<Vec<PathBuf>> {
        let re = self.config.instrument.run_regex()?;
        let mut runs = Vec::new();
        for data_dir in &self.config.data_dirs {
            let entries = match fs::read_dir(data_dir) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("Skipping data directory {}: {err}", data_dir.display());
                    continue;
                }
            };
            for entry in entries {
                let entry = entry.with_context(|| data_dir.display().to_string())?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if re.is_match(&name)
                    && !self.config.ignore_dirs.contains(&name)
                    && entry.path().is_dir()
                {
                    runs.push(entry.path());
                }
            }
        }
        runs.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
        Ok(runs)
    }

    pub fn load_run(&self, run_dir: &Path) -> Result<Run> {
        Run::new(run_dir, &self.config.instrument)
    }

    fn record(&mut self, run: &Run, status: RunStatus) -> Result<bool> {
        record_status(self.store.as_mut(), &run.id, status)
    }

    /// Force the store to hold the status derived from the filesystem,
    /// including a status preceding the stored one.
    pub fn update_status(&mut self, run: &Run) -> Result<RunStatus> {
        let status = run.status()?;
        match self.store.get(&run.id)? {
            None => self.store.create(&run.id, status)?,
            Some(_) => self.store.update(&run.id, status)?,
        }
        Ok(status)
    }

    /// Take the actions the current status of `run` calls for.
    pub fn advance(&mut self, run: &Run) -> Result<Step> {
        let status = run.status()?;
        match status {
            RunStatus::ReadyToDemux => self.start_demultiplexing(run),
            RunStatus::DemuxComplete => self.transfer_and_archive(run),
            _ => {
                self.record(run, status)?;
                Ok(Step::Waiting(status))
            }
        }
    }

    fn start_demultiplexing(&mut self, run: &Run) -> Result<Step> {
        let manifests = self.manifests.manifests(run)?;
        if manifests.is_empty() {
            warn!("{run}: no manifest found, not demultiplexing");
            return Ok(Step::MissingManifest);
        }

        // every manifest is checked before anything is written; a manifest
        // with several masks in one lane is split into one job per mask
        let mut planned = Vec::new();
        for manifest in manifests {
            let entries = parse_manifest(&manifest)?;
            let plans = BaseMaskPlan::new(&entries, &run.setup.reads)
                .with_context(|| format!("{run}: {}", manifest.display()))?
                .split_by_mask();
            let split = plans.len() > 1;
            for plan in plans {
                let base_masks = plan
                    .lane_masks(&manifest)
                    .with_context(|| format!("{run}: {}", manifest.display()))?;
                let samples = split.then(|| plan.samples());
                planned.push((manifest.clone(), samples, base_masks));
            }
        }

        let demux_dir = run.demux_dir();
        fs::create_dir_all(&demux_dir).with_context(|| demux_dir.display().to_string())?;
        let jobs = if let [(manifest, None, base_masks)] = planned.as_slice() {
            vec![DemuxJob {
                manifest: manifest.clone(),
                output_dir: demux_dir,
                base_masks: base_masks.clone(),
            }]
        } else {
            let jobs: Vec<_> = planned
                .iter()
                .enumerate()
                .map(|(n, (_, _, base_masks))| {
                    let output_dir = run.sub_demux_dir(n);
                    let name = format!(
                        "{}_{n}.{}",
                        run.config.manifest_stem, run.config.manifest_ext
                    );
                    DemuxJob {
                        manifest: output_dir.join(name),
                        output_dir,
                        base_masks: base_masks.clone(),
                    }
                })
                .collect();
            // the plan tells the detector how many sub-jobs to wait for, so
            // it is in place before the first of them
            write_job_plan(run, &jobs)?;
            for (job, (source, samples, _)) in jobs.iter().zip(&planned) {
                fs::create_dir_all(&job.output_dir)
                    .with_context(|| job.output_dir.display().to_string())?;
                match samples {
                    Some(samples) => write_manifest(&job.manifest, source, samples)?,
                    None => {
                        fs::copy(source, &job.manifest)
                            .with_context(|| job.manifest.display().to_string())?;
                    }
                }
            }
            jobs
        };

        for job in &jobs {
            self.launcher.launch(run, job)?;
        }
        self.record(run, RunStatus::Demultiplexing)?;
        Ok(Step::DemuxStarted { jobs: jobs.len() })
    }

    fn check_archived(&self, run: &Run) -> Result<Step> {
        let recorded = self
            .store
            .get(&run.id)?
            .is_some_and(|r| r.status == RunStatus::Archived);
        if recorded || is_archived(run, &self.config.archive_dir) {
            return Ok(Step::AlreadyArchived);
        }
        warn!(
            "{run}: transferred but not archived, leaving {} in place",
            run.run_dir.display()
        );
        Ok(Step::TransferredNotArchived)
    }

    fn transfer_and_archive(&mut self, run: &Run) -> Result<Step> {
        // clears a marker left behind after the ledger was written
        let ongoing = transfer_ongoing(run, &self.ledger)?;
        if self.ledger.is_transferred(&run.id)? {
            return self.check_archived(run);
        }
        if ongoing {
            self.record(run, RunStatus::Transferring)?;
            return Ok(Step::TransferOngoing);
        }
        self.record(run, RunStatus::DemuxComplete)?;

        if run.config.demultiplex {
            aggregate_demux_results(run)?;
        }
        if let Some(metadata_dir) = &self.config.metadata_dir {
            sync_metadata(run, metadata_dir)?;
        }
        let agent = self.transfers.agent(run)?;

        let Some(marker) = TransferMarker::acquire(run)? else {
            self.record(run, RunStatus::Transferring)?;
            return Ok(Step::TransferOngoing);
        };
        info!("{run}: transferring");
        let attempt = self
            .record(run, RunStatus::Transferring)
            .and_then(|_| agent.transfer());
        match attempt {
            Ok(true) => marker.release()?,
            Ok(false) => {
                marker.release()?;
                let dest = agent
                    .dest_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                return Err(TransferValidationError::Rejected { dest }.into());
            }
            Err(err) if is_handled_transfer_error(&err) => {
                marker.release()?;
                return Err(err.context(format!("{run}: transfer failed")));
            }
            // the marker stays, the next poll treats the transfer as ongoing
            Err(err) => return Err(err),
        }
        info!("{run}: transfer successful");

        self.ledger.record_completion(&run.id)?;
        self.record(run, RunStatus::Transferred)?;
        let archived = archive_run(run, &self.config.archive_dir)?;
        self.record(run, RunStatus::Archived)?;
        Ok(Step::Archived(archived))
    }

    /// Advance one run directory, constructing the run first.
    pub fn process(&mut self, run_dir: &Path) -> Result<Step> {
        let run = self.load_run(run_dir)?;
        run.advance(self)
    }

    /// Advance `run_dirs`, or every discovered run when `None`. Failures are
    /// collected per run without stopping the cycle and reported in one
    /// notification at the end.
    pub fn poll(&mut self, run_dirs: Option<Vec<PathBuf>>) -> Result<PollReport> {
        let run_dirs = match run_dirs {
            Some(dirs) => dirs,
            None => self.discover_runs()?,
        };
        let mut report = PollReport::default();
        for run_dir in run_dirs {
            let name = run_dir
                .file_name()
                .map_or_else(|| run_dir.display().to_string(), |n| n.to_string_lossy().into_owned());
            match self.process(&run_dir) {
                Ok(step) => {
                    info!("{name}: {step}");
                    report.steps.push((name, step));
                }
                Err(error) => {
                    warn!("{name}: {}", error_chain(&error));
                    report.failures.push(RunFailure { run: name, error });
                }
            }
        }

        if !report.failures.is_empty() {
            let body = report
                .failures
                .iter()
                .map(|f| format!("{}:\n\t{}", f.run, error_chain(&f.error)))
                .join("\n\n");
            if let Err(err) =
                self.notifier
                    .notify("Runs processed with errors", &body, &self.config.mail.recipients)
            {
                warn!("Failed to send notification: {}", error_chain(&err));
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{ADAPTER_TRIMMING, CONVERSION_STATS_XML, DEMUX_STATS_XML};
    use crate::demux::read_job_plan;
    use pretty_assertions::assert_eq;
    use sr_transfer::SymlinkAgent;
    use sr_types::InstrumentConfig;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    const RUN_ID: &str = "141124_ST-COMPLETED1_01_AFCIDXX";
    const RUN_INFO: &str = r#"<Reads>
<Read Number="1" NumCycles="151" IsIndexedRead="N"/>
<Read Number="2" NumCycles="10" IsIndexedRead="Y"/>
<Read Number="3" NumCycles="10" IsIndexedRead="Y"/>
</Reads>"#;

    #[derive(Default, Clone)]
    struct Recorder {
        launched: Rc<RefCell<Vec<DemuxJob>>>,
        notified: Rc<RefCell<Vec<String>>>,
        transfers: Rc<RefCell<usize>>,
    }

    impl DemuxLauncher for Recorder {
        fn launch(&self, _run: &Run, job: &DemuxJob) -> Result<()> {
            self.launched.borrow_mut().push(job.clone());
            Ok(())
        }
    }

    impl Notifier for Recorder {
        fn notify(&self, _subject: &str, body: &str, _recipients: &[String]) -> Result<()> {
            self.notified.borrow_mut().push(body.to_string());
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        recorder: Recorder,
        controller: RunController,
    }

    impl Fixture {
        fn new() -> Result<Fixture> {
            let dir = tempdir()?;
            let data = dir.path().join("data");
            fs::create_dir_all(data.join(RUN_ID))?;
            fs::create_dir_all(data.join("not_a_run"))?;
            fs::write(data.join(RUN_ID).join("RunInfo.xml"), RUN_INFO)?;
            let config = Config {
                data_dirs: vec![data, dir.path().join("missing")],
                ignore_dirs: Vec::new(),
                archive_dir: dir.path().join("nosync"),
                transfer_log: dir.path().join("transfer.tsv"),
                status_db: None,
                metadata_dir: Some(dir.path().join("metadata")),
                manifest_dirs: Vec::new(),
                instrument: InstrumentConfig::default(),
                transfer: RsyncConfig::default(),
                demux: Default::default(),
                mail: Default::default(),
            };
            let recorder = Recorder::default();
            let counter = recorder.transfers.clone();
            let dest_root = dir.path().join("dest");
            let transfers = move |run: &Run| -> Result<Box<dyn TransferAgent>> {
                *counter.borrow_mut() += 1;
                Ok(Box::new(SymlinkAgent::new(&run.run_dir, &dest_root.join(&run.id))))
            };
            let controller = RunController {
                store: Box::<MemoryStatusStore>::default(),
                ledger: TransferLedger::new(&config.transfer_log),
                manifests: Box::new(FsManifestProvider {
                    manifest_dirs: Vec::new(),
                }),
                launcher: Box::new(recorder.clone()),
                transfers: Box::new(transfers),
                notifier: Box::new(recorder.clone()),
                config,
            };
            Ok(Fixture {
                dir,
                recorder,
                controller,
            })
        }

        fn run_dir(&self) -> PathBuf {
            self.dir.path().join("data").join(RUN_ID)
        }

        fn write(&self, rel: &str, contents: &str) -> Result<()> {
            let path = self.run_dir().join(rel);
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(path, contents)?;
            Ok(())
        }

        fn finish_demux(&self, demux_dir: &str) -> Result<()> {
            for name in [DEMUX_STATS_XML, CONVERSION_STATS_XML] {
                self.write(
                    &format!("{demux_dir}/Stats/{name}"),
                    "<Stats>\n<Flowcell flowcell-id=\"FCIDXX\">\n</Flowcell>\n</Stats>\n",
                )?;
            }
            self.write(&format!("{demux_dir}/Stats/{ADAPTER_TRIMMING}"), "Lane\tSample\n")?;
            self.write(&format!("{demux_dir}/Stats/Stats.json"), "{\"Flowcell\": \"FCIDXX\"}")
        }

        fn status(&self) -> Option<RunStatus> {
            self.controller.store.get(RUN_ID).unwrap().map(|r| r.status)
        }

        fn poll(&mut self) -> Result<PollReport> {
            self.controller.poll(None)
        }
    }

    const MANIFEST: &str = "[Data]\nLane,Sample_ID,Sample_Project,index,index2\n\
                            1,S1,P1,ACGTACGTAC,ACGTACGTAC\n2,S2,P1,ACGTACG,\n";

    #[test]
    fn test_full_lifecycle() -> Result<()> {
        let mut fx = Fixture::new()?;

        let report = fx.poll()?;
        assert_eq!(report.steps, vec![(RUN_ID.to_string(), Step::Waiting(RunStatus::Sequencing))]);
        assert_eq!(fx.status(), Some(RunStatus::Sequencing));

        fx.write("RTAComplete.txt", "")?;
        assert_eq!(fx.poll()?.steps[0].1, Step::MissingManifest);
        assert_eq!(fx.status(), Some(RunStatus::Sequencing));
        assert!(!fx.run_dir().join("Demultiplexing").exists());

        fx.write("SampleSheet.csv", MANIFEST)?;
        assert_eq!(fx.poll()?.steps[0].1, Step::DemuxStarted { jobs: 1 });
        assert_eq!(fx.status(), Some(RunStatus::Demultiplexing));
        let launched = fx.recorder.launched.borrow().clone();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].output_dir, fx.run_dir().join("Demultiplexing"));
        assert_eq!(
            launched[0].base_masks,
            vec!["1:Y151,I10,I10", "2:Y151,I7N3,N10"]
        );

        assert_eq!(
            fx.poll()?.steps[0].1,
            Step::Waiting(RunStatus::Demultiplexing)
        );

        fx.finish_demux("Demultiplexing")?;
        let step = fx.poll()?.steps[0].1.clone();
        let archived = fx.dir.path().join("nosync").join(RUN_ID);
        assert_eq!(step, Step::Archived(archived.clone()));
        assert_eq!(fx.status(), Some(RunStatus::Archived));
        assert!(fx.controller.ledger.is_transferred(RUN_ID)?);
        assert!(archived.join("RunInfo.xml").exists());
        assert!(!archived.join("transferring").exists());
        assert!(fx
            .dir
            .path()
            .join("metadata")
            .join(RUN_ID)
            .join("SampleSheet.csv")
            .exists());
        assert_eq!(*fx.recorder.transfers.borrow(), 1);

        // the archived run is no longer discovered; processing it directly
        // does not transfer it again
        assert!(fx.poll()?.steps.is_empty());
        assert_eq!(fx.controller.process(&archived)?, Step::AlreadyArchived);
        assert_eq!(*fx.recorder.transfers.borrow(), 1);
        assert!(fx.recorder.notified.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_several_manifests_get_numbered_jobs() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("RTAComplete.txt", "")?;
        fx.write("SampleSheet_10.csv", MANIFEST)?;
        fx.write("SampleSheet_2.csv", MANIFEST)?;

        assert_eq!(fx.poll()?.steps[0].1, Step::DemuxStarted { jobs: 2 });
        let launched = fx.recorder.launched.borrow().clone();
        assert_eq!(
            launched
                .iter()
                .map(|j| (j.manifest.clone(), j.output_dir.clone()))
                .collect::<Vec<_>>(),
            vec![
                (
                    fx.run_dir().join("Demultiplexing_0/SampleSheet_0.csv"),
                    fx.run_dir().join("Demultiplexing_0")
                ),
                (
                    fx.run_dir().join("Demultiplexing_1/SampleSheet_1.csv"),
                    fx.run_dir().join("Demultiplexing_1")
                ),
            ]
        );
        assert!(fx.run_dir().join("Demultiplexing").is_dir());
        assert_eq!(
            fs::read_to_string(fx.run_dir().join("Demultiplexing_1/SampleSheet_1.csv"))?,
            MANIFEST
        );
        let run = fx.controller.load_run(&fx.run_dir())?;
        assert_eq!(read_job_plan(&run)?.map(|jobs| jobs.len()), Some(2));

        fx.finish_demux("Demultiplexing_0")?;
        assert_eq!(fx.poll()?.steps[0].1, Step::Waiting(RunStatus::Demultiplexing));
        fx.finish_demux("Demultiplexing_1")?;
        assert!(matches!(fx.poll()?.steps[0].1, Step::Archived(_)));
        Ok(())
    }

    #[test]
    fn test_every_job_is_prepared_before_any_launch() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("RTAComplete.txt", "")?;
        fx.write("SampleSheet_1.csv", MANIFEST)?;
        fx.write("SampleSheet_2.csv", MANIFEST)?;

        struct Checking(PathBuf);
        impl DemuxLauncher for Checking {
            fn launch(&self, _run: &Run, _job: &DemuxJob) -> Result<()> {
                for n in 0..2 {
                    let manifest = self.0.join(format!("Demultiplexing_{n}/SampleSheet_{n}.csv"));
                    anyhow::ensure!(manifest.is_file(), "{} is missing", manifest.display());
                }
                anyhow::bail!("killed")
            }
        }
        fx.controller.launcher = Box::new(Checking(fx.run_dir()));
        let report = fx.poll()?;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].error.to_string(), "killed");
        Ok(())
    }

    #[test]
    fn test_interrupted_launch_is_never_archived() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("RTAComplete.txt", "")?;
        fx.write("SampleSheet_1.csv", MANIFEST)?;
        fx.write("SampleSheet_2.csv", MANIFEST)?;
        // killed after the first job ran, before the second directory existed
        fs::create_dir_all(fx.run_dir().join("Demultiplexing"))?;
        fx.finish_demux("Demultiplexing_0")?;

        for _ in 0..2 {
            assert_eq!(
                fx.poll()?.steps[0].1,
                Step::Waiting(RunStatus::Demultiplexing)
            );
        }
        assert!(fx.run_dir().exists());
        assert!(!fx.controller.ledger.is_transferred(RUN_ID)?);
        assert_eq!(*fx.recorder.transfers.borrow(), 0);
        Ok(())
    }

    #[test]
    fn test_mixed_masks_are_split_into_jobs() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("RTAComplete.txt", "")?;
        fx.write(
            "SampleSheet.csv",
            "[Header]\nDate,2018-01-01\n[Data]\nLane,Sample_ID,Sample_Project,index,index2\n\
             1,S1,P1,ACGTACG,ACGTACG\n1,S2,P1,ACGTACG,\n2,S3,P1,ACGTACG,\n",
        )?;

        assert_eq!(fx.poll()?.steps[0].1, Step::DemuxStarted { jobs: 2 });
        let launched = fx.recorder.launched.borrow().clone();
        assert_eq!(
            launched.iter().map(|j| j.base_masks.clone()).collect::<Vec<_>>(),
            vec![
                vec!["1:Y151,I7N3,I7N3".to_string(), "2:Y151,I7N3,N10".to_string()],
                vec!["1:Y151,I7N3,N10".to_string()],
            ]
        );
        let samples = |n: usize| -> Result<Vec<String>> {
            Ok(parse_manifest(&launched[n].manifest)?
                .into_iter()
                .map(|e| e.sample_id)
                .collect())
        };
        assert_eq!(samples(0)?, vec!["S1", "S3"]);
        assert_eq!(samples(1)?, vec!["S2"]);
        assert!(fs::read_to_string(&launched[1].manifest)?.starts_with("[Header]\nDate,2018-01-01\n"));
        assert_eq!(fx.status(), Some(RunStatus::Demultiplexing));

        fx.finish_demux("Demultiplexing_0")?;
        assert_eq!(fx.poll()?.steps[0].1, Step::Waiting(RunStatus::Demultiplexing));
        fx.finish_demux("Demultiplexing_1")?;
        assert!(matches!(fx.poll()?.steps[0].1, Step::Archived(_)));
        Ok(())
    }

    #[test]
    fn test_invalid_manifest_fails_before_writing() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("RTAComplete.txt", "")?;
        fx.write("SampleSheet_0.csv", MANIFEST)?;
        fx.write(
            "SampleSheet_1.csv",
            "[Data]\nLane,Sample_ID,index\n1,S1,ACGTACGTACGT\n",
        )?;
        let report = fx.poll()?;
        assert!(report.steps.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0]
                .error
                .downcast_ref::<sr_types::ConfigurationError>(),
            Some(sr_types::ConfigurationError::IndexTooLong { .. })
        ));
        assert!(!fx.run_dir().join("Demultiplexing").exists());
        assert!(fx.recorder.launched.borrow().is_empty());
        assert_eq!(fx.recorder.notified.borrow().len(), 1);
        assert!(fx.recorder.notified.borrow()[0].starts_with(RUN_ID));
        Ok(())
    }

    #[test]
    fn test_ongoing_transfer_is_not_duplicated() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("RTAComplete.txt", "")?;
        fx.finish_demux("Demultiplexing")?;
        fx.write("transferring", "")?;

        assert_eq!(fx.poll()?.steps[0].1, Step::TransferOngoing);
        assert_eq!(fx.status(), Some(RunStatus::Transferring));
        assert_eq!(*fx.recorder.transfers.borrow(), 0);
        assert!(fx.run_dir().join("transferring").exists());
        Ok(())
    }

    #[test]
    fn test_transferred_run_is_not_transferred_again() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("RTAComplete.txt", "")?;
        fx.finish_demux("Demultiplexing")?;
        fx.controller.ledger.record_completion(RUN_ID)?;
        // left behind by a crash after the ledger was written
        fx.write("transferring", "")?;

        for _ in 0..2 {
            assert_eq!(fx.poll()?.steps[0].1, Step::TransferredNotArchived);
        }
        assert_eq!(*fx.recorder.transfers.borrow(), 0);
        assert!(fx.run_dir().exists());
        assert!(!fx.run_dir().join("transferring").exists());
        Ok(())
    }

    #[test]
    fn test_failed_transfer_releases_marker() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("RTAComplete.txt", "")?;
        fx.finish_demux("Demultiplexing")?;
        // the link agent refuses to replace an existing destination
        let dest_root = fx.dir.path().join("dest");
        fs::create_dir_all(dest_root.join(RUN_ID))?;
        fx.controller.transfers = Box::new(move |run: &Run| -> Result<Box<dyn TransferAgent>> {
            let mut agent = SymlinkAgent::new(&run.run_dir, &dest_root.join(&run.id));
            agent.overwrite = false;
            Ok(Box::new(agent))
        });

        let report = fx.poll()?;
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0].error.downcast_ref::<TransferValidationError>(),
            Some(TransferValidationError::Rejected { .. })
        ));
        assert!(!fx.run_dir().join("transferring").exists());
        assert!(!fx.controller.ledger.is_transferred(RUN_ID)?);
        assert_eq!(fx.status(), Some(RunStatus::Transferring));
        Ok(())
    }

    #[test]
    fn test_unhandled_transfer_error_keeps_marker() -> Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("RTAComplete.txt", "")?;
        fx.finish_demux("Demultiplexing")?;

        struct Exploding(PathBuf);
        impl TransferAgent for Exploding {
            fn src_path(&self) -> &Path {
                &self.0
            }
            fn dest_path(&self) -> Option<&Path> {
                None
            }
            fn transfer(&self) -> Result<bool> {
                anyhow::bail!("unexpected")
            }
            fn validate_transfer(&self) -> Result<bool> {
                Ok(false)
            }
        }
        fx.controller.transfers = Box::new(|run: &Run| -> Result<Box<dyn TransferAgent>> {
            Ok(Box::new(Exploding(run.run_dir.clone())))
        });

        assert_eq!(fx.poll()?.failures.len(), 1);
        assert!(fx.run_dir().join("transferring").exists());
        assert_eq!(fx.poll()?.steps[0].1, Step::TransferOngoing);
        Ok(())
    }

    #[test]
    fn test_one_failure_does_not_block_other_runs() -> Result<()> {
        let mut fx = Fixture::new()?;
        let broken = fx.dir.path().join("data").join("141124_ST-BROKEN1_01_AFCIDXX");
        fs::create_dir(&broken)?;

        let report = fx.poll()?;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].run, "141124_ST-BROKEN1_01_AFCIDXX");
        assert!(report.failures[0]
            .error
            .downcast_ref::<sr_types::RunSetupError>()
            .is_some());
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].0, RUN_ID);
        Ok(())
    }

    #[test]
    fn test_update_status_may_go_back() -> Result<()> {
        let mut fx = Fixture::new()?;
        let run = fx.controller.load_run(&fx.run_dir())?;
        fx.controller.store.create(RUN_ID, RunStatus::Transferred)?;
        assert_eq!(fx.controller.update_status(&run)?, RunStatus::Sequencing);
        assert_eq!(fx.status(), Some(RunStatus::Sequencing));
        Ok(())
    }
}
