//! seqrunner
#![deny(missing_docs)]

use anyhow::{bail, Result};
use clap::{self, Parser};
use log::info;
use sr_lib::base_mask::{plan_run, BaseMaskPlan};
use sr_lib::ledger::transfer_ongoing;
use sr_lib::manifest::{parse_manifest, FsManifestProvider};
use sr_lib::{RunController, RunLifecycle};
use sr_types::{Config, InstrumentConfig, Run};
use sr_wrap::utils::{init_logging, print_error_chain};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Drive sequencing runs from the instrument to the archive
#[derive(Parser, Debug)]
#[clap(name = "seqrunner", version)]
struct SeqRunner {
    #[clap(subcommand)]
    subcmd: SubCommand,

    /// TOML configuration file
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Log more, may be repeated. RUST_LOG takes precedence.
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Parser, Debug)]
enum SubCommand {
    /// Advance every run found in the data directories by one step.
    #[clap(name = "preprocess")]
    Preprocess {
        /// Only process this run directory
        #[clap(long)]
        run: Option<PathBuf>,
    },

    /// Report the detected status of a run and whether it is transferred.
    #[clap(name = "transfer-status")]
    TransferStatus {
        /// Run directory
        run_dir: PathBuf,
    },

    /// Record the status detected on disk, even if it precedes the recorded one.
    #[clap(name = "update-status")]
    UpdateStatus {
        /// Run directory
        run_dir: PathBuf,
    },

    /// Print the base mask plans of a run's manifests as JSON.
    #[clap(name = "base-mask")]
    BaseMask {
        /// Run directory holding the read setup descriptor
        #[clap(long)]
        run: PathBuf,

        /// Sample sheet. Defaults to the manifests found for the run.
        #[clap(long)]
        manifest: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        bail!("--config is required for this command");
    };
    Config::load(path)
}

fn controller(path: Option<&Path>) -> Result<RunController> {
    RunController::from_config(load_config(path)?)
}

fn execute(args: SeqRunner) -> Result<ExitCode> {
    let config = args.config.as_deref();
    match args.subcmd {
        SubCommand::Preprocess { run } => {
            let mut controller = controller(config)?;
            let report = controller.poll(run.map(|r| vec![r]))?;
            info!(
                "Processed {} runs, {} with errors",
                report.steps.len() + report.failures.len(),
                report.failures.len()
            );
            if report.failures.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        SubCommand::TransferStatus { run_dir } => {
            let controller = controller(config)?;
            let run = controller.load_run(&run_dir)?;
            let ongoing = transfer_ongoing(&run, &controller.ledger)?;
            let transfer = if controller.ledger.is_transferred(&run.id)? {
                "transferred"
            } else if ongoing {
                "transferring"
            } else {
                "not transferred"
            };
            println!("{}\t{}\t{transfer}", run.id, run.status()?);
            Ok(ExitCode::SUCCESS)
        }
        SubCommand::UpdateStatus { run_dir } => {
            let mut controller = controller(config)?;
            let run = controller.load_run(&run_dir)?;
            let status = controller.update_status(&run)?;
            println!("{}\t{status}", run.id);
            Ok(ExitCode::SUCCESS)
        }
        SubCommand::BaseMask { run, manifest } => {
            let (instrument, manifest_dirs) = match config {
                Some(path) => {
                    let config = Config::load(path)?;
                    (config.instrument, config.manifest_dirs)
                }
                None => (InstrumentConfig::default(), Vec::new()),
            };
            let run = Run::new(&run, &instrument)?;
            let plans = match manifest {
                Some(manifest) => {
                    let plan = BaseMaskPlan::new(&parse_manifest(&manifest)?, &run.setup.reads)?;
                    vec![(manifest, plan)]
                }
                None => plan_run(&run, &FsManifestProvider { manifest_dirs })?,
            };
            let plans: BTreeMap<String, BaseMaskPlan> = plans
                .into_iter()
                .map(|(manifest, plan)| (manifest.display().to_string(), plan))
                .collect();
            println!("{}", serde_json::to_string_pretty(&plans)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let args = SeqRunner::parse();
    init_logging(args.verbose);
    match execute(args) {
        Ok(code) => code,
        Err(err) => {
            print_error_chain(&err);
            ExitCode::FAILURE
        }
    }
}
