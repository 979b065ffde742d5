//! Configuration of the run processing, read from a TOML file.
//!
//! Every instrument-family field has a default reproducing the Illumina
//! layout, so a minimal file only lists data directories and destinations.
use crate::errors::ConfigurationError;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentFamily {
    #[default]
    Illumina,
    Element,
    Nanopore,
}

/// Naming conventions of one instrument family. These are the only
/// instrument-specific inputs of the lifecycle.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct InstrumentConfig {
    pub family: InstrumentFamily,
    /// Matches run directory names. A `flowcell` named group, if present,
    /// captures the flowcell identifier.
    pub run_pattern: String,
    pub sequencing_done_marker: String,
    /// `None` for families without a read setup (no demultiplexing).
    pub run_setup_file: Option<String>,
    pub demux_dir: String,
    pub manifest_stem: String,
    pub manifest_ext: String,
    pub stats_dir: String,
    pub final_stats_file: String,
    pub transfer_marker: String,
    pub metadata_files: Vec<String>,
    pub demultiplex: bool,
}

impl Default for InstrumentConfig {
    fn default() -> InstrumentConfig {
        InstrumentConfig {
            family: InstrumentFamily::Illumina,
            run_pattern: r"^\d{6}_[^_]+_\d+_[AB]?(?P<flowcell>[A-Za-z0-9-]+)$".to_string(),
            sequencing_done_marker: "RTAComplete.txt".to_string(),
            run_setup_file: Some("RunInfo.xml".to_string()),
            demux_dir: "Demultiplexing".to_string(),
            manifest_stem: "SampleSheet".to_string(),
            manifest_ext: "csv".to_string(),
            stats_dir: "Stats".to_string(),
            final_stats_file: "Stats.json".to_string(),
            transfer_marker: "transferring".to_string(),
            metadata_files: vec![
                "RunInfo.xml".to_string(),
                "runParameters.xml".to_string(),
                "RunParameters.xml".to_string(),
            ],
            demultiplex: true,
        }
    }
}

impl InstrumentConfig {
    pub fn run_regex(&self) -> Result<Regex> {
        Regex::new(&self.run_pattern)
            .with_context(|| format!("invalid run_pattern '{}'", self.run_pattern))
    }
}

/// Options of the synchronization-based transfer of a run.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct RsyncConfig {
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
    pub dest_path: Option<PathBuf>,
    /// File name patterns shipped with the run, e.g. `*.fastq.gz`.
    pub include_patterns: Vec<String>,
    /// Digest file, relative to the transferred run directory.
    pub digest_file: Option<PathBuf>,
    pub validate: bool,
}

impl Default for RsyncConfig {
    fn default() -> RsyncConfig {
        RsyncConfig {
            remote_host: None,
            remote_user: None,
            dest_path: None,
            include_patterns: ["*.fastq.gz", "*.csv", "*.xml", "*.json", "*.html", "*.txt"]
                .map(String::from)
                .to_vec(),
            digest_file: None,
            validate: false,
        }
    }
}

/// The external demultiplexing program and its fixed arguments.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct DemuxCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for DemuxCommand {
    fn default() -> DemuxCommand {
        DemuxCommand {
            program: "bcl2fastq".to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct MailConfig {
    pub recipients: Vec<String>,
    /// `mail`-compatible program (`<program> -s <subject> <recipients...>`,
    /// body on stdin). Notifications are only logged when unset.
    pub command: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub data_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub ignore_dirs: Vec<String>,
    pub archive_dir: PathBuf,
    /// Append-only ledger of completed transfers.
    pub transfer_log: PathBuf,
    /// JSON file recording the last status of every run. Kept in memory when unset.
    #[serde(default)]
    pub status_db: Option<PathBuf>,
    /// Destination of the auxiliary run metadata.
    #[serde(default)]
    pub metadata_dir: Option<PathBuf>,
    /// Locations searched for `<flowcell>.csv` manifests.
    #[serde(default)]
    pub manifest_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub instrument: InstrumentConfig,
    #[serde(default)]
    pub transfer: RsyncConfig,
    #[serde(default)]
    pub demux: DemuxCommand,
    #[serde(default)]
    pub mail: MailConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let contents =
            std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        Config::from_toml(&contents, path)
    }

    /// Parse `contents`; `path` is only used in error messages.
    pub fn from_toml(contents: &str, path: &Path) -> Result<Config> {
        let config: Config = toml::from_str(contents).map_err(|e| ConfigurationError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.instrument.run_regex().map_err(|e| ConfigurationError::Invalid {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        })?;
        Ok(config)
    }
}
