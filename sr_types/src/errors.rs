//! Error types shared by every stage of run processing.
//!
//! These are carried inside `anyhow::Error`; callers classify a failure with
//! `err.downcast_ref::<AggregationError>()` and friends.
use std::path::PathBuf;

/// Fatal problems found while constructing a `Run`. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum RunSetupError {
    #[error("The run directory {path:?} does not exist.")]
    MissingRunDir { path: PathBuf },

    #[error("The run setup file {path:?} is missing.")]
    MissingDescriptor { path: PathBuf },

    #[error("The run setup file {path:?} could not be parsed: {reason}")]
    InvalidDescriptor { path: PathBuf, reason: String },

    #[error("The instrument configuration is incomplete: {0}")]
    IncompleteConfig(String),
}

/// Manifest, base mask or configuration file inputs are unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("No manifest could be located for run {run}.")]
    ManifestNotFound { run: String },

    #[error("Error parsing manifest {path:?}: {reason}")]
    ManifestParse { path: PathBuf, reason: String },

    #[error(
        "The index of length {index_size} does not fit in the {cycles} cycles of read {read}. \
         The manifest disagrees with the run setup."
    )]
    IndexTooLong {
        read: u32,
        index_size: usize,
        cycles: usize,
    },

    #[error(
        "Lane {lane} of manifest {path:?} mixes samples with different index lengths \
         ({masks}). Split them into separate manifests."
    )]
    MixedBaseMasks {
        path: PathBuf,
        lane: u32,
        masks: String,
    },

    #[error("Invalid configuration file {path:?}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Demultiplexing results could not be assembled into the canonical tree.
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("The required statistics file {path:?} is missing.")]
    MissingStatsFile { path: PathBuf },

    #[error("Both {first:?} and {second:?} would be linked to {name:?}.")]
    Conflict {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Sample {sample} is reported for lane {lane} by more than one demultiplexing job.")]
    OverlappingSamples { lane: u64, sample: String },

    #[error("Demultiplexing jobs disagree on {field}: {first} and {second}.")]
    Inconsistent {
        field: String,
        first: String,
        second: String,
    },

    #[error("Malformed demultiplexing output {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}
