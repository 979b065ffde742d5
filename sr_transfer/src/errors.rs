use std::path::PathBuf;

/// The source or destination of a transfer is unusable.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("The transfer source {path:?} does not exist.")]
    MissingSource { path: PathBuf },

    #[error("A destination path is required when no remote host is given.")]
    MissingDestination,

    #[error("A remote user ({user}) was given without a remote host.")]
    UserWithoutHost { user: String },
}

/// The transfer mechanism could not be run or exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error(
    "Transfer command `{command}` failed{}",
    .status.map(|s| format!(" with exit status {s}")).unwrap_or_default()
)]
pub struct TransferExecutionError {
    pub command: String,
    pub status: Option<i32>,
    #[source]
    pub source: Option<std::io::Error>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferValidationError {
    #[error("Validation of a transfer to remote host {host} is not supported.")]
    RemoteUnsupported { host: String },

    #[error("No digest file is configured for validation.")]
    NoDigestFile,

    #[error("The digest file {path:?} does not exist.")]
    MissingDigestFile { path: PathBuf },

    #[error("The transfer to {dest} was refused or its copy does not match the source.")]
    Rejected { dest: String },

    #[error("Cannot tell the digest algorithm of {path:?} from its extension.")]
    UnsupportedAlgorithm { path: PathBuf },
}

/// An operating system failure while replacing or creating a link.
#[derive(Debug, thiserror::Error)]
pub enum SymlinkError {
    #[error("Failed to {action} {path:?}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to remove mount point {path:?}.")]
    MountPoint { path: PathBuf },

    #[error("{path:?} is neither a file, a link nor a directory.")]
    UnsupportedEntry { path: PathBuf },
}
