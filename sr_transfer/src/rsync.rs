//! Transfer through an external `rsync` process.
use crate::agent::TransferAgent;
use crate::digest::validate_digest_file;
use crate::errors::{TransferError, TransferExecutionError, TransferValidationError};
use anyhow::{Context, Result};
use log::{info, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Copy options every rsync transfer starts from: follow links, keep times,
/// devices and specials, recurse, and make files group-writable.
pub const DEFAULT_OPTS: [&str; 2] = ["-LtDrv", "--chmod=g+rw"];

#[derive(Clone, Debug)]
pub struct RsyncAgent {
    pub src_path: PathBuf,
    pub dest_path: Option<PathBuf>,
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
    /// Validate against `digest_file` after a successful copy.
    pub validate: bool,
    /// Absolute path of the digest file on the destination side.
    pub digest_file: Option<PathBuf>,
    /// Options passed before the source and destination arguments.
    pub opts: Vec<String>,
    /// Directory receiving `rsync.out` and `rsync.err`. Output is discarded when unset.
    pub log_dir: Option<PathBuf>,
    pub program: String,
}

impl RsyncAgent {
    pub fn new(src_path: &Path, dest_path: Option<&Path>) -> RsyncAgent {
        RsyncAgent {
            src_path: src_path.to_path_buf(),
            dest_path: dest_path.map(Path::to_path_buf),
            remote_host: None,
            remote_user: None,
            validate: false,
            digest_file: None,
            opts: DEFAULT_OPTS.map(String::from).to_vec(),
            log_dir: None,
            program: "rsync".to_string(),
        }
    }

    pub fn remote(mut self, host: Option<&str>, user: Option<&str>) -> RsyncAgent {
        self.remote_host = host.map(String::from);
        self.remote_user = user.map(String::from);
        self
    }

    /// Ship the files matching `include_patterns` and every directory, skip
    /// the per-job directories inside the numbered sub-job trees of
    /// `demux_dir`, and drop directories left empty by the filter.
    pub fn with_run_filters(mut self, demux_dir: &str, include_patterns: &[String]) -> RsyncAgent {
        self.opts.push(format!("--exclude={demux_dir}_*/*_*"));
        self.opts.push("--include=*/".to_string());
        self.opts
            .extend(include_patterns.iter().map(|p| format!("--include={p}")));
        self.opts.push("--exclude=*".to_string());
        self.opts.push("--prune-empty-dirs".to_string());
        self
    }

    /// Destination argument in `[user@][host:]path` form.
    pub fn remote_path(&self) -> String {
        let mut target = String::new();
        if let Some(host) = &self.remote_host {
            if let Some(user) = &self.remote_user {
                target.push_str(user);
                target.push('@');
            }
            target.push_str(host);
            target.push(':');
        }
        if let Some(dest) = &self.dest_path {
            target.push_str(&dest.to_string_lossy());
        }
        target
    }

    /// Arguments of the rsync invocation, without the program name.
    pub fn args(&self) -> Vec<String> {
        let mut args = self.opts.clone();
        args.push(self.src_path.to_string_lossy().into_owned());
        args.push(self.remote_path());
        args
    }

    fn output_file(&self, name: &str) -> Result<Stdio> {
        Ok(match &self.log_dir {
            Some(dir) => {
                let path = dir.join(name);
                File::create(&path)
                    .with_context(|| path.display().to_string())?
                    .into()
            }
            None => Stdio::null(),
        })
    }
}

impl TransferAgent for RsyncAgent {
    fn src_path(&self) -> &Path {
        &self.src_path
    }

    fn dest_path(&self) -> Option<&Path> {
        self.dest_path.as_deref()
    }

    /// A remote host alone is a valid destination (its home directory); a
    /// user without a host is not.
    fn validate_dest_path(&self) -> Result<()> {
        match (&self.remote_host, &self.remote_user, &self.dest_path) {
            (None, Some(user), _) => Err(TransferError::UserWithoutHost { user: user.clone() }.into()),
            (None, None, None) => Err(TransferError::MissingDestination.into()),
            _ => Ok(()),
        }
    }

    fn transfer(&self) -> Result<bool> {
        self.validate_src_path()?;
        self.validate_dest_path()?;
        let args = self.args();
        let command = format!("{} {}", self.program, args.join(" "));
        info!("Running {command}");

        let status = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(self.output_file("rsync.out")?)
            .stderr(self.output_file("rsync.err")?)
            .status();
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                return Err(TransferExecutionError {
                    command,
                    status: status.code(),
                    source: None,
                }
                .into())
            }
            Err(err) => {
                return Err(TransferExecutionError {
                    command,
                    status: None,
                    source: Some(err),
                }
                .into())
            }
        }

        if self.validate {
            let valid = self.validate_transfer()?;
            if !valid {
                warn!("Validation of {} failed", self.remote_path());
            }
            return Ok(valid);
        }
        Ok(true)
    }

    fn validate_transfer(&self) -> Result<bool> {
        if let Some(host) = &self.remote_host {
            return Err(TransferValidationError::RemoteUnsupported { host: host.clone() }.into());
        }
        let digest_file = self
            .digest_file
            .as_deref()
            .ok_or(TransferValidationError::NoDigestFile)?;
        if !digest_file.is_file() {
            return Err(TransferValidationError::MissingDigestFile {
                path: digest_file.to_path_buf(),
            }
            .into());
        }
        validate_digest_file(digest_file)
    }
}
