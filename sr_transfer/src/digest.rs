//! Content checksums of transferred files.
//!
//! A digest file lists one `<hex digest>  <path>` pair per line, as written by
//! `sha256sum` and friends. Paths are relative to the digest file's directory
//! and the algorithm is named by the file's extension (`checksums.sha256`).
use crate::errors::TransferValidationError;
use anyhow::{Context, Result};
use log::warn;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DigestAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// Choose the algorithm named by the extension of `digest_file`.
    pub fn from_path(digest_file: &Path) -> Result<DigestAlgorithm> {
        let ext = digest_file
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        Ok(match ext.as_deref() {
            Some("sha1") => DigestAlgorithm::Sha1,
            Some("sha224") => DigestAlgorithm::Sha224,
            Some("sha256") => DigestAlgorithm::Sha256,
            Some("sha384") => DigestAlgorithm::Sha384,
            Some("sha512") => DigestAlgorithm::Sha512,
            _ => {
                return Err(TransferValidationError::UnsupportedAlgorithm {
                    path: digest_file.to_path_buf(),
                }
                .into())
            }
        })
    }

    /// Hex digest of the contents of `path`.
    pub fn hash_file(self, path: &Path) -> Result<String> {
        match self {
            DigestAlgorithm::Sha1 => hash_with::<Sha1>(path),
            DigestAlgorithm::Sha224 => hash_with::<Sha224>(path),
            DigestAlgorithm::Sha256 => hash_with::<Sha256>(path),
            DigestAlgorithm::Sha384 => hash_with::<Sha384>(path),
            DigestAlgorithm::Sha512 => hash_with::<Sha512>(path),
        }
    }
}

fn hash_with<D: Digest + Write>(path: &Path) -> Result<String> {
    let mut hasher = D::new();
    std::io::copy(
        &mut File::open(path).with_context(|| path.display().to_string())?,
        &mut hasher,
    )?;
    Ok(hex::encode(hasher.finalize()))
}

/// Recompute every digest listed in `digest_file`. Returns false if any entry
/// is malformed, names a missing file or does not match.
pub fn validate_digest_file(digest_file: &Path) -> Result<bool> {
    let algorithm = DigestAlgorithm::from_path(digest_file)?;
    let base = digest_file.parent().unwrap_or_else(|| Path::new("."));
    let contents =
        fs::read_to_string(digest_file).with_context(|| digest_file.display().to_string())?;

    let mut valid = true;
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        let Some((expected, name)) = line.split_once(char::is_whitespace) else {
            warn!("Malformed line in {}: {line}", digest_file.display());
            valid = false;
            continue;
        };
        // sha*sum marks binary-mode entries with a leading '*'
        let name = name.trim_start();
        let name = name.strip_prefix('*').unwrap_or(name);
        let path = base.join(name);
        if !path.is_file() {
            warn!("{} is listed in {} but missing", path.display(), digest_file.display());
            valid = false;
            continue;
        }
        let computed = algorithm.hash_file(&path)?;
        if !computed.eq_ignore_ascii_case(expected) {
            warn!(
                "Checksum mismatch for {}: expected {expected}, computed {computed}",
                path.display()
            );
            valid = false;
        }
    }
    Ok(valid)
}

/// Write a digest file covering `files`, which must live under the digest
/// file's directory.
pub fn write_digest_file(digest_file: &Path, files: &[PathBuf]) -> Result<()> {
    let algorithm = DigestAlgorithm::from_path(digest_file)?;
    let base = digest_file.parent().unwrap_or_else(|| Path::new("."));
    let mut out = File::create(digest_file).with_context(|| digest_file.display().to_string())?;
    for file in files {
        let rel = file.strip_prefix(base).with_context(|| {
            format!("{} is not under {}", file.display(), base.display())
        })?;
        writeln!(out, "{}  {}", algorithm.hash_file(file)?, rel.display())?;
    }
    Ok(())
}
