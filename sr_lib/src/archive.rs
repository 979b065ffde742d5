//! Run metadata export and relocation of finished runs.
use crate::manifest::local_manifests;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use sr_types::Run;
use std::fs;
use std::path::{Path, PathBuf};

/// Copy the configured metadata files and the manifests of `run` to
/// `<metadata_dir>/<run id>/`. Missing metadata files are skipped.
pub fn sync_metadata(run: &Run, metadata_dir: &Path) -> Result<Vec<PathBuf>> {
    let dest_dir = metadata_dir.join(&run.id);
    fs::create_dir_all(&dest_dir).with_context(|| dest_dir.display().to_string())?;

    let mut sources: Vec<PathBuf> = run
        .config
        .metadata_files
        .iter()
        .map(|name| run.run_dir.join(name))
        .filter(|path| path.is_file())
        .collect();
    sources.extend(local_manifests(run)?);

    let mut copied = Vec::new();
    for source in sources {
        let Some(name) = source.file_name() else {
            continue;
        };
        let dest = dest_dir.join(name);
        fs::copy(&source, &dest).with_context(|| dest.display().to_string())?;
        copied.push(dest);
    }
    if copied.is_empty() {
        warn!("{run}: no metadata files to copy");
    } else {
        info!("{run}: copied {} metadata files to {}", copied.len(), dest_dir.display());
    }
    Ok(copied)
}

/// True if `run` already lives in `archive_dir`.
pub fn is_archived(run: &Run, archive_dir: &Path) -> bool {
    run.run_dir.parent() == Some(archive_dir)
}

/// Move the run directory into `archive_dir` and return its new location.
/// An existing entry of the same name is never overwritten.
pub fn archive_run(run: &Run, archive_dir: &Path) -> Result<PathBuf> {
    let dest = archive_dir.join(&run.id);
    if fs::symlink_metadata(&dest).is_ok() {
        bail!(
            "Cannot archive {}: {} already exists",
            run.run_dir.display(),
            dest.display()
        );
    }
    fs::create_dir_all(archive_dir).with_context(|| archive_dir.display().to_string())?;
    fs::rename(&run.run_dir, &dest).with_context(|| {
        format!("moving {} to {}", run.run_dir.display(), dest.display())
    })?;
    info!("{run}: archived to {}", dest.display());
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sr_types::InstrumentConfig;
    use tempfile::tempdir;

    fn make_run(root: &Path) -> Result<Run> {
        let run_dir = root.join("141124_ST-COMPLETED1_01_AFCIDXX");
        fs::create_dir(&run_dir)?;
        fs::write(
            run_dir.join("RunInfo.xml"),
            r#"<Read Number="1" NumCycles="151" IsIndexedRead="N"/>"#,
        )?;
        fs::write(run_dir.join("SampleSheet.csv"), "Sample_ID\nS1\n")?;
        Run::new(&run_dir, &InstrumentConfig::default())
    }

    #[test]
    fn test_sync_metadata() -> Result<()> {
        let dir = tempdir()?;
        let run = make_run(dir.path())?;
        let copied = sync_metadata(&run, &dir.path().join("metadata"))?;
        let dest = dir.path().join("metadata").join(&run.id);
        assert_eq!(
            copied,
            vec![dest.join("RunInfo.xml"), dest.join("SampleSheet.csv")]
        );
        Ok(())
    }

    #[test]
    fn test_archive_run() -> Result<()> {
        let dir = tempdir()?;
        let archive = dir.path().join("nosync");
        let run = make_run(dir.path())?;
        assert!(!is_archived(&run, &archive));

        let dest = archive_run(&run, &archive)?;
        assert_eq!(dest, archive.join(&run.id));
        assert!(dest.join("RunInfo.xml").exists());
        assert!(!run.run_dir.exists());
        let archived = Run::new(&dest, &run.config)?;
        assert!(is_archived(&archived, &archive));

        fs::create_dir(&run.run_dir)?;
        assert!(archive_run(&run, &archive).is_err());
        assert!(run.run_dir.exists());
        Ok(())
    }
}
