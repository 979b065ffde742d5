//! Sample sheets: locating them for a run and reading their `[Data]` table.
use anyhow::{Context, Result};
use csv::StringRecord;
use log::info;
use regex::Regex;
use serde::Serialize;
use sr_types::{ConfigurationError, Run};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One sample of a manifest, bound to a lane.
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct LaneIndexEntry {
    pub lane: u32,
    pub sample_id: String,
    pub sample_name: String,
    pub project: String,
    pub index: String,
    pub index2: Option<String>,
}

fn index_len(index: &str) -> usize {
    if index.eq_ignore_ascii_case("NoIndex") {
        0
    } else {
        index.len()
    }
}

impl LaneIndexEntry {
    pub fn index_len(&self) -> usize {
        index_len(&self.index)
    }

    pub fn index2_len(&self) -> usize {
        self.index2.as_deref().map_or(0, index_len)
    }
}

const DATA_COLUMNS: [&str; 6] = [
    "Lane",
    "Sample_ID",
    "Sample_Name",
    "Sample_Project",
    "index",
    "index2",
];

fn is_section(line: &str) -> bool {
    line.trim_start().starts_with('[')
}

fn is_data_header(line: &str) -> bool {
    line.trim_start().starts_with("[Data]")
}

/// Lines of the `[Data]` section, or the whole text if it has no sections.
fn data_section(contents: &str) -> String {
    if !contents.lines().any(is_section) {
        return contents.to_string();
    }
    contents
        .lines()
        .skip_while(|line| !is_data_header(line))
        .skip(1)
        .take_while(|line| !is_section(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The lines before and after the `[Data]` section.
fn surrounding_sections(contents: &str) -> (Vec<&str>, Vec<&str>) {
    if !contents.lines().any(is_section) {
        return (Vec::new(), Vec::new());
    }
    let before = contents.lines().take_while(|line| !is_data_header(line)).collect();
    let after = contents
        .lines()
        .skip_while(|line| !is_data_header(line))
        .skip(1)
        .skip_while(|line| !is_section(line))
        .collect();
    (before, after)
}

fn read_manifest(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|err| {
        ConfigurationError::ManifestParse {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
        .into()
    })
}

/// Parse the samples of a manifest, in file order.
pub fn parse_manifest(path: &Path) -> Result<Vec<LaneIndexEntry>> {
    let contents = read_manifest(path)?;
    parse_manifest_str(&contents).map_err(|reason| {
        ConfigurationError::ManifestParse {
            path: path.to_path_buf(),
            reason,
        }
        .into()
    })
}

/// Write a manifest holding `entries` as its `[Data]` section. The other
/// sections are taken from `template`.
pub fn write_manifest(path: &Path, template: &Path, entries: &[LaneIndexEntry]) -> Result<()> {
    let contents = read_manifest(template)?;
    let (before, after) = surrounding_sections(&contents);

    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(DATA_COLUMNS)?;
    for entry in entries {
        let lane = entry.lane.to_string();
        wtr.write_record([
            lane.as_str(),
            entry.sample_id.as_str(),
            entry.sample_name.as_str(),
            entry.project.as_str(),
            entry.index.as_str(),
            entry.index2.as_deref().unwrap_or_default(),
        ])?;
    }
    let data = String::from_utf8(wtr.into_inner()?)?;

    let mut out = String::new();
    for line in before {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("[Data]\n");
    out.push_str(&data);
    for line in after {
        out.push_str(line);
        out.push('\n');
    }
    fs::write(path, out).with_context(|| path.display().to_string())
}

fn parse_manifest_str(contents: &str) -> Result<Vec<LaneIndexEntry>, String> {
    let data = data_section(contents);
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(data.as_bytes());
    let mut headers = rdr.headers().map_err(|e| e.to_string())?.clone();
    headers.trim();
    let col_map: HashMap<&str, usize> = headers.iter().enumerate().map(|(i, h)| (h, i)).collect();
    if !col_map.contains_key("Sample_ID") {
        return Err("no Sample_ID column in the [Data] section".to_string());
    }

    let mut entries = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let mut record: StringRecord = record.map_err(|e| e.to_string())?;
        record.trim();
        if record.iter().all(str::is_empty) {
            continue;
        }
        let get = |col: &str| -> String {
            col_map
                .get(col)
                .and_then(|&i| record.get(i))
                .unwrap_or_default()
                .to_string()
        };
        let lane = match get("Lane").as_str() {
            "" => 1,
            lane => lane
                .parse()
                .map_err(|_| format!("invalid lane '{lane}' on data line {}", line + 1))?,
        };
        let index2 = Some(get("index2")).filter(|i| !i.is_empty());
        entries.push(LaneIndexEntry {
            lane,
            sample_id: get("Sample_ID"),
            sample_name: get("Sample_Name"),
            project: get("Sample_Project"),
            index: get("index"),
            index2,
        });
    }
    Ok(entries)
}

/// Manifests stored in the run directory, ordered by their numeric suffix
/// (`SampleSheet.csv` first), then by name.
pub fn local_manifests(run: &Run) -> Result<Vec<PathBuf>> {
    let re = Regex::new(&format!(
        r"^{}(?:_(\d+))?\.{}$",
        regex::escape(&run.config.manifest_stem),
        regex::escape(&run.config.manifest_ext)
    ))?;
    let mut found = Vec::new();
    for entry in fs::read_dir(&run.run_dir).with_context(|| run.run_dir.display().to_string())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(caps) = re.captures(&name) {
            let suffix = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
            found.push((suffix, name, entry.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, _, path)| path).collect())
}

/// Supplies the manifests of a run.
pub trait ManifestProvider {
    /// Manifests to demultiplex `run` with, in processing order. Empty if
    /// none can be located.
    fn manifests(&self, run: &Run) -> Result<Vec<PathBuf>>;
}

/// Reads manifests from the run directory, falling back to a
/// `<flowcell>.<ext>` file in one of `manifest_dirs`, which is copied into
/// the run directory.
pub struct FsManifestProvider {
    pub manifest_dirs: Vec<PathBuf>,
}

impl ManifestProvider for FsManifestProvider {
    fn manifests(&self, run: &Run) -> Result<Vec<PathBuf>> {
        let local = local_manifests(run)?;
        if !local.is_empty() {
            return Ok(local);
        }
        let name = format!("{}.{}", run.flowcell_id, run.config.manifest_ext);
        let Some(external) = self
            .manifest_dirs
            .iter()
            .map(|dir| dir.join(&name))
            .find(|path| path.is_file())
        else {
            return Ok(Vec::new());
        };
        let dest = run
            .run_dir
            .join(format!("{}.{}", run.config.manifest_stem, run.config.manifest_ext));
        info!("{run}: copying manifest {}", external.display());
        fs::copy(&external, &dest).with_context(|| dest.display().to_string())?;
        Ok(vec![dest])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sr_types::InstrumentConfig;
    use tempfile::tempdir;

    const SECTIONED: &str = "\
[Header]
Date,2018-01-01
[Reads]
151
151
[Data]
Lane,Sample_ID,Sample_Name,Sample_Plate,Sample_Well,I7_Index_ID,index,I5_Index_ID,index2,Sample_Project,Description
1,Sample_P10000_1001,Sample_P10000_1001,,,,CGCGCAG,,CTGCGCG,A_Test_18_01,
1,Sample_P10000_1005,Sample_P10000_1005,,,,AGGTACC,,,A_Test_18_01,
,,,,,,,,,,
";

    #[test]
    fn test_parse_sectioned_manifest() {
        let entries = parse_manifest_str(SECTIONED).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            LaneIndexEntry {
                lane: 1,
                sample_id: "Sample_P10000_1001".to_string(),
                sample_name: "Sample_P10000_1001".to_string(),
                project: "A_Test_18_01".to_string(),
                index: "CGCGCAG".to_string(),
                index2: Some("CTGCGCG".to_string()),
            }
        );
        assert_eq!(entries[1].index2, None);
        assert_eq!(entries[1].index2_len(), 0);
    }

    #[test]
    fn test_parse_plain_manifest() {
        let entries =
            parse_manifest_str("Sample_ID,Sample_Project,index\nS1,P1,NoIndex\nS2,P1,ACGT\n")
                .unwrap();
        assert_eq!(entries.iter().map(|e| e.lane).collect::<Vec<_>>(), vec![1, 1]);
        assert_eq!(entries[0].index_len(), 0);
        assert_eq!(entries[1].index_len(), 4);
    }

    #[test]
    fn test_parse_errors() -> Result<()> {
        assert!(parse_manifest_str("[Data]\nLane,index\n1,ACGT\n").is_err());
        assert!(parse_manifest_str("Lane,Sample_ID\nx,S1\n").is_err());

        let dir = tempdir()?;
        let path = dir.path().join("SampleSheet.csv");
        fs::write(&path, "[Data]\nLane,index\n1,ACGT\n")?;
        let err = parse_manifest(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigurationError>(),
            Some(ConfigurationError::ManifestParse { .. })
        ));

        // present but unreadable
        let err = parse_manifest(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigurationError>(),
            Some(ConfigurationError::ManifestParse { path, .. }) if path == dir.path()
        ));
        Ok(())
    }

    #[test]
    fn test_write_manifest_keeps_other_sections() -> Result<()> {
        let dir = tempdir()?;
        let template = dir.path().join("SampleSheet.csv");
        fs::write(&template, format!("{SECTIONED}[Settings]\nAdapter,AGATCGGAAGAGC\n"))?;
        let entries = parse_manifest(&template)?;

        let path = dir.path().join("SampleSheet_1.csv");
        write_manifest(&path, &template, &entries[1..])?;
        let written = fs::read_to_string(&path)?;
        assert!(written.starts_with("[Header]\nDate,2018-01-01\n[Reads]\n151\n151\n[Data]\n"));
        assert!(written.contains(
            "Lane,Sample_ID,Sample_Name,Sample_Project,index,index2\n\
             1,Sample_P10000_1005,Sample_P10000_1005,A_Test_18_01,AGGTACC,\n"
        ));
        assert!(written.ends_with("[Settings]\nAdapter,AGATCGGAAGAGC\n"));
        assert_eq!(parse_manifest(&path)?, entries[1..].to_vec());
        Ok(())
    }

    fn make_run(root: &Path) -> Result<Run> {
        let run_dir = root.join("141124_ST-DUMMY1_01_AFCIDXX");
        fs::create_dir(&run_dir)?;
        fs::write(
            run_dir.join("RunInfo.xml"),
            r#"<Read Number="1" NumCycles="151" IsIndexedRead="N"/>"#,
        )?;
        Run::new(&run_dir, &InstrumentConfig::default())
    }

    #[test]
    fn test_local_manifest_order() -> Result<()> {
        let dir = tempdir()?;
        let run = make_run(dir.path())?;
        for name in [
            "SampleSheet_10.csv",
            "SampleSheet_2.csv",
            "SampleSheet.csv",
            "SampleSheet_x.csv",
            "SampleSheet_1.txt",
        ] {
            fs::write(run.run_dir.join(name), SECTIONED)?;
        }
        let names: Vec<_> = local_manifests(&run)?
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["SampleSheet.csv", "SampleSheet_2.csv", "SampleSheet_10.csv"]
        );
        Ok(())
    }

    #[test]
    fn test_external_manifest_is_copied() -> Result<()> {
        let dir = tempdir()?;
        let run = make_run(dir.path())?;
        let lims = dir.path().join("lims");
        fs::create_dir(&lims)?;

        let provider = FsManifestProvider {
            manifest_dirs: vec![dir.path().join("missing"), lims.clone()],
        };
        assert!(provider.manifests(&run)?.is_empty());

        fs::write(lims.join("FCIDXX.csv"), SECTIONED)?;
        let manifests = provider.manifests(&run)?;
        assert_eq!(manifests, vec![run.run_dir.join("SampleSheet.csv")]);
        assert_eq!(fs::read_to_string(&manifests[0])?, SECTIONED);
        Ok(())
    }
}
