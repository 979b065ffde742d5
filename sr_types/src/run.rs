//! A sequencing run directory and its read setup.
use crate::config::InstrumentConfig;
use crate::errors::RunSetupError;
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref READ_ELEMENT: Regex = Regex::new(r"<Read\s+([^>]*?)/?>").unwrap();
    static ref XML_ATTRIBUTE: Regex = Regex::new(r#"(\w+)\s*=\s*"([^"]*)""#).unwrap();
}

/// One read of the run setup, in instrument order.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReadDescriptor {
    pub number: u32,
    pub num_cycles: usize,
    pub is_indexed: bool,
}

impl ReadDescriptor {
    pub fn new(number: u32, num_cycles: usize, is_indexed: bool) -> ReadDescriptor {
        ReadDescriptor {
            number,
            num_cycles,
            is_indexed,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct RunSetup {
    pub reads: Vec<ReadDescriptor>,
}

impl RunSetup {
    /// Parse the `<Read Number=".." NumCycles=".." IsIndexedRead=".."/>`
    /// elements of a `RunInfo.xml` document. Attributes may come in any order.
    pub fn from_run_info(contents: &str) -> Result<RunSetup, String> {
        let mut reads = Vec::new();
        for element in READ_ELEMENT.captures_iter(contents) {
            let attrs: HashMap<&str, &str> = XML_ATTRIBUTE
                .captures_iter(element.get(1).map_or("", |m| m.as_str()))
                .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
                .collect();
            let get = |name: &str| {
                attrs
                    .get(name)
                    .copied()
                    .ok_or_else(|| format!("<Read> element without a {name} attribute"))
            };
            let number = get("Number")?;
            let cycles = get("NumCycles")?;
            reads.push(ReadDescriptor {
                number: number
                    .parse()
                    .map_err(|_| format!("invalid read number '{number}'"))?,
                num_cycles: cycles
                    .parse()
                    .map_err(|_| format!("invalid cycle count '{cycles}'"))?,
                is_indexed: matches!(get("IsIndexedRead")?, "Y" | "y" | "true" | "True"),
            });
        }
        if reads.is_empty() {
            return Err("no <Read> elements".to_string());
        }
        reads.sort_by_key(|r| r.number);
        Ok(RunSetup { reads })
    }

    /// Parse an Element `RunParameters.json`, whose `Cycles` object lists the
    /// reads as `R1`, `I1`, `I2`, `R2`.
    pub fn from_run_parameters(contents: &str) -> Result<RunSetup, String> {
        #[derive(Deserialize)]
        struct RunParameters {
            #[serde(rename = "Cycles")]
            cycles: HashMap<String, usize>,
        }
        let params: RunParameters = serde_json::from_str(contents).map_err(|e| e.to_string())?;
        let reads: Vec<_> = ["R1", "I1", "I2", "R2"]
            .into_iter()
            .filter_map(|name| params.cycles.get(name).map(|&c| (name, c)))
            .filter(|&(_, cycles)| cycles > 0)
            .zip(1..)
            .map(|((name, cycles), number)| {
                ReadDescriptor::new(number, cycles, name.starts_with('I'))
            })
            .collect();
        if reads.is_empty() {
            return Err("no reads listed under Cycles".to_string());
        }
        Ok(RunSetup { reads })
    }

    pub fn total_cycles(&self) -> usize {
        self.reads.iter().map(|r| r.num_cycles).sum()
    }
}

/// A run directory tracked through the lifecycle. The status is not stored
/// here; it is derived from the filesystem on every poll.
#[derive(Clone, Debug)]
pub struct Run {
    pub run_dir: PathBuf,
    pub id: String,
    pub flowcell_id: String,
    pub setup: RunSetup,
    pub config: InstrumentConfig,
}

impl Display for Run {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

impl Run {
    /// Construct a run from its directory. Fails with a [`RunSetupError`] when
    /// the directory or its read setup descriptor is missing or unusable.
    pub fn new(run_dir: &Path, config: &InstrumentConfig) -> Result<Run> {
        if !run_dir.is_dir() {
            return Err(RunSetupError::MissingRunDir {
                path: run_dir.to_path_buf(),
            }
            .into());
        }
        let id = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RunSetupError::MissingRunDir {
                path: run_dir.to_path_buf(),
            })?;
        let setup = match config.run_setup_file.as_deref().filter(|f| !f.is_empty()) {
            Some(setup_file) => read_setup(&run_dir.join(setup_file))?,
            None if config.demultiplex => {
                return Err(RunSetupError::IncompleteConfig(
                    "run_setup_file is required when demultiplex is enabled".to_string(),
                )
                .into())
            }
            None => RunSetup::default(),
        };
        let flowcell_id = flowcell_id(&id, config)?;
        Ok(Run {
            run_dir: run_dir.to_path_buf(),
            id,
            flowcell_id,
            setup,
            config: config.clone(),
        })
    }

    /// Canonical demultiplexing output directory.
    pub fn demux_dir(&self) -> PathBuf {
        self.run_dir.join(&self.config.demux_dir)
    }

    /// Output directory of sub-job `n`, used when the run has several manifests.
    pub fn sub_demux_dir(&self, n: usize) -> PathBuf {
        self.run_dir.join(format!("{}_{n}", self.config.demux_dir))
    }

    /// Existing numbered sub-job directories, ordered by number.
    pub fn sub_demux_dirs(&self) -> Result<Vec<PathBuf>> {
        let re = Regex::new(&format!(r"^{}_(\d+)$", regex::escape(&self.config.demux_dir)))?;
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.run_dir)
            .with_context(|| self.run_dir.display().to_string())?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(n) = re.captures(&name).and_then(|c| c[1].parse::<u64>().ok()) {
                if entry.path().is_dir() {
                    found.push((n, entry.path()));
                }
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// Final statistics file of a demultiplexing output directory.
    pub fn final_stats_path(&self, demux_dir: &Path) -> PathBuf {
        demux_dir
            .join(&self.config.stats_dir)
            .join(&self.config.final_stats_file)
    }

    pub fn sequencing_marker_path(&self) -> PathBuf {
        self.run_dir.join(&self.config.sequencing_done_marker)
    }

    pub fn transfer_marker_path(&self) -> PathBuf {
        self.run_dir.join(&self.config.transfer_marker)
    }
}

fn read_setup(path: &Path) -> Result<RunSetup> {
    if !path.is_file() {
        return Err(RunSetupError::MissingDescriptor {
            path: path.to_path_buf(),
        }
        .into());
    }
    let contents = fs::read_to_string(path).with_context(|| path.display().to_string())?;
    let parsed = if path.extension().is_some_and(|ext| ext == "json") {
        RunSetup::from_run_parameters(&contents)
    } else {
        RunSetup::from_run_info(&contents)
    };
    Ok(parsed.map_err(|reason| RunSetupError::InvalidDescriptor {
        path: path.to_path_buf(),
        reason,
    })?)
}

fn flowcell_id(run_id: &str, config: &InstrumentConfig) -> Result<String> {
    let re = config.run_regex()?;
    if let Some(m) = re.captures(run_id).and_then(|c| c.name("flowcell")) {
        return Ok(m.as_str().to_string());
    }
    let last = run_id.rsplit('_').next().unwrap_or(run_id);
    let stripped = last
        .strip_prefix('A')
        .or_else(|| last.strip_prefix('B'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(last);
    Ok(stripped.to_string())
}
