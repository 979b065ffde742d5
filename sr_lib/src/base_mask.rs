//! Per-lane base masks: which cycles of each read are sequence (`Y`), index
//! (`I`) or ignored (`N`).
use crate::manifest::{parse_manifest, LaneIndexEntry, ManifestProvider};
use anyhow::Result;
use itertools::Itertools;
use serde::Serialize;
use sr_types::{ConfigurationError, ReadDescriptor, Run};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn index_token(read: &ReadDescriptor, index_size: usize) -> Result<String> {
    let cycles = read.num_cycles;
    if index_size > cycles {
        return Err(ConfigurationError::IndexTooLong {
            read: read.number,
            index_size,
            cycles,
        }
        .into());
    }
    Ok(match index_size {
        0 => format!("N{cycles}"),
        n if n == cycles => format!("I{cycles}"),
        n => format!("I{n}N{}", cycles - n),
    })
}

/// Compute the base mask tokens of a run, one per read.
///
/// Non-index reads are kept whole. The first index read covers `index_size`
/// cycles; the second covers `index2_size` cycles when `dual_index` is set
/// and is masked entirely otherwise. Any further index read is masked.
pub fn compute_base_mask(
    reads: &[ReadDescriptor],
    index_size: usize,
    dual_index: bool,
    index2_size: usize,
) -> Result<Vec<String>> {
    let mut seen_index_reads = 0;
    let mut mask = Vec::with_capacity(reads.len());
    for read in reads {
        if !read.is_indexed {
            mask.push(format!("Y{}", read.num_cycles));
            continue;
        }
        seen_index_reads += 1;
        mask.push(match seen_index_reads {
            1 => index_token(read, index_size)?,
            2 if dual_index => index_token(read, index2_size)?,
            _ => format!("N{}", read.num_cycles),
        });
    }
    Ok(mask)
}

/// Samples of one lane sharing a base mask.
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct MaskGroup {
    pub base_mask: Vec<String>,
    pub samples: Vec<LaneIndexEntry>,
}

/// lane -> mask key -> group. The key is the concatenated tokens, e.g. `Y151I7N3N10`.
#[derive(Serialize, Clone, PartialEq, Eq, Debug, Default)]
#[serde(transparent)]
pub struct BaseMaskPlan {
    pub lanes: BTreeMap<u32, BTreeMap<String, MaskGroup>>,
}

impl BaseMaskPlan {
    /// Group the samples of a manifest by lane and by the mask implied by
    /// their own index lengths. Samples keep their manifest order.
    pub fn new(entries: &[LaneIndexEntry], reads: &[ReadDescriptor]) -> Result<BaseMaskPlan> {
        let mut lanes: BTreeMap<u32, BTreeMap<String, MaskGroup>> = BTreeMap::new();
        for entry in entries {
            let index2_size = entry.index2_len();
            let base_mask =
                compute_base_mask(reads, entry.index_len(), index2_size > 0, index2_size)?;
            lanes
                .entry(entry.lane)
                .or_default()
                .entry(base_mask.concat())
                .or_insert_with(|| MaskGroup {
                    base_mask,
                    samples: Vec::new(),
                })
                .samples
                .push(entry.clone());
        }
        Ok(BaseMaskPlan { lanes })
    }

    /// `--use-bases-mask` values, one `<lane>:<tokens>` per lane. A single
    /// demultiplexing job applies one mask per lane, so a lane with several
    /// mask groups is rejected.
    pub fn lane_masks(&self, manifest: &Path) -> Result<Vec<String>> {
        self.lanes
            .iter()
            .map(|(&lane, groups)| {
                if groups.len() > 1 {
                    return Err(ConfigurationError::MixedBaseMasks {
                        path: manifest.to_path_buf(),
                        lane,
                        masks: groups.keys().join(", "),
                    }
                    .into());
                }
                let tokens = groups
                    .values()
                    .flat_map(|group| group.base_mask.iter())
                    .join(",");
                Ok(format!("{lane}:{tokens}"))
            })
            .collect()
    }

    /// Split into plans applying one mask per lane, each to be run by its own
    /// job. The n-th plan holds the n-th mask group, in key order, of every
    /// lane having that many groups. A plan without mixed lanes is returned
    /// whole.
    pub fn split_by_mask(&self) -> Vec<BaseMaskPlan> {
        let jobs = self.lanes.values().map(BTreeMap::len).max().unwrap_or(1);
        (0..jobs)
            .map(|n| BaseMaskPlan {
                lanes: self
                    .lanes
                    .iter()
                    .filter_map(|(&lane, groups)| {
                        let (key, group) = groups.iter().nth(n)?;
                        Some((lane, BTreeMap::from([(key.clone(), group.clone())])))
                    })
                    .collect(),
            })
            .collect()
    }

    /// The samples of every lane, in lane order.
    pub fn samples(&self) -> Vec<LaneIndexEntry> {
        self.lanes
            .values()
            .flat_map(|groups| groups.values())
            .flat_map(|group| group.samples.iter().cloned())
            .collect()
    }
}

/// Plan every manifest `provider` supplies for `run`. Fails with
/// [`ConfigurationError::ManifestNotFound`] when there is none.
pub fn plan_run(
    run: &Run,
    provider: &dyn ManifestProvider,
) -> Result<Vec<(PathBuf, BaseMaskPlan)>> {
    let manifests = provider.manifests(run)?;
    if manifests.is_empty() {
        return Err(ConfigurationError::ManifestNotFound {
            run: run.id.clone(),
        }
        .into());
    }
    manifests
        .into_iter()
        .map(|manifest| {
            let plan = BaseMaskPlan::new(&parse_manifest(&manifest)?, &run.setup.reads)?;
            Ok((manifest, plan))
        })
        .collect()
}
