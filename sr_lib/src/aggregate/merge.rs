//! Reassembly of the statistics written by several demultiplexing jobs.
//! Values are moved, never recomputed.
use anyhow::Result;
use serde_json::{Map, Value};
use sr_types::AggregationError;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level fields which must agree between jobs.
const RUN_FIELDS: [&str; 3] = ["Flowcell", "RunNumber", "RunId"];

fn malformed(path: &Path, reason: impl Into<String>) -> anyhow::Error {
    AggregationError::Malformed {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
    .into()
}

fn lane_of(path: &Path, record: &Value, key: &str) -> Result<u64> {
    record
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed(path, format!("record without a numeric {key}")))
}

/// Union of the per-lane records of `key`, ascending by lane. Records of a
/// lane reported by several jobs are combined by `combine`.
fn union_by_lane(
    docs: &[(PathBuf, Value)],
    key: &str,
    lane_key: &str,
    mut combine: impl FnMut(u64, &mut Value, Value) -> Result<()>,
) -> Result<Option<Value>> {
    let mut lanes: BTreeMap<u64, Value> = BTreeMap::new();
    let mut present = false;
    for (path, doc) in docs {
        let Some(records) = doc.get(key) else {
            continue;
        };
        present = true;
        let records = records
            .as_array()
            .ok_or_else(|| malformed(path, format!("{key} is not an array")))?;
        for record in records {
            let lane = lane_of(path, record, lane_key)?;
            match lanes.entry(lane) {
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                }
                Entry::Occupied(mut slot) => combine(lane, slot.get_mut(), record.clone())?,
            }
        }
    }
    Ok(present.then(|| Value::Array(lanes.into_values().collect())))
}

/// Append the samples of `other` to the `DemuxResults` of `lane`. Every
/// other field keeps the value of the first job.
fn combine_conversion_results(lane: u64, first: &mut Value, other: Value) -> Result<()> {
    let Some(Value::Array(extra)) = other.get("DemuxResults").cloned() else {
        return Ok(());
    };
    let Some(obj) = first.as_object_mut() else {
        return Ok(());
    };
    let Some(results) = obj
        .entry("DemuxResults")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
    else {
        return Ok(());
    };
    let mut seen: HashSet<String> = results
        .iter()
        .filter_map(|r| r.get("SampleId")?.as_str().map(String::from))
        .collect();
    for result in extra {
        if let Some(sample) = result.get("SampleId").and_then(Value::as_str) {
            if !seen.insert(sample.to_string()) {
                return Err(AggregationError::OverlappingSamples {
                    lane,
                    sample: sample.to_string(),
                }
                .into());
            }
        }
        results.push(result);
    }
    Ok(())
}

/// Merge the `Stats.json` documents of several jobs into one document shaped
/// like the output of a single job.
pub fn merge_stats_json(docs: &[(PathBuf, Value)]) -> Result<Value> {
    let Some((first_path, first)) = docs.first() else {
        return Ok(Value::Object(Map::new()));
    };
    let mut merged = first
        .as_object()
        .cloned()
        .ok_or_else(|| malformed(first_path, "not a JSON object"))?;

    for field in RUN_FIELDS {
        let Some(expected) = first.get(field) else {
            continue;
        };
        for (_, doc) in &docs[1..] {
            if let Some(value) = doc.get(field).filter(|&v| v != expected) {
                return Err(AggregationError::Inconsistent {
                    field: field.to_string(),
                    first: expected.to_string(),
                    second: value.to_string(),
                }
                .into());
            }
        }
    }

    if let Some(v) = union_by_lane(
        docs,
        "ConversionResults",
        "LaneNumber",
        combine_conversion_results,
    )? {
        merged.insert("ConversionResults".to_string(), v);
    }
    if let Some(v) = union_by_lane(docs, "ReadInfosForLanes", "LaneNumber", |_, _, _| Ok(()))? {
        merged.insert("ReadInfosForLanes".to_string(), v);
    }
    if let Some(v) = union_by_lane(docs, "UnknownBarcodes", "Lane", |_, _, _| Ok(()))? {
        merged.insert("UnknownBarcodes".to_string(), v);
    }
    Ok(Value::Object(merged))
}

/// Splice the content of every document's `<Flowcell>` element into the
/// `<Flowcell>` element of the first one.
pub fn merge_flowcell_xml(docs: &[(PathBuf, String)]) -> Result<String> {
    const CLOSE: &str = "</Flowcell>";
    let Some((first_path, first)) = docs.first() else {
        return Ok(String::new());
    };
    let close = first
        .find(CLOSE)
        .ok_or_else(|| malformed(first_path, "no <Flowcell> element"))?;
    // insert on the line holding the closing tag, if it stands alone
    let line_start = first[..close].rfind('\n').map_or(0, |i| i + 1);
    let insert_at = if first[line_start..close].trim().is_empty() {
        line_start
    } else {
        close
    };

    let mut spliced = String::new();
    for (path, doc) in &docs[1..] {
        let open = doc
            .find("<Flowcell")
            .and_then(|start| doc[start..].find('>').map(|end| start + end + 1))
            .ok_or_else(|| malformed(path, "no <Flowcell> element"))?;
        let end = doc[open..]
            .find(CLOSE)
            .map(|end| open + end)
            .ok_or_else(|| malformed(path, "unterminated <Flowcell> element"))?;
        let content = doc[open..end]
            .trim_start_matches(&['\n', '\r'][..])
            .trim_end_matches(&[' ', '\t'][..]);
        spliced.push_str(content);
        if !content.is_empty() && !content.ends_with('\n') {
            spliced.push('\n');
        }
    }

    let mut merged = String::with_capacity(first.len() + spliced.len());
    merged.push_str(&first[..insert_at]);
    merged.push_str(&spliced);
    merged.push_str(&first[insert_at..]);
    Ok(merged)
}

/// One header followed by the rows of every job, stable-sorted by the lane
/// in the first column.
pub fn merge_adapter_trimming(docs: &[(PathBuf, String)]) -> Result<String> {
    let mut header = None;
    let mut rows = Vec::new();
    for (path, doc) in docs {
        let mut lines = doc.lines().filter(|l| !l.trim().is_empty());
        let doc_header = lines
            .next()
            .ok_or_else(|| malformed(path, "empty adapter trimming report"))?;
        header.get_or_insert(doc_header);
        rows.extend(lines);
    }
    rows.sort_by_key(|row| {
        row.split('\t')
            .next()
            .and_then(|lane| lane.trim().parse::<u64>().ok())
            .unwrap_or(u64::MAX)
    });

    let mut merged = String::new();
    for line in header.into_iter().chain(rows) {
        merged.push_str(line);
        merged.push('\n');
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stats(lanes: &[u64], samples: &[&str]) -> Value {
        json!({
            "Flowcell": "FCIDXX",
            "RunNumber": 1,
            "RunId": "141124_ST-COMPLEX1_01_AFCIDXX",
            "ReadInfosForLanes": lanes.iter().map(|l| json!({"LaneNumber": l, "ReadInfos": []})).collect::<Vec<_>>(),
            "ConversionResults": lanes.iter().map(|l| json!({
                "LaneNumber": l,
                "TotalClustersRaw": 100,
                "DemuxResults": samples.iter().map(|s| json!({"SampleId": s, "NumberReads": 10})).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
            "UnknownBarcodes": lanes.iter().map(|l| json!({"Lane": l, "Barcodes": {}})).collect::<Vec<_>>(),
        })
    }

    fn lanes(doc: &Value, key: &str, lane_key: &str) -> Vec<u64> {
        doc[key]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r[lane_key].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_disjoint_lanes_are_unioned_in_order() -> Result<()> {
        let docs = vec![
            (PathBuf::from("Demultiplexing_0"), stats(&[3, 4], &["S3"])),
            (PathBuf::from("Demultiplexing_1"), stats(&[1, 2], &["S1"])),
        ];
        let merged = merge_stats_json(&docs)?;
        assert_eq!(lanes(&merged, "ConversionResults", "LaneNumber"), vec![1, 2, 3, 4]);
        assert_eq!(lanes(&merged, "ReadInfosForLanes", "LaneNumber"), vec![1, 2, 3, 4]);
        assert_eq!(lanes(&merged, "UnknownBarcodes", "Lane"), vec![1, 2, 3, 4]);
        assert_eq!(merged["Flowcell"], "FCIDXX");
        Ok(())
    }

    #[test]
    fn test_shared_lane_concatenates_samples() -> Result<()> {
        let docs = vec![
            (PathBuf::from("Demultiplexing_0"), stats(&[1], &["S1", "S2"])),
            (PathBuf::from("Demultiplexing_1"), stats(&[1], &["S3"])),
        ];
        let merged = merge_stats_json(&docs)?;
        let samples: Vec<_> = merged["ConversionResults"][0]["DemuxResults"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["SampleId"].as_str().unwrap())
            .collect();
        assert_eq!(samples, vec!["S1", "S2", "S3"]);
        assert_eq!(merged["ConversionResults"][0]["TotalClustersRaw"], 100);
        Ok(())
    }

    #[test]
    fn test_overlapping_samples_are_rejected() {
        let docs = vec![
            (PathBuf::from("Demultiplexing_0"), stats(&[1], &["S1"])),
            (PathBuf::from("Demultiplexing_1"), stats(&[1], &["S1"])),
        ];
        let err = merge_stats_json(&docs).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggregationError>(),
            Some(AggregationError::OverlappingSamples { lane: 1, .. })
        ));
    }

    #[test]
    fn test_inconsistent_flowcells_are_rejected() {
        let mut other = stats(&[2], &["S2"]);
        other["Flowcell"] = json!("OTHERFC");
        let docs = vec![
            (PathBuf::from("Demultiplexing_0"), stats(&[1], &["S1"])),
            (PathBuf::from("Demultiplexing_1"), other),
        ];
        let err = merge_stats_json(&docs).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggregationError>(),
            Some(AggregationError::Inconsistent { .. })
        ));
    }

    #[test]
    fn test_merge_flowcell_xml() -> Result<()> {
        let doc = |project: &str| {
            format!(
                "<?xml version=\"1.0\"?>\n<Stats>\n  <Flowcell flowcell-id=\"FCIDXX\">\n    \
                 <Project name=\"{project}\"/>\n  </Flowcell>\n</Stats>\n"
            )
        };
        let docs = vec![
            (PathBuf::from("a.xml"), doc("P1")),
            (PathBuf::from("b.xml"), doc("P2")),
        ];
        assert_eq!(
            merge_flowcell_xml(&docs)?,
            "<?xml version=\"1.0\"?>\n<Stats>\n  <Flowcell flowcell-id=\"FCIDXX\">\n    \
             <Project name=\"P1\"/>\n    <Project name=\"P2\"/>\n  </Flowcell>\n</Stats>\n"
        );

        let bad = vec![
            (PathBuf::from("a.xml"), doc("P1")),
            (PathBuf::from("b.xml"), "<Stats/>".to_string()),
        ];
        assert!(merge_flowcell_xml(&bad).is_err());
        Ok(())
    }

    #[test]
    fn test_merge_adapter_trimming() -> Result<()> {
        let header = "Lane\tProject\tSample Id\tSample Name\tSample Number\tRead\tTrimmed bases";
        let docs = vec![
            (
                PathBuf::from("a.txt"),
                format!("{header}\n2\tP1\tS1\tS1\t1\t1\t10\n2\tP1\tS1\tS1\t1\t2\t12\n"),
            ),
            (PathBuf::from("b.txt"), format!("{header}\n1\tP2\tS2\tS2\t1\t1\t7\n")),
        ];
        assert_eq!(
            merge_adapter_trimming(&docs)?,
            format!(
                "{header}\n1\tP2\tS2\tS2\t1\t1\t7\n2\tP1\tS1\tS1\t1\t1\t10\n2\tP1\tS1\tS1\t1\t2\t12\n"
            )
        );
        Ok(())
    }
}
