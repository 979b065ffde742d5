//! Reassembly of the `lane.html` and `laneBarcode.html` reports written by
//! bcl2fastq. Only the table whose first column is `Lane` is rewritten; the
//! rest of the first job's page is kept as is.
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use sr_types::AggregationError;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref TABLE: Regex = Regex::new(r"(?is)<table[^>]*>.*?</table>").unwrap();
    static ref ROW: Regex = Regex::new(r"(?is)<tr[^>]*>.*?</tr>").unwrap();
    static ref CELL: Regex = Regex::new(r"(?is)<t([hd])[^>]*>(.*?)</t[hd]>").unwrap();
}

/// How rows of the same lane from different jobs are combined.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LaneRows {
    /// `lane.html`: one row per lane, the first job reporting a lane wins.
    Union,
    /// `laneBarcode.html`: one row per sample, all rows are kept.
    Concat,
}

impl LaneRows {
    pub fn for_report(file_name: &str) -> Option<LaneRows> {
        match file_name {
            "lane.html" => Some(LaneRows::Union),
            "laneBarcode.html" => Some(LaneRows::Concat),
            _ => None,
        }
    }
}

struct LaneTable<'a> {
    /// Byte range of the whole `<table>` element in the page.
    span: Range<usize>,
    /// Table text up to the first row after the header.
    head: &'a str,
    rows: Vec<(u64, &'a str)>,
    /// Table text after the last row, closing tags included.
    tail: &'a str,
}

fn first_cell(row: &str) -> Option<(bool, String)> {
    CELL.captures(row)
        .map(|c| (&c[1] == "h" || &c[1] == "H", c[2].trim().to_string()))
}

fn lane_table<'a>(path: &Path, html: &'a str) -> Result<LaneTable<'a>> {
    for table in TABLE.find_iter(html) {
        let text = table.as_str();
        let mut rows = ROW.find_iter(text);
        let Some(header) = rows.next() else {
            continue;
        };
        match first_cell(header.as_str()) {
            Some((true, name)) if name.eq_ignore_ascii_case("Lane") => {}
            _ => continue,
        }
        let mut lane_rows = Vec::new();
        let mut rows_start = None;
        let mut rows_end = header.end();
        for row in rows {
            let cell = first_cell(row.as_str());
            if matches!(cell, Some((true, _))) {
                // footer rows stay with the closing tags
                break;
            }
            let lane = cell
                .and_then(|(_, lane)| lane.parse().ok())
                .ok_or_else(|| AggregationError::Malformed {
                    path: path.to_path_buf(),
                    reason: format!("row without a lane number: {}", row.as_str()),
                })?;
            lane_rows.push((lane, row.as_str()));
            rows_start.get_or_insert(row.start());
            rows_end = row.end();
        }
        return Ok(LaneTable {
            span: table.range(),
            head: &text[..rows_start.unwrap_or(header.end())],
            rows: lane_rows,
            tail: &text[rows_end..],
        });
    }
    Err(AggregationError::Malformed {
        path: path.to_path_buf(),
        reason: "no table with a Lane column".to_string(),
    }
    .into())
}

/// Merge the same report of several jobs into the page of the first one,
/// with rows ordered by lane.
pub fn merge_lane_report(docs: &[(PathBuf, String)], mode: LaneRows) -> Result<String> {
    let Some((first_path, first)) = docs.first() else {
        return Ok(String::new());
    };
    let base = lane_table(first_path, first)?;

    let mut by_lane: BTreeMap<u64, Vec<&str>> = BTreeMap::new();
    let tables = std::iter::once(Ok(base.rows.clone()))
        .chain(docs[1..].iter().map(|(p, d)| lane_table(p, d).map(|t| t.rows)));
    for rows in tables {
        for (lane, row) in rows? {
            let slot = by_lane.entry(lane).or_default();
            if mode == LaneRows::Concat || slot.is_empty() {
                slot.push(row);
            }
        }
    }

    let mut merged = String::with_capacity(first.len());
    merged.push_str(&first[..base.span.start]);
    merged.push_str(base.head);
    if base.rows.is_empty() {
        merged.push('\n');
    }
    let rows: Vec<&str> = by_lane.into_values().flatten().collect();
    merged.push_str(&rows.join("\n"));
    merged.push_str(base.tail);
    merged.push_str(&first[base.span.end..]);
    Ok(merged)
}
