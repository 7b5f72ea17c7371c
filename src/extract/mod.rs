// src/extract/mod.rs

pub mod convert;
pub mod date_parser;
pub mod utils;

pub use convert::to_record_batch;

use csv::ReaderBuilder;
use glob::glob;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

use crate::config::{Locator, PipelineConfig};
use crate::entity::Entity;
use crate::error::{PipelineError, Result};
use utils::{clean_str, partition_id, strip_bom};

/// Candidate field separators, checked against the header line.
const DELIMITERS: &[u8] = b",;\t|";

#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    /// Column names, verbatim from the first line of the source.
    pub headers: Vec<String>,
    /// One Vec of cleaned cell strings per data line.
    pub rows: Vec<Vec<String>>,
    /// File the table was read from.
    pub source: PathBuf,
    /// Partition identifier (file stem), used to order unified partitions.
    pub partition: String,
}

impl RawTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Expand every locator to the files it names. A locator that matches
/// nothing fails the entity with `SourceNotFound`.
pub fn resolve_sources(config: &PipelineConfig, locators: &[Locator]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for loc in locators {
        let mut path = config.resolve(loc)?;
        if path.is_dir() {
            path = path.join("*.csv");
        }
        let mut matched: Vec<PathBuf> = glob(&path.to_string_lossy())?
            .filter_map(|entry| match entry {
                Ok(p) if p.is_file() => Some(p),
                Ok(_) => None,
                Err(e) => {
                    warn!(locator = %loc, "unreadable glob entry: {}", e);
                    None
                }
            })
            .collect();
        if matched.is_empty() {
            return Err(PipelineError::SourceNotFound {
                locator: loc.to_string(),
            });
        }
        matched.sort();
        debug!(locator = %loc, files = matched.len(), "resolved source");
        files.extend(matched);
    }
    files.dedup();
    Ok(files)
}

/// Read every raw partition of `entity`, in path order.
pub fn extract_entity(config: &PipelineConfig, entity: Entity) -> Result<Vec<RawTable>> {
    let files = resolve_sources(config, &config.source_locators(entity))?;
    files.iter().map(read_raw_table).collect()
}

/// Pick the single delimiter used by the header line.
fn detect_delimiter(header_line: &str, path: &Path) -> Result<u8> {
    let present: Vec<u8> = DELIMITERS
        .iter()
        .copied()
        .filter(|d| header_line.as_bytes().contains(d))
        .collect();
    match present.as_slice() {
        [] => Ok(b','),
        [one] => Ok(*one),
        many => Err(PipelineError::SchemaInference {
            path: path.to_path_buf(),
            reason: format!(
                "header mixes delimiters {:?}",
                many.iter().map(|b| *b as char).collect::<String>()
            ),
        }),
    }
}

/// Parse one delimited source into a `RawTable`. Every data line must have
/// exactly as many fields as the header.
#[instrument(level = "info", skip(path), fields(path = %path.as_ref().display()))]
pub fn read_raw_table<P: AsRef<Path>>(path: P) -> Result<RawTable> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let text = String::from_utf8(bytes).map_err(|e| PipelineError::SchemaInference {
        path: path.to_path_buf(),
        reason: format!(
            "invalid UTF-8 at byte {}",
            e.utf8_error().valid_up_to()
        ),
    })?;
    let text = strip_bom(&text);

    let header_line = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| PipelineError::SchemaInference {
            path: path.to_path_buf(),
            reason: "source is empty".into(),
        })?;
    let delimiter = detect_delimiter(header_line, path)?;

    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = rdr.headers()?.iter().map(clean_str).collect();
    let mut seen = HashSet::new();
    for h in &headers {
        if h.is_empty() || !seen.insert(h.as_str()) {
            return Err(PipelineError::SchemaInference {
                path: path.to_path_buf(),
                reason: format!("empty or duplicate column name {:?}", h),
            });
        }
    }

    let mut rows = Vec::new();
    for (idx, result) in rdr.records().enumerate() {
        let record = result?;
        if record.len() != headers.len() {
            return Err(PipelineError::SchemaInference {
                path: path.to_path_buf(),
                reason: format!(
                    "record {} has {} fields, header has {}",
                    idx + 1,
                    record.len(),
                    headers.len()
                ),
            });
        }
        rows.push(record.iter().map(clean_str).collect());
    }

    debug!(columns = headers.len(), rows = rows.len(), "read raw table");
    Ok(RawTable {
        headers,
        rows,
        source: path.to_path_buf(),
        partition: partition_id(path),
    })
}
