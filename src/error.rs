// src/error.rs

use serde::Serialize;
use std::{fmt, io, path::PathBuf};
use thiserror::Error;

/// Fatal failures of one entity pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no source files match `{locator}`")]
    SourceNotFound { locator: String },

    #[error("cannot infer schema of {path:?}: {reason}")]
    SchemaInference { path: PathBuf, reason: String },

    #[error("schema drift in `{entity}` partition `{partition}`: {detail}")]
    SchemaDrift {
        entity: String,
        partition: String,
        detail: String,
    },

    #[error("`{entity}` is missing required column `{column}`")]
    MissingColumn { entity: String, column: String },

    #[error("output `{locator}` is locked by another writer")]
    WriteConflict { locator: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("secret `{key}` unavailable in scope `{scope}`")]
    Secret { scope: String, key: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

impl PipelineError {
    /// Short taxonomy name used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceNotFound { .. } => "SourceNotFound",
            Self::SchemaInference { .. } => "SchemaInferenceError",
            Self::SchemaDrift { .. } => "SchemaDriftError",
            Self::MissingColumn { .. } => "MissingColumn",
            Self::WriteConflict { .. } => "WriteConflict",
            Self::Config(_) => "ConfigError",
            Self::Secret { .. } => "SecretError",
            Self::Io(_) | Self::Arrow(_) | Self::Parquet(_) | Self::Csv(_) | Self::Pattern(_) => {
                "IoError"
            }
        }
    }

    /// Only lock contention is worth retrying from the outside.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A value that failed type coercion and was replaced with null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueCoercionWarning {
    pub column: String,
    pub count: usize,
    /// First offending raw value, kept for the log line.
    pub sample: String,
}

/// Non-fatal findings collected while an entity runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum Warning {
    ValueCoercion(ValueCoercionWarning),
    /// Same row key seen in more than one Sales partition. Rows are kept.
    DuplicateRowKeys { columns: Vec<String>, count: usize },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::ValueCoercion(w) => write!(
                f,
                "{} value(s) in `{}` could not be coerced (e.g. {:?})",
                w.count, w.column, w.sample
            ),
            Warning::DuplicateRowKeys { columns, count } => write!(
                f,
                "{} duplicate row key(s) on ({}) across partitions",
                count,
                columns.join(", ")
            ),
        }
    }
}

/// Tracks coercion failures per column; folds into `Warning`s at the end.
#[derive(Debug, Default)]
pub struct CoercionTally {
    entries: Vec<ValueCoercionWarning>,
}

impl CoercionTally {
    pub fn record(&mut self, column: &str, raw: &str) {
        match self.entries.iter_mut().find(|w| w.column == column) {
            Some(w) => w.count += 1,
            None => self.entries.push(ValueCoercionWarning {
                column: column.to_string(),
                count: 1,
                sample: raw.to_string(),
            }),
        }
    }

    pub fn merge(&mut self, other: CoercionTally) {
        for w in other.entries {
            match self.entries.iter_mut().find(|e| e.column == w.column) {
                Some(e) => e.count += w.count,
                None => self.entries.push(w),
            }
        }
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.entries.into_iter().map(Warning::ValueCoercion).collect()
    }
}
