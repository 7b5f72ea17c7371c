// src/unify/mod.rs

use arrow::{
    array::{Array, ArrayRef, Float64Array, StringArray, TimestampMicrosecondBuilder},
    compute::{cast, concat_batches},
    datatypes::{DataType, Field, Schema, TimeUnit},
    record_batch::RecordBatch,
    util::display::array_value_to_string,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};

use crate::config::SalesRules;
use crate::entity::Entity;
use crate::error::{CoercionTally, PipelineError, Result, Warning};
use crate::extract::date_parser;
use crate::normalize::upsert_column;
use crate::schema::{column_type_of, map_to_arrow_type};

static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\D)((?:19|20)\d{2})(?:\D|$)").expect("static regex"));

/// One normalized source partition, e.g. a yearly Sales extract.
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: String,
    pub batch: RecordBatch,
}

impl Partition {
    pub fn new(id: impl Into<String>, batch: RecordBatch) -> Self {
        Self {
            id: id.into(),
            batch,
        }
    }

    /// First `19xx`/`20xx` run in the identifier.
    pub fn year(&self) -> Option<i32> {
        YEAR_RE
            .captures(&self.id)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

#[derive(Debug)]
pub struct Unified {
    pub batch: RecordBatch,
    /// Partition ids in concatenation order.
    pub order: Vec<String>,
    pub warnings: Vec<Warning>,
}

/// Merge schema-identical partitions and apply the Sales fixes.
///
/// Partitions are concatenated chronologically, ties broken by identifier.
/// Any difference in column names or order is schema drift and nothing is
/// produced. Storage is never touched.
#[instrument(level = "info", skip_all, fields(entity = %entity, partitions = partitions.len()))]
pub fn unify(entity: Entity, partitions: Vec<Partition>, rules: &SalesRules) -> Result<Unified> {
    let partitions = prepare(entity, partitions)?;

    let mut warnings = Vec::new();
    if let Some(w) = detect_duplicate_keys(&partitions, &rules.key_columns)? {
        warn!(entity = %entity, "{}", w);
        warnings.push(w);
    }

    let order: Vec<String> = partitions.iter().map(|p| p.id.clone()).collect();
    let schema = partitions[0].batch.schema();
    let batch = concat_batches(&schema, partitions.iter().map(|p| &p.batch))?;
    debug!(rows = batch.num_rows(), "concatenated partitions");

    let mut tally = CoercionTally::default();
    let batch = coerce_timestamp(entity, batch, &rules.stock_date_column, &mut tally)?;
    let batch = substitute_order_numbers(entity, batch, &rules.order_number_column)?;
    let batch = derive_multiply(
        entity,
        batch,
        &rules.quantity_column,
        &rules.price_column,
        &rules.multiply_column,
    )?;

    for w in tally.into_warnings() {
        warn!(entity = %entity, "{}", w);
        warnings.push(w);
    }

    info!(rows = batch.num_rows(), order = ?order, "unified");
    Ok(Unified {
        batch,
        order,
        warnings,
    })
}

/// Order, verify and type-align partitions ahead of concatenation.
fn prepare(entity: Entity, mut partitions: Vec<Partition>) -> Result<Vec<Partition>> {
    if partitions.is_empty() {
        return Err(PipelineError::SourceNotFound {
            locator: format!("{} partitions", entity),
        });
    }
    order_partitions(&mut partitions);
    verify_schemas(entity, &partitions)?;
    align_types(partitions)
}

/// Plain row-wise merge, for entities without post-transforms that happen
/// to match more than one source file.
pub fn concat_partitions(entity: Entity, partitions: Vec<Partition>) -> Result<(RecordBatch, Vec<String>)> {
    let partitions = prepare(entity, partitions)?;
    let order = partitions.iter().map(|p| p.id.clone()).collect();
    let schema = partitions[0].batch.schema();
    let batch = concat_batches(&schema, partitions.iter().map(|p| &p.batch))?;
    Ok((batch, order))
}

/// Ascending year; year-less ids after dated ones; ties by id.
pub fn order_partitions(partitions: &mut [Partition]) {
    partitions.sort_by(|a, b| {
        let (ya, yb) = (a.year(), b.year());
        (ya.is_none(), ya, &a.id).cmp(&(yb.is_none(), yb, &b.id))
    });
}

fn column_names(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}

/// Every partition must carry exactly the first partition's columns, in order.
pub fn verify_schemas(entity: Entity, partitions: &[Partition]) -> Result<()> {
    let Some(first) = partitions.first() else {
        return Ok(());
    };
    let expected = column_names(&first.batch);

    for part in &partitions[1..] {
        let found = column_names(&part.batch);
        if found == expected {
            continue;
        }

        let exp: BTreeSet<&String> = expected.iter().collect();
        let got: BTreeSet<&String> = found.iter().collect();
        let missing: Vec<&str> = exp.difference(&got).map(|s| s.as_str()).collect();
        let unexpected: Vec<&str> = got.difference(&exp).map(|s| s.as_str()).collect();

        let detail = if missing.is_empty() && unexpected.is_empty() {
            let pos = expected
                .iter()
                .zip(&found)
                .position(|(a, b)| a != b)
                .unwrap_or(0);
            format!(
                "column order differs at position {}: expected `{}`, found `{}`",
                pos, expected[pos], found[pos]
            )
        } else {
            format!(
                "missing columns {:?}, unexpected columns {:?} (relative to `{}`)",
                missing, unexpected, first.id
            )
        };
        return Err(PipelineError::SchemaDrift {
            entity: entity.to_string(),
            partition: part.id.clone(),
            detail,
        });
    }
    Ok(())
}

/// Columns inferred differently per partition (Int64 one year, Float64 the
/// next) are cast to a common type.
fn align_types(partitions: Vec<Partition>) -> Result<Vec<Partition>> {
    let first = partitions[0].batch.schema();
    let mut target: Vec<DataType> = first.fields().iter().map(|f| f.data_type().clone()).collect();

    for (idx, dt) in target.iter_mut().enumerate() {
        let all_same = partitions
            .iter()
            .all(|p| p.batch.schema().field(idx).data_type() == &*dt);
        if all_same {
            continue;
        }
        let widened = partitions
            .iter()
            .map(|p| column_type_of(p.batch.schema().field(idx).data_type()))
            .reduce(|a, b| a.widen(b))
            .map(map_to_arrow_type)
            .unwrap_or(DataType::Utf8);
        debug!(column = %first.field(idx).name(), to = ?widened, "widening partition types");
        *dt = widened;
    }

    let schema = Arc::new(Schema::new(
        first
            .fields()
            .iter()
            .zip(&target)
            .map(|(f, dt)| Field::new(f.name(), dt.clone(), true))
            .collect::<Vec<_>>(),
    ));

    partitions
        .into_iter()
        .map(|p| {
            let columns = p
                .batch
                .columns()
                .iter()
                .zip(&target)
                .map(|(col, dt)| {
                    if col.data_type() == dt {
                        Ok(col.clone())
                    } else {
                        cast(col, dt)
                    }
                })
                .collect::<std::result::Result<Vec<ArrayRef>, _>>()?;
            let batch = RecordBatch::try_new(schema.clone(), columns)?;
            Ok(Partition { id: p.id, batch })
        })
        .collect()
}

/// Row keys repeated across partitions. Rows are kept; the count is reported.
fn detect_duplicate_keys(partitions: &[Partition], key_columns: &[String]) -> Result<Option<Warning>> {
    if key_columns.is_empty() {
        return Ok(None);
    }
    let schema = partitions[0].batch.schema();
    if key_columns.iter().any(|k| schema.index_of(k).is_err()) {
        debug!(keys = ?key_columns, "key columns absent, skipping duplicate check");
        return Ok(None);
    }

    let mut earlier: HashSet<String> = HashSet::new();
    let mut count = 0usize;
    for part in partitions {
        let cols: Vec<&ArrayRef> = key_columns
            .iter()
            .filter_map(|k| part.batch.column_by_name(k))
            .collect();
        let mut local = HashSet::with_capacity(part.batch.num_rows());
        for row in 0..part.batch.num_rows() {
            let key = cols
                .iter()
                .map(|c| array_value_to_string(c, row))
                .collect::<std::result::Result<Vec<_>, _>>()?
                .join("\u{1f}");
            if earlier.contains(&key) {
                count += 1;
            }
            local.insert(key);
        }
        earlier.extend(local);
    }

    Ok((count > 0).then(|| Warning::DuplicateRowKeys {
        columns: key_columns.to_vec(),
        count,
    }))
}

fn column<'a>(entity: Entity, batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| PipelineError::MissingColumn {
            entity: entity.to_string(),
            column: name.to_string(),
        })
}

/// Text stock dates become `Timestamp(µs)`; unparseable values become null
/// and are tallied.
fn coerce_timestamp(
    entity: Entity,
    batch: RecordBatch,
    name: &str,
    tally: &mut CoercionTally,
) -> Result<RecordBatch> {
    let col = column(entity, &batch, name)?.clone();
    let ts_type = DataType::Timestamp(TimeUnit::Microsecond, None);
    if col.data_type() == &ts_type {
        return Ok(batch);
    }

    let converted: ArrayRef = match col.data_type() {
        DataType::Date32 | DataType::Date64 | DataType::Timestamp(_, _) => cast(&col, &ts_type)?,
        _ => {
            let text = cast(&col, &DataType::Utf8)?;
            let text = text
                .as_any()
                .downcast_ref::<StringArray>()
                .cloned()
                .unwrap_or_else(|| StringArray::new_null(text.len()));
            let mut b = TimestampMicrosecondBuilder::with_capacity(text.len());
            for v in text.iter() {
                match v.map(str::trim).filter(|s| !s.is_empty()) {
                    None => b.append_null(),
                    Some(s) => match date_parser::parse_datetime(s) {
                        Some(dt) => b.append_value(date_parser::to_timestamp_micros(dt)),
                        None => {
                            tally.record(name, s);
                            b.append_null();
                        }
                    },
                }
            }
            Arc::new(b.finish())
        }
    };
    upsert_column(batch, name, converted)
}

/// Every `S` in the order number becomes `T`.
fn substitute_order_numbers(entity: Entity, batch: RecordBatch, name: &str) -> Result<RecordBatch> {
    let text = cast(column(entity, &batch, name)?, &DataType::Utf8)?;
    let replaced: StringArray = text
        .as_any()
        .downcast_ref::<StringArray>()
        .map(|arr| arr.iter().map(|v| v.map(|s| s.replace('S', "T"))).collect())
        .unwrap_or_else(|| StringArray::new_null(text.len()));
    upsert_column(batch, name, Arc::new(replaced))
}

/// `out = quantity × price`, null when either side is null or not numeric.
fn derive_multiply(
    entity: Entity,
    batch: RecordBatch,
    quantity: &str,
    price: &str,
    out: &str,
) -> Result<RecordBatch> {
    let q = as_f64(column(entity, &batch, quantity)?)?;
    let p = as_f64(column(entity, &batch, price)?)?;
    let product: Float64Array = q
        .iter()
        .zip(p.iter())
        .map(|(a, b)| Some(a? * b?))
        .collect();
    upsert_column(batch, out, Arc::new(product))
}

fn as_f64(col: &ArrayRef) -> Result<Float64Array> {
    let text_free = match col.data_type() {
        // trim so " 4.5" still reads as a number
        DataType::Utf8 => {
            let arr = col.as_any().downcast_ref::<StringArray>();
            match arr {
                Some(a) => Arc::new(a.iter().map(|v| v.map(str::trim)).collect::<StringArray>())
                    as ArrayRef,
                None => col.clone(),
            }
        }
        _ => col.clone(),
    };
    let floats = cast(&text_free, &DataType::Float64)?;
    Ok(floats
        .as_any()
        .downcast_ref::<Float64Array>()
        .cloned()
        .unwrap_or_else(|| Float64Array::new_null(floats.len())))
}
