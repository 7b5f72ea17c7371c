use arrow::{
    array::{ArrayRef, Date32Builder, Float64Builder, Int64Builder, StringBuilder,
        TimestampMicrosecondBuilder},
    record_batch::RecordBatch,
};
use std::sync::Arc;
use tracing::debug;

use super::date_parser;
use super::RawTable;
use crate::entity::EntitySchema;
use crate::error::{CoercionTally, PipelineError, Result};
use crate::schema::{build_arrow_schema, derive_types, ColumnType};

/// Validate `raw` against the entity schema and materialise it as Arrow.
///
/// Missing required columns are structural and fail the entity. Cells that
/// do not fit their column type become null and are tallied.
pub fn to_record_batch(
    entity: &str,
    raw: &RawTable,
    schema: &EntitySchema,
    tally: &mut CoercionTally,
) -> Result<RecordBatch> {
    if let Some(missing) = schema
        .required
        .iter()
        .find(|c| raw.column_index(c).is_none())
    {
        return Err(PipelineError::MissingColumn {
            entity: entity.to_string(),
            column: missing.clone(),
        });
    }

    let columns = derive_types(entity, &raw.headers, &raw.rows, &schema.hints);
    let arrow_schema = build_arrow_schema(&columns);

    let mut out: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for (idx, col) in columns.iter().enumerate() {
        let cells = raw.rows.iter().map(|r| r[idx].as_str());
        let arr: ArrayRef = match col.ty {
            ColumnType::Utf8 => {
                let mut b = StringBuilder::new();
                for c in cells {
                    if c.is_empty() {
                        b.append_null();
                    } else {
                        b.append_value(c);
                    }
                }
                Arc::new(b.finish())
            }
            ColumnType::Int64 => {
                let mut b = Int64Builder::with_capacity(raw.rows.len());
                for c in cells {
                    b.append_option(coerce(c, &col.name, tally, |s| s.parse().ok()));
                }
                Arc::new(b.finish())
            }
            ColumnType::Float64 => {
                let mut b = Float64Builder::with_capacity(raw.rows.len());
                for c in cells {
                    b.append_option(coerce(c, &col.name, tally, |s| s.parse().ok()));
                }
                Arc::new(b.finish())
            }
            ColumnType::Date => {
                let mut b = Date32Builder::with_capacity(raw.rows.len());
                for c in cells {
                    b.append_option(coerce(c, &col.name, tally, |s| {
                        date_parser::parse_date(s).map(date_parser::to_date32)
                    }));
                }
                Arc::new(b.finish())
            }
            ColumnType::Timestamp => {
                let mut b = TimestampMicrosecondBuilder::with_capacity(raw.rows.len());
                for c in cells {
                    b.append_option(coerce(c, &col.name, tally, |s| {
                        date_parser::parse_datetime(s).map(date_parser::to_timestamp_micros)
                    }));
                }
                Arc::new(b.finish())
            }
        };
        out.push(arr);
    }

    debug!(
        entity,
        partition = %raw.partition,
        columns = columns.len(),
        rows = raw.rows.len(),
        "typed raw table"
    );
    RecordBatch::try_new(arrow_schema, out).map_err(Into::into)
}

/// Empty cells are null without complaint; unparseable ones are tallied.
fn coerce<T>(
    cell: &str,
    column: &str,
    tally: &mut CoercionTally,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    if cell.is_empty() {
        return None;
    }
    let v = parse(cell);
    if v.is_none() {
        tally.record(column, cell);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SalesRules;
    use crate::entity::Entity;
    use crate::error::Warning;
    use arrow::array::{Array, Date32Array, Int64Array, StringArray};
    use arrow::datatypes::DataType;
    use std::path::PathBuf;

    fn raw(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
            source: PathBuf::from("mem.csv"),
            partition: "mem".into(),
        }
    }

    #[test]
    fn calendar_dates_are_typed_and_bad_ones_tallied() {
        let table = raw(&["Date"], &[&["1/1/2015"], &["2015-01-02"], &["someday"], &[""]]);
        let schema = Entity::Calendar.schema(&SalesRules::default());
        let mut tally = CoercionTally::default();

        let batch = to_record_batch("Calendar", &table, &schema, &mut tally).unwrap();
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Date32);
        let dates = batch
            .column(0)
            .as_any()
            .downcast_ref::<Date32Array>()
            .unwrap();
        assert_eq!(dates.value_as_date(0).unwrap().to_string(), "2015-01-01");
        assert!(dates.is_null(2));
        assert!(dates.is_null(3));

        let warnings = tally.into_warnings();
        assert_eq!(warnings.len(), 1);
        match &warnings[0] {
            Warning::ValueCoercion(w) => {
                assert_eq!(w.count, 1);
                assert_eq!(w.sample, "someday");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_required_column_is_structural() {
        let table = raw(&["CustomerKey", "FirstName"], &[&["1", "JON"]]);
        let schema = Entity::Customers.schema(&SalesRules::default());
        let err = to_record_batch("Customers", &table, &schema, &mut CoercionTally::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingColumn { ref column, .. } if column == "LastName"
        ));
    }

    #[test]
    fn inferred_columns_keep_empty_cells_null() {
        let table = raw(
            &["ProductKey", "ProductColor"],
            &[&["214", "Red"], &["", ""]],
        );
        let schema = Entity::Returns.schema(&SalesRules::default());
        let batch =
            to_record_batch("Returns", &table, &schema, &mut CoercionTally::default()).unwrap();
        let keys = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        let colors = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(keys.value(0), 214);
        assert!(keys.is_null(1));
        assert!(colors.is_null(1));
    }

    #[test]
    fn pass_through_keeps_values_past_the_first_thousand_rows() {
        let mut rows: Vec<Vec<String>> = (0..1000)
            .map(|_| vec!["312".to_string(), "1".to_string()])
            .collect();
        rows.push(vec!["HL-312".to_string(), "1.5".to_string()]);
        let table = RawTable {
            headers: vec!["ProductKey".into(), "ReturnQuantity".into()],
            rows,
            source: PathBuf::from("returns.csv"),
            partition: "returns".into(),
        };
        let schema = Entity::Returns.schema(&SalesRules::default());
        let mut tally = CoercionTally::default();
        let batch = to_record_batch("Returns", &table, &schema, &mut tally).unwrap();

        let keys = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(keys.value(1000), "HL-312");
        assert_eq!(keys.value(0), "312");
        let qty = batch.column(1);
        assert_eq!(qty.data_type(), &DataType::Float64);
        assert!(!qty.is_null(1000));
        assert!(tally.into_warnings().is_empty());
    }
}
