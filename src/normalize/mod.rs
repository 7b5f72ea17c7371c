// src/normalize/mod.rs

use arrow::{
    array::{Array, ArrayRef, Date32Array, Int32Array, StringArray},
    compute::cast,
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use chrono::{Datelike, NaiveDate};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::entity::Entity;
use crate::error::{PipelineError, Result};
use crate::extract::date_parser;

/// Apply the entity's cleaning rules. Rows are never dropped; a null input
/// to a rule yields a null derived value.
#[instrument(level = "debug", skip_all, fields(entity = %entity, rows = batch.num_rows()))]
pub fn normalize(entity: Entity, batch: RecordBatch) -> Result<RecordBatch> {
    match entity {
        Entity::Calendar => derive_calendar(batch),
        Entity::Customers => derive_full_name(batch),
        Entity::Products => derive_product_columns(batch),
        // Sales gets its fixes after unification
        Entity::ProductSubcategories | Entity::Returns | Entity::Territories | Entity::Sales => {
            Ok(batch)
        }
    }
}

/// `Month` (1-12) and `Year` from `Date`.
fn derive_calendar(batch: RecordBatch) -> Result<RecordBatch> {
    let dates = date_values(required(&batch, Entity::Calendar, "Date")?)?;

    let months: Int32Array = dates.iter().map(|d| d.map(|d| d.month() as i32)).collect();
    let years: Int32Array = dates.iter().map(|d| d.map(|d| d.year())).collect();

    let batch = upsert_column(batch, "Month", Arc::new(months))?;
    upsert_column(batch, "Year", Arc::new(years))
}

/// `fullName` from optional `Prefix`, `FirstName`, `LastName`.
fn derive_full_name(batch: RecordBatch) -> Result<RecordBatch> {
    let first = utf8(required(&batch, Entity::Customers, "FirstName")?)?;
    let last = utf8(required(&batch, Entity::Customers, "LastName")?)?;
    let prefix = match batch.column_by_name("Prefix") {
        Some(col) => Some(utf8(col)?),
        None => None,
    };

    let names: StringArray = (0..batch.num_rows())
        .map(|i| {
            let p = prefix.as_ref().and_then(|p| value(p, i));
            full_name(p, value(&first, i), value(&last, i))
        })
        .collect();

    upsert_column(batch, "fullName", Arc::new(names))
}

/// `ProductSKU` cut at the first `-`, `ProductName` cut at the first
/// whitespace. Both replace their source column in place.
fn derive_product_columns(batch: RecordBatch) -> Result<RecordBatch> {
    let skus = utf8(required(&batch, Entity::Products, "ProductSKU")?)?;
    let names = utf8(required(&batch, Entity::Products, "ProductName")?)?;

    let sku_base: StringArray = skus.iter().map(|v| v.map(sku_prefix)).collect();
    let first_words: StringArray = names.iter().map(|v| v.map(first_token)).collect();

    let batch = upsert_column(batch, "ProductSKU", Arc::new(sku_base))?;
    upsert_column(batch, "ProductName", Arc::new(first_words))
}

/// Non-empty parts joined by single spaces; null only when every part is
/// null or blank.
pub fn full_name(prefix: Option<&str>, first: Option<&str>, last: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [prefix, first, last]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join(" "))
}

pub fn sku_prefix(sku: &str) -> &str {
    sku.split('-').next().unwrap_or(sku)
}

pub fn first_token(name: &str) -> &str {
    name.split_whitespace().next().unwrap_or("")
}

fn required<'a>(batch: &'a RecordBatch, entity: Entity, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| PipelineError::MissingColumn {
            entity: entity.to_string(),
            column: name.to_string(),
        })
}

fn utf8(col: &ArrayRef) -> Result<StringArray> {
    let col = match col.data_type() {
        DataType::Utf8 => col.clone(),
        _ => cast(col, &DataType::Utf8)?,
    };
    Ok(col
        .as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .unwrap_or_else(|| StringArray::new_null(col.len())))
}

fn value(arr: &StringArray, i: usize) -> Option<&str> {
    (!arr.is_null(i)).then(|| arr.value(i))
}

/// Dates from a Date32 column, or parsed from text when the table was built
/// without the Calendar hint.
fn date_values(col: &ArrayRef) -> Result<Vec<Option<NaiveDate>>> {
    if let Some(days) = col.as_any().downcast_ref::<Date32Array>() {
        return Ok(days
            .iter()
            .map(|d| d.and_then(date_parser::from_date32))
            .collect());
    }
    let text = utf8(col)?;
    Ok(text
        .iter()
        .map(|v| v.and_then(date_parser::parse_date))
        .collect())
}

/// Replace `name` in place if present, else append it. Source columns keep
/// their position either way.
pub(crate) fn upsert_column(batch: RecordBatch, name: &str, array: ArrayRef) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    let field = Field::new(name, array.data_type().clone(), true);

    match schema.index_of(name) {
        Ok(idx) => {
            fields[idx] = field;
            columns[idx] = array;
        }
        Err(_) => {
            fields.push(field);
            columns.push(array);
        }
    }
    debug!(column = name, "derived column");
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::Schema;

    fn string_batch(cols: &[(&str, Vec<Option<&str>>)]) -> RecordBatch {
        let fields: Vec<Field> = cols
            .iter()
            .map(|(n, _)| Field::new(*n, DataType::Utf8, true))
            .collect();
        let arrays: Vec<ArrayRef> = cols
            .iter()
            .map(|(_, v)| Arc::new(StringArray::from(v.clone())) as ArrayRef)
            .collect();
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap()
    }

    fn strings(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
        let col = batch.column_by_name(name).unwrap();
        let arr = col.as_any().downcast_ref::<StringArray>().unwrap();
        arr.iter().map(|v| v.map(str::to_string)).collect()
    }

    #[test]
    fn calendar_month_and_year() {
        let dates: Vec<Option<i32>> = ["2015-01-01", "2016-02-29", "2017-12-31"]
            .iter()
            .map(|s| Some(date_parser::to_date32(date_parser::parse_date(s).unwrap())))
            .chain(std::iter::once(None))
            .collect();
        let schema = Schema::new(vec![Field::new("Date", DataType::Date32, true)]);
        let batch =
            RecordBatch::try_new(Arc::new(schema), vec![Arc::new(Date32Array::from(dates))])
                .unwrap();

        let out = normalize(Entity::Calendar, batch).unwrap();
        assert_eq!(out.num_columns(), 3);
        let month = out.column_by_name("Month").unwrap();
        let month = month.as_any().downcast_ref::<Int32Array>().unwrap();
        let year = out.column_by_name("Year").unwrap();
        let year = year.as_any().downcast_ref::<Int32Array>().unwrap();

        assert_eq!(month.value(1), 2);
        assert_eq!(year.value(1), 2016);
        assert_eq!(month.value(2), 12);
        assert!(month.is_null(3) && year.is_null(3));

        // Month/Year plus the original day rebuild the source date
        let src = out.column(0).as_any().downcast_ref::<Date32Array>().unwrap();
        for i in 0..3 {
            let d = src.value_as_date(i).unwrap();
            assert!((1..=12).contains(&month.value(i)));
            let rebuilt =
                NaiveDate::from_ymd_opt(year.value(i), month.value(i) as u32, d.day()).unwrap();
            assert_eq!(rebuilt, d);
        }
    }

    #[test]
    fn calendar_accepts_text_dates() {
        let batch = string_batch(&[("Date", vec![Some("3/15/2016")])]);
        let out = normalize(Entity::Calendar, batch).unwrap();
        let month = out.column_by_name("Month").unwrap();
        assert_eq!(month.as_any().downcast_ref::<Int32Array>().unwrap().value(0), 3);
    }

    #[test]
    fn customers_full_name() {
        let batch = string_batch(&[
            ("Prefix", vec![Some("MR."), None, Some(""), Some("MRS.")]),
            ("FirstName", vec![Some("JON"), Some("EUGENE"), Some("RUBEN"), None]),
            ("LastName", vec![Some("YANG"), Some("HUANG"), Some("TORRES"), Some("LU")]),
        ]);
        let out = normalize(Entity::Customers, batch).unwrap();
        let names = strings(&out, "fullName");
        assert_eq!(
            names,
            vec![
                Some("MR. JON YANG".into()),
                Some("EUGENE HUANG".into()),
                Some("RUBEN TORRES".into()),
                Some("MRS. LU".into())
            ]
        );
        // source columns retained
        assert_eq!(out.num_columns(), 4);
    }

    #[test]
    fn full_name_splits_into_present_parts() {
        let cases = [
            (Some("DR."), "ANA", "DIAZ"),
            (None, "ANA", "DIAZ"),
            (Some("  "), "ANA", "DIAZ"),
        ];
        for (prefix, first, last) in cases {
            let name = full_name(prefix, Some(first), Some(last)).unwrap();
            let expected: Vec<&str> = [prefix.unwrap_or(""), first, last]
                .into_iter()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            assert_eq!(name.split(' ').collect::<Vec<_>>(), expected);
        }
    }

    #[test]
    fn missing_names_are_skipped_like_blank_prefixes() {
        assert_eq!(full_name(Some("MRS."), None, Some("LU")).as_deref(), Some("MRS. LU"));
        assert_eq!(full_name(None, Some("JON"), None).as_deref(), Some("JON"));
        assert_eq!(full_name(Some(" "), None, Some("")), None);
        assert_eq!(full_name(None, None, None), None);
    }

    #[test]
    fn customers_without_prefix_column() {
        let batch = string_batch(&[
            ("FirstName", vec![Some("JON")]),
            ("LastName", vec![Some("YANG")]),
        ]);
        let out = normalize(Entity::Customers, batch).unwrap();
        assert_eq!(strings(&out, "fullName"), vec![Some("JON YANG".into())]);
    }

    #[test]
    fn products_sku_and_name() {
        let batch = string_batch(&[
            ("ProductKey", vec![Some("214"), Some("215"), Some("216")]),
            ("ProductSKU", vec![Some("ABC-123-X"), Some("HL-U509"), Some("PLAIN")]),
            ("ProductName", vec![Some("Road Bike Pro"), Some("Sport-100 Helmet"), None]),
        ]);
        let out = normalize(Entity::Products, batch).unwrap();
        assert_eq!(out.schema().index_of("ProductSKU").unwrap(), 1);
        assert_eq!(
            strings(&out, "ProductSKU"),
            vec![Some("ABC".into()), Some("HL".into()), Some("PLAIN".into())]
        );
        assert_eq!(
            strings(&out, "ProductName"),
            vec![Some("Road".into()), Some("Sport-100".into()), None]
        );
    }

    #[test]
    fn missing_rule_column_fails_entity() {
        let batch = string_batch(&[("ProductSKU", vec![Some("ABC-1")])]);
        let err = normalize(Entity::Products, batch).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingColumn { ref column, .. } if column == "ProductName"
        ));
    }

    #[test]
    fn pass_through_entities_are_unchanged() {
        let batch = string_batch(&[("Region", vec![Some("Northwest")])]);
        for e in [Entity::Returns, Entity::Territories, Entity::ProductSubcategories] {
            assert_eq!(normalize(e, batch.clone()).unwrap(), batch);
        }
    }
}
