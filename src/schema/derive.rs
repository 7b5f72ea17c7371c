use tracing::debug;

use super::{Column, ColumnType};

/// For each column, look at every row:
///  - Ignore empty cells
///  - A hinted column takes its hint, cells are not consulted
///  - Otherwise fold each cell's type into the running type with `widen`,
///    stopping early once the column has fallen back to utf8
///  - Columns with no values default to utf8
pub fn derive_types(
    table_name: &str,
    header_names: &[String],
    rows: &[Vec<String>],
    hints: &[Column],
) -> Vec<Column> {
    let mut cols = Vec::with_capacity(header_names.len());

    for (idx, name) in header_names.iter().enumerate() {
        if let Some(hint) = hints.iter().find(|h| &h.name == name) {
            cols.push(Column::new(name, hint.ty));
            continue;
        }

        let mut seen: Option<ColumnType> = None;
        for row in rows {
            let cell = row.get(idx).map(|s| s.trim()).unwrap_or("");
            if cell.is_empty() {
                continue;
            }
            let inferred = infer_type(cell);
            seen = Some(match seen {
                None => inferred,
                Some(prev) => prev.widen(inferred),
            });
            if seen == Some(ColumnType::Utf8) {
                break;
            }
        }

        let ty = seen.unwrap_or_else(|| {
            debug!(
                "derive_types: no values for `{}` in `{}`, defaulting to utf8",
                name, table_name
            );
            ColumnType::Utf8
        });
        cols.push(Column::new(name, ty));
    }

    cols
}

/// Numeric detection only; dates stay text unless an entity hints otherwise.
fn infer_type(v: &str) -> ColumnType {
    // "inf" and "NaN" parse as f64 but are not numbers in a CSV extract
    if !v.bytes().any(|b| b.is_ascii_digit()) {
        return ColumnType::Utf8;
    }
    if v.parse::<i64>().is_ok() {
        ColumnType::Int64
    } else if v.parse::<f64>().is_ok() {
        ColumnType::Float64
    } else {
        ColumnType::Utf8
    }
}
