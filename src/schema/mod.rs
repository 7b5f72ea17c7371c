pub mod arrow;
pub mod derive;
pub mod types;

pub use self::arrow::{build_arrow_schema, column_type_of, map_to_arrow_type};
pub use derive::derive_types;
pub use types::{Column, ColumnType};
