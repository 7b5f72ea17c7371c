// src/entity.rs

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::SalesRules;
use crate::schema::{Column, ColumnType};

/// Logical datasets handled by the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Entity {
    Calendar,
    Customers,
    ProductSubcategories,
    Products,
    Returns,
    Territories,
    Sales,
}

/// What the Extractor validates an entity's raw tables against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    /// Columns whose absence is a structural failure.
    pub required: Vec<String>,
    /// Asserted types; every other column is inferred.
    pub hints: Vec<Column>,
}

impl Entity {
    pub const ALL: [Entity; 7] = [
        Entity::Calendar,
        Entity::Customers,
        Entity::ProductSubcategories,
        Entity::Products,
        Entity::Returns,
        Entity::Territories,
        Entity::Sales,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Entity::Calendar => "Calendar",
            Entity::Customers => "Customers",
            Entity::ProductSubcategories => "ProductSubcategories",
            Entity::Products => "Products",
            Entity::Returns => "Returns",
            Entity::Territories => "Territories",
            Entity::Sales => "Sales",
        }
    }

    /// Case-insensitive; `_` and `-` are ignored so `product_subcategories` matches.
    pub fn from_name(s: &str) -> Option<Self> {
        let norm: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        Entity::ALL
            .into_iter()
            .find(|e| e.name().to_lowercase() == norm)
    }

    /// Source pattern inside the bronze container.
    pub fn default_source(&self) -> &'static str {
        match self {
            Entity::Calendar => "Calendar/*.csv",
            Entity::Customers => "Customers/*.csv",
            Entity::ProductSubcategories => "ProductSubcategories/*.csv",
            Entity::Products => "Products/*.csv",
            Entity::Returns => "Returns/*.csv",
            Entity::Territories => "Territories/*.csv",
            Entity::Sales => "Sales/*.csv",
        }
    }

    /// Output path inside the silver container.
    pub fn default_output(&self) -> &'static str {
        self.name()
    }

    /// Sales arrives as one file per year and goes through the Unifier.
    pub fn is_partitioned(&self) -> bool {
        matches!(self, Entity::Sales)
    }

    pub fn schema(&self, sales: &SalesRules) -> EntitySchema {
        let utf8 = |n: &str| Column::new(n, ColumnType::Utf8);
        match self {
            Entity::Calendar => EntitySchema {
                required: vec!["Date".into()],
                hints: vec![Column::new("Date", ColumnType::Date)],
            },
            Entity::Customers => EntitySchema {
                required: vec!["FirstName".into(), "LastName".into()],
                hints: vec![utf8("Prefix"), utf8("FirstName"), utf8("LastName")],
            },
            Entity::Products => EntitySchema {
                required: vec!["ProductSKU".into(), "ProductName".into()],
                hints: vec![utf8("ProductSKU"), utf8("ProductName")],
            },
            Entity::Sales => EntitySchema {
                required: vec![
                    sales.stock_date_column.clone(),
                    sales.order_number_column.clone(),
                    sales.quantity_column.clone(),
                    sales.price_column.clone(),
                ],
                hints: vec![
                    utf8(&sales.stock_date_column),
                    utf8(&sales.order_number_column),
                ],
            },
            Entity::ProductSubcategories | Entity::Returns | Entity::Territories => {
                EntitySchema {
                    required: Vec::new(),
                    hints: Vec::new(),
                }
            }
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip_loosely() {
        for e in Entity::ALL {
            assert_eq!(Entity::from_name(e.name()), Some(e));
        }
        assert_eq!(
            Entity::from_name("product_subcategories"),
            Some(Entity::ProductSubcategories)
        );
        assert_eq!(Entity::from_name(" sales "), Some(Entity::Sales));
        assert_eq!(Entity::from_name("Orders"), None);
    }

    #[test]
    fn sales_schema_follows_rules() {
        let rules = SalesRules {
            price_column: "ProductPrice".into(),
            ..SalesRules::default()
        };
        let schema = Entity::Sales.schema(&rules);
        assert!(schema.required.contains(&"ProductPrice".to_string()));
        assert!(schema
            .hints
            .contains(&Column::new("StockDate", ColumnType::Utf8)));
        assert!(Entity::Sales.is_partitioned());
        assert!(!Entity::Returns.is_partitioned());
    }
}
