// src/config/mod.rs

pub mod locator;

pub use locator::{Locator, Zone};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::entity::Entity;
use crate::error::{PipelineError, Result};

/// Keys that would carry credential material. Credentials come from the
/// secret store only, so a config file naming any of these is refused.
const FORBIDDEN_KEYS: &[&str] = &[
    "client_id",
    "client_secret",
    "tenant_id",
    "password",
    "token",
    "access_key",
];

/// How the Writer treats data already present at an output locator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Overwrite,
    Append,
}

/// Column names the Sales unifier operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SalesRules {
    pub stock_date_column: String,
    pub order_number_column: String,
    pub quantity_column: String,
    pub price_column: String,
    pub multiply_column: String,
    /// Columns forming a row key; collisions across partitions are reported.
    pub key_columns: Vec<String>,
}

impl Default for SalesRules {
    fn default() -> Self {
        Self {
            stock_date_column: "StockDate".into(),
            order_number_column: "OrderNumber".into(),
            quantity_column: "OrderQuantity".into(),
            price_column: "UnitPrice".into(),
            multiply_column: "multiply".into(),
            key_columns: vec!["OrderNumber".into(), "OrderLineItem".into()],
        }
    }
}

/// Per-entity settings that differ from the catalog defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EntityOverride {
    pub write_mode: Option<WriteMode>,
    /// Source patterns relative to the bronze container.
    pub sources: Option<Vec<String>>,
    /// Output path relative to the silver container.
    pub output: Option<String>,
}

/// Everything one run needs. Passed explicitly into every pipeline call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub account: String,
    /// Filesystem root backing the bronze container.
    pub source_root: PathBuf,
    /// Filesystem root backing the silver container.
    pub output_root: PathBuf,
    /// Secret-store scope holding the OAuth client credentials.
    pub secret_scope: String,
    #[serde(default = "num_cpus::get")]
    pub workers: usize,
    #[serde(default)]
    pub entities: BTreeMap<String, EntityOverride>,
    #[serde(default)]
    pub sales: SalesRules,
    /// Age after which a write lock left by a crashed run is reclaimed.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
}

fn default_scheme() -> String {
    "abfss".to_string()
}

fn default_lock_stale_secs() -> u64 {
    6 * 60 * 60
}

impl PipelineConfig {
    pub fn new(
        account: &str,
        source_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        secret_scope: &str,
    ) -> Self {
        Self {
            scheme: default_scheme(),
            account: account.to_string(),
            source_root: source_root.into(),
            output_root: output_root.into(),
            secret_scope: secret_scope.to_string(),
            workers: num_cpus::get(),
            entities: BTreeMap::new(),
            sales: SalesRules::default(),
            lock_stale_secs: default_lock_stale_secs(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        if let Some(key) = find_forbidden_key(&value) {
            return Err(PipelineError::Config(format!(
                "credential key `{}` is not allowed in configuration; use the secret scope",
                key
            )));
        }
        let cfg: PipelineConfig =
            serde_yaml::from_value(value).map_err(|e| PipelineError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.account.trim().is_empty() {
            return Err(PipelineError::Config("account must not be empty".into()));
        }
        if self.secret_scope.trim().is_empty() {
            return Err(PipelineError::Config("secret_scope must not be empty".into()));
        }
        if self.source_root == self.output_root {
            return Err(PipelineError::Config(format!(
                "source and output zones share the root {}",
                self.source_root.display()
            )));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be at least 1".into()));
        }
        for name in self.entities.keys() {
            if Entity::from_name(name).is_none() {
                return Err(PipelineError::Config(format!("unknown entity `{}`", name)));
            }
        }
        Ok(())
    }

    fn override_for(&self, entity: Entity) -> Option<&EntityOverride> {
        self.entities
            .iter()
            .find(|(k, _)| Entity::from_name(k) == Some(entity))
            .map(|(_, v)| v)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn write_mode(&self, entity: Entity) -> WriteMode {
        self.override_for(entity)
            .and_then(|o| o.write_mode)
            .unwrap_or_default()
    }

    pub fn source_locators(&self, entity: Entity) -> Vec<Locator> {
        let base = Locator::new(&self.scheme, Zone::Bronze, &self.account, "");
        match self.override_for(entity).and_then(|o| o.sources.as_ref()) {
            Some(patterns) => patterns.iter().map(|p| base.with_path(p)).collect(),
            None => vec![base.with_path(entity.default_source())],
        }
    }

    pub fn output_locator(&self, entity: Entity) -> Locator {
        let path = self
            .override_for(entity)
            .and_then(|o| o.output.clone())
            .unwrap_or_else(|| entity.default_output().to_string());
        Locator::new(&self.scheme, Zone::Silver, &self.account, &path)
    }

    /// Map a locator onto the filesystem root backing its zone.
    pub fn resolve(&self, locator: &Locator) -> Result<PathBuf> {
        if locator.account != self.account {
            return Err(PipelineError::Config(format!(
                "locator {} belongs to account `{}`, run is configured for `{}`",
                locator, locator.account, self.account
            )));
        }
        let root = match locator.zone {
            Zone::Bronze => &self.source_root,
            Zone::Silver => &self.output_root,
        };
        Ok(if locator.path.is_empty() {
            root.clone()
        } else {
            root.join(&locator.path)
        })
    }
}

fn find_forbidden_key(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Mapping(map) => map.iter().find_map(|(k, v)| {
            let hit = k.as_str().and_then(|k| {
                let norm = k.to_ascii_lowercase().replace('-', "_");
                FORBIDDEN_KEYS.contains(&norm.as_str()).then(|| k.to_string())
            });
            hit.or_else(|| find_forbidden_key(v))
        }),
        serde_yaml::Value::Sequence(seq) => seq.iter().find_map(find_forbidden_key),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
account: lake.dfs.core.windows.net
source_root: /mnt/bronze
output_root: /mnt/silver
secret_scope: adventure-works
workers: 4
entities:
  Sales:
    write_mode: append
    sources: ["Sales/AdventureWorks_Sales_20*.csv"]
  Returns:
    output: returns_clean
sales:
  price_column: ProductPrice
"#;

    #[test]
    fn loads_yaml_with_overrides() {
        let cfg = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.scheme, "abfss");
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.lock_stale_after(), Duration::from_secs(6 * 60 * 60));
        assert_eq!(cfg.write_mode(Entity::Sales), WriteMode::Append);
        assert_eq!(cfg.write_mode(Entity::Calendar), WriteMode::Overwrite);
        assert_eq!(cfg.sales.price_column, "ProductPrice");
        assert_eq!(cfg.sales.quantity_column, "OrderQuantity");

        let sources = cfg.source_locators(Entity::Sales);
        assert_eq!(
            sources[0].to_string(),
            "abfss://bronze@lake.dfs.core.windows.net/Sales/AdventureWorks_Sales_20*.csv"
        );
        let out = cfg.output_locator(Entity::Returns);
        assert_eq!(
            cfg.resolve(&out).unwrap(),
            PathBuf::from("/mnt/silver/returns_clean")
        );
    }

    #[test]
    fn refuses_literal_credentials() {
        let text = format!("{}\nclient-secret: hunter2\n", SAMPLE);
        let err = PipelineConfig::from_yaml_str(&text).unwrap_err();
        assert!(err.to_string().contains("client-secret"), "{}", err);
    }

    #[test]
    fn zones_must_be_distinct() {
        let cfg = PipelineConfig::new("acct", "/data", "/data", "scope");
        assert!(matches!(cfg.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn resolve_checks_account() {
        let cfg = PipelineConfig::new("acct", "/in", "/out", "scope");
        let foreign: Locator = "abfss://bronze@other/Calendar/x.csv".parse().unwrap();
        assert!(cfg.resolve(&foreign).is_err());

        let own: Locator = "abfss://bronze@acct/Calendar/x.csv".parse().unwrap();
        assert_eq!(cfg.resolve(&own).unwrap(), PathBuf::from("/in/Calendar/x.csv"));
    }

    #[test]
    fn unknown_entity_override_is_rejected() {
        let text = SAMPLE.replace("Returns:", "Refunds:");
        assert!(PipelineConfig::from_yaml_str(&text).is_err());
    }
}
