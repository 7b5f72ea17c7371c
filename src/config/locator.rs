// src/config/locator.rs

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::PipelineError;

/// Storage zone a locator points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    /// Landing area for unmodified extracts (`bronze` / `raw`).
    Bronze,
    /// Trusted output of this stage (`silver` / `trusted`).
    Silver,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Bronze => "bronze",
            Zone::Silver => "silver",
        }
    }
}

impl FromStr for Zone {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bronze" | "raw" => Ok(Zone::Bronze),
            "silver" | "trusted" => Ok(Zone::Silver),
            other => Err(PipelineError::Config(format!("unknown zone `{}`", other))),
        }
    }
}

/// `<scheme>://<zone>@<account>/<path>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub scheme: String,
    pub zone: Zone,
    pub account: String,
    /// Path inside the zone container, without a leading `/`. May hold glob wildcards.
    pub path: String,
}

impl Locator {
    pub fn new(scheme: &str, zone: Zone, account: &str, path: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            zone,
            account: account.to_string(),
            path: path.trim_start_matches('/').to_string(),
        }
    }

    /// Same container, different path.
    pub fn with_path(&self, path: &str) -> Self {
        Self::new(&self.scheme, self.zone, &self.account, path)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}@{}/{}",
            self.scheme,
            self.zone.as_str(),
            self.account,
            self.path
        )
    }
}

impl FromStr for Locator {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| PipelineError::Config(format!("invalid locator `{}`: {}", s, why));

        let (scheme, rest) = s.split_once("://").ok_or_else(|| bad("missing `://`"))?;
        if scheme.is_empty() {
            return Err(bad("empty scheme"));
        }
        let (zone, rest) = rest.split_once('@').ok_or_else(|| bad("missing `@`"))?;
        let zone: Zone = zone.parse().map_err(|_| bad("unknown zone"))?;
        let (account, path) = match rest.split_once('/') {
            Some((a, p)) => (a, p),
            None => (rest, ""),
        };
        if account.is_empty() {
            return Err(bad("empty account"));
        }
        Ok(Locator::new(scheme, zone, account, path))
    }
}
