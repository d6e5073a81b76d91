//! Canned upstream data for offline cascade runs.
//!
//! A fixture file maps queries to the records a collector would have returned:
//!
//! ```json
//! {
//!   "name": "registry-dump",
//!   "queries": {
//!     "acme": [ { "kind": "company_record", "source": "registry", "name": "Acme Subsidiary" } ]
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use cymonides_common::canonical_value;

use crate::collector::Collector;
use crate::normalize::UpstreamRecord;

#[derive(Debug, Deserialize)]
struct FixtureFile {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    queries: HashMap<String, Vec<UpstreamRecord>>,
}

fn default_name() -> String {
    "fixture".to_string()
}

/// Collector answering from a fixture file. Unknown queries yield nothing.
pub struct FixtureCollector {
    name: String,
    records: HashMap<String, Vec<UpstreamRecord>>,
}

impl FixtureCollector {
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: FixtureFile = serde_json::from_str(raw).context("invalid fixture file")?;
        Ok(Self {
            name: file.name,
            records: file
                .queries
                .into_iter()
                .map(|(query, records)| (canonical_value(&query), records))
                .collect(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read fixture file {}", path.display()))?;
        Self::from_json(&raw)
    }
}

#[async_trait]
impl Collector for FixtureCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, query: &str) -> Result<Vec<UpstreamRecord>> {
        Ok(self
            .records
            .get(&canonical_value(query))
            .cloned()
            .unwrap_or_default())
    }
}
