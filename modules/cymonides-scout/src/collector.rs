use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use cymonides_common::{Config, Ontology};

use crate::normalize::{Normalizer, UpstreamRecord};
use crate::traits::{EntitySearch, SearchOutcome};

/// One upstream OSINT source.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;
    async fn collect(&self, query: &str) -> Result<Vec<UpstreamRecord>>;
}

/// Fans a query out to every collector and normalizes what comes back.
pub struct CollectorPool {
    collectors: Vec<Arc<dyn Collector>>,
    normalizer: Normalizer,
    concurrency: usize,
    timeout: Duration,
}

impl CollectorPool {
    pub fn new(ontology: Arc<Ontology>) -> Self {
        Self {
            collectors: Vec::new(),
            normalizer: Normalizer::new(ontology),
            concurrency: 4,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &Config, ontology: Arc<Ontology>) -> Self {
        Self::new(ontology)
            .with_concurrency(config.collector_concurrency)
            .with_timeout(Duration::from_secs(config.collector_timeout_secs))
    }

    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}

#[async_trait]
impl EntitySearch for CollectorPool {
    async fn search(&self, query: &str, project_id: &str) -> Result<SearchOutcome> {
        if self.collectors.is_empty() {
            bail!("no collectors configured");
        }

        let timeout = self.timeout;
        let mut results: Vec<(String, Result<Vec<UpstreamRecord>>)> =
            stream::iter(self.collectors.iter().cloned().map(|collector| {
                async move {
                    let result = match tokio::time::timeout(timeout, collector.collect(query)).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow!("timed out after {}ms", timeout.as_millis())),
                    };
                    (collector.name().to_string(), result)
                }
            }).collect::<Vec<_>>())
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        // Completion order is not stable; merge order must be.
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut outcome = SearchOutcome::default();
        let mut failed = 0;
        let mut records_seen = 0;
        for (name, result) in results {
            match result {
                Ok(records) => {
                    for record in &records {
                        records_seen += 1;
                        match self.normalizer.normalize(record, project_id) {
                            Ok(normalized) => outcome.extend(normalized),
                            Err(e) => {
                                warn!(collector = name.as_str(), error = %e, "Skipping malformed record")
                            }
                        }
                    }
                    debug!(collector = name.as_str(), query, records = records.len(), "Collector finished");
                }
                Err(e) => {
                    warn!(collector = name.as_str(), query, error = %e, "Collector failed");
                    failed += 1;
                }
            }
        }

        if failed == self.collectors.len() {
            bail!("all {failed} collectors failed for {query:?}");
        }

        info!(
            query,
            collectors = self.collectors.len(),
            failed,
            records = records_seen,
            discoveries = outcome.discoveries.len(),
            "Search complete"
        );
        Ok(outcome)
    }
}
