use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use cymonides_common::{partition_name, project_or_default, Config, Node, Ontology};

use crate::merge::{merge_into, MergeChanges};
use crate::store::{NodeStore, StoreError};

/// Backoff schedule for optimistic-concurrency retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

const MAX_BACKOFF: Duration = Duration::from_secs(2);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.merge_max_retries,
            base_backoff: Duration::from_millis(config.merge_backoff_ms),
        }
    }

    /// Exponential backoff for the given (1-based) retry, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// How a single node landed in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Merged(MergeChanges),
    /// Only timestamps moved.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertErrorKind {
    Validation,
    Store,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertError {
    /// Position of the offending node in the submitted batch.
    pub index: usize,
    pub node_id: Option<String>,
    pub kind: UpsertErrorKind,
    pub message: String,
}

/// Aggregate result of one batch. Failures are per node, never all-or-nothing.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpsertResult {
    pub success_count: u32,
    pub error_count: u32,
    pub inserted: u32,
    pub merged: u32,
    pub unchanged: u32,
    pub errors: Vec<UpsertError>,
}

impl UpsertResult {
    fn record(&mut self, outcome: &MergeOutcome) {
        self.success_count += 1;
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Merged(_) => self.merged += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
        }
    }

    fn push_error(&mut self, error: UpsertError) {
        self.error_count += 1;
        self.errors.push(error);
    }
}

impl std::fmt::Display for UpsertResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Upsert: {} succeeded ({} inserted, {} merged, {} unchanged), {} failed",
            self.success_count, self.inserted, self.merged, self.unchanged, self.error_count,
        )
    }
}

/// Result of a conflict-safe read-modify-write on one node.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Missing,
    Unchanged(Node),
    Updated(Node),
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }

    pub fn node(&self) -> Option<&Node> {
        match self {
            UpdateOutcome::Missing => None,
            UpdateOutcome::Unchanged(n) | UpdateOutcome::Updated(n) => Some(n),
        }
    }
}

/// Write-side wrapper for the graph. Every mutation goes through optimistic
/// compare-and-swap so concurrent collectors and cascade runs never clobber
/// each other.
#[derive(Clone)]
pub struct GraphWriter {
    pub(crate) store: Arc<dyn NodeStore>,
    pub(crate) ontology: Arc<Ontology>,
    pub(crate) retry: RetryPolicy,
    ensured: Arc<Mutex<HashSet<String>>>,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn NodeStore>, ontology: Arc<Ontology>) -> Self {
        Self {
            store,
            ontology,
            retry: RetryPolicy::default(),
            ensured: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn ontology(&self) -> &Ontology {
        &self.ontology
    }

    pub fn store(&self) -> Arc<dyn NodeStore> {
        Arc::clone(&self.store)
    }

    /// Make sure the project's partition exists before writing to it.
    pub async fn ensure_partition(&self, project_id: &str) -> Result<String, StoreError> {
        let partition = partition_name(project_id);
        let known = self
            .ensured
            .lock()
            .map(|set| set.contains(&partition))
            .unwrap_or(false);
        if !known {
            self.store.ensure_partition(&partition).await?;
            if let Ok(mut set) = self.ensured.lock() {
                set.insert(partition.clone());
            }
        }
        Ok(partition)
    }

    /// Merge a batch of observed nodes into a project's partition.
    ///
    /// Returns `Err` only when the store cannot be reached at all; every other
    /// failure is recorded against its node and the batch carries on.
    pub async fn upsert_batch(
        &self,
        nodes: Vec<Node>,
        project_id: &str,
    ) -> Result<UpsertResult, StoreError> {
        let project = project_or_default(project_id);
        let partition = self.ensure_partition(project).await?;
        let mut result = UpsertResult::default();

        for (index, node) in nodes.into_iter().enumerate() {
            let Some(node) = self.prepare(node, project, index, &mut result) else {
                continue;
            };
            let node_id = node.id.clone();

            match self.merge_node(&partition, &node).await {
                Ok(outcome) => {
                    debug!(id = node_id.as_str(), ?outcome, "Node upserted");
                    result.record(&outcome);
                }
                Err(e) if e.is_fatal() => {
                    warn!(partition = partition.as_str(), error = %e, "Store unreachable, aborting batch");
                    return Err(e);
                }
                Err(e) => {
                    warn!(id = node_id.as_str(), error = %e, "Node upsert failed");
                    result.push_error(UpsertError {
                        index,
                        node_id: Some(node_id),
                        kind: UpsertErrorKind::Store,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            partition = partition.as_str(),
            succeeded = result.success_count,
            inserted = result.inserted,
            merged = result.merged,
            failed = result.error_count,
            "Batch upserted"
        );
        Ok(result)
    }

    /// Validate one incoming node. Invalid edges are dropped with an error entry;
    /// a node without an id is dropped entirely.
    fn prepare(
        &self,
        mut node: Node,
        project: &str,
        index: usize,
        result: &mut UpsertResult,
    ) -> Option<Node> {
        if node.id.trim().is_empty() {
            result.push_error(UpsertError {
                index,
                node_id: None,
                kind: UpsertErrorKind::Validation,
                message: format!("node {:?} has no id", node.label),
            });
            return None;
        }

        if node.project_id != project {
            node.project_id = project.to_string();
        }

        let incoming = std::mem::take(&mut node.embedded_edges);
        for mut edge in incoming {
            if edge.target_id.trim().is_empty() {
                result.push_error(UpsertError {
                    index,
                    node_id: Some(node.id.clone()),
                    kind: UpsertErrorKind::Validation,
                    message: format!("edge {} has no target id", edge.relation),
                });
                continue;
            }
            edge.relation = self.ontology.resolve_relation(&edge.relation);
            if !edge.confidence.is_finite() {
                edge.confidence = self.ontology.default_confidence(&edge.relation);
            }
            edge.confidence = edge.confidence.clamp(0.0, 1.0);
            node.add_edge(edge);
        }

        Some(node)
    }

    /// Insert-if-absent, else additive merge with optimistic retries.
    pub async fn merge_node(&self, partition: &str, incoming: &Node) -> Result<MergeOutcome, StoreError> {
        let mut attempt = 0;
        loop {
            let last_error = match self.try_merge(partition, incoming).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => StoreError::Conflict {
                    id: incoming.id.clone(),
                    attempts: attempt + 1,
                },
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.retry.max_retries {
                return Err(last_error);
            }
            let backoff = self.retry.backoff(attempt);
            debug!(
                id = incoming.id.as_str(),
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %last_error,
                "Retrying merge"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// One read-modify-write attempt. `Ok(None)` means we lost a race.
    async fn try_merge(&self, partition: &str, incoming: &Node) -> Result<Option<MergeOutcome>, StoreError> {
        match self.store.get(partition, &incoming.id).await? {
            None => {
                if self.store.insert(partition, incoming).await? {
                    Ok(Some(MergeOutcome::Inserted))
                } else {
                    Ok(None)
                }
            }
            Some(current) => {
                let mut node = current.node;
                let changes = merge_into(&mut node, incoming, Utc::now());
                if !self.store.replace(partition, &node, current.version).await? {
                    return Ok(None);
                }
                if changes.is_empty() {
                    Ok(Some(MergeOutcome::Unchanged))
                } else {
                    Ok(Some(MergeOutcome::Merged(changes)))
                }
            }
        }
    }

    /// Conflict-safe read-modify-write of a single node.
    ///
    /// `mutate` returns whether it changed the node; it may run more than once
    /// when another writer races us, always against the freshest copy.
    pub async fn update_node<F>(
        &self,
        project_id: &str,
        id: &str,
        mut mutate: F,
    ) -> Result<UpdateOutcome, StoreError>
    where
        F: FnMut(&mut Node) -> bool + Send,
    {
        let partition = self.ensure_partition(project_or_default(project_id)).await?;
        let mut attempt = 0;
        loop {
            let Some(current) = self.store.get(&partition, id).await? else {
                return Ok(UpdateOutcome::Missing);
            };
            let mut node = current.node;
            if !mutate(&mut node) {
                return Ok(UpdateOutcome::Unchanged(node));
            }
            node.updated_at = Utc::now();

            if self.store.replace(&partition, &node, current.version).await? {
                return Ok(UpdateOutcome::Updated(node));
            }

            attempt += 1;
            if attempt > self.retry.max_retries {
                return Err(StoreError::Conflict {
                    id: id.to_string(),
                    attempts: attempt,
                });
            }
            tokio::time::sleep(self.retry.backoff(attempt)).await;
        }
    }
}
