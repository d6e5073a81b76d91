//! Undo one ingestion job.

use chrono::Utc;
use tracing::{info, warn};

use cymonides_common::{partition_name, project_or_default, Node};

use crate::store::{NodeFilter, StoreError};
use crate::writer::GraphWriter;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RollbackStats {
    pub nodes_deleted: u32,
    pub nodes_reverted: u32,
    pub edges_removed: u32,
    pub failed: u32,
}

impl std::fmt::Display for RollbackStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Rollback: {} deleted, {} reverted, {} edges removed, {} failed",
            self.nodes_deleted, self.nodes_reverted, self.edges_removed, self.failed,
        )
    }
}

enum Step {
    Deleted,
    Reverted { edges: u32 },
    Untouched,
}

/// True when `job` is the only thing that ever wrote this node. Operator
/// tags and edges written without a job count as other writers.
fn owned_by(node: &Node, job: &str) -> bool {
    node.created_by_job.as_deref() == Some(job)
        && node.ingestion_jobs.iter().all(|j| j == job)
        && node.tags.is_empty()
        && node
            .embedded_edges
            .iter()
            .all(|e| e.job_id.as_deref() == Some(job))
}

/// Strip the job's edges and membership. Returns the number of edges removed,
/// or `None` if the job left nothing on this node.
fn strip_job(node: &mut Node, job: &str) -> Option<u32> {
    let edges_before = node.embedded_edges.len();
    node.embedded_edges.retain(|e| e.job_id.as_deref() != Some(job));
    let edges = (edges_before - node.embedded_edges.len()) as u32;

    let jobs_before = node.ingestion_jobs.len();
    node.ingestion_jobs.retain(|j| j != job);

    (edges > 0 || node.ingestion_jobs.len() != jobs_before).then_some(edges)
}

impl GraphWriter {
    /// Remove everything a job contributed to a project.
    ///
    /// Nodes the job created alone are deleted; nodes other jobs also touched
    /// lose the job's edges and its id. Sources and metadata stay.
    pub async fn rollback_job(&self, project_id: &str, job_id: &str) -> Result<RollbackStats, StoreError> {
        let partition = partition_name(project_or_default(project_id));
        let touched = self
            .store
            .find(&partition, &NodeFilter::Job(job_id.to_string()))
            .await?;
        let mut stats = RollbackStats::default();

        for node in &touched {
            match self.rollback_node(&partition, &node.id, job_id).await {
                Ok(Step::Deleted) => stats.nodes_deleted += 1,
                Ok(Step::Reverted { edges }) => {
                    stats.nodes_reverted += 1;
                    stats.edges_removed += edges;
                }
                Ok(Step::Untouched) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(id = node.id.as_str(), job_id, error = %e, "Rollback of node failed");
                    stats.failed += 1;
                }
            }
        }

        info!(project_id, job_id, %stats, "Job rolled back");
        Ok(stats)
    }

    async fn rollback_node(&self, partition: &str, id: &str, job: &str) -> Result<Step, StoreError> {
        let mut attempt = 0;
        loop {
            let Some(current) = self.store.get(partition, id).await? else {
                return Ok(Step::Untouched);
            };

            let applied = if owned_by(&current.node, job) {
                self.store
                    .delete(partition, id, current.version)
                    .await?
                    .then_some(Step::Deleted)
            } else {
                let mut node = current.node;
                match strip_job(&mut node, job) {
                    None => Some(Step::Untouched),
                    Some(edges) => {
                        node.updated_at = Utc::now();
                        self.store
                            .replace(partition, &node, current.version)
                            .await?
                            .then_some(Step::Reverted { edges })
                    }
                }
            };
            if let Some(step) = applied {
                return Ok(step);
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
