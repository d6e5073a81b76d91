// Store abstraction behind the upsert engine.
//
// NodeStore is the whole contract a document store has to meet: versioned
// get, insert-if-absent, compare-and-swap replace, delete, and array-contains
// lookups. Merge logic lives above it (writer.rs) so the same engine runs
// against Postgres, the in-process MemoryStore, or anything else that can do
// row-level optimistic locking.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use cymonides_common::{Node, NodeType, VerificationStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The backing store cannot be reached at all.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A single operation failed; other documents may still be writable.
    #[error("Store error: {0}")]
    Backend(String),

    /// Optimistic-concurrency retries ran out.
    #[error("Write conflict on {id} after {attempts} attempts")]
    Conflict { id: String, attempts: u32 },
}

impl StoreError {
    /// Only connectivity loss escapes a batch or a cascade round.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// A document together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub node: Node,
    pub version: u64,
}

/// Array-contains / term lookups the bridge needs.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeFilter {
    Tag(String),
    Source(String),
    /// Nodes holding an embedded edge that points at this id.
    TargetOf(String),
    Status(VerificationStatus),
    Job(String),
    Type(NodeType),
}

impl NodeFilter {
    /// JSON containment document equivalent to this filter (`doc @> filter`).
    pub fn containment(&self) -> Value {
        match self {
            NodeFilter::Tag(tag) => json!({ "tags": [tag] }),
            NodeFilter::Source(source) => json!({ "sources": [source] }),
            NodeFilter::TargetOf(id) => json!({ "embedded_edges": [{ "target_id": id }] }),
            NodeFilter::Status(status) => json!({ "verification_status": status }),
            NodeFilter::Job(job) => json!({ "ingestion_jobs": [job] }),
            NodeFilter::Type(node_type) => json!({ "type": node_type }),
        }
    }

    pub fn matches(&self, node: &Node) -> bool {
        match self {
            NodeFilter::Tag(tag) => node.tags.contains(tag),
            NodeFilter::Source(source) => node.sources.contains(source),
            NodeFilter::TargetOf(id) => node.embedded_edges.iter().any(|e| &e.target_id == id),
            NodeFilter::Status(status) => node.verification_status == Some(*status),
            NodeFilter::Job(job) => node.ingestion_jobs.contains(job),
            NodeFilter::Type(node_type) => node.node_type == *node_type,
        }
    }
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Create the partition if it does not exist. Idempotent and race tolerant.
    async fn ensure_partition(&self, partition: &str) -> Result<(), StoreError>;

    async fn get(&self, partition: &str, id: &str) -> Result<Option<Versioned>, StoreError>;

    /// Insert unless a document with this id exists. Returns false if it already did.
    async fn insert(&self, partition: &str, node: &Node) -> Result<bool, StoreError>;

    /// Replace iff the stored version still equals `expected`. Returns false on conflict.
    async fn replace(&self, partition: &str, node: &Node, expected: u64) -> Result<bool, StoreError>;

    /// Delete iff the stored version still equals `expected`. Returns false on conflict.
    async fn delete(&self, partition: &str, id: &str, expected: u64) -> Result<bool, StoreError>;

    /// All documents matching the filter, ordered by id.
    async fn find(&self, partition: &str, filter: &NodeFilter) -> Result<Vec<Node>, StoreError>;
}
