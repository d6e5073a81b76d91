// Trait boundary between the cascade controller and whatever performs searches.
//
// EntitySearch is implemented by CollectorPool in production and by
// StubSearch in tests: no network, no database, no Docker.

use anyhow::Result;
use async_trait::async_trait;

use cymonides_common::{Node, VerificationStatus};

/// An entity surfaced by a search, with the confidence the search has in it.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    pub node: Node,
    pub status: VerificationStatus,
    /// Why the search believes this entity is connected to the query.
    pub reason: String,
}

impl Discovery {
    pub fn verified(node: Node, reason: impl Into<String>) -> Self {
        Self {
            node,
            status: VerificationStatus::Verified,
            reason: reason.into(),
        }
    }

    pub fn unverified(node: Node, reason: impl Into<String>) -> Self {
        Self {
            node,
            status: VerificationStatus::Unverified,
            reason: reason.into(),
        }
    }
}

/// Everything one search produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutcome {
    /// Supporting nodes (result pages, emails, ...) with their edges.
    pub nodes: Vec<Node>,
    /// Entities that enter the verification cascade.
    pub discoveries: Vec<Discovery>,
}

impl SearchOutcome {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.discoveries.is_empty()
    }

    pub fn extend(&mut self, other: SearchOutcome) {
        self.nodes.extend(other.nodes);
        self.discoveries.extend(other.discoveries);
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_discovery(mut self, discovery: Discovery) -> Self {
        self.discoveries.push(discovery);
        self
    }
}

#[async_trait]
pub trait EntitySearch: Send + Sync {
    /// Search every upstream source for `query`. An error means nothing usable
    /// came back; the caller decides whether to retry later.
    async fn search(&self, query: &str, project_id: &str) -> Result<SearchOutcome>;
}
