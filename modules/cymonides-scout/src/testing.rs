// Test doubles for the scout crate.
//
// Two stubs matching the two trait boundaries:
// - StubSearch (EntitySearch): query → scripted SearchOutcome, records calls
// - StubCollector (Collector): fixed records, optional delay or failure
//
// Plus helpers for building discoveries and a MemoryStore-backed graph.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use cymonides_common::{build_edge, canonical_value, Node, NodeType, Ontology};
use cymonides_graph::{GraphReader, GraphWriter, MemoryStore, NodeStore, RetryPolicy};

use crate::cascade::CascadeController;
use crate::collector::Collector;
use crate::normalize::UpstreamRecord;
use crate::traits::{Discovery, EntitySearch, SearchOutcome};

// ---------------------------------------------------------------------------
// StubSearch
// ---------------------------------------------------------------------------

/// Scripted search. Unscripted queries return an empty outcome.
/// Builder pattern: `.on()`, `.fail_on()`.
#[derive(Default)]
pub struct StubSearch {
    outcomes: HashMap<String, SearchOutcome>,
    failures: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl StubSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, query: &str, outcome: SearchOutcome) -> Self {
        self.outcomes.insert(canonical_value(query), outcome);
        self
    }

    pub fn fail_on(mut self, query: &str) -> Self {
        self.failures.insert(canonical_value(query));
        self
    }

    /// Every query searched so far, in order, canonicalized.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, query: &str) -> usize {
        let wanted = canonical_value(query);
        self.calls.lock().unwrap().iter().filter(|q| **q == wanted).count()
    }
}

#[async_trait]
impl EntitySearch for StubSearch {
    async fn search(&self, query: &str, project_id: &str) -> Result<SearchOutcome> {
        let key = canonical_value(query);
        self.calls.lock().unwrap().push(key.clone());
        if self.failures.contains(&key) {
            bail!("upstream unavailable for {query}");
        }
        let mut outcome = self.outcomes.get(&key).cloned().unwrap_or_default();
        for node in outcome
            .nodes
            .iter_mut()
            .chain(outcome.discoveries.iter_mut().map(|d| &mut d.node))
        {
            node.project_id = project_id.to_string();
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// StubCollector
// ---------------------------------------------------------------------------

pub struct StubCollector {
    name: String,
    records: Vec<UpstreamRecord>,
    delay: Option<Duration>,
    fail: bool,
}

impl StubCollector {
    pub fn new(name: &str, records: Vec<UpstreamRecord>) -> Self {
        Self {
            name: name.to_string(),
            records,
            delay: None,
            fail: false,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Collector for StubCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, _query: &str) -> Result<Vec<UpstreamRecord>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            bail!("{} is down", self.name);
        }
        Ok(self.records.clone())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn person(name: &str) -> Node {
    Node::new(NodeType::Person, name, "p1").with_source("stub")
}

pub fn company(name: &str) -> Node {
    Node::new(NodeType::Company, name, "p1").with_source("stub")
}

pub fn page(url: &str) -> Node {
    Node::new(NodeType::Webpage, url, "p1").with_source("stub")
}

/// `entity` with a `found_on` edge to `page`.
pub fn on_page(entity: Node, page: &Node) -> Node {
    entity.with_edge(build_edge(page, "found_on", None, &Ontology::builtin()))
}

pub fn verified(node: Node) -> Discovery {
    Discovery::verified(node, "authoritative registry match")
}

pub fn unverified(node: Node) -> Discovery {
    Discovery::unverified(node, "search hit")
}

/// A fresh in-memory graph with both sides of the store kept for inspection.
pub struct MemoryGraph {
    pub store: Arc<MemoryStore>,
    pub writer: GraphWriter,
    pub reader: GraphReader,
}

impl MemoryGraph {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn NodeStore> = store.clone();
        let writer = GraphWriter::new(dyn_store.clone(), Arc::new(Ontology::builtin()))
            .with_retry(RetryPolicy {
                max_retries: 3,
                base_backoff: Duration::from_millis(1),
            });
        Self {
            store,
            writer,
            reader: GraphReader::new(dyn_store),
        }
    }

    pub fn controller(&self) -> CascadeController {
        CascadeController::new(self.writer.clone(), self.reader.clone())
    }

    /// Stored entity by type and raw value.
    pub async fn entity(&self, node_type: NodeType, value: &str) -> Option<Node> {
        self.reader.find_entity("p1", node_type, value).await.unwrap()
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}
