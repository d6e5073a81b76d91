//! In-process versioned document store.
//!
//! Same optimistic-concurrency contract as the Postgres store, with hooks for
//! simulating write failures, lost races and outages.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use cymonides_common::Node;

use crate::store::{NodeFilter, NodeStore, StoreError, Versioned};

type Partition = BTreeMap<String, (u64, Node)>;

#[derive(Default)]
struct State {
    partitions: HashMap<String, Partition>,
    failing_ids: HashSet<String>,
    pending_conflicts: HashMap<String, u32>,
    offline: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write touching `id` fails with a backend error.
    pub fn fail_writes_for(&self, id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_ids.insert(id.to_string());
        }
    }

    /// The next `count` replaces of `id` report a version conflict.
    pub fn inject_conflicts(&self, id: &str, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_conflicts.insert(id.to_string(), count);
        }
    }

    /// Simulate losing the connection to the store.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
    }

    /// Snapshot of a partition, ordered by id.
    pub fn nodes(&self, partition: &str) -> Vec<Node> {
        self.state
            .lock()
            .map(|state| {
                state
                    .partitions
                    .get(partition)
                    .map(|p| p.values().map(|(_, n)| n.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn has_partition(&self, partition: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.partitions.contains_key(partition))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))?;
        if state.offline {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(state)
    }
}

fn partition_mut<'a>(state: &'a mut State, partition: &str) -> Result<&'a mut Partition, StoreError> {
    state
        .partitions
        .get_mut(partition)
        .ok_or_else(|| StoreError::Backend(format!("partition {partition} does not exist")))
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn ensure_partition(&self, partition: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.partitions.entry(partition.to_string()).or_default();
        Ok(())
    }

    async fn get(&self, partition: &str, id: &str) -> Result<Option<Versioned>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .partitions
            .get(partition)
            .and_then(|p| p.get(id))
            .map(|(version, node)| Versioned {
                node: node.clone(),
                version: *version,
            }))
    }

    async fn insert(&self, partition: &str, node: &Node) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if state.failing_ids.contains(&node.id) {
            return Err(StoreError::Backend(format!("write rejected for {}", node.id)));
        }
        let docs = partition_mut(&mut state, partition)?;
        if docs.contains_key(&node.id) {
            return Ok(false);
        }
        docs.insert(node.id.clone(), (1, node.clone()));
        Ok(true)
    }

    async fn replace(&self, partition: &str, node: &Node, expected: u64) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if state.failing_ids.contains(&node.id) {
            return Err(StoreError::Backend(format!("write rejected for {}", node.id)));
        }
        if let Some(remaining) = state.pending_conflicts.get_mut(&node.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(false);
            }
        }
        let docs = partition_mut(&mut state, partition)?;
        match docs.get_mut(&node.id) {
            Some((version, stored)) if *version == expected => {
                *version += 1;
                *stored = node.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, partition: &str, id: &str, expected: u64) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if state.failing_ids.contains(id) {
            return Err(StoreError::Backend(format!("write rejected for {id}")));
        }
        let docs = partition_mut(&mut state, partition)?;
        let current = docs.get(id).map(|(version, _)| *version);
        if current != Some(expected) {
            return Ok(false);
        }
        docs.remove(id);
        Ok(true)
    }

    async fn find(&self, partition: &str, filter: &NodeFilter) -> Result<Vec<Node>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .partitions
            .get(partition)
            .map(|docs| {
                docs.values()
                    .filter(|(_, node)| filter.matches(node))
                    .map(|(_, node)| node.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
