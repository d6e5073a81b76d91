use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cymonides_common::{
    generate_node_id, is_first_sequence, partition_name, Node, NodeClass, NodeType,
    VerificationStatus, DISCOVERED_BY,
};

use crate::store::{NodeFilter, NodeStore, StoreError};

/// An entity waiting for follow-up search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: String,
    pub value: String,
    pub tag: Option<String>,
}

impl QueueEntry {
    fn from_node(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            value: node.canonical_value.clone(),
            tag: node.query_sequence_tag.clone(),
        }
    }
}

/// The VERIFIED entity that corroborates an UNVERIFIED one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    pub id: String,
    pub label: String,
    /// The shared source page, when the link is indirect.
    pub via: Option<(String, String)>,
}

impl VerifiedPeer {
    pub fn reason(&self) -> String {
        match &self.via {
            Some((_, page)) => format!(
                "co-occurs with VERIFIED {} ({}) on {}",
                self.label, self.id, page
            ),
            None => format!("directly linked to VERIFIED {} ({})", self.label, self.id),
        }
    }
}

/// Read-side wrapper for the graph: lookups, cascade queues, corroboration.
#[derive(Clone)]
pub struct GraphReader {
    pub(crate) store: Arc<dyn NodeStore>,
}

impl GraphReader {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self { store }
    }

    pub async fn get_node(&self, project_id: &str, id: &str) -> Result<Option<Node>, StoreError> {
        let partition = partition_name(project_id);
        Ok(self.store.get(&partition, id).await?.map(|v| v.node))
    }

    /// Look an entity up by its observed value.
    pub async fn find_entity(
        &self,
        project_id: &str,
        node_type: NodeType,
        value: &str,
    ) -> Result<Option<Node>, StoreError> {
        self.get_node(project_id, &generate_node_id(node_type, value)).await
    }

    pub async fn find(&self, project_id: &str, filter: &NodeFilter) -> Result<Vec<Node>, StoreError> {
        self.store.find(&partition_name(project_id), filter).await
    }

    /// VERIFIED entities with at least one discovery not yet followed up.
    pub async fn verified_queue(&self, project_id: &str) -> Result<Vec<QueueEntry>, StoreError> {
        let nodes = self
            .find(project_id, &NodeFilter::Status(VerificationStatus::Verified))
            .await?;
        Ok(nodes
            .iter()
            .filter(|n| n.is_entity() && n.has_unsearched_cascade_edge())
            .map(QueueEntry::from_node)
            .collect())
    }

    /// UNVERIFIED entities whose cascade tag is still at its first sequence.
    pub async fn unverified_queue(&self, project_id: &str) -> Result<Vec<QueueEntry>, StoreError> {
        let nodes = self
            .find(project_id, &NodeFilter::Status(VerificationStatus::Unverified))
            .await?;
        Ok(nodes
            .iter()
            .filter(|n| {
                n.is_entity()
                    && n.query_sequence_tag.as_deref().is_some_and(is_first_sequence)
            })
            .map(QueueEntry::from_node)
            .collect())
    }

    /// First VERIFIED entity that co-occurs with `entity`: either linked to it
    /// directly, or attached to the same source page. Query nodes and
    /// discovery edges are never evidence. Candidates are visited in id order.
    pub async fn find_verified_peer(
        &self,
        project_id: &str,
        entity: &Node,
    ) -> Result<Option<VerifiedPeer>, StoreError> {
        let inbound = self.find(project_id, &NodeFilter::TargetOf(entity.id.clone())).await?;

        let mut direct = BTreeSet::new();
        let mut pages = BTreeMap::new();

        for edge in entity.embedded_edges.iter().filter(|e| e.relation != DISCOVERED_BY) {
            match edge.target_class {
                NodeClass::Source => {
                    pages.insert(edge.target_id.clone(), edge.target_label.clone());
                }
                NodeClass::Nexus => {}
                _ => {
                    direct.insert(edge.target_id.clone());
                }
            }
        }
        for node in &inbound {
            let linked = node
                .embedded_edges
                .iter()
                .any(|e| e.target_id == entity.id && e.relation != DISCOVERED_BY);
            if !linked {
                continue;
            }
            match node.node_class {
                NodeClass::Source => {
                    pages.insert(node.id.clone(), node.label.clone());
                }
                NodeClass::Nexus => {}
                _ => {
                    direct.insert(node.id.clone());
                }
            }
        }

        for id in direct.iter().filter(|id| **id != entity.id) {
            if let Some(peer) = self.verified_entity(project_id, id).await? {
                return Ok(Some(VerifiedPeer {
                    id: peer.id,
                    label: peer.label,
                    via: None,
                }));
            }
        }

        for (page_id, page_label) in &pages {
            let mut peers = BTreeSet::new();
            if let Some(page) = self.get_node(project_id, page_id).await? {
                peers.extend(
                    page.embedded_edges
                        .iter()
                        .filter(|e| e.relation != DISCOVERED_BY)
                        .map(|e| e.target_id.clone()),
                );
            }
            for node in self.find(project_id, &NodeFilter::TargetOf(page_id.clone())).await? {
                peers.insert(node.id);
            }
            peers.remove(&entity.id);

            for id in &peers {
                if let Some(peer) = self.verified_entity(project_id, id).await? {
                    return Ok(Some(VerifiedPeer {
                        id: peer.id,
                        label: peer.label,
                        via: Some((page_id.clone(), page_label.clone())),
                    }));
                }
            }
        }

        Ok(None)
    }

    async fn verified_entity(&self, project_id: &str, id: &str) -> Result<Option<Node>, StoreError> {
        Ok(self
            .get_node(project_id, id)
            .await?
            .filter(|n| n.is_entity() && n.is_verified()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_names_the_verified_entity() {
        let direct = VerifiedPeer {
            id: "abc".into(),
            label: "Acme Subsidiary".into(),
            via: None,
        };
        assert!(direct.reason().contains("Acme Subsidiary"));

        let shared = VerifiedPeer {
            via: Some(("p1".into(), "https://acme.com/team".into())),
            ..direct
        };
        assert!(shared.reason().contains("https://acme.com/team"));
        assert!(shared.reason().contains("abc"));
    }
}
