//! Cascade state transitions. Each is one compare-and-swap on the entity's
//! own document, so concurrent cascade runs cannot double-increment a tag or
//! half-apply an upgrade.

use cymonides_common::{next_sequence_tag, Node, VerificationStatus};

use crate::store::StoreError;
use crate::writer::{GraphWriter, UpdateOutcome};

/// What `upgrade_to_verified` did, with the entity as stored afterwards.
#[derive(Debug, Clone)]
pub enum UpgradeOutcome {
    /// This call recorded the upgrade.
    Recorded(Node),
    /// An earlier upgrade already recorded its reason.
    AlreadyRecorded(Node),
    Missing,
}

impl UpgradeOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, UpgradeOutcome::Recorded(_))
    }

    pub fn into_node(self) -> Option<Node> {
        match self {
            UpgradeOutcome::Recorded(node) | UpgradeOutcome::AlreadyRecorded(node) => Some(node),
            UpgradeOutcome::Missing => None,
        }
    }
}

/// Proof that this run advanced an entity's cascade tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUpClaim {
    pub node_id: String,
    pub previous_tag: String,
    pub tag: String,
    /// Nexus ids of the discovery edges this claim marked as searched.
    pub marked: Vec<String>,
}

impl GraphWriter {
    /// Advance an UNVERIFIED entity's tag from `expected_tag` to the next
    /// sequence and mark the discovery edges carrying `expected_tag` as searched.
    ///
    /// Returns `None` when the entity is gone, already VERIFIED, or another run
    /// advanced it first.
    pub async fn claim_follow_up(
        &self,
        project_id: &str,
        node_id: &str,
        expected_tag: &str,
    ) -> Result<Option<FollowUpClaim>, StoreError> {
        let Some(next) = next_sequence_tag(expected_tag) else {
            return Ok(None);
        };

        let mut marked = Vec::new();
        let outcome = self
            .update_node(project_id, node_id, |node| {
                marked.clear();
                if node.is_verified() || node.query_sequence_tag.as_deref() != Some(expected_tag) {
                    return false;
                }
                for edge in node.embedded_edges.iter_mut().filter(|e| {
                    e.is_cascade()
                        && !e.already_searched
                        && e.query_sequence_tag.as_deref() == Some(expected_tag)
                }) {
                    edge.already_searched = true;
                    marked.push(edge.target_id.clone());
                }
                node.query_sequence_tag = Some(next.clone());
                true
            })
            .await?;

        Ok(outcome.is_updated().then(|| FollowUpClaim {
            node_id: node_id.to_string(),
            previous_tag: expected_tag.to_string(),
            tag: next,
            marked,
        }))
    }

    /// Undo a claim whose search failed, so a later invocation retries the entity.
    /// A no-op if the tag has moved on since.
    pub async fn release_follow_up(
        &self,
        project_id: &str,
        claim: &FollowUpClaim,
    ) -> Result<bool, StoreError> {
        let outcome = self
            .update_node(project_id, &claim.node_id, |node| {
                if node.query_sequence_tag.as_deref() != Some(claim.tag.as_str()) {
                    return false;
                }
                node.query_sequence_tag = Some(claim.previous_tag.clone());
                for edge in node
                    .embedded_edges
                    .iter_mut()
                    .filter(|e| e.is_cascade() && claim.marked.contains(&e.target_id))
                {
                    edge.already_searched = false;
                }
                true
            })
            .await?;
        Ok(outcome.is_updated())
    }

    /// Mark every discovery edge of an entity as followed up.
    pub async fn mark_searched(&self, project_id: &str, node_id: &str) -> Result<bool, StoreError> {
        let outcome = self
            .update_node(project_id, node_id, |node| {
                let mut changed = false;
                for edge in node
                    .embedded_edges
                    .iter_mut()
                    .filter(|e| e.is_cascade() && !e.already_searched)
                {
                    edge.already_searched = true;
                    changed = true;
                }
                changed
            })
            .await?;
        Ok(outcome.is_updated())
    }

    /// UNVERIFIED → VERIFIED for the entity and its discovery edges.
    ///
    /// The first recorded reason is kept, and only the call that records it
    /// gets `Recorded`. An entity a merge already flipped to VERIFIED still
    /// has its reason recorded here. There is no inverse.
    pub async fn upgrade_to_verified(
        &self,
        project_id: &str,
        node_id: &str,
        reason: &str,
    ) -> Result<UpgradeOutcome, StoreError> {
        let mut recorded = false;
        let outcome = self
            .update_node(project_id, node_id, |node| {
                recorded = node.upgrade_reason.is_none();
                let mut changed = recorded;
                if !node.is_verified() {
                    node.verification_status = Some(VerificationStatus::Verified);
                    changed = true;
                }
                if recorded {
                    node.upgrade_reason = Some(reason.to_string());
                }
                for edge in node.embedded_edges.iter_mut().filter(|e| e.is_cascade()) {
                    if edge.verification_status != Some(VerificationStatus::Verified) {
                        edge.verification_status = Some(VerificationStatus::Verified);
                        changed = true;
                    }
                }
                changed
            })
            .await?;

        Ok(match outcome {
            UpdateOutcome::Missing => UpgradeOutcome::Missing,
            UpdateOutcome::Updated(node) if recorded => UpgradeOutcome::Recorded(node),
            UpdateOutcome::Unchanged(node) | UpdateOutcome::Updated(node) => {
                UpgradeOutcome::AlreadyRecorded(node)
            }
        })
    }
}
