//! Additive merge of an incoming observation into a stored node.
//!
//! Nothing already recorded is removed: sources and edges only grow, metadata
//! keys and identity fields are filled only where empty, and verification
//! status only moves towards VERIFIED.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use cymonides_common::{Edge, Node, VerificationStatus};

/// What a merge changed, ignoring the timestamp bump every merge performs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeChanges {
    pub sources_added: u32,
    pub edges_added: u32,
    pub edges_refreshed: u32,
    pub metadata_keys_filled: u32,
    pub fields_filled: u32,
    pub tags_added: u32,
    pub status_upgraded: bool,
}

impl MergeChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Fold `incoming` into `existing` in place.
pub fn merge_into(existing: &mut Node, incoming: &Node, now: DateTime<Utc>) -> MergeChanges {
    let mut changes = MergeChanges::default();

    for source in &incoming.sources {
        if existing.add_source(source.clone()) {
            changes.sources_added += 1;
        }
    }

    for edge in &incoming.embedded_edges {
        match existing.find_edge_mut(edge.key()) {
            Some(current) => {
                if refresh_edge(current, edge) {
                    changes.edges_refreshed += 1;
                }
            }
            None => {
                existing.embedded_edges.push(edge.clone());
                changes.edges_added += 1;
            }
        }
    }

    changes.metadata_keys_filled = merge_metadata(&mut existing.metadata, &incoming.metadata);

    changes.fields_filled += fill_string(&mut existing.label, &incoming.label);
    changes.fields_filled += fill_string(&mut existing.canonical_value, &incoming.canonical_value);
    changes.fields_filled += fill_string(&mut existing.source_system, &incoming.source_system);
    changes.fields_filled += fill_string(&mut existing.project_id, &incoming.project_id);
    changes.fields_filled += fill_option(&mut existing.created_by_job, &incoming.created_by_job);
    changes.fields_filled +=
        fill_option(&mut existing.query_sequence_tag, &incoming.query_sequence_tag);
    changes.fields_filled += fill_option(&mut existing.upgrade_reason, &incoming.upgrade_reason);

    for tag in &incoming.tags {
        if !existing.tags.contains(tag) {
            existing.tags.push(tag.clone());
            changes.tags_added += 1;
        }
    }
    for job in &incoming.ingestion_jobs {
        if !existing.ingestion_jobs.contains(job) {
            existing.ingestion_jobs.push(job.clone());
            changes.fields_filled += 1;
        }
    }

    let status =
        VerificationStatus::merge(existing.verification_status, incoming.verification_status);
    if status != existing.verification_status {
        changes.status_upgraded = true;
        existing.verification_status = status;
    }

    existing.updated_at = now;
    existing.last_seen = now;
    changes
}

/// Re-observation of an edge that already exists under the same key.
/// Returns whether anything changed.
fn refresh_edge(current: &mut Edge, incoming: &Edge) -> bool {
    let mut changed = false;

    if incoming.confidence > current.confidence {
        current.confidence = incoming.confidence;
        changed = true;
    }

    let status = VerificationStatus::merge(current.verification_status, incoming.verification_status);
    if status != current.verification_status {
        current.verification_status = status;
        changed = true;
    }

    changed |= fill_option(&mut current.connection_reason, &incoming.connection_reason) > 0;
    changed |= fill_option(&mut current.query_sequence_tag, &incoming.query_sequence_tag) > 0;
    changed |= merge_metadata(&mut current.metadata, &incoming.metadata) > 0;
    changed
}

/// Key-by-key merge: an incoming key lands only where the existing value is missing or empty.
pub fn merge_metadata(existing: &mut Map<String, Value>, incoming: &Map<String, Value>) -> u32 {
    let mut filled = 0;
    for (key, value) in incoming {
        if is_empty_value(value) {
            continue;
        }
        let replace = existing.get(key).map_or(true, is_empty_value);
        if replace {
            existing.insert(key.clone(), value.clone());
            filled += 1;
        }
    }
    filled
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn fill_string(existing: &mut String, incoming: &str) -> u32 {
    if existing.trim().is_empty() && !incoming.trim().is_empty() {
        *existing = incoming.to_string();
        1
    } else {
        0
    }
}

fn fill_option<T: Clone>(existing: &mut Option<T>, incoming: &Option<T>) -> u32 {
    if existing.is_none() && incoming.is_some() {
        existing.clone_from(incoming);
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cymonides_common::{build_edge, NodeType, Ontology};
    use serde_json::json;

    fn acme() -> Node {
        Node::new(NodeType::Company, "Acme Corp", "p1")
    }

    #[test]
    fn sources_union_preserves_order() {
        let mut existing = acme().with_source("google");
        let incoming = acme().with_source("bing").with_source("google");
        let changes = merge_into(&mut existing, &incoming, Utc::now());

        assert_eq!(existing.sources, vec!["google", "bing"]);
        assert_eq!(changes.sources_added, 1);
    }

    #[test]
    fn duplicate_edge_is_refreshed_not_appended() {
        let ontology = Ontology::builtin();
        let email = Node::new(NodeType::Email, "info@acme.com", "p1");
        let mut existing = acme().with_edge(build_edge(&email, "has_email", Some(0.5), &ontology));
        let incoming = acme().with_edge(build_edge(&email, "has_email", Some(0.8), &ontology));

        let changes = merge_into(&mut existing, &incoming, Utc::now());
        assert_eq!(existing.embedded_edges.len(), 1);
        assert_eq!(changes.edges_refreshed, 1);
        assert!((existing.embedded_edges[0].confidence - 0.8).abs() < f64::EPSILON);

        // Lower confidence never drags the stored value down.
        let weaker = acme().with_edge(build_edge(&email, "has_email", Some(0.1), &ontology));
        let changes = merge_into(&mut existing, &weaker, Utc::now());
        assert!(changes.is_empty());
        assert!((existing.embedded_edges[0].confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn metadata_existing_keys_win_unless_empty() {
        let mut existing = acme()
            .with_metadata("jurisdiction", "gb")
            .with_metadata("company_number", "");
        let incoming = acme()
            .with_metadata("jurisdiction", "us")
            .with_metadata("company_number", "0123")
            .with_metadata("status", "active");

        let changes = merge_into(&mut existing, &incoming, Utc::now());
        assert_eq!(changes.metadata_keys_filled, 2);
        assert_eq!(existing.metadata["jurisdiction"], json!("gb"));
        assert_eq!(existing.metadata["company_number"], json!("0123"));
        assert_eq!(existing.metadata["status"], json!("active"));
    }

    #[test]
    fn identity_fields_only_fill_blanks() {
        let mut existing = acme().with_source_system("opencorporates");
        existing.label = String::new();
        let incoming = acme().with_label("ACME CORPORATION").with_source_system("aleph");

        merge_into(&mut existing, &incoming, Utc::now());
        assert_eq!(existing.label, "ACME CORPORATION");
        assert_eq!(existing.source_system, "opencorporates");
    }

    #[test]
    fn status_never_downgrades() {
        let mut existing = acme().with_status(VerificationStatus::Verified);
        let incoming = acme().with_status(VerificationStatus::Unverified);
        let changes = merge_into(&mut existing, &incoming, Utc::now());

        assert!(!changes.status_upgraded);
        assert_eq!(existing.verification_status, Some(VerificationStatus::Verified));

        let mut existing = acme().with_status(VerificationStatus::Unverified);
        let incoming = acme().with_status(VerificationStatus::Verified);
        assert!(merge_into(&mut existing, &incoming, Utc::now()).status_upgraded);
    }

    #[test]
    fn remerge_of_same_observation_changes_nothing_but_timestamps() {
        let ontology = Ontology::builtin();
        let email = Node::new(NodeType::Email, "info@acme.com", "p1");
        let incoming = acme()
            .with_source("google")
            .with_metadata("jurisdiction", "gb")
            .with_edge(build_edge(&email, "has_email", None, &ontology));

        let mut existing = incoming.clone();
        let created = existing.created_at;
        let later = Utc::now() + chrono::Duration::seconds(5);
        let changes = merge_into(&mut existing, &incoming, later);

        assert!(changes.is_empty());
        assert_eq!(existing.created_at, created);
        assert_eq!(existing.updated_at, later);
        assert_eq!(existing.last_seen, later);
    }
}
