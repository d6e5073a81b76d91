//! Document contract tests.
//!
//! These pin the persisted shape of nodes and edges:
//! - Every field the store indexes is present on a serialized node
//! - Cascade fields only appear on edges that carry them
//! - Older documents missing optional fields still deserialize

use cymonides_common::{
    build_edge, generate_node_id, Node, NodeType, Ontology, VerificationStatus,
};
use serde_json::json;

const REQUIRED_NODE_FIELDS: &[&str] = &[
    "id",
    "node_class",
    "type",
    "label",
    "canonical_value",
    "sources",
    "embedded_edges",
    "metadata",
    "project_id",
    "created_at",
    "updated_at",
    "last_seen",
];

const REQUIRED_EDGE_FIELDS: &[&str] = &["target_id", "relation", "direction", "confidence", "created_at"];

#[test]
fn serialized_node_has_every_indexed_field() {
    let ontology = Ontology::builtin();
    let email = Node::new(NodeType::Email, "info@acme.com", "p1");
    let acme = Node::new(NodeType::Company, "Acme Corp", "p1")
        .with_source("google")
        .with_edge(build_edge(&email, "has_email", None, &ontology));

    let doc = serde_json::to_value(&acme).unwrap();
    for field in REQUIRED_NODE_FIELDS {
        assert!(doc.get(field).is_some(), "missing node field {field}");
    }
    let edge = &doc["embedded_edges"][0];
    for field in REQUIRED_EDGE_FIELDS {
        assert!(edge.get(field).is_some(), "missing edge field {field}");
    }
    assert!(edge.get("verification_status").is_none());
    assert!(edge.get("query_sequence_tag").is_none());
}

#[test]
fn minimal_legacy_document_deserializes() {
    let now = "2026-01-01T00:00:00Z";
    let doc = json!({
        "id": generate_node_id(NodeType::Person, "john doe"),
        "node_class": "entity",
        "type": "person",
        "label": "John Doe",
        "canonical_value": "john doe",
        "created_at": now,
        "updated_at": now,
        "last_seen": now,
        "verification_status": "UNVERIFIED",
        "embedded_edges": [{
            "target_id": "abc",
            "target_class": "nexus",
            "target_type": "query",
            "target_label": "acme",
            "relation": "discovered_by",
            "direction": "incoming",
            "confidence": 0.7,
            "created_at": now
        }]
    });

    let node: Node = serde_json::from_value(doc).unwrap();
    assert!(node.sources.is_empty());
    assert!(node.tags.is_empty());
    assert_eq!(node.verification_status, Some(VerificationStatus::Unverified));
    assert!(node.embedded_edges[0].is_cascade());
    assert!(!node.embedded_edges[0].already_searched);
}

#[test]
fn observations_of_the_same_entity_share_an_id() {
    let a = Node::new(NodeType::Company, "Acme Corp", "p1");
    let b = Node::new(NodeType::Company, "  ACME CORP  ", "p2");
    assert_eq!(a.id, b.id);
    assert_eq!(a.canonical_value, b.canonical_value);
    assert_ne!(a.label, b.label);
}
