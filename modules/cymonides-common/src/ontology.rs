//! Relationship ontology: which relations exist, which relation links two node
//! types, and how confident a relation is by default.
//!
//! Lookups never fail. Unknown relations resolve to `related_to` and unknown
//! confidences to 0.85, so an empty ontology is a valid configuration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Map;
use tracing::{debug, info};

use crate::error::CymonidesError;
use crate::types::{
    Direction, Edge, Node, NodeType, VerificationStatus, DEFAULT_CONFIDENCE, DISCOVERED_BY,
    FALLBACK_RELATION,
};

const BUILTIN_RELATIONS: &[(&str, Option<f64>)] = &[
    ("works_for", Some(0.85)),
    ("has_email", Some(0.9)),
    ("has_phone", Some(0.9)),
    ("has_domain", Some(0.9)),
    ("has_username", Some(0.8)),
    ("found_on", Some(0.8)),
    ("mentions", Some(0.7)),
    ("co_occurs_with", Some(0.6)),
    ("owns", Some(0.9)),
    ("officer_of", Some(0.95)),
    ("located_in", Some(0.9)),
    ("operates_in", Some(0.8)),
    ("same_as", Some(0.95)),
    (DISCOVERED_BY, Some(0.7)),
    ("tagged_with", Some(1.0)),
    (FALLBACK_RELATION, None),
];

const BUILTIN_PAIRS: &[(NodeType, NodeType, &str)] = &[
    (NodeType::Person, NodeType::Company, "works_for"),
    (NodeType::Person, NodeType::Email, "has_email"),
    (NodeType::Company, NodeType::Email, "has_email"),
    (NodeType::Person, NodeType::Phone, "has_phone"),
    (NodeType::Company, NodeType::Phone, "has_phone"),
    (NodeType::Company, NodeType::Domain, "has_domain"),
    (NodeType::Person, NodeType::Username, "has_username"),
    (NodeType::Person, NodeType::Linkedin, "same_as"),
    (NodeType::Company, NodeType::Company, "owns"),
    (NodeType::Person, NodeType::Webpage, "found_on"),
    (NodeType::Company, NodeType::Webpage, "found_on"),
    (NodeType::Email, NodeType::Webpage, "found_on"),
    (NodeType::Phone, NodeType::Webpage, "found_on"),
    (NodeType::Domain, NodeType::Webpage, "found_on"),
    (NodeType::Username, NodeType::Webpage, "found_on"),
    (NodeType::Webpage, NodeType::Person, "mentions"),
    (NodeType::Webpage, NodeType::Company, "mentions"),
    (NodeType::Company, NodeType::Municipality, "located_in"),
    (NodeType::Company, NodeType::Region, "located_in"),
    (NodeType::Company, NodeType::Country, "located_in"),
    (NodeType::Person, NodeType::Country, "located_in"),
    (NodeType::Company, NodeType::Industry, "operates_in"),
    (NodeType::Query, NodeType::Person, DISCOVERED_BY),
    (NodeType::Query, NodeType::Company, DISCOVERED_BY),
];

/// On-disk ontology format.
///
/// ```json
/// {
///   "relations": { "works_for": { "confidence": 0.85 }, "mentions": {} },
///   "pairs": [ { "source": "person", "target": "company", "relation": "works_for" } ]
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
struct OntologyFile {
    #[serde(default)]
    relations: BTreeMap<String, RelationSpec>,
    #[serde(default)]
    pairs: Vec<PairSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct RelationSpec {
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PairSpec {
    source: NodeType,
    target: NodeType,
    relation: String,
}

#[derive(Debug, Clone, Default)]
pub struct Ontology {
    relations: BTreeSet<String>,
    pairs: HashMap<(NodeType, NodeType), String>,
    confidences: HashMap<String, f64>,
}

impl Ontology {
    /// No relations, no pairs: everything falls back.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The vocabulary shipped with the bridge.
    pub fn builtin() -> Self {
        let mut ontology = Self::empty();
        for (name, confidence) in BUILTIN_RELATIONS {
            ontology = ontology.with_relation(name, *confidence);
        }
        for (source, target, relation) in BUILTIN_PAIRS {
            ontology = ontology.with_pair(*source, *target, relation);
        }
        ontology
    }

    pub fn from_json(raw: &str) -> Result<Self, CymonidesError> {
        let file: OntologyFile = serde_json::from_str(raw)
            .map_err(|e| CymonidesError::Ontology(format!("invalid ontology file: {e}")))?;

        let mut ontology = Self::empty();
        for (name, spec) in file.relations {
            if let Some(c) = spec.confidence {
                if !(0.0..=1.0).contains(&c) {
                    return Err(CymonidesError::Ontology(format!(
                        "confidence for {name} out of range: {c}"
                    )));
                }
            }
            ontology = ontology.with_relation(&name, spec.confidence);
        }
        for pair in file.pairs {
            ontology = ontology.with_pair(pair.source, pair.target, &pair.relation);
        }
        Ok(ontology)
    }

    pub fn load(path: &Path) -> Result<Self, CymonidesError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CymonidesError::Ontology(format!("cannot read {}: {e}", path.display()))
        })?;
        let ontology = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            relations = ontology.relations.len(),
            pairs = ontology.pairs.len(),
            "Loaded relationship ontology"
        );
        Ok(ontology)
    }

    pub fn with_relation(mut self, name: &str, confidence: Option<f64>) -> Self {
        let name = normalize_relation(name);
        if let Some(c) = confidence {
            self.confidences.insert(name.clone(), c.clamp(0.0, 1.0));
        }
        self.relations.insert(name);
        self
    }

    /// Register a type pair. The relation joins the vocabulary if it is new.
    pub fn with_pair(mut self, source: NodeType, target: NodeType, relation: &str) -> Self {
        let relation = normalize_relation(relation);
        self.relations.insert(relation.clone());
        self.pairs.insert((source, target), relation);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty() && self.pairs.is_empty()
    }

    /// `discovered_by` is reserved: cascade state depends on it whatever the vocabulary says.
    pub fn is_known(&self, relation: &str) -> bool {
        let normalized = normalize_relation(relation);
        normalized == DISCOVERED_BY || self.relations.contains(&normalized)
    }

    /// Validate a relation against the vocabulary, falling back to `related_to`.
    pub fn resolve_relation(&self, relation: &str) -> String {
        let normalized = normalize_relation(relation);
        if self.is_known(&normalized) {
            normalized
        } else {
            debug!(relation, "Unknown relation, falling back to {FALLBACK_RELATION}");
            FALLBACK_RELATION.to_string()
        }
    }

    pub fn relation_for(&self, source: NodeType, target: NodeType) -> Option<&str> {
        self.pairs.get(&(source, target)).map(String::as_str)
    }

    pub fn default_confidence(&self, relation: &str) -> f64 {
        self.confidences
            .get(&normalize_relation(relation))
            .copied()
            .unwrap_or(DEFAULT_CONFIDENCE)
    }
}

fn normalize_relation(relation: &str) -> String {
    relation.trim().to_lowercase()
}

/// Relation linking a source type to a target type. Total: unknown pairs yield `related_to`.
pub fn classify_relation(source: NodeType, target: NodeType, ontology: &Ontology) -> String {
    ontology
        .relation_for(source, target)
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_RELATION.to_string())
}

/// Outgoing edge to `target`, denormalizing its current classification.
///
/// Explicit confidences are clamped into [0, 1]; otherwise the relation's
/// ontology default (or 0.85) applies.
pub fn build_edge(target: &Node, relation: &str, confidence: Option<f64>, ontology: &Ontology) -> Edge {
    let relation = ontology.resolve_relation(relation);
    let confidence = match confidence {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => ontology.default_confidence(&relation),
    };
    Edge {
        target_id: target.id.clone(),
        target_class: target.node_class,
        target_type: target.node_type,
        target_label: target.label.clone(),
        relation,
        direction: Direction::Outgoing,
        confidence,
        verification_status: None,
        connection_reason: None,
        query_sequence_tag: None,
        already_searched: false,
        metadata: Map::new(),
        job_id: None,
        created_at: Utc::now(),
    }
}

/// Incoming `discovered_by` edge recording that `query` surfaced an entity.
/// Carries the entity's cascade state for that discovery.
pub fn build_discovery_edge(
    query: &Node,
    status: VerificationStatus,
    reason: &str,
    sequence_tag: &str,
    ontology: &Ontology,
) -> Edge {
    let mut edge =
        build_edge(query, DISCOVERED_BY, None, ontology).with_direction(Direction::Incoming);
    edge.verification_status = Some(status);
    edge.connection_reason = (!reason.trim().is_empty()).then(|| reason.trim().to_string());
    edge.query_sequence_tag = Some(sequence_tag.to_string());
    edge
}
