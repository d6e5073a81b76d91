use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CymonidesError;
use crate::id::{canonical_value, generate_node_id, project_or_default};

/// Relation carried by the edges that record which query surfaced an entity.
pub const DISCOVERED_BY: &str = "discovered_by";

/// Relation every unknown or unresolvable relation collapses to.
pub const FALLBACK_RELATION: &str = "related_to";

/// Confidence used when neither the caller nor the ontology supplies one.
pub const DEFAULT_CONFIDENCE: f64 = 0.85;

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    Entity,
    Source,
    Location,
    Category,
    Nexus,
    Narrative,
}

impl std::fmt::Display for NodeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeClass::Entity => write!(f, "entity"),
            NodeClass::Source => write!(f, "source"),
            NodeClass::Location => write!(f, "location"),
            NodeClass::Category => write!(f, "category"),
            NodeClass::Nexus => write!(f, "nexus"),
            NodeClass::Narrative => write!(f, "narrative"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Person,
    Company,
    Email,
    Phone,
    Domain,
    Username,
    Ip,
    Linkedin,
    Password,
    Webpage,
    Municipality,
    Region,
    Country,
    Industry,
    Query,
    Tag,
    Workstream,
    Note,
}

impl NodeType {
    pub const ALL: [NodeType; 18] = [
        NodeType::Person,
        NodeType::Company,
        NodeType::Email,
        NodeType::Phone,
        NodeType::Domain,
        NodeType::Username,
        NodeType::Ip,
        NodeType::Linkedin,
        NodeType::Password,
        NodeType::Webpage,
        NodeType::Municipality,
        NodeType::Region,
        NodeType::Country,
        NodeType::Industry,
        NodeType::Query,
        NodeType::Tag,
        NodeType::Workstream,
        NodeType::Note,
    ];

    /// The closed class every type belongs to.
    pub fn node_class(self) -> NodeClass {
        match self {
            NodeType::Person
            | NodeType::Company
            | NodeType::Email
            | NodeType::Phone
            | NodeType::Domain
            | NodeType::Username
            | NodeType::Ip
            | NodeType::Linkedin
            | NodeType::Password => NodeClass::Entity,
            NodeType::Webpage => NodeClass::Source,
            NodeType::Municipality | NodeType::Region | NodeType::Country => NodeClass::Location,
            NodeType::Industry => NodeClass::Category,
            NodeType::Query => NodeClass::Nexus,
            NodeType::Tag | NodeType::Workstream | NodeType::Note => NodeClass::Narrative,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Person => "person",
            NodeType::Company => "company",
            NodeType::Email => "email",
            NodeType::Phone => "phone",
            NodeType::Domain => "domain",
            NodeType::Username => "username",
            NodeType::Ip => "ip",
            NodeType::Linkedin => "linkedin",
            NodeType::Password => "password",
            NodeType::Webpage => "webpage",
            NodeType::Municipality => "municipality",
            NodeType::Region => "region",
            NodeType::Country => "country",
            NodeType::Industry => "industry",
            NodeType::Query => "query",
            NodeType::Tag => "tag",
            NodeType::Workstream => "workstream",
            NodeType::Note => "note",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = CymonidesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        NodeType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| CymonidesError::Validation(format!("unknown node type: {s}")))
    }
}

/// Verification state of an entity or cascade edge.
///
/// Ordered so that `max` implements the only legal transition:
/// UNVERIFIED may become VERIFIED, never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Unverified,
    Verified,
}

impl VerificationStatus {
    /// Combine an existing status with a newly observed one.
    pub fn merge(existing: Option<Self>, incoming: Option<Self>) -> Option<Self> {
        existing.max(incoming)
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationStatus::Unverified => write!(f, "UNVERIFIED"),
            VerificationStatus::Verified => write!(f, "VERIFIED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
        }
    }
}

// --- Edge ---

/// A directed, typed relationship embedded in its source node's document.
///
/// Target classification is copied at creation time so an edge can be rendered
/// without loading its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub target_id: String,
    pub target_class: NodeClass,
    pub target_type: NodeType,
    pub target_label: String,
    pub relation: String,
    pub direction: Direction,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<VerificationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_sequence_tag: Option<String>,
    #[serde(default)]
    pub already_searched: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Identity of an edge within one node: at most one edge per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey<'a> {
    pub target_id: &'a str,
    pub relation: &'a str,
    pub direction: Direction,
}

impl Edge {
    pub fn key(&self) -> EdgeKey<'_> {
        EdgeKey {
            target_id: &self.target_id,
            relation: &self.relation,
            direction: self.direction,
        }
    }

    /// Edges that carry cascade state: the incoming link from the query that surfaced an entity.
    pub fn is_cascade(&self) -> bool {
        self.relation == DISCOVERED_BY && self.direction == Direction::Incoming
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// --- Node ---

/// A canonical entity or source document, with its outgoing and incoming
/// relationships embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node_class: NodeClass,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    pub canonical_value: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub embedded_edges: Vec<Edge>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<VerificationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_sequence_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_reason: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub source_system: String,
    #[serde(default)]
    pub ingestion_jobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_job: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    /// Build a node for a raw observed value. The label keeps the original
    /// casing; id and canonical value are normalized.
    pub fn new(node_type: NodeType, value: &str, project_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: generate_node_id(node_type, value),
            node_class: node_type.node_class(),
            node_type,
            label: value.trim().to_string(),
            canonical_value: canonical_value(value),
            sources: Vec::new(),
            embedded_edges: Vec::new(),
            metadata: Map::new(),
            verification_status: None,
            query_sequence_tag: None,
            upgrade_reason: None,
            tags: Vec::new(),
            project_id: project_or_default(project_id).to_string(),
            source_system: String::new(),
            ingestion_jobs: Vec::new(),
            created_by_job: None,
            created_at: now,
            updated_at: now,
            last_seen: now,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        if !label.trim().is_empty() {
            self.label = label.trim().to_string();
        }
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.add_source(source);
        self
    }

    pub fn with_source_system(mut self, system: impl Into<String>) -> Self {
        self.source_system = system.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: VerificationStatus) -> Self {
        self.verification_status = Some(status);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.add_edge(edge);
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.stamp_job(&job_id.into());
        self
    }

    /// Attribute this node and every edge not yet attributed to an ingestion job.
    pub fn stamp_job(&mut self, job_id: &str) {
        if !self.ingestion_jobs.iter().any(|j| j == job_id) {
            self.ingestion_jobs.push(job_id.to_string());
        }
        if self.created_by_job.is_none() {
            self.created_by_job = Some(job_id.to_string());
        }
        for edge in self.embedded_edges.iter_mut().filter(|e| e.job_id.is_none()) {
            edge.job_id = Some(job_id.to_string());
        }
    }

    /// Append a source unless already present. Returns whether it was added.
    pub fn add_source(&mut self, source: impl Into<String>) -> bool {
        let source = source.into();
        if source.is_empty() || self.sources.contains(&source) {
            return false;
        }
        self.sources.push(source);
        true
    }

    /// Append an edge unless one with the same key exists. Returns whether it was added.
    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if self.find_edge(edge.key()).is_some() {
            return false;
        }
        self.embedded_edges.push(edge);
        true
    }

    pub fn find_edge(&self, key: EdgeKey<'_>) -> Option<&Edge> {
        self.embedded_edges.iter().find(|e| e.key() == key)
    }

    pub fn find_edge_mut(&mut self, key: EdgeKey<'_>) -> Option<&mut Edge> {
        self.embedded_edges.iter_mut().find(|e| e.key() == key)
    }

    pub fn is_entity(&self) -> bool {
        self.node_class == NodeClass::Entity
    }

    pub fn is_verified(&self) -> bool {
        self.verification_status == Some(VerificationStatus::Verified)
    }

    pub fn cascade_edges(&self) -> impl Iterator<Item = &Edge> {
        self.embedded_edges.iter().filter(|e| e.is_cascade())
    }

    /// True while at least one cascade edge has not been followed up.
    pub fn has_unsearched_cascade_edge(&self) -> bool {
        self.cascade_edges().any(|e| !e.already_searched)
    }
}
