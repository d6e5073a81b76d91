//! Upstream records → graph nodes.
//!
//! Collectors hand back typed records; the normalizer turns each one into
//! supporting nodes plus the entities that enter the verification cascade.
//! Registry and WHOIS data is authoritative, so what it yields is VERIFIED.
//! Search hits and profiles only suggest, so what they yield is UNVERIFIED.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cymonides_common::{build_edge, classify_relation, Node, NodeClass, NodeType, Ontology};

use crate::traits::{Discovery, SearchOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamRecord {
    /// A web search result and the entities it mentions.
    SearchHit {
        source: String,
        url: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        snippet: String,
        #[serde(default)]
        entities: Vec<MentionedEntity>,
    },
    /// A company registry entry.
    CompanyRecord {
        source: String,
        name: String,
        #[serde(default)]
        jurisdiction: Option<String>,
        #[serde(default)]
        registration_number: Option<String>,
        #[serde(default)]
        officers: Vec<Officer>,
    },
    /// A social or professional profile.
    PersonProfile {
        source: String,
        name: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        employer: Option<String>,
        #[serde(default)]
        email: Option<String>,
        #[serde(default)]
        username: Option<String>,
    },
    WhoisRecord {
        source: String,
        domain: String,
        #[serde(default)]
        registrant_name: Option<String>,
        #[serde(default)]
        registrant_email: Option<String>,
        #[serde(default)]
        registrant_org: Option<String>,
    },
}

impl UpstreamRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamRecord::SearchHit { .. } => "search_hit",
            UpstreamRecord::CompanyRecord { .. } => "company_record",
            UpstreamRecord::PersonProfile { .. } => "person_profile",
            UpstreamRecord::WhoisRecord { .. } => "whois_record",
        }
    }

    pub fn source(&self) -> &str {
        match self {
            UpstreamRecord::SearchHit { source, .. }
            | UpstreamRecord::CompanyRecord { source, .. }
            | UpstreamRecord::PersonProfile { source, .. }
            | UpstreamRecord::WhoisRecord { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionedEntity {
    #[serde(rename = "type")]
    pub entity_type: NodeType,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Officer {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{kind} record is missing {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("{kind} record has invalid {field}: {value:?}")]
    InvalidValue {
        kind: &'static str,
        field: &'static str,
        value: String,
    },
}

pub struct Normalizer {
    ontology: Arc<Ontology>,
}

impl Normalizer {
    pub fn new(ontology: Arc<Ontology>) -> Self {
        Self { ontology }
    }

    pub fn normalize(
        &self,
        record: &UpstreamRecord,
        project_id: &str,
    ) -> Result<SearchOutcome, NormalizeError> {
        let kind = record.kind();
        match record {
            UpstreamRecord::SearchHit {
                source,
                url,
                title,
                snippet,
                entities,
            } => {
                let url = require_url(kind, "url", url)?;
                self.search_hit(project_id, source, url, title, snippet, entities)
            }
            UpstreamRecord::CompanyRecord {
                source,
                name,
                jurisdiction,
                registration_number,
                officers,
            } => {
                let name = require(kind, "name", name)?;
                Ok(self.company_record(
                    project_id,
                    source,
                    name,
                    jurisdiction.as_deref(),
                    registration_number.as_deref(),
                    officers,
                ))
            }
            UpstreamRecord::PersonProfile {
                source,
                name,
                url,
                employer,
                email,
                username,
            } => {
                let name = require(kind, "name", name)?;
                let url = match url.as_deref().and_then(present) {
                    Some(url) => Some(require_url(kind, "url", url)?),
                    None => None,
                };
                Ok(self.person_profile(
                    project_id,
                    source,
                    name,
                    url,
                    employer.as_deref().and_then(present),
                    email.as_deref().and_then(present),
                    username.as_deref().and_then(present),
                ))
            }
            UpstreamRecord::WhoisRecord {
                source,
                domain,
                registrant_name,
                registrant_email,
                registrant_org,
            } => {
                let domain = require(kind, "domain", domain)?;
                if domain.contains(char::is_whitespace) || !domain.contains('.') {
                    return Err(NormalizeError::InvalidValue {
                        kind,
                        field: "domain",
                        value: domain.to_string(),
                    });
                }
                Ok(self.whois_record(
                    project_id,
                    source,
                    domain,
                    registrant_name.as_deref().and_then(present),
                    registrant_email.as_deref().and_then(present),
                    registrant_org.as_deref().and_then(present),
                ))
            }
        }
    }

    fn search_hit(
        &self,
        project_id: &str,
        source: &str,
        url: &str,
        title: &str,
        snippet: &str,
        entities: &[MentionedEntity],
    ) -> Result<SearchOutcome, NormalizeError> {
        let mut page = observed(NodeType::Webpage, url, project_id, source).with_label(title);
        if let Some(snippet) = present(snippet) {
            page = page.with_metadata("snippet", snippet);
        }

        let mut outcome = SearchOutcome::default();
        for mentioned in entities {
            let Some(value) = present(&mentioned.value) else {
                continue;
            };
            if mentioned.entity_type.node_class() != NodeClass::Entity {
                return Err(NormalizeError::InvalidValue {
                    kind: "search_hit",
                    field: "entities",
                    value: mentioned.entity_type.to_string(),
                });
            }
            let entity = observed(mentioned.entity_type, value, project_id, source);
            let entity = self.link(entity, &page);
            page = self.link(page, &entity);
            outcome = outcome.with_discovery(Discovery::unverified(
                entity,
                format!("mentioned on {url}"),
            ));
        }

        outcome.nodes.insert(0, page);
        Ok(outcome)
    }

    fn company_record(
        &self,
        project_id: &str,
        source: &str,
        name: &str,
        jurisdiction: Option<&str>,
        registration_number: Option<&str>,
        officers: &[Officer],
    ) -> SearchOutcome {
        let mut company = observed(NodeType::Company, name, project_id, source);
        if let Some(jurisdiction) = jurisdiction.and_then(present) {
            company = company.with_metadata("jurisdiction", jurisdiction);
        }
        if let Some(number) = registration_number.and_then(present) {
            company = company.with_metadata("registration_number", number);
        }

        let mut outcome = SearchOutcome::default();
        for officer in officers {
            let Some(officer_name) = present(&officer.name) else {
                continue;
            };
            let mut person = observed(NodeType::Person, officer_name, project_id, source)
                .with_edge(build_edge(&company, "officer_of", None, &self.ontology));
            if let Some(role) = officer.role.as_deref().and_then(present) {
                person = person.with_metadata("role", role);
            }
            outcome = outcome.with_discovery(Discovery::verified(
                person,
                format!("officer of {} per {source}", company.label),
            ));
        }

        outcome.discoveries.insert(
            0,
            Discovery::verified(company, format!("registered company per {source}")),
        );
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn person_profile(
        &self,
        project_id: &str,
        source: &str,
        name: &str,
        url: Option<&str>,
        employer: Option<&str>,
        email: Option<&str>,
        username: Option<&str>,
    ) -> SearchOutcome {
        let mut person = observed(NodeType::Person, name, project_id, source);
        let mut outcome = SearchOutcome::default();

        if let Some(url) = url {
            let page = observed(NodeType::Webpage, url, project_id, source);
            person = self.link(person, &page);
            outcome = outcome.with_node(self.link(page, &person));
        }
        if let Some(email) = email {
            let email = observed(NodeType::Email, email, project_id, source);
            person = self.link(person, &email);
            outcome = outcome.with_node(email);
        }
        if let Some(username) = username {
            let username = observed(NodeType::Username, username, project_id, source);
            person = self.link(person, &username);
            outcome = outcome.with_node(username);
        }
        if let Some(employer) = employer {
            let company = observed(NodeType::Company, employer, project_id, source);
            person = self.link(person, &company);
            outcome = outcome.with_discovery(Discovery::unverified(
                company,
                format!("employer listed on {name}'s {source} profile"),
            ));
        }

        outcome.discoveries.insert(
            0,
            Discovery::unverified(person, format!("profile on {source}")),
        );
        outcome
    }

    fn whois_record(
        &self,
        project_id: &str,
        source: &str,
        domain: &str,
        registrant_name: Option<&str>,
        registrant_email: Option<&str>,
        registrant_org: Option<&str>,
    ) -> SearchOutcome {
        let domain_node = observed(NodeType::Domain, domain, project_id, source);
        let mut outcome = SearchOutcome::default();

        let mut org = registrant_org.map(|org| {
            self.link(observed(NodeType::Company, org, project_id, source), &domain_node)
        });
        let mut person = registrant_name.map(|name| {
            let person = observed(NodeType::Person, name, project_id, source);
            match &org {
                Some(org) => self.link(person, org),
                None => self.link(person, &domain_node),
            }
        });

        if let Some(email) = registrant_email {
            let email = observed(NodeType::Email, email, project_id, source);
            if let Some(holder) = person.take() {
                person = Some(self.link(holder, &email));
            } else if let Some(holder) = org.take() {
                org = Some(self.link(holder, &email));
            }
            outcome = outcome.with_node(email);
        }

        outcome = outcome.with_discovery(Discovery::verified(
            domain_node,
            format!("WHOIS record per {source}"),
        ));
        if let Some(org) = org {
            outcome = outcome.with_discovery(Discovery::verified(
                org,
                format!("WHOIS registrant organisation of {domain}"),
            ));
        }
        if let Some(person) = person {
            outcome = outcome.with_discovery(Discovery::verified(
                person,
                format!("WHOIS registrant of {domain}"),
            ));
        }
        outcome
    }

    /// Add an outgoing edge from `node` to `target`, relation by type pair.
    fn link(&self, mut node: Node, target: &Node) -> Node {
        let relation = classify_relation(node.node_type, target.node_type, &self.ontology);
        node.add_edge(build_edge(target, &relation, None, &self.ontology));
        node
    }
}

fn observed(node_type: NodeType, value: &str, project_id: &str, source: &str) -> Node {
    Node::new(node_type, value, project_id)
        .with_source(source)
        .with_source_system(source)
}

fn present(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn require<'a>(
    kind: &'static str,
    field: &'static str,
    value: &'a str,
) -> Result<&'a str, NormalizeError> {
    present(value).ok_or(NormalizeError::MissingField { kind, field })
}

fn require_url<'a>(
    kind: &'static str,
    field: &'static str,
    value: &'a str,
) -> Result<&'a str, NormalizeError> {
    let url = require(kind, field, value)?;
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url)
    } else {
        Err(NormalizeError::InvalidValue {
            kind,
            field,
            value: url.to_string(),
        })
    }
}
