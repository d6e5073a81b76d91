//! Deterministic identity helpers: node ids, partition names, cascade tags.

use sha2::{Digest, Sha256};

use crate::types::NodeType;

pub const DEFAULT_PROJECT: &str = "default";

const PARTITION_PREFIX: &str = "graph-";

/// Normalized form of an observed value used for dedup and lookup.
pub fn canonical_value(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// First 16 hex chars of SHA-256 over `"{type}:{canonical value}"`.
///
/// Pure: the same `(type, value)` yields the same id forever.
pub fn generate_node_id(node_type: NodeType, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node_type.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(canonical_value(value).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// The project a node belongs to, with blank ids mapped to the default project.
pub fn project_or_default(project_id: &str) -> &str {
    let trimmed = project_id.trim();
    if trimmed.is_empty() {
        DEFAULT_PROJECT
    } else {
        trimmed
    }
}

/// Partition (index/table) name for a project, e.g. `graph-p1`.
///
/// Ids made only of `[a-z0-9_-]`, without `__` and at most
/// `MAX_PLAIN_PROJECT` long, are used as they are. Anything else is
/// sanitized, truncated, and suffixed with `__` plus a digest of the id, so
/// two distinct projects never share a partition. The result stays well under
/// Postgres' 63-byte identifier limit, index suffixes included.
pub fn partition_name(project_id: &str) -> String {
    let project = project_or_default(project_id);
    if is_plain_project(project) {
        return format!("{PARTITION_PREFIX}{project}");
    }

    let sanitized: String = project
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(HASHED_PROJECT_STEM)
        .collect();
    let digest = hex::encode(Sha256::digest(project.as_bytes()));
    format!("{PARTITION_PREFIX}{sanitized}__{}", &digest[..16])
}

const MAX_PLAIN_PROJECT: usize = 40;
const HASHED_PROJECT_STEM: usize = 24;

fn is_plain_project(project: &str) -> bool {
    project.len() <= MAX_PLAIN_PROJECT
        && !project.contains("__")
        && project
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Cascade tag `"{value}_{n}"`.
pub fn sequence_tag(value: &str, n: u32) -> String {
    format!("{value}_{n}")
}

/// Split a cascade tag into its value and counter.
pub fn parse_sequence_tag(tag: &str) -> Option<(&str, u32)> {
    let (value, n) = tag.rsplit_once('_')?;
    let n = n.parse().ok()?;
    Some((value, n))
}

/// `"acme_1"` → `"acme_2"`.
pub fn next_sequence_tag(tag: &str) -> Option<String> {
    let (value, n) = parse_sequence_tag(tag)?;
    Some(sequence_tag(value, n.checked_add(1)?))
}

/// True for tags that have not been followed up yet.
pub fn is_first_sequence(tag: &str) -> bool {
    matches!(parse_sequence_tag(tag), Some((_, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_ignores_case_and_surrounding_whitespace() {
        assert_eq!(
            generate_node_id(NodeType::Company, "Acme Corp"),
            generate_node_id(NodeType::Company, "  acme corp ")
        );
        assert_eq!(
            generate_node_id(NodeType::Company, "acme corp"),
            generate_node_id(NodeType::Company, "ACME CORP")
        );
    }

    #[test]
    fn id_depends_on_type() {
        assert_ne!(
            generate_node_id(NodeType::Company, "acme"),
            generate_node_id(NodeType::Person, "acme")
        );
    }

    #[test]
    fn id_is_sixteen_hex_chars() {
        let id = generate_node_id(NodeType::Email, "info@acme.com");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn partition_names_are_sanitized() {
        assert_eq!(partition_name("p1"), "graph-p1");
        assert_eq!(partition_name(""), "graph-default");
        assert_eq!(partition_name("  "), "graph-default");
        assert_eq!(partition_name("case_42"), "graph-case_42");

        let hashed = partition_name("Case 42; DROP");
        assert!(hashed.starts_with("graph-case_42__drop__"));
        assert!(hashed
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'));
    }

    #[test]
    fn distinct_projects_never_share_a_partition() {
        let ids = [
            "case_42",
            "Case 42",
            "CASE?42",
            "case 42",
            "case__42",
            "operation-nightfall-2026-eastern-european-subsidiaries-a",
            "operation-nightfall-2026-eastern-european-subsidiaries-b",
        ];
        let names: std::collections::HashSet<_> = ids.iter().map(|id| partition_name(id)).collect();
        assert_eq!(names.len(), ids.len());
    }

    #[test]
    fn partition_names_fit_postgres_identifiers() {
        let long = "x".repeat(500);
        for id in ["p1", "Case 42", long.as_str(), "ünïcödé project"] {
            // `_canonical_idx` is the longest suffix migrations append.
            assert!(partition_name(id).len() + "_canonical_idx".len() <= 63, "{id}");
        }
    }

    #[test]
    fn sequence_tags_increment() {
        assert_eq!(next_sequence_tag("acme_1").as_deref(), Some("acme_2"));
        assert_eq!(next_sequence_tag("john_doe_9").as_deref(), Some("john_doe_10"));
        assert_eq!(parse_sequence_tag("john_doe_2"), Some(("john_doe", 2)));
        assert!(is_first_sequence("john_doe_1"));
        assert!(!is_first_sequence("john_doe_11"));
        assert_eq!(next_sequence_tag("no-counter"), None);
    }
}
