//! Tags, boolean tag queries, and tag-backed workstreams.
//!
//! Tags live in each node's `tags` array and are matched with array-contains
//! lookups. A query such as `(#acme AND #officers) OR #watchlist` is evaluated
//! by set intersection/union over the per-tag id sets.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use tracing::info;

use cymonides_common::{CymonidesError, Node, NodeType};

use crate::error::GraphError;
use crate::reader::GraphReader;
use crate::store::{NodeFilter, StoreError};
use crate::writer::GraphWriter;

/// `"#Acme Officers"` → `"acme_officers"`.
pub fn normalize_tag(raw: &str) -> Result<String, CymonidesError> {
    let trimmed = raw.trim().trim_start_matches('#').trim();
    let normalized = trimmed
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase();
    if normalized.is_empty() {
        return Err(CymonidesError::Validation(format!("empty tag: {raw:?}")));
    }
    Ok(normalized)
}

// --- Tag queries ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagQuery {
    Tag(String),
    And(Box<TagQuery>, Box<TagQuery>),
    Or(Box<TagQuery>, Box<TagQuery>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Tag(String),
}

fn tokenize(expr: &str) -> Result<Vec<Token>, CymonidesError> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    let flush = |word: &mut String, tokens: &mut Vec<Token>| -> Result<(), CymonidesError> {
        if word.is_empty() {
            return Ok(());
        }
        let token = match word.to_uppercase().as_str() {
            "AND" => Token::And,
            "OR" => Token::Or,
            _ => Token::Tag(normalize_tag(word)?),
        };
        tokens.push(token);
        word.clear();
        Ok(())
    };

    for c in expr.chars() {
        match c {
            '(' | ')' => {
                flush(&mut word, &mut tokens)?;
                tokens.push(if c == '(' { Token::Open } else { Token::Close });
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens)?,
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens)?;
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    // expr := term (OR term)*
    fn expr(&mut self) -> Result<TagQuery, CymonidesError> {
        let mut left = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.term()?;
            left = TagQuery::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // term := factor (AND factor)*
    fn term(&mut self) -> Result<TagQuery, CymonidesError> {
        let mut left = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.factor()?;
            left = TagQuery::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // factor := TAG | '(' expr ')'
    fn factor(&mut self) -> Result<TagQuery, CymonidesError> {
        match self.next() {
            Some(Token::Tag(tag)) => Ok(TagQuery::Tag(tag)),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(invalid("missing closing parenthesis")),
                }
            }
            Some(Token::Close) => Err(invalid("unexpected ')'")),
            Some(Token::And) | Some(Token::Or) => Err(invalid("operator without left operand")),
            None => Err(invalid("expression ends early")),
        }
    }
}

fn invalid(message: &str) -> CymonidesError {
    CymonidesError::Validation(format!("invalid tag query: {message}"))
}

impl TagQuery {
    pub fn parse(expr: &str) -> Result<Self, CymonidesError> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Err(invalid("empty expression"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let query = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(invalid("expected AND or OR between terms"));
        }
        Ok(query)
    }

    /// Every tag mentioned in the query.
    pub fn tags(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_tags(&mut out);
        out
    }

    fn collect_tags(&self, out: &mut BTreeSet<String>) {
        match self {
            TagQuery::Tag(tag) => {
                out.insert(tag.clone());
            }
            TagQuery::And(a, b) | TagQuery::Or(a, b) => {
                a.collect_tags(out);
                b.collect_tags(out);
            }
        }
    }

    /// Evaluate against precomputed per-tag id sets.
    pub fn evaluate(&self, sets: &BTreeMap<String, BTreeSet<String>>) -> BTreeSet<String> {
        match self {
            TagQuery::Tag(tag) => sets.get(tag).cloned().unwrap_or_default(),
            TagQuery::And(a, b) => {
                let left = a.evaluate(sets);
                let right = b.evaluate(sets);
                left.intersection(&right).cloned().collect()
            }
            TagQuery::Or(a, b) => {
                let mut left = a.evaluate(sets);
                left.extend(b.evaluate(sets));
                left
            }
        }
    }
}

impl FromStr for TagQuery {
    type Err = CymonidesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for TagQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagQuery::Tag(tag) => write!(f, "#{tag}"),
            TagQuery::And(a, b) => write!(f, "({a} AND {b})"),
            TagQuery::Or(a, b) => write!(f, "({a} OR {b})"),
        }
    }
}

// --- Store operations ---

impl GraphWriter {
    /// Tag a node. Returns false if the node was already tagged or does not exist.
    pub async fn add_tag(&self, project_id: &str, node_id: &str, tag: &str) -> Result<bool, GraphError> {
        let tag = normalize_tag(tag)?;
        let outcome = self
            .update_node(project_id, node_id, |node| {
                if node.tags.contains(&tag) {
                    return false;
                }
                node.tags.push(tag.clone());
                true
            })
            .await?;
        Ok(outcome.is_updated())
    }

    /// Untag a node. Returns false if the tag was not present.
    pub async fn remove_tag(&self, project_id: &str, node_id: &str, tag: &str) -> Result<bool, GraphError> {
        let tag = normalize_tag(tag)?;
        let outcome = self
            .update_node(project_id, node_id, |node| {
                let before = node.tags.len();
                node.tags.retain(|t| t != &tag);
                node.tags.len() != before
            })
            .await?;
        Ok(outcome.is_updated())
    }

    /// Create (or re-observe) a workstream: a narrative node whose members are
    /// the nodes carrying its tag.
    pub async fn create_workstream(
        &self,
        project_id: &str,
        name: &str,
        note: &str,
    ) -> Result<Node, GraphError> {
        let tag = normalize_tag(name)?;
        let node = Node::new(NodeType::Workstream, name, project_id)
            .with_metadata("tag", tag.clone())
            .with_metadata("note", note);

        let result = self.upsert_batch(vec![node.clone()], project_id).await?;
        if let Some(error) = result.errors.first() {
            return Err(StoreError::Backend(error.message.clone()).into());
        }
        info!(project_id, tag = tag.as_str(), "Workstream ready");
        Ok(node)
    }
}

impl GraphReader {
    pub async fn get_nodes_by_tag(&self, project_id: &str, tag: &str) -> Result<Vec<Node>, GraphError> {
        let tag = normalize_tag(tag)?;
        Ok(self.find(project_id, &NodeFilter::Tag(tag)).await?)
    }

    /// Nodes matching a boolean tag query, ordered by id.
    pub async fn query_tags(&self, project_id: &str, query: &TagQuery) -> Result<Vec<Node>, GraphError> {
        let mut sets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut nodes: BTreeMap<String, Node> = BTreeMap::new();
        for tag in query.tags() {
            let tagged = self.find(project_id, &NodeFilter::Tag(tag.clone())).await?;
            sets.insert(tag, tagged.iter().map(|n| n.id.clone()).collect());
            nodes.extend(tagged.into_iter().map(|n| (n.id.clone(), n)));
        }

        Ok(query
            .evaluate(&sets)
            .into_iter()
            .filter_map(|id| nodes.remove(&id))
            .collect())
    }

    pub async fn workstream_members(&self, project_id: &str, name: &str) -> Result<Vec<Node>, GraphError> {
        self.get_nodes_by_tag(project_id, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets(pairs: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        pairs
            .iter()
            .map(|(tag, ids)| (tag.to_string(), ids.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn normalizes_tags() {
        assert_eq!(normalize_tag("#Acme").unwrap(), "acme");
        assert_eq!(normalize_tag("  #Acme Officers ").unwrap(), "acme_officers");
        assert_eq!(normalize_tag("watch-list").unwrap(), "watch_list");
        assert!(normalize_tag("#").is_err());
        assert!(normalize_tag("   ").is_err());
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let q = TagQuery::parse("#a OR #b AND #c").unwrap();
        assert_eq!(q.to_string(), "(#a OR (#b AND #c))");

        let q = TagQuery::parse("(#a OR #b) and #c").unwrap();
        assert_eq!(q.to_string(), "((#a OR #b) AND #c)");
    }

    #[test]
    fn rejects_malformed_queries() {
        for bad in ["", "#a AND", "AND #a", "(#a OR #b", "#a #b", "#a )", "()"] {
            assert!(TagQuery::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn evaluates_by_set_operations() {
        let sets = sets(&[("a", &["1", "2", "3"]), ("b", &["2", "3", "4"]), ("c", &["9"])]);

        let and = TagQuery::parse("(#a AND #b)").unwrap().evaluate(&sets);
        assert_eq!(and.into_iter().collect::<Vec<_>>(), vec!["2", "3"]);

        let or = TagQuery::parse("(#a OR #c)").unwrap().evaluate(&sets);
        assert_eq!(or.into_iter().collect::<Vec<_>>(), vec!["1", "2", "3", "9"]);

        let missing = TagQuery::parse("#a AND #nothing").unwrap().evaluate(&sets);
        assert!(missing.is_empty());
    }

    #[test]
    fn collects_mentioned_tags() {
        let q = TagQuery::parse("(#A AND #b) OR #a").unwrap();
        assert_eq!(q.tags().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
