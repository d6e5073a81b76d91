//! Tagging, tag queries and workstreams against the in-process store.

use std::sync::Arc;

use cymonides_common::{Node, NodeType, Ontology};
use cymonides_graph::{GraphReader, GraphWriter, MemoryStore, NodeStore, TagQuery};

fn setup() -> (GraphWriter, GraphReader) {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryStore::new());
    (
        GraphWriter::new(store.clone(), Arc::new(Ontology::builtin())),
        GraphReader::new(store),
    )
}

async fn seed(writer: &GraphWriter) -> Vec<Node> {
    let nodes = vec![
        Node::new(NodeType::Company, "Acme Corp", "p1"),
        Node::new(NodeType::Person, "John Doe", "p1"),
        Node::new(NodeType::Person, "Jane Roe", "p1"),
        Node::new(NodeType::Email, "info@acme.com", "p1"),
    ];
    writer.upsert_batch(nodes.clone(), "p1").await.unwrap();
    nodes
}

fn ids(nodes: &[Node]) -> Vec<String> {
    nodes.iter().map(|n| n.id.clone()).collect()
}

#[tokio::test]
async fn add_and_remove_are_idempotent() {
    let (writer, reader) = setup();
    let nodes = seed(&writer).await;
    let acme = &nodes[0];

    assert!(writer.add_tag("p1", &acme.id, "#Acme").await.unwrap());
    assert!(!writer.add_tag("p1", &acme.id, "acme").await.unwrap());
    assert_eq!(ids(&reader.get_nodes_by_tag("p1", "#ACME").await.unwrap()), vec![acme.id.clone()]);

    assert!(writer.remove_tag("p1", &acme.id, "#acme").await.unwrap());
    assert!(!writer.remove_tag("p1", &acme.id, "#acme").await.unwrap());
    assert!(reader.get_nodes_by_tag("p1", "acme").await.unwrap().is_empty());

    assert!(!writer.add_tag("p1", "no-such-node", "acme").await.unwrap());
    assert!(writer.add_tag("p1", &acme.id, "   ").await.is_err());
}

#[tokio::test]
async fn boolean_queries_combine_tag_sets() {
    let (writer, reader) = setup();
    let nodes = seed(&writer).await;
    let (acme, john, jane, email) = (&nodes[0], &nodes[1], &nodes[2], &nodes[3]);

    for node in [acme, john, email] {
        writer.add_tag("p1", &node.id, "acme").await.unwrap();
    }
    for node in [john, jane] {
        writer.add_tag("p1", &node.id, "officers").await.unwrap();
    }
    writer.add_tag("p1", &email.id, "watchlist").await.unwrap();

    let both = reader
        .query_tags("p1", &"#acme AND #officers".parse::<TagQuery>().unwrap())
        .await
        .unwrap();
    assert_eq!(ids(&both), vec![john.id.clone()]);

    let either = reader
        .query_tags("p1", &TagQuery::parse("(#acme AND #officers) OR #watchlist").unwrap())
        .await
        .unwrap();
    let mut expected = vec![john.id.clone(), email.id.clone()];
    expected.sort();
    assert_eq!(ids(&either), expected);

    let none = reader
        .query_tags("p1", &TagQuery::parse("#officers AND #watchlist").unwrap())
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn workstream_members_are_nodes_with_its_tag() {
    let (writer, reader) = setup();
    let nodes = seed(&writer).await;

    let ws = writer
        .create_workstream("p1", "Acme Officers", "who runs acme")
        .await
        .unwrap();
    assert_eq!(ws.node_type, NodeType::Workstream);
    assert_eq!(ws.metadata.get("tag").and_then(|v| v.as_str()), Some("acme_officers"));

    writer.add_tag("p1", &nodes[1].id, "#acme officers").await.unwrap();
    writer.add_tag("p1", &nodes[2].id, "acme-officers").await.unwrap();

    let members = reader.workstream_members("p1", "Acme Officers").await.unwrap();
    let mut expected = vec![nodes[1].id.clone(), nodes[2].id.clone()];
    expected.sort();
    assert_eq!(ids(&members), expected);

    // Creating it again only re-observes the same node.
    let again = writer.create_workstream("p1", "acme officers", "").await.unwrap();
    assert_eq!(again.id, ws.id);
}
