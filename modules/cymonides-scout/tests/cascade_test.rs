//! Verification cascade against an in-memory graph and scripted searches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use cymonides_common::{NodeType, VerificationStatus};
use cymonides_scout::testing::{
    company, on_page, page, person, unverified, verified, MemoryGraph, StubSearch,
};
use cymonides_scout::{BudgetTracker, EntitySearch, SearchOutcome};

/// Seed for "acme": one VERIFIED subsidiary, one UNVERIFIED person.
fn acme_seed() -> SearchOutcome {
    SearchOutcome::default()
        .with_discovery(verified(company("Acme Subsidiary")))
        .with_discovery(unverified(person("John Doe")))
}

/// Searching "john doe" puts John on the same page as the VERIFIED subsidiary.
fn john_on_acme_page() -> SearchOutcome {
    let team = page("https://acme.com/team");
    SearchOutcome::default()
        .with_node(on_page(company("Acme Subsidiary"), &team))
        .with_node(team.clone())
        .with_discovery(unverified(on_page(person("John Doe"), &team)))
}

#[tokio::test]
async fn verified_phase_runs_before_unverified_and_advances_tag() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new().on("acme", acme_seed());

    let summary = graph
        .controller()
        .recursive_search("acme", "p1", 2, &search)
        .await
        .unwrap();

    assert_eq!(search.calls(), vec!["acme", "acme subsidiary", "john doe"]);
    assert_eq!(summary.verified_searches, 1);
    assert_eq!(summary.unverified_searches, 1);
    assert_eq!(summary.upgrades, 0);
    assert_eq!(summary.depth_reached, 1);

    let john = graph.entity(NodeType::Person, "John Doe").await.unwrap();
    assert_eq!(john.query_sequence_tag.as_deref(), Some("john doe_2"));
    assert_eq!(john.verification_status, Some(VerificationStatus::Unverified));
    assert!(graph.reader.unverified_queue("p1").await.unwrap().is_empty());
    assert!(graph.reader.verified_queue("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn every_verified_lead_precedes_every_unverified_one() {
    let graph = MemoryGraph::new();
    let seed = SearchOutcome::default()
        .with_discovery(unverified(person("Zed Unverified")))
        .with_discovery(verified(company("Globex")))
        .with_discovery(unverified(person("Ann Unverified")))
        .with_discovery(verified(company("Initech")));
    let search = StubSearch::new().on("seed", seed);

    graph
        .controller()
        .recursive_search("seed", "p1", 1, &search)
        .await
        .unwrap();

    let calls = search.calls();
    assert_eq!(calls.len(), 5);
    let mut verified_phase = calls[1..3].to_vec();
    verified_phase.sort();
    assert_eq!(verified_phase, vec!["globex", "initech"]);
    let mut unverified_phase = calls[3..5].to_vec();
    unverified_phase.sort();
    assert_eq!(unverified_phase, vec!["ann unverified", "zed unverified"]);
}

#[tokio::test]
async fn upgraded_entity_is_searched_again_in_the_same_round() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new()
        .on("acme", acme_seed())
        .on("john doe", john_on_acme_page());

    let summary = graph
        .controller()
        .recursive_search("acme", "p1", 1, &search)
        .await
        .unwrap();

    // max_depth 1: the second "john doe" can only come from the cascade.
    assert_eq!(
        search.calls(),
        vec!["acme", "acme subsidiary", "john doe", "john doe"]
    );
    assert_eq!(summary.upgrades, 1);
    assert_eq!(summary.cascade_searches, 1);
    assert_eq!(summary.total_searches, 4);

    let john = graph.entity(NodeType::Person, "John Doe").await.unwrap();
    assert!(john.is_verified());
    let reason = john.upgrade_reason.clone().unwrap();
    assert!(reason.contains("Acme Subsidiary"), "{reason}");
    assert!(reason.contains("https://acme.com/team"), "{reason}");
    assert!(!john.has_unsearched_cascade_edge());
}

#[tokio::test]
async fn authoritative_match_counts_as_upgrade() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new()
        .on("acme", SearchOutcome::default().with_discovery(unverified(person("Jane Roe"))))
        .on(
            "jane roe",
            SearchOutcome::default().with_discovery(verified(person("Jane Roe"))),
        );

    let summary = graph
        .controller()
        .recursive_search("acme", "p1", 1, &search)
        .await
        .unwrap();

    assert_eq!(summary.upgrades, 1);
    let jane = graph.entity(NodeType::Person, "Jane Roe").await.unwrap();
    assert!(jane
        .upgrade_reason
        .as_deref()
        .unwrap()
        .starts_with("matched an authoritative record"));
}

/// Seed for "acme": two UNVERIFIED people.
fn two_leads_seed() -> SearchOutcome {
    SearchOutcome::default()
        .with_discovery(unverified(person("John Doe")))
        .with_discovery(unverified(person("Jane Roe")))
}

#[tokio::test]
async fn lead_rediscovered_as_verified_is_upgraded_and_searched_in_the_same_round() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new()
        .on("acme", two_leads_seed())
        .on(
            "john doe",
            SearchOutcome::default().with_discovery(verified(person("Jane Roe"))),
        );

    let summary = graph
        .controller()
        .recursive_search("acme", "p1", 1, &search)
        .await
        .unwrap();

    assert_eq!(summary.upgrades, 1);
    assert_eq!(summary.cascade_searches, 1);
    let calls = search.calls();
    let john_at = calls.iter().position(|q| q == "john doe").unwrap();
    let jane_last = calls.iter().rposition(|q| q == "jane roe").unwrap();
    assert!(jane_last > john_at, "{calls:?}");

    let jane = graph.entity(NodeType::Person, "Jane Roe").await.unwrap();
    assert!(jane.is_verified());
    let reason = jane.upgrade_reason.clone().unwrap();
    assert!(reason.starts_with("matched an authoritative record"), "{reason}");
    assert!(reason.contains("john doe"), "{reason}");
    assert!(!jane.has_unsearched_cascade_edge());
    assert!(graph.reader.verified_queue("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn lead_verified_by_the_verified_phase_is_upgraded_before_other_leads() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new()
        .on(
            "acme",
            SearchOutcome::default()
                .with_discovery(verified(company("Globex")))
                .with_discovery(unverified(person("Jane Roe")))
                .with_discovery(unverified(person("John Doe"))),
        )
        .on(
            "globex",
            SearchOutcome::default().with_discovery(verified(person("Jane Roe"))),
        );

    let summary = graph
        .controller()
        .recursive_search("acme", "p1", 1, &search)
        .await
        .unwrap();

    assert_eq!(search.calls(), vec!["acme", "globex", "jane roe", "john doe"]);
    assert_eq!(summary.verified_searches, 1);
    assert_eq!(summary.cascade_searches, 1);
    assert_eq!(summary.unverified_searches, 1);
    assert_eq!(summary.upgrades, 1);

    let jane = graph.entity(NodeType::Person, "Jane Roe").await.unwrap();
    assert!(jane.upgrade_reason.unwrap().contains("globex"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_sharing_a_budget_stay_within_it() {
    let graph = MemoryGraph::new();
    let budget = Arc::new(BudgetTracker::new(3));
    let search = Arc::new(StubSearch::new().on("acme", acme_seed()));

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let controller = graph.controller().with_budget(budget.clone());
            let search = search.clone();
            tokio::spawn(async move {
                controller
                    .recursive_search("acme", "p1", 3, search.as_ref())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut searches = 0;
    for run in runs {
        searches += run.await.unwrap().total_searches;
    }

    assert_eq!(searches, 3);
    assert_eq!(search.calls().len(), 3);
    assert_eq!(budget.spent(), 3);
}

#[tokio::test]
async fn check_upgrade_without_evidence_is_none() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new().on("acme", acme_seed());
    let controller = graph.controller();
    controller.recursive_search("acme", "p1", 0, &search).await.unwrap();

    let john = graph.entity(NodeType::Person, "John Doe").await.unwrap();
    // Both were found by the same query; that alone proves nothing.
    assert!(controller
        .check_verification_upgrade("p1", &john.id)
        .await
        .unwrap()
        .is_none());
    assert!(controller
        .check_verification_upgrade("p1", "missing")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn max_depth_zero_only_seeds() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new().on("acme", acme_seed());

    let summary = graph
        .controller()
        .recursive_search("acme", "p1", 0, &search)
        .await
        .unwrap();

    assert_eq!(search.calls(), vec!["acme"]);
    assert_eq!(summary.depth_reached, 0);
    let john = graph.entity(NodeType::Person, "John Doe").await.unwrap();
    assert_eq!(john.query_sequence_tag.as_deref(), Some("john doe_1"));
    assert_eq!(graph.reader.unverified_queue("p1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_search_releases_the_claim_for_the_next_run() {
    let graph = MemoryGraph::new();
    let failing = StubSearch::new().on("acme", acme_seed()).fail_on("john doe");

    let summary = graph
        .controller()
        .recursive_search("acme", "p1", 3, &failing)
        .await
        .unwrap();

    assert_eq!(summary.failed_searches, 1);
    // Not retried within the same invocation.
    assert_eq!(failing.call_count("john doe"), 1);
    let john = graph.entity(NodeType::Person, "John Doe").await.unwrap();
    assert_eq!(john.query_sequence_tag.as_deref(), Some("john doe_1"));

    let healthy = StubSearch::new();
    let retry = graph
        .controller()
        .recursive_search("acme", "p1", 1, &healthy)
        .await
        .unwrap();

    assert_eq!(retry.failed_searches, 0);
    assert_eq!(healthy.calls(), vec!["acme", "john doe"]);
    let john = graph.entity(NodeType::Person, "John Doe").await.unwrap();
    assert_eq!(john.query_sequence_tag.as_deref(), Some("john doe_2"));
}

#[tokio::test]
async fn failing_seed_still_returns_a_summary() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new().fail_on("acme");

    let summary = graph
        .controller()
        .recursive_search("acme", "p1", 2, &search)
        .await
        .unwrap();

    assert_eq!(summary.total_searches, 1);
    assert_eq!(summary.failed_searches, 1);
    assert_eq!(summary.depth_reached, 0);
}

#[tokio::test]
async fn budget_stops_before_the_next_search() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new().on("acme", acme_seed());
    let budget = Arc::new(BudgetTracker::new(2));

    let summary = graph
        .controller()
        .with_budget(budget.clone())
        .recursive_search("acme", "p1", 3, &search)
        .await
        .unwrap();

    assert!(summary.budget_exhausted);
    assert_eq!(search.calls(), vec!["acme", "acme subsidiary"]);
    assert_eq!(budget.remaining(), Some(0));

    // John was never claimed, so he is still pending.
    let john = graph.entity(NodeType::Person, "John Doe").await.unwrap();
    assert_eq!(john.query_sequence_tag.as_deref(), Some("john doe_1"));
}

/// Raises the cancel flag once the wrapped search has answered `after` queries.
struct CancelAfter {
    inner: StubSearch,
    flag: Arc<AtomicBool>,
    after: usize,
}

#[async_trait]
impl EntitySearch for CancelAfter {
    async fn search(&self, query: &str, project_id: &str) -> Result<SearchOutcome> {
        let outcome = self.inner.search(query, project_id).await;
        if self.inner.calls().len() >= self.after {
            self.flag.store(true, Ordering::Relaxed);
        }
        outcome
    }
}

#[tokio::test]
async fn cancellation_stops_between_searches() {
    let graph = MemoryGraph::new();
    let flag = Arc::new(AtomicBool::new(false));
    let search = CancelAfter {
        inner: StubSearch::new().on("acme", acme_seed()),
        flag: flag.clone(),
        after: 1,
    };

    let summary = graph
        .controller()
        .with_cancel(flag)
        .recursive_search("acme", "p1", 3, &search)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.total_searches, 1);
    // The seed landed in full.
    assert!(graph.entity(NodeType::Company, "Acme Subsidiary").await.is_some());
    assert_eq!(graph.reader.verified_queue("p1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new().on("acme", acme_seed());
    let controller = graph.controller();
    controller.cancel_handle().store(true, Ordering::Relaxed);

    let summary = controller.recursive_search("acme", "p1", 3, &search).await.unwrap();

    assert!(summary.cancelled);
    assert!(search.calls().is_empty());
    assert!(graph.store.nodes("graph-p1").is_empty());
}

#[tokio::test]
async fn verified_entities_never_regress() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new()
        .on("acme", acme_seed())
        .on("john doe", john_on_acme_page())
        .on(
            "rumours",
            SearchOutcome::default().with_discovery(unverified(person("John Doe"))),
        );
    let controller = graph.controller();

    controller.recursive_search("acme", "p1", 1, &search).await.unwrap();
    controller.recursive_search("rumours", "p1", 2, &search).await.unwrap();

    let john = graph.entity(NodeType::Person, "John Doe").await.unwrap();
    assert_eq!(john.verification_status, Some(VerificationStatus::Verified));
}

#[tokio::test]
async fn query_nodes_link_to_what_they_found() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new().on("acme", acme_seed());

    let summary = graph
        .controller()
        .recursive_search("acme", "p1", 0, &search)
        .await
        .unwrap();

    let query = graph.entity(NodeType::Query, "acme").await.unwrap();
    assert_eq!(query.embedded_edges.len(), 2);
    assert!(query.embedded_edges.iter().all(|e| e.relation == "discovered_by"));
    assert_eq!(query.created_by_job.as_deref(), Some(summary.job_id.as_str()));

    let john = graph.entity(NodeType::Person, "John Doe").await.unwrap();
    let edge = john.cascade_edges().next().unwrap();
    assert_eq!(edge.target_id, query.id);
    assert_eq!(edge.query_sequence_tag.as_deref(), Some("john doe_1"));
    assert_eq!(edge.connection_reason.as_deref(), Some("search hit"));
    assert_eq!(edge.job_id.as_deref(), Some(summary.job_id.as_str()));
}

#[tokio::test]
async fn a_cascade_run_can_be_rolled_back() {
    let graph = MemoryGraph::new();
    let search = StubSearch::new()
        .on("acme", acme_seed())
        .on("john doe", john_on_acme_page());

    let summary = graph
        .controller()
        .recursive_search("acme", "p1", 2, &search)
        .await
        .unwrap();
    assert!(!graph.store.nodes("graph-p1").is_empty());

    let stats = graph.writer.rollback_job("p1", &summary.job_id).await.unwrap();

    assert!(stats.nodes_deleted > 0);
    assert_eq!(stats.failed, 0);
    assert!(graph.store.nodes("graph-p1").is_empty());
}

#[tokio::test]
async fn offline_store_aborts_the_run() {
    let graph = MemoryGraph::new();
    graph.store.set_offline(true);
    let search = StubSearch::new().on("acme", acme_seed());

    let result = graph
        .controller()
        .recursive_search("acme", "p1", 2, &search)
        .await;

    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_follow_up_each_lead_once() {
    let graph = MemoryGraph::new();
    let search = Arc::new(StubSearch::new().on("acme", acme_seed()));

    let runs: Vec<_> = (0..2)
        .map(|_| {
            let controller = graph.controller();
            let search = search.clone();
            tokio::spawn(async move {
                controller
                    .recursive_search("acme", "p1", 2, search.as_ref())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut unverified_searches = 0;
    for run in runs {
        unverified_searches += run.await.unwrap().unverified_searches;
    }

    assert_eq!(unverified_searches, 1);
    assert_eq!(search.call_count("john doe"), 1);
    let john = graph.entity(NodeType::Person, "John Doe").await.unwrap();
    assert_eq!(john.query_sequence_tag.as_deref(), Some("john doe_2"));
    assert_eq!(john.cascade_edges().count(), 1);
}
