//! Verification cascade: priority-ordered recursive expansion over the graph.
//!
//! Each round rebuilds two queues from the store. VERIFIED leads are searched
//! first; UNVERIFIED ones are then followed up one by one, re-checked for
//! corroboration after their search, and searched again on the spot when
//! that check upgrades them. A queued lead that some later search returns
//! as VERIFIED is upgraded and searched on the spot as well.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use cymonides_common::{
    build_discovery_edge, build_edge, project_or_default, sequence_tag, Node, NodeType,
    VerificationStatus, DISCOVERED_BY,
};
use cymonides_graph::{
    GraphReader, GraphWriter, QueueEntry, StoreError, UpgradeOutcome, UpsertResult,
};

use crate::budget::{BudgetTracker, OperationCost};
use crate::traits::{EntitySearch, SearchOutcome};

const CASCADE_SOURCE: &str = "cascade";
const AUTHORITATIVE_MATCH: &str = "matched an authoritative record";

/// Counts from one `recursive_search` invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CascadeSummary {
    /// Ingestion job every write of this invocation is attributed to.
    pub job_id: String,
    pub total_searches: u32,
    pub verified_searches: u32,
    pub unverified_searches: u32,
    pub cascade_searches: u32,
    pub upgrades: u32,
    pub failed_searches: u32,
    pub depth_reached: u32,
    pub cancelled: bool,
    pub budget_exhausted: bool,
}

impl std::fmt::Display for CascadeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cascade {}: {} searches ({} verified, {} unverified, {} cascade), {} upgrades, {} failed, depth {}",
            self.job_id,
            self.total_searches,
            self.verified_searches,
            self.unverified_searches,
            self.cascade_searches,
            self.upgrades,
            self.failed_searches,
            self.depth_reached,
        )?;
        if self.cancelled {
            write!(f, " [cancelled]")?;
        }
        if self.budget_exhausted {
            write!(f, " [budget exhausted]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Seed,
    Verified,
    Unverified,
    Cascade,
}

/// Per-invocation accumulators. Nothing outlives the call.
struct Run<'a> {
    project_id: &'a str,
    job_id: String,
    search: &'a dyn EntitySearch,
    summary: CascadeSummary,
    /// Entities whose search failed; not retried until the next invocation.
    failed: HashSet<String>,
    /// Ids written as VERIFIED since the last promotion pass.
    verified_writes: HashSet<String>,
}

impl Run<'_> {
    fn halted(&self) -> bool {
        self.summary.cancelled || self.summary.budget_exhausted
    }

    fn pending(&self, queue: Vec<QueueEntry>) -> Vec<QueueEntry> {
        queue
            .into_iter()
            .filter(|entry| !self.failed.contains(&entry.id))
            .collect()
    }
}

pub struct CascadeController {
    writer: GraphWriter,
    reader: GraphReader,
    budget: Arc<BudgetTracker>,
    cancel: Arc<AtomicBool>,
}

impl CascadeController {
    pub fn new(writer: GraphWriter, reader: GraphReader) -> Self {
        Self {
            writer,
            reader,
            budget: Arc::new(BudgetTracker::unlimited()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_budget(mut self, budget: Arc<BudgetTracker>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Setting the returned flag stops the cascade before its next search.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Seed the graph with `initial_query`, then expand it round by round
    /// until both queues are empty or `max_depth` rounds have run.
    ///
    /// Only loss of the store escapes as `Err`; failing searches are counted
    /// and the entity is left for the next invocation.
    pub async fn recursive_search(
        &self,
        initial_query: &str,
        project_id: &str,
        max_depth: u32,
        search: &dyn EntitySearch,
    ) -> Result<CascadeSummary, StoreError> {
        let project_id = project_or_default(project_id);
        let job_id = Uuid::new_v4().to_string();
        let mut run = Run {
            project_id,
            job_id: job_id.clone(),
            search,
            summary: CascadeSummary {
                job_id,
                ..Default::default()
            },
            failed: HashSet::new(),
            verified_writes: HashSet::new(),
        };

        info!(
            project_id,
            job_id = run.job_id.as_str(),
            initial_query,
            max_depth,
            "Cascade starting"
        );

        if self.may_search(&mut run) {
            self.search_entity(&mut run, initial_query, None, Phase::Seed)
                .await?;
        }

        let mut depth = 1;
        'rounds: while depth <= max_depth && !run.halted() {
            let Some((verified, unverified)) = self.build_queues(&run).await? else {
                break;
            };
            run.verified_writes.clear();
            if verified.is_empty() && unverified.is_empty() {
                info!(project_id, depth, "Cascade reached a fixed point");
                break;
            }
            run.summary.depth_reached = depth;
            info!(
                project_id,
                depth,
                verified = verified.len(),
                unverified = unverified.len(),
                "Cascade round"
            );

            // Phase 1: every VERIFIED lead before any UNVERIFIED one.
            for entry in &verified {
                if !self.may_search(&mut run) {
                    break 'rounds;
                }
                if self
                    .search_entity(&mut run, &entry.value, Some(&entry.id), Phase::Verified)
                    .await?
                {
                    let marked = self.writer.mark_searched(project_id, &entry.id).await;
                    self.settle(&mut run, &entry.id, marked)?;
                }
            }

            // Phase 2, starting with leads Phase 1 rediscovered as VERIFIED.
            self.promote_merged(&mut run, &unverified).await?;
            for entry in &unverified {
                if !self.may_search(&mut run) {
                    break 'rounds;
                }
                self.follow_up(&mut run, entry).await?;
                self.promote_merged(&mut run, &unverified).await?;
            }

            depth += 1;
        }

        self.budget.log_status();
        info!(project_id, summary = %run.summary, "Cascade finished");
        Ok(run.summary)
    }

    /// Whether an UNVERIFIED entity now qualifies for VERIFIED, and why.
    ///
    /// An entity its own search already marked VERIFIED qualifies as an
    /// authoritative match. Otherwise the first VERIFIED entity it is linked
    /// to, directly or through a shared result page, decides.
    pub async fn check_verification_upgrade(
        &self,
        project_id: &str,
        node_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let Some(node) = self.reader.get_node(project_id, node_id).await? else {
            return Ok(None);
        };

        if node.is_verified() {
            return Ok(Some(authoritative_reason(&node)));
        }

        Ok(self
            .reader
            .find_verified_peer(project_id, &node)
            .await?
            .map(|peer| peer.reason()))
    }

    async fn build_queues(
        &self,
        run: &Run<'_>,
    ) -> Result<Option<(Vec<QueueEntry>, Vec<QueueEntry>)>, StoreError> {
        let queues = async {
            let verified = self.reader.verified_queue(run.project_id).await?;
            let unverified = self.reader.unverified_queue(run.project_id).await?;
            Ok::<_, StoreError>((verified, unverified))
        };
        match queues.await {
            Ok((verified, unverified)) => Ok(Some((run.pending(verified), run.pending(unverified)))),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(project_id = run.project_id, error = %e, "Cannot read cascade queues, stopping");
                Ok(None)
            }
        }
    }

    /// One UNVERIFIED entity: claim, search, re-check, and cascade on upgrade.
    async fn follow_up(&self, run: &mut Run<'_>, entry: &QueueEntry) -> Result<(), StoreError> {
        let Some(tag) = entry.tag.as_deref() else {
            return Ok(());
        };

        let claim = match self
            .writer
            .claim_follow_up(run.project_id, &entry.id, tag)
            .await
        {
            Ok(Some(claim)) => claim,
            // Already VERIFIED by a merge, or another run got here first.
            Ok(None) => return self.promote_if_merged(run, entry).await,
            Err(e) => return self.absorb(run, &entry.id, e),
        };

        let searched = self
            .search_entity(run, &entry.value, Some(&entry.id), Phase::Unverified)
            .await?;
        if !searched {
            let released = self.writer.release_follow_up(run.project_id, &claim).await;
            return self.settle(run, &entry.id, released);
        }

        let reason = match self
            .check_verification_upgrade(run.project_id, &entry.id)
            .await
        {
            Ok(Some(reason)) => reason,
            Ok(None) => return Ok(()),
            Err(e) => return self.absorb(run, &entry.id, e),
        };

        self.upgrade_and_cascade(run, entry, &reason).await
    }

    /// Upgrade every lead of this round's UNVERIFIED snapshot that a search
    /// since the last pass wrote as VERIFIED. Their cascade searches can
    /// verify more, so repeat until a pass finds nothing.
    async fn promote_merged(
        &self,
        run: &mut Run<'_>,
        snapshot: &[QueueEntry],
    ) -> Result<(), StoreError> {
        while !run.verified_writes.is_empty() && !run.halted() {
            let written = std::mem::take(&mut run.verified_writes);
            for entry in snapshot.iter().filter(|e| written.contains(&e.id)) {
                self.promote_if_merged(run, entry).await?;
            }
        }
        Ok(())
    }

    /// A queued UNVERIFIED lead whose stored status a merge flipped to
    /// VERIFIED gets its upgrade recorded and its cascade search now.
    async fn promote_if_merged(&self, run: &mut Run<'_>, entry: &QueueEntry) -> Result<(), StoreError> {
        if run.failed.contains(&entry.id) {
            return Ok(());
        }
        let node = match self.reader.get_node(run.project_id, &entry.id).await {
            Ok(Some(node)) => node,
            Ok(None) => return Ok(()),
            Err(e) => return self.absorb(run, &entry.id, e),
        };
        if !node.is_verified() || node.upgrade_reason.is_some() {
            debug!(id = entry.id.as_str(), "Already followed up, skipping");
            return Ok(());
        }
        let reason = authoritative_reason(&node);
        self.upgrade_and_cascade(run, entry, &reason).await
    }

    /// Record the upgrade, then search the newly VERIFIED lead immediately.
    /// Only the run that records the upgrade searches.
    async fn upgrade_and_cascade(
        &self,
        run: &mut Run<'_>,
        entry: &QueueEntry,
        reason: &str,
    ) -> Result<(), StoreError> {
        match self
            .writer
            .upgrade_to_verified(run.project_id, &entry.id, reason)
            .await
        {
            Ok(UpgradeOutcome::Recorded(_)) => {
                run.summary.upgrades += 1;
                info!(
                    id = entry.id.as_str(),
                    value = entry.value.as_str(),
                    reason,
                    "Entity upgraded to VERIFIED"
                );
            }
            Ok(_) => return Ok(()),
            Err(e) => return self.absorb(run, &entry.id, e),
        }

        // Newly verified leads do not wait for the next round.
        if !self.may_search(run) {
            return Ok(());
        }
        if self
            .search_entity(run, &entry.value, Some(&entry.id), Phase::Cascade)
            .await?
        {
            let marked = self.writer.mark_searched(run.project_id, &entry.id).await;
            self.settle(run, &entry.id, marked)?;
        }
        Ok(())
    }

    fn may_search(&self, run: &mut Run<'_>) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            if !run.summary.cancelled {
                info!(project_id = run.project_id, "Cascade cancelled");
            }
            run.summary.cancelled = true;
            return false;
        }
        if run.summary.budget_exhausted || self.budget.remaining() == Some(0) {
            self.exhaust(run);
            return false;
        }
        true
    }

    fn exhaust(&self, run: &mut Run<'_>) {
        if !run.summary.budget_exhausted {
            info!(project_id = run.project_id, "Search budget exhausted, stopping cascade");
        }
        run.summary.budget_exhausted = true;
    }

    /// Reserve budget, search, then persist what came back. `Ok(false)` means
    /// the entity could not be advanced; only loss of the store is an `Err`.
    async fn search_entity(
        &self,
        run: &mut Run<'_>,
        query: &str,
        origin: Option<&str>,
        phase: Phase,
    ) -> Result<bool, StoreError> {
        if !self.budget.try_spend(OperationCost::ENTITY_SEARCH) {
            self.exhaust(run);
            return Ok(false);
        }
        run.summary.total_searches += 1;
        match phase {
            Phase::Seed => {}
            Phase::Verified => run.summary.verified_searches += 1,
            Phase::Unverified => run.summary.unverified_searches += 1,
            Phase::Cascade => run.summary.cascade_searches += 1,
        }
        debug!(query, ?phase, "Searching");

        let outcome = match run.search.search(query, run.project_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(query, ?phase, error = %e, "Search failed, entity not advanced this run");
                run.summary.failed_searches += 1;
                if let Some(id) = origin {
                    run.failed.insert(id.to_string());
                }
                return Ok(false);
            }
        };

        match self.persist(run, query, origin, outcome).await {
            Ok((result, verified)) => {
                if result.error_count > 0 {
                    warn!(query, %result, "Some search results were not stored");
                }
                run.verified_writes.extend(verified);
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(query, error = %e, "Storing search results failed");
                run.summary.failed_searches += 1;
                if let Some(id) = origin {
                    run.failed.insert(id.to_string());
                }
                Ok(false)
            }
        }
    }

    /// Fold a search outcome into the graph under this run's job: a query
    /// node for `query`, discovery edges carrying cascade state, and the
    /// supporting nodes as reported. Also returns the ids written as VERIFIED.
    async fn persist(
        &self,
        run: &Run<'_>,
        query: &str,
        origin: Option<&str>,
        outcome: SearchOutcome,
    ) -> Result<(UpsertResult, Vec<String>), StoreError> {
        let ontology = self.writer.ontology();
        let mut nexus = Node::new(NodeType::Query, query, run.project_id).with_source(CASCADE_SOURCE);
        let mut batch = Vec::with_capacity(outcome.nodes.len() + outcome.discoveries.len() + 1);

        for discovery in outcome.discoveries {
            let mut node = discovery.node;
            let tag = sequence_tag(&node.canonical_value, 1);

            let mut edge =
                build_discovery_edge(&nexus, discovery.status, &discovery.reason, &tag, ontology);
            // Finding an entity by searching for it is not a new lead.
            edge.already_searched = origin == Some(node.id.as_str());
            node.add_edge(edge);

            node.verification_status =
                VerificationStatus::merge(node.verification_status, Some(discovery.status));
            if node.query_sequence_tag.is_none() {
                node.query_sequence_tag = Some(tag);
            }
            nexus.add_edge(build_edge(&node, DISCOVERED_BY, None, ontology));
            node.stamp_job(&run.job_id);
            batch.push(node);
        }

        for mut node in outcome.nodes {
            node.stamp_job(&run.job_id);
            batch.push(node);
        }

        nexus.stamp_job(&run.job_id);
        batch.insert(0, nexus);
        let verified = batch
            .iter()
            .filter(|n| n.is_verified())
            .map(|n| n.id.clone())
            .collect();
        let result = self.writer.upsert_batch(batch, run.project_id).await?;
        Ok((result, verified))
    }

    fn settle<T>(
        &self,
        run: &mut Run<'_>,
        id: &str,
        result: Result<T, StoreError>,
    ) -> Result<(), StoreError> {
        match result {
            Ok(_) => Ok(()),
            Err(e) => self.absorb(run, id, e),
        }
    }

    /// Fatal store errors abort the run; anything else is logged and the
    /// entity is skipped for the rest of it.
    fn absorb(&self, run: &mut Run<'_>, id: &str, error: StoreError) -> Result<(), StoreError> {
        if error.is_fatal() {
            return Err(error);
        }
        warn!(id, error = %error, "Cascade bookkeeping failed, skipping entity");
        run.failed.insert(id.to_string());
        Ok(())
    }
}

/// Upgrade reason for an entity a search itself returned as VERIFIED,
/// naming the record and the query that returned it.
fn authoritative_reason(node: &Node) -> String {
    let evidence = node
        .cascade_edges()
        .find(|e| e.verification_status == Some(VerificationStatus::Verified));
    match evidence {
        Some(edge) => format!(
            "{AUTHORITATIVE_MATCH} ({}, returned by query {:?})",
            edge.connection_reason.as_deref().unwrap_or("no reason given"),
            edge.target_label,
        ),
        None => AUTHORITATIVE_MATCH.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_display_flags_early_exit() {
        let summary = CascadeSummary {
            job_id: "job".into(),
            total_searches: 4,
            upgrades: 1,
            budget_exhausted: true,
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.contains("4 searches"));
        assert!(text.contains("1 upgrades"));
        assert!(text.ends_with("[budget exhausted]"));
    }
}
