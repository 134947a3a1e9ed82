//! Streaming query engine
//!
//! A logical query runs against the local tier and the remote tier of a
//! [`TierSnapshot`]. Records are delivered in network-arrival order,
//! deduplicated by id within the query, through a [`QueryStream`] that can be
//! consumed one record at a time or collected with a callback.
//!
//! Tier timeouts are soft: when one fires the tier simply stops contributing.
//! A tier whose connection fails contributes zero records and never fails the
//! other tier.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use folio_core::{NodeTier, NodeTransport, NodeUrl, QueryFilter, Record, RecordId, ReferenceError};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::QueryConfig;
use crate::tiering::TierSnapshot;

/// How the two tiers are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPolicy {
    /// Query the remote tier only when the local tier found nothing
    LatencyFirst,
    /// Query both tiers concurrently and merge
    CompletenessFirst,
}

impl QueryPolicy {
    /// Policy for a kind of query
    ///
    /// Id lookups address immutable records, so any copy is as good as
    /// another and the local answer suffices. Everything else may have a
    /// newer version on the remote tier.
    pub fn for_filter(filter: &QueryFilter) -> Self {
        if filter.is_id_lookup() {
            QueryPolicy::LatencyFirst
        } else {
            QueryPolicy::CompletenessFirst
        }
    }
}

/// A record together with the tier it arrived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedRecord {
    pub record: Record,
    pub tier: NodeTier,
}

/// How one tier's part of a query ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierReport {
    pub tier: NodeTier,
    /// Records delivered by the tier, before deduplication
    pub received: usize,
    /// The tier could not be queried at all
    pub failed: bool,
    /// The soft timeout fired before end-of-stream
    pub timed_out: bool,
}

/// Summary of a finished query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOutcome {
    /// Deduplicated records across both tiers, in arrival order
    pub records: Vec<Record>,
    pub local_failed: bool,
    pub remote_failed: bool,
    /// At least one tier hit its timeout
    pub timed_out: bool,
    /// The remote tier was actually asked
    pub remote_queried: bool,
}

impl QueryOutcome {
    fn absorb(&mut self, report: TierReport) {
        match report.tier {
            NodeTier::Local => self.local_failed |= report.failed,
            NodeTier::Remote => {
                self.remote_failed |= report.failed;
                self.remote_queried = true;
            }
        }
        self.timed_out |= report.timed_out;
    }

    /// Some tier failed outright
    pub fn any_failed(&self) -> bool {
        self.local_failed || self.remote_failed
    }
}

enum TierEvent {
    Record(TaggedRecord),
    Finished(TierReport),
}

type TierEvents = Pin<Box<dyn Stream<Item = TierEvent> + Send>>;

/// Records of one logical query
///
/// Implements [`Stream`]; [`collect`](Self::collect) drives it to completion
/// while invoking a callback per record.
pub struct QueryStream {
    inner: TierEvents,
    seen: HashSet<RecordId>,
    outcome: QueryOutcome,
}

impl QueryStream {
    fn new(inner: TierEvents) -> Self {
        Self {
            inner,
            seen: HashSet::new(),
            outcome: QueryOutcome::default(),
        }
    }

    /// Next unique record, or `None` once every tier completed or timed out
    pub async fn next(&mut self) -> Option<TaggedRecord> {
        StreamExt::next(self).await
    }

    /// Drive the query to completion
    pub async fn collect(mut self, mut on_record: impl FnMut(&TaggedRecord)) -> QueryOutcome {
        while let Some(tagged) = self.next().await {
            on_record(&tagged);
        }
        self.outcome
    }

    /// Outcome so far; complete once the stream has ended
    pub fn outcome(&self) -> &QueryOutcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> QueryOutcome {
        self.outcome
    }
}

impl Stream for QueryStream {
    type Item = TaggedRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(TierEvent::Record(tagged))) => {
                    if this.seen.insert(tagged.record.id.clone()) {
                        this.outcome.records.push(tagged.record.clone());
                        return Poll::Ready(Some(tagged));
                    }
                    trace!(record = %tagged.record.id, tier = %tagged.tier, "Dropping duplicate delivery");
                }
                Poll::Ready(Some(TierEvent::Finished(report))) => this.outcome.absorb(report),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Issues logical queries against node tiers
pub struct QueryEngine {
    transport: Arc<dyn NodeTransport>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(transport: Arc<dyn NodeTransport>, config: QueryConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Start a query against a snapshot of the node pool
    ///
    /// # Errors
    ///
    /// Returns an error if the filter is malformed.
    pub fn query(
        &self,
        nodes: &TierSnapshot,
        filter: QueryFilter,
        policy: QueryPolicy,
    ) -> Result<QueryStream, ReferenceError> {
        filter.validate()?;
        debug!(
            local = nodes.local.len(),
            remote = nodes.remote.len(),
            ?policy,
            "Starting query"
        );

        let local = tier_events(
            Arc::clone(&self.transport),
            NodeTier::Local,
            nodes.local.clone(),
            filter.clone(),
            self.config.local_timeout,
        );
        let remote = tier_events(
            Arc::clone(&self.transport),
            NodeTier::Remote,
            nodes.remote.clone(),
            filter,
            self.config.remote_timeout,
        );

        let inner: TierEvents = match policy {
            QueryPolicy::CompletenessFirst => Box::pin(futures::stream::select(local, remote)),
            QueryPolicy::LatencyFirst => Box::pin(async_stream::stream! {
                let mut local = local;
                let mut local_records = 0;
                while let Some(event) = local.next().await {
                    if matches!(event, TierEvent::Record(_)) {
                        local_records += 1;
                    }
                    yield event;
                }
                if local_records == 0 {
                    let mut remote = remote;
                    while let Some(event) = remote.next().await {
                        yield event;
                    }
                } else {
                    trace!(local_records, "Local tier answered, skipping remote tier");
                }
            }),
        };

        Ok(QueryStream::new(inner))
    }

    /// Run a query to completion, invoking `on_record` per unique record
    pub async fn query_with(
        &self,
        nodes: &TierSnapshot,
        filter: QueryFilter,
        policy: QueryPolicy,
        mut on_record: impl FnMut(&Record),
    ) -> Result<Vec<Record>, ReferenceError> {
        let stream = self.query(nodes, filter, policy)?;
        let outcome = stream.collect(|tagged| on_record(&tagged.record)).await;
        Ok(outcome.records)
    }
}

/// Events of one tier, ending with exactly one `Finished`
fn tier_events(
    transport: Arc<dyn NodeTransport>,
    tier: NodeTier,
    nodes: Vec<NodeUrl>,
    filter: QueryFilter,
    timeout: Duration,
) -> TierEvents {
    Box::pin(async_stream::stream! {
        let mut report = TierReport {
            tier,
            received: 0,
            failed: false,
            timed_out: false,
        };

        if nodes.is_empty() {
            yield TierEvent::Finished(report);
            return;
        }

        let deadline = Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, transport.request(&nodes, &filter)).await {
            Ok(Ok(mut records)) => loop {
                match tokio::time::timeout_at(deadline, records.next()).await {
                    Ok(Some(record)) => {
                        report.received += 1;
                        yield TierEvent::Record(TaggedRecord { record, tier });
                    }
                    Ok(None) => {
                        trace!(%tier, received = report.received, "Tier reached end of stream");
                        break;
                    }
                    Err(_) => {
                        debug!(%tier, received = report.received, "Tier timed out");
                        report.timed_out = true;
                        break;
                    }
                }
            },
            Ok(Err(e)) => {
                warn!(%tier, error = %e, "Tier query failed, continuing without it");
                report.failed = true;
            }
            Err(_) => {
                debug!(%tier, "Tier timed out before answering");
                report.timed_out = true;
            }
        }

        yield TierEvent::Finished(report);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{
        AuthorKey, Kind, MockNodeTransport, MockSigner, NodeTransport, RecordId, Signer, Tag,
        UnsignedRecord,
    };

    fn url(s: &str) -> NodeUrl {
        NodeUrl::parse(s).unwrap()
    }

    async fn highlight(text: &str, ts: u64) -> Record {
        MockSigner::new()
            .sign(
                UnsignedRecord::new(AuthorKey::new("pubkeyA"), Kind::HIGHLIGHT, ts)
                    .with_tag(Tag::pair("a", "30023:pubkeyB:post"))
                    .with_content(text),
            )
            .await
            .unwrap()
    }

    fn filter() -> QueryFilter {
        QueryFilter::new().kind(Kind::HIGHLIGHT).tag('a', "30023:pubkeyB:post")
    }

    struct Fixture {
        transport: Arc<MockNodeTransport>,
        local: NodeUrl,
        remote: NodeUrl,
        engine: QueryEngine,
    }

    async fn fixture() -> Fixture {
        let transport = Arc::new(MockNodeTransport::new());
        let local = url("ws://localhost:4869");
        let remote = url("wss://relay.example.com");
        for node in [&local, &remote] {
            transport.add_node(node);
            transport.connect(node).await.unwrap();
        }
        let engine = QueryEngine::new(transport.clone(), QueryConfig::default());
        Fixture {
            transport,
            local,
            remote,
            engine,
        }
    }

    impl Fixture {
        fn snapshot(&self) -> TierSnapshot {
            TierSnapshot::from_urls([self.local.clone(), self.remote.clone()])
        }
    }

    #[test]
    fn test_policy_for_filter() {
        let by_id = QueryFilter::for_ids([RecordId::new("a".repeat(64))]);
        assert_eq!(QueryPolicy::for_filter(&by_id), QueryPolicy::LatencyFirst);
        assert_eq!(
            QueryPolicy::for_filter(&filter()),
            QueryPolicy::CompletenessFirst
        );
    }

    #[tokio::test]
    async fn test_completeness_first_merges_tiers() {
        let fx = fixture().await;
        fx.transport.seed(&fx.local, highlight("one", 1).await);
        fx.transport.seed(&fx.remote, highlight("two", 2).await);

        let mut seen = Vec::new();
        let records = fx
            .engine
            .query_with(&fx.snapshot(), filter(), QueryPolicy::CompletenessFirst, |r| {
                seen.push(r.id.clone())
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_latency_first_skips_remote_when_local_answers() {
        let fx = fixture().await;
        fx.transport.seed(&fx.local, highlight("one", 1).await);
        fx.transport.seed(&fx.remote, highlight("two", 2).await);

        let stream = fx
            .engine
            .query(&fx.snapshot(), filter(), QueryPolicy::LatencyFirst)
            .unwrap();
        let outcome = stream.collect(|_| {}).await;
        assert_eq!(outcome.records.len(), 1);
        assert!(!outcome.remote_queried);
        assert_eq!(fx.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_latency_first_falls_through_when_local_empty() {
        let fx = fixture().await;
        fx.transport.seed(&fx.remote, highlight("two", 2).await);

        let stream = fx
            .engine
            .query(&fx.snapshot(), filter(), QueryPolicy::LatencyFirst)
            .unwrap();
        let outcome = stream.collect(|_| {}).await;
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.remote_queried);
    }

    #[tokio::test]
    async fn test_duplicates_delivered_once() {
        let fx = fixture().await;
        let record = highlight("same", 1).await;
        fx.transport.seed(&fx.local, record.clone());
        fx.transport.seed(&fx.remote, record.clone());
        fx.transport.set_duplicate(&fx.local, true);

        let mut calls = 0;
        let records = fx
            .engine
            .query_with(&fx.snapshot(), filter(), QueryPolicy::CompletenessFirst, |_| {
                calls += 1
            })
            .await
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(records, vec![record]);
    }

    #[tokio::test]
    async fn test_failed_tier_degrades_to_empty() {
        let fx = fixture().await;
        fx.transport.seed(&fx.remote, highlight("a", 1).await);
        fx.transport.seed(&fx.remote, highlight("b", 2).await);
        fx.transport.take_offline(&fx.local);

        let outcome = fx
            .engine
            .query(&fx.snapshot(), filter(), QueryPolicy::CompletenessFirst)
            .unwrap()
            .collect(|_| {})
            .await;
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.local_failed);
        assert!(!outcome.remote_failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_tier_times_out_softly() {
        let fx = fixture().await;
        let record = highlight("local", 1).await;
        fx.transport.seed(&fx.local, record.clone());
        fx.transport.set_stall(&fx.local, true);
        fx.transport.set_stall(&fx.remote, true);

        let started = Instant::now();
        let outcome = fx
            .engine
            .query(&fx.snapshot(), filter(), QueryPolicy::CompletenessFirst)
            .unwrap()
            .collect(|_| {})
            .await;

        assert_eq!(outcome.records, vec![record]);
        assert!(outcome.timed_out);
        assert!(!outcome.any_failed());
        assert!(started.elapsed() >= QueryConfig::default().remote_timeout);
    }

    #[tokio::test]
    async fn test_invalid_filter_rejected() {
        let fx = fixture().await;
        assert!(
            fx.engine
                .query(&fx.snapshot(), QueryFilter::new(), QueryPolicy::LatencyFirst)
                .is_err()
        );
    }
}
