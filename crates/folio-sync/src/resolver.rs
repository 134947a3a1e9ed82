//! Content resolution pipeline
//!
//! Resolves a logical coordinate to content by trying, in order:
//!
//! 1. the content cache (TTL-bounded)
//! 2. the local record store
//! 3. a streaming query against the connected node pool
//!
//! Each step short-circuits on success. The network step emits `Partial` on
//! the first usable record and `Final` with the newest record once the query
//! completes. When no node is reachable it emits `Loading` and waits for the
//! pool to gain a connection instead of failing.
//!
//! Every resolution holds a [`RequestToken`]. Starting a newer resolution for
//! the same coordinate invalidates older tokens, and a resolution whose token
//! is no longer current stops emitting. The superseded network work is not
//! aborted; its results are simply ignored.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use folio_core::{
    ContentProjection, Coordinate, NodeTier, QueryFilter, Record, ResolveError, ResolvedContent,
};
use folio_storage::{CacheWrite, ContentCache, RecordStore};
use futures::Stream;
use tracing::{debug, instrument, trace, warn};

use crate::config::RebroadcastPolicy;
use crate::query::{QueryEngine, QueryPolicy};
use crate::rebroadcast::Rebroadcaster;
use crate::tiering::{NodePool, TierSnapshot};

/// Observable state of a resolution
#[derive(Debug, Clone, PartialEq)]
pub enum ContentState {
    /// Waiting on the network
    Loading,
    /// First value received; a newer one may follow
    Partial(ResolvedContent),
    /// Settled value
    Final(ResolvedContent),
    Error(ResolveError),
}

impl ContentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContentState::Final(_) | ContentState::Error(_))
    }

    pub fn content(&self) -> Option<&ResolvedContent> {
        match self {
            ContentState::Partial(c) | ContentState::Final(c) => Some(c),
            _ => None,
        }
    }
}

/// Identifies one resolution of a coordinate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestToken {
    coordinate: Coordinate,
    generation: u64,
}

impl RequestToken {
    pub fn coordinate(&self) -> &Coordinate {
        &self.coordinate
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Registry of the current generation per coordinate
///
/// Generations come from one monotonic counter, so a token issued before a
/// [`reset`](Self::reset) can never become current again.
#[derive(Debug, Default)]
pub struct Generations {
    next: AtomicU64,
    current: DashMap<Coordinate, u64>,
}

impl Generations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token, superseding every earlier token for the coordinate
    pub fn issue(&self, coordinate: &Coordinate) -> RequestToken {
        let generation = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.current.insert(coordinate.clone(), generation);
        RequestToken {
            coordinate: coordinate.clone(),
            generation,
        }
    }

    pub fn is_current(&self, token: &RequestToken) -> bool {
        self.current
            .get(&token.coordinate)
            .is_some_and(|g| *g == token.generation)
    }

    /// Retire a token that reached a terminal state
    ///
    /// Returns false, leaving the registry as is, when the token was
    /// already superseded.
    pub fn complete(&self, token: &RequestToken) -> bool {
        self.current
            .remove_if(&token.coordinate, |_, generation| {
                *generation == token.generation
            })
            .is_some()
    }

    /// Supersede any in-flight resolution of the coordinate
    pub fn invalidate(&self, coordinate: &Coordinate) {
        self.current.remove(coordinate);
    }

    pub fn reset(&self) {
        self.current.clear();
    }

    /// Coordinates with a resolution in flight
    pub fn in_flight(&self) -> usize {
        self.current.len()
    }
}

/// Secondary lookup consulted only when the streaming query found nothing
#[async_trait]
pub trait FallbackLookup: Send + Sync {
    async fn lookup(&self, coordinate: &Coordinate) -> Option<Record>;
}

type StateEvents = Pin<Box<dyn Stream<Item = ContentState> + Send>>;

/// States of one resolution
pub struct ResolveStream {
    token: Option<RequestToken>,
    inner: StateEvents,
}

impl ResolveStream {
    fn ready(token: Option<RequestToken>, state: ContentState) -> Self {
        Self {
            token,
            inner: Box::pin(futures::stream::iter([state])),
        }
    }

    /// Token of this resolution; `None` for rejected references
    pub fn token(&self) -> Option<&RequestToken> {
        self.token.as_ref()
    }
}

impl Stream for ResolveStream {
    type Item = ContentState;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

/// Resolves coordinates to content
pub struct ContentResolver {
    cache: Arc<ContentCache>,
    store: Arc<dyn RecordStore>,
    pool: Arc<NodePool>,
    engine: Arc<QueryEngine>,
    rebroadcaster: Arc<Rebroadcaster>,
    generations: Arc<Generations>,
    policy: RebroadcastPolicy,
    fallback: Option<Arc<dyn FallbackLookup>>,
}

impl ContentResolver {
    pub fn new(
        cache: Arc<ContentCache>,
        store: Arc<dyn RecordStore>,
        pool: Arc<NodePool>,
        engine: Arc<QueryEngine>,
        rebroadcaster: Arc<Rebroadcaster>,
    ) -> Self {
        Self {
            cache,
            store,
            pool,
            engine,
            rebroadcaster,
            generations: Arc::new(Generations::new()),
            policy: RebroadcastPolicy::default(),
            fallback: None,
        }
    }

    /// Set the rebroadcast policy for records fetched from remote nodes
    pub fn with_policy(mut self, policy: RebroadcastPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the secondary lookup
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackLookup>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn generations(&self) -> &Arc<Generations> {
        &self.generations
    }

    /// Resolve a `kind:author:identifier` reference
    pub fn resolve(&self, reference: &str) -> ResolveStream {
        match Coordinate::parse(reference) {
            Ok(coordinate) => self.resolve_coordinate(coordinate),
            Err(e) => {
                debug!(reference, error = %e, "Rejecting malformed reference");
                ResolveStream::ready(None, ContentState::Error(e.into()))
            }
        }
    }

    /// Resolve a parsed coordinate
    #[instrument(skip(self, coordinate), fields(coordinate = %coordinate))]
    pub fn resolve_coordinate(&self, coordinate: Coordinate) -> ResolveStream {
        if !ContentProjection::supports(coordinate.kind) {
            return ResolveStream::ready(
                None,
                ContentState::Error(ResolveError::InvalidReference(format!(
                    "kind {} has no content projection",
                    coordinate.kind
                ))),
            );
        }

        let token = self.generations.issue(&coordinate);

        if let Some(content) = self.cache.get(&coordinate) {
            debug!(record = %content.record_id, "Resolved from cache");
            self.generations.complete(&token);
            return ResolveStream::ready(Some(token), ContentState::Final(content));
        }

        if let Some(content) = self
            .store
            .get_by_coordinate(&coordinate)
            .as_ref()
            .and_then(ResolvedContent::from_record)
        {
            debug!(record = %content.record_id, "Resolved from local store");
            self.cache.put(&content);
            self.generations.complete(&token);
            return ResolveStream::ready(Some(token), ContentState::Final(content));
        }

        let resolution = NetworkResolution {
            token: token.clone(),
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
            pool: Arc::clone(&self.pool),
            engine: Arc::clone(&self.engine),
            rebroadcaster: Arc::clone(&self.rebroadcaster),
            generations: Arc::clone(&self.generations),
            policy: self.policy,
            fallback: self.fallback.clone(),
        };
        ResolveStream {
            token: Some(token),
            inner: resolution.run(),
        }
    }
}

/// Network step of one resolution
struct NetworkResolution {
    token: RequestToken,
    cache: Arc<ContentCache>,
    store: Arc<dyn RecordStore>,
    pool: Arc<NodePool>,
    engine: Arc<QueryEngine>,
    rebroadcaster: Arc<Rebroadcaster>,
    generations: Arc<Generations>,
    policy: RebroadcastPolicy,
    fallback: Option<Arc<dyn FallbackLookup>>,
}

impl NetworkResolution {
    fn coordinate(&self) -> &Coordinate {
        &self.token.coordinate
    }

    fn is_current(&self) -> bool {
        let current = self.generations.is_current(&self.token);
        if !current {
            trace!(coordinate = %self.coordinate(), generation = self.token.generation, "Resolution superseded");
        }
        current
    }

    /// Retire the token before a terminal emission; false when superseded
    fn settle(&self) -> bool {
        self.generations.complete(&self.token) || {
            trace!(coordinate = %self.coordinate(), generation = self.token.generation, "Resolution superseded");
            false
        }
    }

    /// Connected nodes, waiting for the pool to gain one if necessary
    async fn wait_for_nodes(&self) -> Option<TierSnapshot> {
        let mut status = self.pool.watch_status();
        loop {
            let nodes = self.pool.connected_snapshot();
            if !nodes.is_empty() {
                return Some(nodes);
            }
            debug!(coordinate = %self.coordinate(), "No reachable nodes, waiting for connectivity");
            if status.changed().await.is_err() || !self.is_current() {
                return None;
            }
        }
    }

    fn backfill(&self, record: &Record) {
        if let Err(e) = self.store.insert(record.clone()) {
            warn!(record = %record.id, error = %e, "Failed to store fetched record");
        }
    }

    async fn fallback(&self) -> Option<ResolvedContent> {
        let lookup = self.fallback.as_ref()?;
        let record = lookup.lookup(self.coordinate()).await?;
        if record.coordinate().as_ref() != Some(self.coordinate()) {
            warn!(
                coordinate = %self.coordinate(),
                record = %record.id,
                "Fallback returned a record for another coordinate"
            );
            return None;
        }
        self.backfill(&record);
        let content = ResolvedContent::from_record(&record)?;
        self.cache.put(&content);
        debug!(record = %content.record_id, "Resolved through fallback lookup");
        Some(content)
    }

    fn run(self) -> StateEvents {
        let this = self;
        Box::pin(async_stream::stream! {
            if !this.is_current() {
                return;
            }
            yield ContentState::Loading;

            let Some(nodes) = this.wait_for_nodes().await else {
                this.settle();
                return;
            };
            if !this.is_current() {
                return;
            }

            let filter = QueryFilter::for_coordinate(this.coordinate());
            let policy = QueryPolicy::for_filter(&filter);
            let mut query = match this.engine.query(&nodes, filter, policy) {
                Ok(query) => query,
                Err(e) => {
                    if this.settle() {
                        yield ContentState::Error(e.into());
                    }
                    return;
                }
            };

            let mut shown: Option<ResolvedContent> = None;
            let mut newest: Option<Record> = None;
            let mut from_remote: Vec<Record> = Vec::new();

            while let Some(tagged) = query.next().await {
                let record = tagged.record;
                this.backfill(&record);
                if tagged.tier == NodeTier::Remote {
                    from_remote.push(record.clone());
                }
                if newest.as_ref().is_none_or(|n| record.supersedes(n)) {
                    newest = Some(record.clone());
                }
                if shown.is_none()
                    && let Some(content) = ResolvedContent::from_record(&record)
                {
                    if !this.is_current() {
                        continue;
                    }
                    this.cache.put(&content);
                    yield ContentState::Partial(content.clone());
                    shown = Some(content);
                }
            }

            let outcome = query.into_outcome();
            this.rebroadcaster.rebroadcast(from_remote, &nodes, this.policy);

            if !this.is_current() {
                return;
            }

            match shown {
                Some(shown) => {
                    let settled = newest
                        .as_ref()
                        .and_then(ResolvedContent::from_record)
                        .filter(|c| c.is_newer_than(&shown))
                        .unwrap_or(shown);
                    if let CacheWrite::Unchanged = this.cache.put(&settled) {
                        trace!(record = %settled.record_id, "Settled value already cached");
                    }
                    if this.settle() {
                        yield ContentState::Final(settled);
                    }
                }
                None => {
                    if let Some(content) = this.fallback().await {
                        if this.settle() {
                            yield ContentState::Final(content);
                        }
                        return;
                    }
                    let error = if outcome.any_failed() {
                        ResolveError::Transport(format!(
                            "no tier answered for {}",
                            this.coordinate()
                        ))
                    } else {
                        ResolveError::NotFound
                    };
                    if this.settle() {
                        debug!(coordinate = %this.coordinate(), error = %error, "Resolution failed");
                        yield ContentState::Error(error);
                    }
                }
            }
        })
    }
}
