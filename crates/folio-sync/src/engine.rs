//! Sync engine composition root
//!
//! [`SyncEngine`] owns one instance of every sync service and wires them to a
//! shared node pool, transport and key-value store. Nothing is global: tests
//! build as many isolated engines as they need.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use folio_core::{
    Clock, Coordinate, NodeTransport, NodeUrl, QueryFilter, Record, RecordId, ReferenceError,
    Signer, SystemClock, UnsignedRecord,
};
use folio_storage::{ContentCache, InMemoryRecordStore, KvStore, OfflineQueue, RecordStore};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::offline::{ReconnectionSync, SyncReport};
use crate::overlay::{PublishState, PublishStateOverlay};
use crate::query::{QueryEngine, QueryPolicy, QueryStream};
use crate::rebroadcast::Rebroadcaster;
use crate::resolver::{ContentResolver, FallbackLookup, ResolveStream};
use crate::tiering::{NodePool, PoolDiff};
use crate::write::{WritePath, WriteReceipt};

/// Builder for [`SyncEngine`]
pub struct SyncEngineBuilder {
    config: SyncConfig,
    transport: Arc<dyn NodeTransport>,
    kv: Arc<dyn KvStore>,
    store: Option<Arc<dyn RecordStore>>,
    clock: Option<Arc<dyn Clock>>,
    signer: Option<Arc<dyn Signer>>,
    fallback: Option<Arc<dyn FallbackLookup>>,
    nodes: Vec<NodeUrl>,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing record store instead of a fresh in-memory one
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackLookup>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Initial (disconnected) pool members
    pub fn nodes(mut self, nodes: impl IntoIterator<Item = NodeUrl>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn build(self) -> SyncEngine {
        for warning in self.config.validate() {
            warn!(%warning, "Questionable sync configuration");
        }

        let config = self.config;
        let transport = self.transport;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let store: Arc<dyn RecordStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryRecordStore::new()),
        };

        let pool = Arc::new(NodePool::with_nodes(self.nodes));
        let cache = Arc::new(ContentCache::with_clock(
            Arc::clone(&self.kv),
            config.cache.clone(),
            clock,
        ));
        let queue = Arc::new(OfflineQueue::new(Arc::clone(&self.kv)));
        let overlay = Arc::new(PublishStateOverlay::new(config.event_channel_capacity));
        let query_engine = Arc::new(QueryEngine::new(
            Arc::clone(&transport),
            config.query.clone(),
        ));
        let rebroadcaster = Arc::new(Rebroadcaster::new(Arc::clone(&transport)));

        let mut resolver = ContentResolver::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&query_engine),
            Arc::clone(&rebroadcaster),
        )
        .with_policy(config.rebroadcast);
        if let Some(fallback) = self.fallback {
            resolver = resolver.with_fallback(fallback);
        }

        let mut writer = WritePath::new(
            Arc::clone(&transport),
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&overlay),
        );
        if let Some(signer) = self.signer {
            writer = writer.with_signer(signer);
        }

        let reconnection = Arc::new(ReconnectionSync::new(
            Arc::clone(&transport),
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&overlay),
            config.reconnect.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        SyncEngine {
            config,
            transport,
            pool,
            cache,
            store,
            queue,
            overlay,
            query_engine,
            rebroadcaster,
            resolver,
            writer,
            reconnection,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }
}

/// A fully wired sync engine
pub struct SyncEngine {
    config: SyncConfig,
    transport: Arc<dyn NodeTransport>,
    pool: Arc<NodePool>,
    cache: Arc<ContentCache>,
    store: Arc<dyn RecordStore>,
    queue: Arc<OfflineQueue>,
    overlay: Arc<PublishStateOverlay>,
    query_engine: Arc<QueryEngine>,
    rebroadcaster: Arc<Rebroadcaster>,
    resolver: ContentResolver,
    writer: WritePath,
    reconnection: Arc<ReconnectionSync>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SyncEngine {
    /// Create an engine with the given store and default clock
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn NodeTransport>,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self::builder(transport, kv).config(config).store(store).build()
    }

    pub fn builder(transport: Arc<dyn NodeTransport>, kv: Arc<dyn KvStore>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config: SyncConfig::default(),
            transport,
            kv,
            store: None,
            clock: None,
            signer: None,
            fallback: None,
            nodes: Vec::new(),
        }
    }

    /// Restore the offline queue and start background tasks
    ///
    /// Calling it again on a running engine does nothing.
    #[instrument(skip(self))]
    pub fn init(&self) -> SyncResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Engine already initialized");
            return Ok(());
        }

        let queued = self.queue.load();
        let pruned = self.cache.prune_expired();

        let tracking = self
            .pool
            .track(Arc::clone(&self.transport), self.shutdown_tx.subscribe());
        let reconnection =
            Arc::clone(&self.reconnection).spawn(self.shutdown_tx.subscribe());
        self.tasks.lock().extend([tracking, reconnection]);

        info!(queued, pruned, nodes = self.pool.len(), "Sync engine started");
        Ok(())
    }

    /// Stop background tasks and wait for them
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        // no receivers left is fine
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Err(e) = self.queue.persist() {
            warn!(error = %e, "Failed to persist offline queue on shutdown");
        }
        info!("Sync engine stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Forget process-lifetime state
    ///
    /// Clears the overlay and invalidates every in-flight resolution. The
    /// offline queue is reloaded from storage, so queued ids survive.
    pub fn reset(&self) {
        self.overlay.reset();
        self.resolver.generations().reset();
        let queued = self.queue.load();
        info!(queued, "Sync engine state reset");
    }

    /// Reconcile the pool with the desired node set
    pub async fn set_nodes(&self, desired: &[NodeUrl]) -> PoolDiff {
        self.pool.reconcile(desired, self.transport.as_ref()).await
    }

    /// Resolve a `kind:author:identifier` reference
    pub fn resolve(&self, reference: &str) -> ResolveStream {
        self.resolver.resolve(reference)
    }

    pub fn resolve_coordinate(&self, coordinate: Coordinate) -> ResolveStream {
        self.resolver.resolve_coordinate(coordinate)
    }

    /// Query the connected nodes with the policy suited to the filter
    pub fn query(&self, filter: QueryFilter) -> Result<QueryStream, ReferenceError> {
        let policy = QueryPolicy::for_filter(&filter);
        self.query_with_policy(filter, policy)
    }

    pub fn query_with_policy(
        &self,
        filter: QueryFilter,
        policy: QueryPolicy,
    ) -> Result<QueryStream, ReferenceError> {
        self.query_engine
            .query(&self.pool.connected_snapshot(), filter, policy)
    }

    pub fn write(&self, record: Record) -> SyncResult<WriteReceipt> {
        self.writer.write(record)
    }

    pub async fn sign_and_write(&self, draft: UnsignedRecord) -> SyncResult<WriteReceipt> {
        self.writer.sign_and_write(draft).await
    }

    pub fn publish_state(&self, id: &RecordId) -> Option<PublishState> {
        self.overlay.get_state(id)
    }

    /// Replay the offline queue immediately
    pub async fn sync_now(&self) -> Option<SyncReport> {
        self.reconnection.run_once().await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn overlay(&self) -> &Arc<PublishStateOverlay> {
        &self.overlay
    }

    pub fn query_engine(&self) -> &Arc<QueryEngine> {
        &self.query_engine
    }

    pub fn rebroadcaster(&self) -> &Arc<Rebroadcaster> {
        &self.rebroadcaster
    }

    pub fn resolver(&self) -> &ContentResolver {
        &self.resolver
    }

    pub fn writer(&self) -> &WritePath {
        &self.writer
    }

    pub fn reconnection(&self) -> &Arc<ReconnectionSync> {
        &self.reconnection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{AuthorKey, Kind, MockNodeTransport, MockSigner, Tag};
    use folio_storage::InMemoryKvStore;

    fn url(s: &str) -> NodeUrl {
        NodeUrl::parse(s).unwrap()
    }

    fn engine(transport: Arc<MockNodeTransport>, kv: Arc<InMemoryKvStore>) -> SyncEngine {
        SyncEngine::builder(transport, kv)
            .signer(Arc::new(MockSigner::new()))
            .build()
    }

    #[tokio::test]
    async fn test_init_is_idempotent_and_shutdown_stops_tasks() {
        let engine = engine(
            Arc::new(MockNodeTransport::new()),
            Arc::new(InMemoryKvStore::new()),
        );
        engine.init().unwrap();
        engine.init().unwrap();
        assert!(engine.is_started());
        assert_eq!(engine.tasks.lock().len(), 2);

        engine.shutdown().await;
        assert!(!engine.is_started());
        assert!(engine.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_init_restores_queue() {
        let kv = Arc::new(InMemoryKvStore::new());
        let transport = Arc::new(MockNodeTransport::new());
        {
            let first = engine(transport.clone(), kv.clone());
            let receipt = first
                .sign_and_write(
                    UnsignedRecord::new(AuthorKey::new("pubkeyA"), Kind::HIGHLIGHT, 1)
                        .with_tag(Tag::pair("r", "https://example.com")),
                )
                .await
                .unwrap();
            receipt.settled.await.unwrap();
            assert_eq!(first.queue().len(), 1);
        }

        let second = engine(transport, kv);
        assert!(second.queue().is_empty());
        second.init().unwrap();
        assert_eq!(second.queue().len(), 1);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_nodes_and_reset() {
        let transport = Arc::new(MockNodeTransport::new());
        let engine = engine(transport.clone(), Arc::new(InMemoryKvStore::new()));
        let local = url("ws://localhost:4869");
        let remote = url("wss://relay.example.com");
        transport.add_node(&local);
        transport.add_node(&remote);

        let diff = engine.set_nodes(&[local.clone(), remote.clone()]).await;
        assert_eq!(diff.added.len(), 2);
        assert!(engine.pool().status().has_remote());

        let receipt = engine
            .sign_and_write(
                UnsignedRecord::new(AuthorKey::new("pubkeyA"), Kind::HIGHLIGHT, 1)
                    .with_tag(Tag::pair("r", "https://example.com")),
            )
            .await
            .unwrap();
        receipt.settled.await.unwrap();
        assert!(engine.publish_state(&receipt.record_id).is_some());

        engine.reset();
        assert!(engine.publish_state(&receipt.record_id).is_none());
        assert!(engine.overlay().is_empty());
    }

    #[tokio::test]
    async fn test_reset_keeps_persisted_queue() {
        let kv = Arc::new(InMemoryKvStore::new());
        let engine = engine(Arc::new(MockNodeTransport::new()), kv.clone());
        engine.init().unwrap();

        let receipt = engine
            .sign_and_write(
                UnsignedRecord::new(AuthorKey::new("pubkeyA"), Kind::HIGHLIGHT, 1)
                    .with_tag(Tag::pair("r", "https://example.com")),
            )
            .await
            .unwrap();
        receipt.settled.await.unwrap();
        assert!(engine.queue().contains(&receipt.record_id));

        engine.reset();
        assert!(engine.queue().contains(&receipt.record_id));
        engine.shutdown().await;

        let restored = OfflineQueue::new(kv);
        assert_eq!(restored.load(), 1);
        assert!(restored.contains(&receipt.record_id));
    }
}
