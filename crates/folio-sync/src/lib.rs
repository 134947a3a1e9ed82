//! # Folio Sync
//!
//! Local-first synchronization engine for the Folio reader.
//!
//! Reads are answered from the nearest copy first: the content cache, then
//! the local record store, then nodes on the same network, then wide-area
//! nodes. Writes land in the local store immediately and are published in
//! the background; records nobody remote accepted wait in a persisted queue
//! until a remote node becomes reachable.
//!
//! ## Components
//!
//! - [`NodePool`]: Node membership, tier split and connectivity status
//! - [`QueryEngine`]: Streaming, deduplicated queries across both tiers
//! - [`ContentResolver`]: cache → store → network resolution with request tokens
//! - [`PublishStateOverlay`]: Per-record publish metadata, merged field by field
//! - [`ReconnectionSync`]: Replays the offline queue when a remote node returns
//! - [`Rebroadcaster`]: Best-effort republishing of fetched records
//! - [`WritePath`]: Store, queue and publish user-authored records
//! - [`SyncEngine`]: Composition root owning one of each
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use folio_core::MockNodeTransport;
//! use folio_storage::InMemoryKvStore;
//! use folio_sync::{ContentState, SyncEngine};
//! use futures::StreamExt;
//!
//! let engine = SyncEngine::builder(Arc::new(MockNodeTransport::new()), Arc::new(InMemoryKvStore::new()))
//!     .build();
//! engine.init()?;
//!
//! let mut states = engine.resolve("30023:pubkey:my-article");
//! while let Some(state) = states.next().await {
//!     if let ContentState::Final(content) = state {
//!         println!("{:?}", content.projection);
//!     }
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod offline;
pub mod overlay;
pub mod query;
pub mod rebroadcast;
pub mod resolver;
pub mod tiering;
pub mod write;

// Re-exports
pub use config::{ConfigWarning, QueryConfig, RebroadcastPolicy, ReconnectConfig, SyncConfig};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use offline::{ConnectivityMonitor, ConnectivityState, ReconnectionSync, SyncReport};
pub use overlay::{OverlayEvent, PublishState, PublishStateOverlay, PublishStatePatch};
pub use query::{QueryEngine, QueryOutcome, QueryPolicy, QueryStream, TaggedRecord, TierReport};
pub use rebroadcast::{RebroadcastHandle, RebroadcastSummary, Rebroadcaster};
pub use resolver::{
    ContentResolver, ContentState, FallbackLookup, Generations, RequestToken, ResolveStream,
};
pub use tiering::{ConnectivityStatus, NodeInfo, NodePool, PoolDiff, TierSnapshot};
pub use write::{WritePath, WriteReceipt};
