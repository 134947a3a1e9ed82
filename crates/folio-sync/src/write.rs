//! Write path
//!
//! Stores a record locally, then publishes it in the background. The steps
//! run in a fixed order so each effect is observable on its own:
//!
//! 1. insert into the local store
//! 2. snapshot the connected nodes
//! 3. flag the record local-only if no remote node is connected
//! 4. queue local-only records before any publish is attempted
//! 5. publish to every connected node in the background
//! 6. fold the per-node outcomes into the publish-state overlay

use std::sync::Arc;

use folio_core::{NodeTransport, Record, RecordId, Signer, SignerError, UnsignedRecord};
use folio_storage::{OfflineQueue, RecordStore};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::SyncResult;
use crate::overlay::{PublishState, PublishStateOverlay, PublishStatePatch};
use crate::tiering::NodePool;

/// Returned as soon as the record is stored locally
#[derive(Debug)]
pub struct WriteReceipt {
    pub record_id: RecordId,
    /// Pessimistic flag from the connectivity snapshot
    pub is_local_only: bool,
    /// Resolves to the overlay entry once every node answered
    pub settled: JoinHandle<PublishState>,
}

/// Stores and publishes user-authored records
pub struct WritePath {
    transport: Arc<dyn NodeTransport>,
    pool: Arc<NodePool>,
    store: Arc<dyn RecordStore>,
    queue: Arc<OfflineQueue>,
    overlay: Arc<PublishStateOverlay>,
    signer: Option<Arc<dyn Signer>>,
}

impl WritePath {
    pub fn new(
        transport: Arc<dyn NodeTransport>,
        pool: Arc<NodePool>,
        store: Arc<dyn RecordStore>,
        queue: Arc<OfflineQueue>,
        overlay: Arc<PublishStateOverlay>,
    ) -> Self {
        Self {
            transport,
            pool,
            store,
            queue,
            overlay,
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Store a signed record and publish it in the background
    ///
    /// # Errors
    ///
    /// Returns an error only if the local store rejects the record; publish
    /// failures are reported through the overlay.
    #[instrument(skip(self, record), fields(record = %record.id, kind = %record.kind))]
    pub fn write(&self, record: Record) -> SyncResult<WriteReceipt> {
        let outcome = self.store.insert(record.clone())?;
        debug!(?outcome, "Stored record locally");

        let nodes = self.pool.connected_snapshot();
        let is_local_only = !nodes.has_remote();

        if is_local_only {
            self.queue.enqueue(record.id.clone());
            self.overlay
                .set_state(&record.id, PublishStatePatch::new().local_only(true));
        }

        let targets = nodes.ordered();
        let transport = Arc::clone(&self.transport);
        let queue = Arc::clone(&self.queue);
        let overlay = Arc::clone(&self.overlay);
        let record_id = record.id.clone();

        let settled = tokio::spawn(async move {
            let outcomes = if targets.is_empty() {
                Vec::new()
            } else {
                transport.publish(&targets, &record).await
            };
            for rejected in outcomes.iter().filter(|o| !o.ok) {
                debug!(
                    record = %record.id,
                    node = %rejected.from,
                    message = %rejected.message,
                    "Node rejected record"
                );
            }

            let state = overlay.record_outcomes(&record.id, &outcomes);
            if state.accepted_remotely() {
                queue.remove(&record.id);
            } else {
                queue.enqueue(record.id.clone());
            }
            debug!(
                record = %record.id,
                accepted = state.accepted_by.len(),
                rejected = state.rejected_by.len(),
                local_only = state.is_local_only,
                "Publish settled"
            );
            state
        });

        Ok(WriteReceipt {
            record_id,
            is_local_only,
            settled,
        })
    }

    /// Sign a draft with the configured signer, then [`write`](Self::write) it
    pub async fn sign_and_write(&self, draft: UnsignedRecord) -> SyncResult<WriteReceipt> {
        let signer = self.signer.as_ref().ok_or(SignerError::Unavailable)?;
        let record = signer.sign(draft).await.inspect_err(|e| {
            warn!(error = %e, "Signing failed, record not written");
        })?;
        self.write(record)
    }
}
