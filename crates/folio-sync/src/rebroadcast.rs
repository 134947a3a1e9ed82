//! Rebroadcast service
//!
//! Republishes records fetched from remote nodes to local nodes (or to the
//! whole pool) so later reads hit a nearby copy. Publication happens in a
//! background task; failures are logged and never reach the caller.

use std::sync::Arc;

use folio_core::{NodeTransport, NodeUrl, Record};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RebroadcastPolicy;
use crate::tiering::TierSnapshot;

/// Counts from one rebroadcast batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebroadcastSummary {
    pub records: usize,
    pub accepted: usize,
    pub rejected: usize,
}

/// Handle to a background rebroadcast; dropping it does not cancel the work
#[derive(Debug)]
pub struct RebroadcastHandle {
    task: JoinHandle<RebroadcastSummary>,
}

impl RebroadcastHandle {
    /// Wait for the batch to finish
    pub async fn finished(self) -> RebroadcastSummary {
        self.task.await.unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Best-effort republisher
pub struct Rebroadcaster {
    transport: Arc<dyn NodeTransport>,
}

impl Rebroadcaster {
    pub fn new(transport: Arc<dyn NodeTransport>) -> Self {
        Self { transport }
    }

    /// Nodes a policy publishes to
    pub fn targets(nodes: &TierSnapshot, policy: RebroadcastPolicy) -> Vec<NodeUrl> {
        if policy.broadcast_to_all {
            nodes.ordered()
        } else if policy.use_local_as_cache {
            nodes.local.clone()
        } else {
            Vec::new()
        }
    }

    /// Republish `records` in the background
    ///
    /// Returns `None` when there is nothing to do (policy disabled, no
    /// targets, or no records).
    pub fn rebroadcast(
        &self,
        records: Vec<Record>,
        nodes: &TierSnapshot,
        policy: RebroadcastPolicy,
    ) -> Option<RebroadcastHandle> {
        let targets = Self::targets(nodes, policy);
        if targets.is_empty() || records.is_empty() {
            return None;
        }

        debug!(
            records = records.len(),
            targets = targets.len(),
            "Rebroadcasting records"
        );
        let transport = Arc::clone(&self.transport);
        let task = tokio::spawn(async move {
            let mut summary = RebroadcastSummary {
                records: records.len(),
                ..RebroadcastSummary::default()
            };
            for record in &records {
                for outcome in transport.publish(&targets, record).await {
                    if outcome.ok {
                        summary.accepted += 1;
                    } else {
                        summary.rejected += 1;
                        warn!(
                            record = %record.id,
                            node = %outcome.from,
                            message = %outcome.message,
                            "Rebroadcast rejected"
                        );
                    }
                }
            }
            summary
        });

        Some(RebroadcastHandle { task })
    }
}
