//! Fan-out of published changes and initial snapshots.

mod router;
mod snapshot_worker;

pub use router::{BroadcastRouter, DeliveryReport, RouterStatsSnapshot};
pub use snapshot_worker::{SnapshotRequest, SnapshotWorker};

pub(crate) use router::evict;
