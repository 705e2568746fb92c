//! Connection registry and subscription index.

mod index;
mod registry;
mod stats;
mod types;

pub use index::SubscriptionIndex;
pub use registry::{ConnectionRegistry, RemovedConnection, SubscriptionChange};
pub use stats::{ConnectionInfo, RegistryStats};
pub use types::{Connection, ConnectionId, DeliveryError, DisconnectReason, Liveness};
