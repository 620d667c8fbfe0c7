//! Replica coordination: send one batch job to every node of a replica and
//! merge what comes back.

pub mod coordinator;
pub mod error;
pub mod messages;
pub mod settings;
pub mod transport;

pub use coordinator::{AggregateBatchStatus, NodeOutcome, ReplicaCoordinator, node_timeout};
pub use error::{MonitorError, Result};
pub use messages::{BatchReply, BatchRequest};
pub use settings::{ClusterSettings, NodeSettings};
pub use transport::{BatchTransport, BoxFuture, LocalTransport};
