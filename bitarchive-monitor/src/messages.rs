use bitarchive_core::{BatchStatus, FilterSpec};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sent to each node of a replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    pub id: Uuid,
    /// Registry key of the job to run.
    pub job: String,
    pub filter: FilterSpec,
    pub replica: String,
    /// How long the coordinator will wait for the reply.
    pub timeout_ms: u64,
}

/// A node's answer. `status.result_file` is the handle to its output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReply {
    pub request_id: Uuid,
    pub node: String,
    pub status: BatchStatus,
}

