use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitarchive_core::batch::status::FileFailure;
use bitarchive_core::{BatchJob, BatchStatus, Filter, FilterSpec, JobRegistry};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MonitorError, Result};
use crate::messages::{BatchReply, BatchRequest};
use crate::settings::ClusterSettings;
use crate::transport::BatchTransport;

/// How one node's part of a replica batch ended.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeOutcome {
    Replied(BatchStatus),
    /// The node or the channel reported an error.
    Failed(String),
    /// No reply within the wait budget. The node may still be running the job.
    TimedOut,
    /// Configured but without a recent sign of life; the request was not sent.
    NotRunning,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: String,
    pub outcome: NodeOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: String,
    pub filename: String,
    pub message: String,
}

/// Merged result of one batch across all nodes of a replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregateBatchStatus {
    pub request_id: Uuid,
    pub replica: String,
    pub job: String,
    pub nodes: Vec<NodeReport>,
    pub files_processed: usize,
    pub failures: Vec<NodeFailure>,
    pub result_file: Option<PathBuf>,
    pub elapsed_ms: u64,
}

impl AggregateBatchStatus {
    pub fn timed_out(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.outcome, NodeOutcome::TimedOut))
            .map(|n| n.node.as_str())
            .collect()
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.outcome, NodeOutcome::Failed(_)))
            .map(|n| n.node.as_str())
            .collect()
    }

    pub fn not_running(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.outcome, NodeOutcome::NotRunning))
            .map(|n| n.node.as_str())
            .collect()
    }

    pub fn replied(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.outcome, NodeOutcome::Replied(_)))
            .count()
    }
}

/// A batch the coordinator is still waiting on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InFlightBatch {
    pub id: Uuid,
    pub replica: String,
    pub job: String,
    pub nodes: usize,
    pub elapsed_ms: u64,
}

struct Pending {
    replica: String,
    job: String,
    nodes: usize,
    started: Instant,
}

/// Time to wait on each node: the job's own allowance, but never less than the default.
pub fn node_timeout(declared: Option<Duration>, default: Duration) -> Duration {
    declared.map_or(default, |d| d.max(default))
}

/// Fans batch requests out to the nodes of a replica and merges the replies.
pub struct ReplicaCoordinator {
    settings: ClusterSettings,
    registry: Arc<JobRegistry>,
    transport: Arc<dyn BatchTransport>,
    pending: DashMap<Uuid, Pending>,
    signs_of_life: DashMap<String, Instant>,
}

impl ReplicaCoordinator {
    pub fn new(
        settings: ClusterSettings,
        registry: Arc<JobRegistry>,
        transport: Arc<dyn BatchTransport>,
    ) -> Self {
        Self {
            settings,
            registry,
            transport,
            pending: DashMap::new(),
            signs_of_life: DashMap::new(),
        }
    }

    /// Note that `node` is up. Nodes only receive batches while their last
    /// sign of life is within the configured delay.
    pub fn sign_of_life(&self, node: &str) {
        if self
            .signs_of_life
            .insert(node.to_string(), Instant::now())
            .is_none()
        {
            tracing::info!(%node, "node is now known to the coordinator");
        } else {
            tracing::trace!(%node, "sign of life");
        }
    }

    /// Configured nodes of `replica` with a recent sign of life, in
    /// configuration order. Stale nodes are forgotten until they speak again.
    pub fn running_nodes(&self, replica: &str) -> Result<Vec<String>> {
        let delay = self.settings.sign_of_life_delay();
        let mut running = Vec::new();
        for node in self.settings.nodes(replica)? {
            let seen = self.signs_of_life.get(&node.id).map(|t| t.elapsed());
            match seen {
                Some(age) if age < delay => running.push(node.id.clone()),
                Some(age) => {
                    tracing::warn!(node = %node.id, silent_ms = age.as_millis() as u64, "no sign of life, not sending batches");
                    self.signs_of_life.remove(&node.id);
                }
                None => {}
            }
        }
        Ok(running)
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn in_flight(&self) -> Vec<InFlightBatch> {
        self.pending
            .iter()
            .map(|e| InFlightBatch {
                id: *e.key(),
                replica: e.replica.clone(),
                job: e.job.clone(),
                nodes: e.nodes,
                elapsed_ms: e.started.elapsed().as_millis() as u64,
            })
            .collect()
    }

    /// Run registry job `job_key` on every node of `replica`.
    ///
    /// Only nodes with a recent sign of life are sent the request; the other
    /// configured nodes are reported as not running. A node that errors or
    /// does not answer in time is reported in the result; it never fails the
    /// call or holds up the other nodes. Waiting stops at the timeout but the
    /// node's work is not cancelled.
    pub async fn run_batch_on_replica(
        &self,
        job_key: &str,
        filter: FilterSpec,
        replica: &str,
    ) -> Result<AggregateBatchStatus> {
        let nodes = self.running_nodes(replica)?;
        let silent: Vec<String> = self
            .settings
            .nodes(replica)?
            .iter()
            .filter(|n| !nodes.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        let job = self.registry.create(job_key)?;
        Filter::compile(&filter)?;
        let wait = node_timeout(job.timeout(), self.settings.default_timeout());

        let request = BatchRequest {
            id: Uuid::new_v4(),
            job: job_key.to_string(),
            filter,
            replica: replica.to_string(),
            timeout_ms: wait.as_millis() as u64,
        };
        let started = Instant::now();
        self.pending.insert(
            request.id,
            Pending {
                replica: replica.to_string(),
                job: job_key.to_string(),
                nodes: nodes.len(),
                started,
            },
        );
        tracing::info!(id = %request.id, %replica, job = %job_key, nodes = nodes.len(), not_running = silent.len(), wait_ms = request.timeout_ms, "replica batch sent");

        let handles: Vec<_> = nodes
            .into_iter()
            .map(|node| {
                let fut = self.transport.send(&node, request.clone());
                let task = tokio::spawn(async move { tokio::time::timeout(wait, fut).await });
                (node, task)
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (node, task) in handles {
            let outcome = match task.await {
                Ok(Ok(Ok(reply))) => reply_outcome(&node, &request, reply),
                Ok(Ok(Err(e))) => NodeOutcome::Failed(e.to_string()),
                Ok(Err(_elapsed)) => NodeOutcome::TimedOut,
                Err(e) => NodeOutcome::Failed(format!("node task aborted: {e}")),
            };
            match &outcome {
                NodeOutcome::Replied(st) => {
                    self.sign_of_life(&node);
                    tracing::info!(%node, processed = st.files_processed, failed = st.failures.len(), "node replied")
                }
                NodeOutcome::Failed(msg) => tracing::warn!(%node, error = %msg, "node failed"),
                NodeOutcome::TimedOut => tracing::warn!(%node, wait_ms = request.timeout_ms, "node timed out"),
                NodeOutcome::NotRunning => {}
            }
            reports.push(NodeReport { node, outcome });
        }
        self.pending.remove(&request.id);
        reports.extend(silent.into_iter().map(|node| NodeReport {
            node,
            outcome: NodeOutcome::NotRunning,
        }));

        let out_dir = self.settings.output_dir();
        let merge_id = request.id;
        let parts: Vec<PathBuf> = reports
            .iter()
            .filter_map(|r| match &r.outcome {
                NodeOutcome::Replied(st) => st.result_file.clone(),
                _ => None,
            })
            .collect();
        let result_file = tokio::task::spawn_blocking(move || merge_results(job, &parts, &out_dir, merge_id))
            .await
            .map_err(|e| MonitorError::Transport(format!("merge task failed: {e}")))??;

        let mut files_processed = 0;
        let mut failures = Vec::new();
        for r in &reports {
            if let NodeOutcome::Replied(st) = &r.outcome {
                files_processed += st.files_processed;
                failures.extend(st.failures.iter().map(|f: &FileFailure| NodeFailure {
                    node: r.node.clone(),
                    filename: f.filename.clone(),
                    message: f.message.clone(),
                }));
            }
        }

        let status = AggregateBatchStatus {
            request_id: request.id,
            replica: replica.to_string(),
            job: job_key.to_string(),
            nodes: reports,
            files_processed,
            failures,
            result_file,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            id = %status.request_id,
            processed = status.files_processed,
            failed = status.failures.len(),
            timed_out = status.timed_out().len(),
            not_running = status.not_running().len(),
            "replica batch collated"
        );
        Ok(status)
    }
}

fn reply_outcome(node: &str, request: &BatchRequest, reply: BatchReply) -> NodeOutcome {
    if reply.request_id != request.id {
        return NodeOutcome::Failed(format!(
            "reply for request {} from '{}' while waiting on {}",
            reply.request_id, reply.node, request.id
        ));
    }
    if reply.node != node {
        tracing::debug!(expected = %node, got = %reply.node, "reply names another node");
    }
    NodeOutcome::Replied(reply.status)
}

/// Concatenate the node outputs, then let the job post-process them. Falls
/// back to the plain concatenation when the job declines or fails.
fn merge_results(
    job: Box<dyn BatchJob>,
    parts: &[PathBuf],
    out_dir: &Path,
    id: Uuid,
) -> Result<Option<PathBuf>> {
    if parts.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(out_dir)?;
    let mut concat = tempfile::NamedTempFile::new_in(out_dir)?;
    {
        let mut w = BufWriter::new(concat.as_file_mut());
        for p in parts {
            match File::open(p) {
                Ok(mut f) => {
                    std::io::copy(&mut f, &mut w)?;
                }
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "node result unreadable"),
            }
        }
        w.flush()?;
    }

    let final_path = out_dir.join(format!("batch-{id}.out"));
    let processed = {
        let mut input = BufReader::new(File::open(concat.path())?);
        let mut output = BufWriter::new(File::create(&final_path)?);
        job.post_process(&mut input, &mut output).and_then(|done| {
            output.flush()?;
            Ok(done)
        })
    };
    match processed {
        Ok(true) => Ok(Some(final_path)),
        other => {
            if let Err(e) = other {
                tracing::warn!(error = %e, "post-processing failed, keeping concatenation");
            }
            concat.persist(&final_path).map_err(|e| e.error)?;
            Ok(Some(final_path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longer_of_declared_and_default_wins() {
        let d = Duration::from_secs(10);
        assert_eq!(node_timeout(None, d), d);
        assert_eq!(node_timeout(Some(Duration::from_secs(3)), d), d);
        assert_eq!(
            node_timeout(Some(Duration::from_secs(60)), d),
            Duration::from_secs(60)
        );
    }
}
