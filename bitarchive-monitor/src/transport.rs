use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bitarchive_core::{Bitarchive, Filter, JobRegistry};

use crate::error::{MonitorError, Result};
use crate::messages::{BatchReply, BatchRequest};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Request/reply channel to storage nodes. The coordinator only builds
/// requests and collates replies; delivery is the transport's business.
pub trait BatchTransport: Send + Sync {
    fn send(&self, node: &str, request: BatchRequest) -> BoxFuture<Result<BatchReply>>;
}

/// Serves nodes living in this process.
pub struct LocalTransport {
    nodes: HashMap<String, Arc<Bitarchive>>,
    registry: Arc<JobRegistry>,
}

impl LocalTransport {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            nodes: HashMap::new(),
            registry,
        }
    }

    pub fn add_node(&mut self, id: impl Into<String>, store: Arc<Bitarchive>) {
        self.nodes.insert(id.into(), store);
    }
}

/// Run one request against one store. Blocking.
pub fn serve_request(
    node: &str,
    store: &Bitarchive,
    registry: &JobRegistry,
    request: &BatchRequest,
) -> Result<BatchReply> {
    let mut job = registry.create(&request.job)?;
    let filter = Filter::compile(&request.filter)?;
    let status = store.batch(&request.id.to_string(), job.as_mut(), &filter)?;
    Ok(BatchReply {
        request_id: request.id,
        node: node.to_string(),
        status,
    })
}

impl BatchTransport for LocalTransport {
    fn send(&self, node: &str, request: BatchRequest) -> BoxFuture<Result<BatchReply>> {
        let store = self.nodes.get(node).cloned();
        let registry = Arc::clone(&self.registry);
        let node = node.to_string();
        Box::pin(async move {
            let store = store.ok_or_else(|| {
                MonitorError::Transport(format!("no route to node '{node}'"))
            })?;
            tokio::task::spawn_blocking(move || serve_request(&node, &store, &registry, &request))
                .await
                .map_err(|e| MonitorError::Transport(format!("node task failed: {e}")))?
        })
    }
}
