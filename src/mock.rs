//! Test doubles and record builders
//!
//! Shared by unit tests, the integration tests and the simulator.

use crate::common::{Error, Result};
use crate::state::{AllocClientStatus, Allocation, ClaimRequest, Job, Node, StateStore, Volume};
use crate::volumewatcher::{ClaimDetacher, ClaimWriter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const NAMESPACE: &str = "default";

/// A node that fingerprinted `plugin_id`
pub fn node(plugin_id: &str) -> Node {
    let id = Uuid::new_v4().to_string();
    let mut plugin_node_ids = HashMap::new();
    plugin_node_ids.insert(plugin_id.to_string(), format!("ext-{}", id));
    Node {
        id,
        plugin_node_ids,
    }
}

pub fn job() -> Job {
    Job {
        id: format!("job-{}", Uuid::new_v4()),
        namespace: NAMESPACE.to_string(),
        stop: false,
    }
}

/// A running allocation of `job` placed on `node`
pub fn alloc(job: &Job, node: &Node) -> Allocation {
    Allocation {
        id: Uuid::new_v4().to_string(),
        namespace: job.namespace.clone(),
        job_id: job.id.clone(),
        node_id: node.id.clone(),
        client_status: AllocClientStatus::Running,
        desired_stop: false,
    }
}

/// A schedulable volume served by `plugin_id` that needs controller detach
pub fn volume(plugin_id: &str) -> Volume {
    let id = format!("vol-{}", Uuid::new_v4());
    Volume {
        external_id: format!("ext-{}", id),
        id,
        namespace: NAMESPACE.to_string(),
        plugin_id: plugin_id.to_string(),
        schedulable: true,
        controller_required: true,
        ..Default::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachCall {
    Node {
        node_id: String,
        volume_id: String,
        allocation_id: String,
    },
    Controller {
        external_volume_id: String,
        external_node_id: String,
    },
}

/// Records detach RPCs; failures, latency and "already detached" replies
/// can be toggled.
#[derive(Debug, Default)]
pub struct MockDetacher {
    node_detaches: AtomicUsize,
    controller_detaches: AtomicUsize,
    pub fail_node: AtomicBool,
    pub fail_controller: AtomicBool,
    pub already_detached: AtomicBool,
    delay_ms: AtomicU64,
    calls: Mutex<Vec<DetachCall>>,
}

impl MockDetacher {
    pub fn node_detaches(&self) -> usize {
        self.node_detaches.load(Ordering::SeqCst)
    }

    pub fn controller_detaches(&self) -> usize {
        self.controller_detaches.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<DetachCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_fail_node(&self, fail: bool) {
        self.fail_node.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_controller(&self, fail: bool) {
        self.fail_controller.store(fail, Ordering::SeqCst);
    }

    /// Make every RPC take `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn record(&self, call: DetachCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

#[async_trait]
impl ClaimDetacher for MockDetacher {
    async fn detach_at_node(&self, node_id: &str, volume_id: &str, allocation_id: &str) -> Result<()> {
        self.node_detaches.fetch_add(1, Ordering::SeqCst);
        self.record(DetachCall::Node {
            node_id: node_id.to_string(),
            volume_id: volume_id.to_string(),
            allocation_id: allocation_id.to_string(),
        })
        .await;
        if self.fail_node.load(Ordering::SeqCst) {
            return Err(Error::NodeDetach {
                volume_id: volume_id.to_string(),
                node_id: node_id.to_string(),
                reason: "node plugin unavailable".into(),
            });
        }
        if self.already_detached.load(Ordering::SeqCst) {
            return Err(Error::AlreadyDetached(volume_id.to_string()));
        }
        Ok(())
    }

    async fn detach_at_controller(&self, external_volume_id: &str, external_node_id: &str) -> Result<()> {
        self.controller_detaches.fetch_add(1, Ordering::SeqCst);
        self.record(DetachCall::Controller {
            external_volume_id: external_volume_id.to_string(),
            external_node_id: external_node_id.to_string(),
        })
        .await;
        if self.fail_controller.load(Ordering::SeqCst) {
            return Err(Error::ControllerDetach {
                volume_id: external_volume_id.to_string(),
                reason: "controller plugin unavailable".into(),
            });
        }
        if self.already_detached.load(Ordering::SeqCst) {
            return Err(Error::AlreadyDetached(external_volume_id.to_string()));
        }
        Ok(())
    }
}

/// Claim writer over a [`StateStore`] that counts batches and claims.
pub struct CountingWriter {
    store: Arc<StateStore>,
    batches: AtomicUsize,
    claims: AtomicUsize,
    pub fail: AtomicBool,
}

impl CountingWriter {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            batches: AtomicUsize::new(0),
            claims: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClaimWriter for CountingWriter {
    async fn upsert_volume_claims(&self, requests: Vec<ClaimRequest>) -> Result<u64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ClaimWrite("index mismatch".into()));
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.claims.fetch_add(requests.len(), Ordering::SeqCst);
        self.store.apply_claim_batch(requests)
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
