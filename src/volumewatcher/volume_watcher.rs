//! Per-volume claim reaper
//!
//! A `VolumeWatcher` drives one volume's terminal claims through
//! `Taken → NodeUnpublishing → NodeDetached → ControllerUnpublishing →
//! ReadyToFree`, checkpointing through the update batcher after each
//! successful node detach so a new leader resumes where the old one stopped.
//!
//! The loop runs only while there is work. Failed RPCs leave the claim where
//! it was and the loop parks until the next notification; it never retries
//! on its own timer.

use crate::common::{Error, Result};
use crate::state::{Allocation, Claim, ClaimMode, ClaimState, StateStore, Volume};
use crate::volumewatcher::{ClaimDetacher, UpdateBatcher};
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Collaborators shared by every watcher created during one enabled period.
pub(crate) struct WatcherContext {
    pub store: Arc<StateStore>,
    pub batcher: UpdateBatcher,
    pub detacher: Arc<dyn ClaimDetacher>,
    /// Cancelled when the watcher set is disabled
    pub shutdown: CancellationToken,
}

struct LoopState {
    running: bool,
    /// Bumped on every start so a finishing loop cannot clear a newer one's flag
    generation: u64,
    /// Latest unconsumed snapshot; newer notifications replace it
    pending: Option<Volume>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    /// Highest volume index this watcher has read or written
    last_index: u64,
}

struct Shared {
    volume_id: String,
    namespace: String,
    ctx: Arc<WatcherContext>,
    state: Mutex<LoopState>,
    wakeup: Notify,
}

/// Reconciliation task handle for one volume; cheap to clone.
#[derive(Clone)]
pub struct VolumeWatcher {
    shared: Arc<Shared>,
}

impl VolumeWatcher {
    pub(crate) fn new(ctx: Arc<WatcherContext>, volume: &Volume) -> Self {
        let cancel = ctx.shutdown.child_token();
        Self {
            shared: Arc::new(Shared {
                volume_id: volume.id.clone(),
                namespace: volume.namespace.clone(),
                ctx,
                state: Mutex::new(LoopState {
                    running: false,
                    generation: 0,
                    pending: None,
                    cancel,
                    handle: None,
                    last_index: 0,
                }),
                wakeup: Notify::new(),
            }),
        }
    }

    pub fn volume_id(&self) -> &str {
        &self.shared.volume_id
    }

    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// Start reconciling `volume`. Ignored if the loop is already running.
    pub fn start(&self, volume: Volume) {
        let mut state = self.shared.lock();
        if state.is_live() {
            return;
        }
        state.pending = Some(volume);
        self.shared.spawn_locked(&mut state);
    }

    /// Hand a fresh snapshot to the loop, starting it if it has exited.
    /// Never blocks; an unconsumed older snapshot is replaced.
    pub fn notify(&self, volume: Volume) {
        {
            let mut state = self.shared.lock();
            state.pending = Some(volume);
            if !state.is_live() {
                self.shared.spawn_locked(&mut state);
            }
        }
        self.shared.wakeup.notify_one();
    }

    /// Wake a parked loop without a new snapshot so it re-checks that its
    /// volume still exists.
    pub(crate) fn wake(&self) {
        self.shared.wakeup.notify_one();
    }

    /// Cancel the loop. Safe to call on a stopped watcher.
    pub fn stop(&self) {
        self.shared.lock().cancel.cancel();
    }

    /// Wait for the current loop task, if any, to exit.
    pub(crate) async fn join(&self) {
        let handle = self.shared.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(volume_id = %self.shared.volume_id, error = %e, "volume watcher task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }
}

impl LoopState {
    fn is_live(&self) -> bool {
        self.running && !self.cancel.is_cancelled()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_locked(self: &Arc<Self>, state: &mut LoopState) {
        if self.ctx.shutdown.is_cancelled() {
            return;
        }
        tracing::trace!(volume_id = %self.volume_id, namespace = %self.namespace, "starting volume watcher");
        state.generation += 1;
        state.running = true;
        state.cancel = self.ctx.shutdown.child_token();
        state.handle = Some(tokio::spawn(run_loop(
            self.clone(),
            state.generation,
            state.cancel.clone(),
        )));
    }

    /// Clear the running flag if this loop is still the current one.
    fn finish(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.running = false;
        }
    }

    fn observe_index(&self, index: u64) {
        let mut state = self.lock();
        state.last_index = state.last_index.max(index);
    }
}

async fn run_loop(shared: Arc<Shared>, generation: u64, cancel: CancellationToken) {
    let mut work_remaining = false;
    loop {
        let next = {
            let mut state = shared.lock();
            match state.pending.take() {
                Some(volume) => Some(volume),
                None if !work_remaining => {
                    // decided under the lock so a concurrent notify restarts us
                    if state.generation == generation {
                        state.running = false;
                    }
                    tracing::trace!(volume_id = %shared.volume_id, "volume watcher idle, exiting");
                    return;
                }
                None => None,
            }
        };

        let Some(snapshot) = next else {
            let woken = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = shared.wakeup.notified() => true,
            };
            if !woken {
                break;
            }
            if shared.ctx.store.volume_by_id(&shared.namespace, &shared.volume_id).is_none() {
                tracing::debug!(volume_id = %shared.volume_id, namespace = %shared.namespace, "volume deregistered while parked");
                break;
            }
            continue;
        };
        if cancel.is_cancelled() {
            break;
        }

        let last_index = shared.lock().last_index;
        if snapshot.modify_index < last_index {
            tracing::trace!(
                volume_id = %shared.volume_id,
                index = snapshot.modify_index,
                last_index,
                "skipping stale volume snapshot"
            );
            continue;
        }

        match shared.reconcile(&cancel).await {
            Ok(Reconciled::Done) => work_remaining = false,
            Ok(Reconciled::Gone) => {
                tracing::debug!(volume_id = %shared.volume_id, namespace = %shared.namespace, "volume no longer exists");
                break;
            }
            Err(Error::Cancelled) => break,
            Err(e) => {
                tracing::warn!(
                    volume_id = %shared.volume_id,
                    namespace = %shared.namespace,
                    error = %e,
                    retryable = e.is_retryable(),
                    "failed to reap volume claims, waiting for next update"
                );
                // a deregistered volume never gets another update
                if shared.ctx.store.volume_by_id(&shared.namespace, &shared.volume_id).is_none() {
                    break;
                }
                work_remaining = true;
            }
        }
    }
    shared.finish(generation);
}

enum Reconciled {
    /// No reapable claim is left
    Done,
    /// The volume was deregistered
    Gone,
}

/// Claims that need detaching, plus per-node counts of claims still in use.
struct ReapPlan {
    reapable: Vec<Claim>,
    node_in_use: HashMap<String, usize>,
}

/// Caches job stopped-ness for one pass
struct JobCache<'a> {
    store: &'a StateStore,
    stopped: HashMap<(String, String), bool>,
}

impl JobCache<'_> {
    fn is_stopped(&mut self, alloc: &Allocation) -> bool {
        let store = self.store;
        *self
            .stopped
            .entry((alloc.namespace.clone(), alloc.job_id.clone()))
            .or_insert_with(|| {
                store
                    .job_by_id(&alloc.namespace, &alloc.job_id)
                    .map(|job| job.stop)
                    .unwrap_or(true)
            })
    }

    /// The allocation is gone, terminal, or its job has stopped or been purged.
    fn is_done(&mut self, alloc: Option<&Allocation>) -> bool {
        match alloc {
            None => true,
            Some(alloc) => alloc.is_terminal() || self.is_stopped(alloc),
        }
    }
}

impl ReapPlan {
    fn collect(vol: &Volume, store: &StateStore) -> Self {
        let mut jobs = JobCache {
            store,
            stopped: HashMap::new(),
        };
        let mut past = vol.past_claims.clone();
        let mut node_in_use: HashMap<String, usize> = HashMap::new();

        for claim in vol.active_claims() {
            let alloc = store.alloc_by_id(&claim.allocation_id);
            match alloc {
                // garbage collected: the client already tore the mount down
                None => {
                    past.entry(claim.allocation_id.clone())
                        .or_insert_with(|| claim.clone().with_state(ClaimState::ReadyToFree));
                }
                Some(ref a) if jobs.is_done(Some(a)) => {
                    // keep any checkpointed progress
                    past.entry(claim.allocation_id.clone())
                        .or_insert_with(|| claim.clone().with_state(ClaimState::Taken));
                }
                Some(_) => *node_in_use.entry(claim.node_id.clone()).or_default() += 1,
            }
        }

        let mut reapable = Vec::with_capacity(past.len());
        for (alloc_id, mut claim) in past {
            if !alloc_id.is_empty() {
                let alloc = store.alloc_by_id(&alloc_id);
                if !jobs.is_done(alloc.as_ref()) {
                    // released while still running: wait for the allocation to stop
                    tracing::trace!(volume_id = %vol.id, alloc_id = %alloc_id, "deferring release of live allocation");
                    continue;
                }
                if claim.node_id.is_empty() {
                    if let Some(alloc) = alloc {
                        claim.node_id = alloc.node_id;
                    }
                }
            }
            reapable.push(claim);
        }
        reapable.sort_by(|a, b| a.allocation_id.cmp(&b.allocation_id));

        Self {
            reapable,
            node_in_use,
        }
    }
}

impl Shared {
    async fn reconcile(&self, cancel: &CancellationToken) -> Result<Reconciled> {
        let store = &self.ctx.store;
        let Some(vol) = store.volume_by_id(&self.namespace, &self.volume_id) else {
            return Ok(Reconciled::Gone);
        };
        self.observe_index(vol.modify_index);

        let mut plan = ReapPlan::collect(&vol, store);
        if plan.reapable.is_empty() {
            return Ok(Reconciled::Done);
        }
        tracing::debug!(
            volume_id = %vol.id,
            namespace = %vol.namespace,
            claims = plan.reapable.len(),
            "reaping volume claims"
        );

        let mut failure: Option<Error> = None;

        for claim in plan.reapable.iter_mut() {
            if claim.state.past_node_detach() {
                continue;
            }
            let previous = claim.state;
            claim.state = ClaimState::NodeUnpublishing;
            match self.node_detach(&vol, claim, cancel).await {
                Ok(()) => {
                    claim.state = ClaimState::NodeDetached;
                    if let Err(e) = self.checkpoint(claim, cancel).await {
                        claim.state = previous;
                        if matches!(e, Error::Cancelled) {
                            return Err(e);
                        }
                        failure.get_or_insert(e);
                    }
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    claim.state = previous;
                    tracing::warn!(
                        volume_id = %vol.id,
                        alloc_id = %claim.allocation_id,
                        node_id = %claim.node_id,
                        error = %e,
                        "node detach failed"
                    );
                    failure.get_or_insert(e);
                }
            }
        }

        // controller detachment is shared by every claim on the volume
        if plan.reapable.iter().all(|c| c.state.past_node_detach()) {
            if let Err(e) = self.controller_detach(&vol, &mut plan, cancel).await {
                if matches!(e, Error::Cancelled) {
                    return Err(e);
                }
                failure.get_or_insert(e);
            }
        }

        if let Err(e) = self.free_claims(&vol, &plan.reapable, cancel).await {
            if matches!(e, Error::Cancelled) {
                return Err(e);
            }
            failure.get_or_insert(e);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(Reconciled::Done),
        }
    }

    async fn node_detach(
        &self,
        vol: &Volume,
        claim: &Claim,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if claim.node_id.is_empty() || self.ctx.store.node_by_id(&claim.node_id).is_none() {
            tracing::debug!(
                volume_id = %vol.id,
                alloc_id = %claim.allocation_id,
                node_id = %claim.node_id,
                "node is gone, skipping node detach"
            );
            return Ok(());
        }

        tracing::trace!(volume_id = %vol.id, alloc_id = %claim.allocation_id, node_id = %claim.node_id, "detaching node");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.ctx.detacher.detach_at_node(&claim.node_id, &vol.id, &claim.allocation_id) => r,
        };
        match result {
            Err(e) if e.is_already_detached() => Ok(()),
            other => other,
        }
    }

    /// Detach from the controller once per node whose claims have all left
    /// the node, then mark those claims ready to free.
    async fn controller_detach(
        &self,
        vol: &Volume,
        plan: &mut ReapPlan,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let nodes: BTreeSet<String> = plan
            .reapable
            .iter()
            .filter(|c| c.state < ClaimState::ReadyToFree)
            .map(|c| c.node_id.clone())
            .collect();

        let mut failure = None;
        for node_id in nodes {
            let still_used = plan.node_in_use.get(&node_id).copied().unwrap_or(0) > 0;
            let needs_rpc = vol.controller_required && !node_id.is_empty() && !still_used;

            if needs_rpc {
                let on_node = plan.reapable.iter().filter(|c| c.node_id == node_id);
                let result = match self.external_node_id(vol, &node_id, on_node) {
                    Ok(external_node_id) => {
                        self.set_state(plan, &node_id, ClaimState::ControllerUnpublishing);
                        tracing::trace!(volume_id = %vol.id, node_id = %node_id, "detaching controller");
                        let result = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                            r = self.ctx.detacher.detach_at_controller(&vol.external_id, &external_node_id) => r,
                        };
                        match result {
                            Err(e) if e.is_already_detached() => Ok(()),
                            other => other,
                        }
                    }
                    Err(e) => Err(e),
                };

                if let Err(e) = result {
                    tracing::warn!(volume_id = %vol.id, node_id = %node_id, error = %e, "controller detach failed");
                    self.set_state(plan, &node_id, ClaimState::NodeDetached);
                    failure.get_or_insert(e);
                    continue;
                }
            }
            self.set_state(plan, &node_id, ClaimState::ReadyToFree);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn set_state(&self, plan: &mut ReapPlan, node_id: &str, state: ClaimState) {
        for claim in plan
            .reapable
            .iter_mut()
            .filter(|c| c.node_id == node_id && c.state < ClaimState::ReadyToFree)
        {
            tracing::trace!(
                volume_id = %self.volume_id,
                alloc_id = %claim.allocation_id,
                from = %claim.state,
                to = %state,
                "claim state"
            );
            claim.state = state;
        }
    }

    /// The plugin's ID for the node: from a claim, else from the node's fingerprint.
    fn external_node_id<'a>(
        &self,
        vol: &Volume,
        node_id: &str,
        mut claims: impl Iterator<Item = &'a Claim>,
    ) -> Result<String> {
        if let Some(claim) = claims.find(|c| !c.external_node_id.is_empty()) {
            return Ok(claim.external_node_id.clone());
        }
        self.ctx
            .store
            .node_by_id(node_id)
            .and_then(|node| node.plugin_node_ids.get(&vol.plugin_id).cloned())
            .ok_or_else(|| Error::UnknownExternalNode {
                node_id: node_id.to_string(),
                plugin_id: vol.plugin_id.clone(),
            })
    }

    /// Persist one claim's progress.
    async fn checkpoint(&self, claim: &Claim, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tracing::trace!(volume_id = %self.volume_id, alloc_id = %claim.allocation_id, state = %claim.state, "checkpointing claim");
        let future = self.ctx.batcher.create_update(
            &self.volume_id,
            &self.namespace,
            release_of(claim),
        );
        let index = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = future.wait() => r?,
        };
        self.observe_index(index);
        Ok(())
    }

    /// Remove every ready claim from the volume. Submitted together so they
    /// land in the same batch.
    async fn free_claims(&self, vol: &Volume, claims: &[Claim], cancel: &CancellationToken) -> Result<()> {
        let ready: Vec<&Claim> = claims
            .iter()
            .filter(|c| c.state == ClaimState::ReadyToFree)
            .collect();
        if ready.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let futures: Vec<_> = ready
            .iter()
            .map(|c| {
                self.ctx
                    .batcher
                    .create_update(&vol.id, &vol.namespace, release_of(c))
                    .wait()
            })
            .collect();
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = join_all(futures) => r,
        };

        let mut failure = None;
        for result in results {
            match result {
                Ok(index) => self.observe_index(index),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => {
                tracing::debug!(volume_id = %vol.id, namespace = %vol.namespace, freed = ready.len(), "released volume claims");
                Ok(())
            }
        }
    }
}

fn release_of(claim: &Claim) -> Claim {
    Claim {
        mode: ClaimMode::Release,
        ..claim.clone()
    }
}
