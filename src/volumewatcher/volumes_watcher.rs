//! Leader-owned set of volume watchers
//!
//! While enabled, the set holds one [`VolumeWatcher`] per volume that has
//! claims, an [`UpdateBatcher`] shared by all of them, and a loop that
//! blocks on volume-table changes and forwards each changed volume to its
//! watcher. Disabling tears all of it down before returning, so no claim
//! write is issued after leadership is lost.

use crate::common::{volume_key, QueryLimiter, Result, WatcherConfig};
use crate::state::{StateStore, Volume};
use crate::volumewatcher::volume_watcher::WatcherContext;
use crate::volumewatcher::{ClaimDetacher, ClaimWriter, UpdateBatcher, VolumeWatcher};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct ManagerState {
    enabled: bool,
    ctx: Option<Arc<WatcherContext>>,
    /// volume ID + namespace → watcher
    watchers: HashMap<String, VolumeWatcher>,
    /// Batcher and change-subscription tasks
    tasks: Vec<JoinHandle<()>>,
}

/// Watcher Set Manager
pub struct VolumesWatcher {
    writer: Arc<dyn ClaimWriter>,
    detacher: Arc<dyn ClaimDetacher>,
    batch_window: Duration,
    rescan_interval: Duration,
    limiter: Arc<QueryLimiter>,
    state: Arc<Mutex<ManagerState>>,
    /// Serializes enable/disable transitions
    lifecycle: tokio::sync::Mutex<()>,
}

impl VolumesWatcher {
    pub fn new(
        config: &WatcherConfig,
        writer: Arc<dyn ClaimWriter>,
        detacher: Arc<dyn ClaimDetacher>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            writer,
            detacher,
            batch_window: config.batch_duration()?,
            rescan_interval: config.rescan_duration()?,
            limiter: Arc::new(QueryLimiter::new(
                config.limit_state_queries_per_second,
                config.query_burst,
            )),
            state: Arc::new(Mutex::new(ManagerState::default())),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        lock_state(&self.state)
    }

    /// Enable or disable the whole set.
    ///
    /// Every call first stops and joins all watchers and background tasks.
    /// Enabling then rescans `store` from scratch and starts a watcher for
    /// each volume holding claims.
    pub async fn set_enabled(&self, enabled: bool, store: Arc<StateStore>) {
        let _transition = self.lifecycle.lock().await;
        self.flush().await;
        if enabled {
            self.enable(store);
        }
    }

    fn enable(&self, store: Arc<StateStore>) {
        let shutdown = CancellationToken::new();
        let (batcher, batcher_task) =
            UpdateBatcher::spawn(self.writer.clone(), self.batch_window, shutdown.clone());
        let ctx = Arc::new(WatcherContext {
            store: store.clone(),
            batcher,
            detacher: self.detacher.clone(),
            shutdown,
        });

        // capture the index before scanning so nothing written after the scan is missed
        let index = store.volume_table_index();
        let volumes = store.volumes_with_claims();

        let mut state = self.lock();
        state.enabled = true;
        state.ctx = Some(ctx.clone());
        for vol in volumes {
            let watcher = VolumeWatcher::new(ctx.clone(), &vol);
            let key = vol.key();
            watcher.start(vol);
            state.watchers.insert(key, watcher);
        }
        let watch_task = tokio::spawn(watch_volumes(
            self.state.clone(),
            self.limiter.clone(),
            ctx,
            index,
            self.rescan_interval,
        ));
        state.tasks.push(batcher_task);
        state.tasks.push(watch_task);
        tracing::info!(watchers = state.watchers.len(), index, "volume watchers enabled");
    }

    /// Cancel everything and wait for it to exit.
    async fn flush(&self) {
        let (watchers, tasks) = {
            let mut state = self.lock();
            let was_enabled = state.enabled;
            state.enabled = false;
            if let Some(ctx) = state.ctx.take() {
                ctx.shutdown.cancel();
            }
            let watchers: Vec<VolumeWatcher> = state.watchers.drain().map(|(_, w)| w).collect();
            let tasks = std::mem::take(&mut state.tasks);
            if was_enabled {
                tracing::info!(watchers = watchers.len(), "disabling volume watchers");
            }
            (watchers, tasks)
        };

        for watcher in &watchers {
            watcher.stop();
        }
        for watcher in &watchers {
            watcher.join().await;
        }
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "volume watcher background task failed");
            }
        }
    }

    /// Remove entries for deregistered volumes whose watcher has finished.
    /// Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut state = self.lock();
        let Some(store) = state.ctx.as_ref().map(|ctx| ctx.store.clone()) else {
            return 0;
        };
        let before = state.watchers.len();
        state.watchers.retain(|_, w| {
            w.is_running() || store.volume_by_id(w.namespace(), w.volume_id()).is_some()
        });
        let removed = before - state.watchers.len();
        if removed > 0 {
            tracing::debug!(removed, "swept volume watchers");
        }
        removed
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Number of watcher entries, running or not
    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().watchers.values().filter(|w| w.is_running()).count()
    }

    pub fn watcher(&self, volume_id: &str, namespace: &str) -> Option<VolumeWatcher> {
        self.lock()
            .watchers
            .get(&volume_key(volume_id, namespace))
            .cloned()
    }
}

fn lock_state(state: &Mutex<ManagerState>) -> MutexGuard<'_, ManagerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Block on volume-table changes and hand every changed volume to its
/// watcher. Every `rescan_interval`, regardless of how busy the table is,
/// every volume with claims is re-notified.
async fn watch_volumes(
    state: Arc<Mutex<ManagerState>>,
    limiter: Arc<QueryLimiter>,
    ctx: Arc<WatcherContext>,
    mut index: u64,
    rescan_interval: Duration,
) {
    let mut rescan = tokio::time::interval_at(Instant::now() + rescan_interval, rescan_interval);
    rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => return,
            _ = limiter.acquire() => {}
        }
        // the rescan tick goes first so table churn cannot starve it
        let changed = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => return,
            _ = rescan.tick() => {
                let claimed = ctx.store.volumes_with_claims();
                tracing::debug!(index, volumes = claimed.len(), "rescanning claimed volumes");
                claimed
            }
            next = ctx.store.wait_volume_change(index) => {
                let changed = ctx.store.volumes_modified_since(index);
                index = changed
                    .iter()
                    .map(|v| v.modify_index)
                    .fold(next, u64::max);
                tracing::trace!(index, volumes = changed.len(), "volume table changed");
                changed
            }
        };

        let mut guard = lock_state(&state);
        for vol in changed {
            notify_volume(&mut guard, &ctx, vol);
        }
        wake_orphaned(&guard, &ctx.store);
    }
}

/// Deregistered volumes never show up as changed again, so a watcher parked
/// on one would wait forever. Wake those to let them exit.
fn wake_orphaned(state: &ManagerState, store: &StateStore) {
    for watcher in state.watchers.values() {
        if watcher.is_running()
            && store
                .volume_by_id(watcher.namespace(), watcher.volume_id())
                .is_none()
        {
            watcher.wake();
        }
    }
}

fn notify_volume(state: &mut ManagerState, ctx: &Arc<WatcherContext>, vol: Volume) {
    if !state.enabled || ctx.shutdown.is_cancelled() {
        return;
    }
    let key = vol.key();
    let watcher = state
        .watchers
        .entry(key)
        .or_insert_with(|| VolumeWatcher::new(ctx.clone(), &vol));
    watcher.notify(vol);
}
