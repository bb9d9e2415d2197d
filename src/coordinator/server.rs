//! Coordinator: the leadership hook around the volume watcher set

use crate::common::{Config, Result};
use crate::coordinator::leader::LeaderState;
use crate::state::StateStore;
use crate::volumewatcher::{ClaimDetacher, ClaimWriter, VolumesWatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub struct Coordinator {
    config: Config,
    store: Arc<StateStore>,
    leader: LeaderState,
    volumes: VolumesWatcher,
}

impl Coordinator {
    pub fn new(
        config: Config,
        store: Arc<StateStore>,
        writer: Arc<dyn ClaimWriter>,
        detacher: Arc<dyn ClaimDetacher>,
    ) -> Result<Self> {
        let volumes = VolumesWatcher::new(&config.watcher, writer, detacher)?;
        let leader = LeaderState::new(config.node_id.clone());
        Ok(Self {
            config,
            store,
            leader,
            volumes,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn leader(&self) -> &LeaderState {
        &self.leader
    }

    pub fn volumes(&self) -> &VolumesWatcher {
        &self.volumes
    }

    /// Called once this server has won `term`. Enables the watcher set
    /// against the current state; a repeated call for the same term is ignored.
    pub async fn establish_leadership(&self, term: u64) -> bool {
        if !self.leader.become_leader(term) {
            tracing::debug!(term, "already leader, ignoring");
            return false;
        }
        self.volumes.set_enabled(true, self.store.clone()).await;
        tracing::info!(
            node_id = %self.leader.node_id(),
            term,
            watchers = self.volumes.watcher_count(),
            "leadership established"
        );
        true
    }

    /// Called when leadership is lost. Returns only after every watcher and
    /// the batcher have stopped.
    pub async fn revoke_leadership(&self, new_leader: Option<String>) -> bool {
        let term = self.leader.get_term();
        let was_leader = self.leader.step_down(term, new_leader);
        self.volumes.set_enabled(false, self.store.clone()).await;
        if was_leader {
            tracing::info!(node_id = %self.leader.node_id(), term, "leadership revoked");
        }
        was_leader
    }

    /// Follow leadership changes until `shutdown`, sweeping watchers of
    /// deregistered volumes every `sweep_interval` while leader.
    pub async fn serve(
        &self,
        mut leadership: watch::Receiver<bool>,
        sweep_interval: Duration,
        shutdown: CancellationToken,
    ) {
        tracing::info!(node_id = %self.leader.node_id(), "coordinator started ({})", self.leader.get_role());

        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut is_leader = *leadership.borrow_and_update();
        self.apply_leadership(is_leader).await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                changed = leadership.changed() => {
                    if changed.is_err() {
                        tracing::warn!("leadership channel closed");
                        break;
                    }
                    let now_leader = *leadership.borrow_and_update();
                    if now_leader != is_leader {
                        is_leader = now_leader;
                        self.apply_leadership(is_leader).await;
                    }
                }
                _ = sweep.tick() => {
                    if self.leader.is_leader() {
                        self.volumes.sweep();
                    }
                }
            }
        }

        self.revoke_leadership(None).await;
        tracing::info!(node_id = %self.leader.node_id(), "coordinator stopped");
    }

    async fn apply_leadership(&self, is_leader: bool) {
        if is_leader {
            let term = self.leader.get_term() + 1;
            self.establish_leadership(term).await;
        } else {
            self.revoke_leadership(None).await;
        }
    }
}
