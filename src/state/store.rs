//! In-memory consistent state store
//!
//! Stores:
//! - Volumes with their read, write and past claims
//! - Allocations, jobs and nodes consulted when reaping claims
//!
//! Every write is assigned the next index under the write lock and returns
//! it, so indexes strictly increase across all tables and concurrent
//! writers. The volume table publishes its index on a watch channel so
//! callers can block until the table moves past an index they have seen.

use crate::common::{Error, Result};
use crate::state::types::{Allocation, Claim, ClaimMode, ClaimRequest, ClaimState, Job, Node, Volume};
use crate::volumewatcher::ClaimWriter;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

#[derive(Default)]
struct Tables {
    /// (namespace, id) → volume
    volumes: BTreeMap<(String, String), Volume>,
    allocs: HashMap<String, Allocation>,
    /// (namespace, id) → job
    jobs: HashMap<(String, String), Job>,
    nodes: HashMap<String, Node>,
    latest_index: u64,
}

impl Tables {
    /// Claim the next index for a write that is about to be committed.
    fn advance(&mut self) -> u64 {
        self.latest_index += 1;
        self.latest_index
    }
}

/// State store
pub struct StateStore {
    tables: RwLock<Tables>,
    volumes_index: watch::Sender<u64>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (volumes_index, _) = watch::channel(0);
        Self {
            tables: RwLock::new(Tables::default()),
            volumes_index,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Highest index of any write
    pub fn latest_index(&self) -> u64 {
        self.read().latest_index
    }

    /// Index of the last write to the volume table
    pub fn volume_table_index(&self) -> u64 {
        *self.volumes_index.borrow()
    }

    fn publish_volumes(&self, index: u64) {
        self.volumes_index.send_if_modified(|current| {
            if index > *current {
                *current = index;
                true
            } else {
                false
            }
        });
    }

    /// Block until the volume table index exceeds `min_index`; returns the new index.
    pub async fn wait_volume_change(&self, min_index: u64) -> u64 {
        let mut rx = self.volumes_index.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current > min_index {
                return current;
            }
            // The sender lives as long as the store, so this only errors on teardown.
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    // === Node, job and allocation operations ===

    pub fn upsert_node(&self, node: Node) -> u64 {
        let mut tables = self.write();
        tables.nodes.insert(node.id.clone(), node);
        tables.advance()
    }

    pub fn delete_node(&self, node_id: &str) -> u64 {
        let mut tables = self.write();
        tables.nodes.remove(node_id);
        tables.advance()
    }

    pub fn upsert_job(&self, job: Job) -> u64 {
        let mut tables = self.write();
        tables
            .jobs
            .insert((job.namespace.clone(), job.id.clone()), job);
        tables.advance()
    }

    pub fn upsert_allocs(&self, allocs: Vec<Allocation>) -> u64 {
        let mut tables = self.write();
        for alloc in allocs {
            tables.allocs.insert(alloc.id.clone(), alloc);
        }
        tables.advance()
    }

    /// Drop allocations, as the core garbage collector does for old terminal ones
    pub fn delete_allocs(&self, alloc_ids: &[String]) -> u64 {
        let mut tables = self.write();
        for id in alloc_ids {
            tables.allocs.remove(id);
        }
        tables.advance()
    }

    pub fn node_by_id(&self, node_id: &str) -> Option<Node> {
        self.read().nodes.get(node_id).cloned()
    }

    pub fn job_by_id(&self, namespace: &str, job_id: &str) -> Option<Job> {
        self.read()
            .jobs
            .get(&(namespace.to_string(), job_id.to_string()))
            .cloned()
    }

    pub fn alloc_by_id(&self, alloc_id: &str) -> Option<Allocation> {
        self.read().allocs.get(alloc_id).cloned()
    }

    // === Volume operations ===

    /// Register or update volumes. Claims on an existing volume are kept.
    pub fn volume_register(&self, volumes: Vec<Volume>) -> Result<u64> {
        let mut tables = self.write();
        let index = tables.advance();
        for mut vol in volumes {
            let key = (vol.namespace.clone(), vol.id.clone());
            match tables.volumes.get(&key) {
                Some(existing) => {
                    vol.create_index = existing.create_index;
                    vol.read_claims = existing.read_claims.clone();
                    vol.write_claims = existing.write_claims.clone();
                    vol.past_claims = existing.past_claims.clone();
                }
                None => vol.create_index = index,
            }
            vol.modify_index = index;
            tables.volumes.insert(key, vol);
        }
        drop(tables);
        self.publish_volumes(index);
        Ok(index)
    }

    /// Remove volumes. Volumes with live read or write claims are refused unless forced.
    pub fn volume_deregister(
        &self,
        namespace: &str,
        volume_ids: &[String],
        force: bool,
    ) -> Result<u64> {
        let mut tables = self.write();
        for id in volume_ids {
            let key = (namespace.to_string(), id.clone());
            let vol = tables.volumes.get(&key).ok_or_else(|| Error::VolumeNotFound {
                volume_id: id.clone(),
                namespace: namespace.to_string(),
            })?;
            if vol.in_use() && !force {
                return Err(Error::VolumeInUse(id.clone()));
            }
        }
        for id in volume_ids {
            tables.volumes.remove(&(namespace.to_string(), id.clone()));
        }
        let index = tables.advance();
        drop(tables);
        self.publish_volumes(index);
        Ok(index)
    }

    /// Apply a single claim at the next index. A rejected claim consumes no index.
    pub fn volume_claim(&self, namespace: &str, volume_id: &str, claim: Claim) -> Result<u64> {
        let mut tables = self.write();
        let index = tables.latest_index + 1;
        apply_claim(&mut tables, index, namespace, volume_id, claim)?;
        tables.advance();
        drop(tables);
        self.publish_volumes(index);
        Ok(index)
    }

    /// Apply a batch of claims in one write at the next index. Each claim is
    /// applied independently; if any fails the whole batch reports an error.
    pub fn apply_claim_batch(&self, requests: Vec<ClaimRequest>) -> Result<u64> {
        let mut tables = self.write();
        let index = tables.advance();
        let total = requests.len();
        let mut failures = Vec::new();
        for req in requests {
            if let Err(e) = apply_claim(&mut tables, index, &req.namespace, &req.volume_id, req.claim) {
                failures.push(e.to_string());
            }
        }
        drop(tables);
        self.publish_volumes(index);

        if failures.is_empty() {
            Ok(index)
        } else {
            Err(Error::ClaimWrite(format!(
                "{} of {} claims failed: {}",
                failures.len(),
                total,
                failures.join("; ")
            )))
        }
    }

    pub fn volume_by_id(&self, namespace: &str, volume_id: &str) -> Option<Volume> {
        self.read()
            .volumes
            .get(&(namespace.to_string(), volume_id.to_string()))
            .cloned()
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.read().volumes.values().cloned().collect()
    }

    /// Volumes holding any read, write or past claim
    pub fn volumes_with_claims(&self) -> Vec<Volume> {
        self.read()
            .volumes
            .values()
            .filter(|v| v.has_claims())
            .cloned()
            .collect()
    }

    /// Volumes written after `index`
    pub fn volumes_modified_since(&self, index: u64) -> Vec<Volume> {
        self.read()
            .volumes
            .values()
            .filter(|v| v.modify_index > index)
            .cloned()
            .collect()
    }
}

fn apply_claim(
    tables: &mut Tables,
    index: u64,
    namespace: &str,
    volume_id: &str,
    mut claim: Claim,
) -> Result<()> {
    let alloc = if claim.allocation_id.is_empty() {
        None
    } else {
        tables.allocs.get(&claim.allocation_id).cloned()
    };
    let vol = tables
        .volumes
        .get_mut(&(namespace.to_string(), volume_id.to_string()))
        .ok_or_else(|| Error::VolumeNotFound {
            volume_id: volume_id.to_string(),
            namespace: namespace.to_string(),
        })?;

    match claim.mode {
        ClaimMode::Read | ClaimMode::Write => {
            let alloc = alloc.ok_or_else(|| Error::AllocNotFound(claim.allocation_id.clone()))?;
            let reject = |reason: &str| Error::ClaimRejected {
                volume_id: volume_id.to_string(),
                reason: reason.to_string(),
            };
            if !vol.schedulable {
                return Err(reject("volume is not schedulable"));
            }
            if alloc.is_terminal() {
                return Err(reject("allocation is terminal"));
            }
            if claim.mode == ClaimMode::Write
                && vol.write_claims.keys().any(|id| *id != claim.allocation_id)
            {
                return Err(reject("volume max write claims reached"));
            }
            if claim.node_id.is_empty() {
                claim.node_id = alloc.node_id.clone();
            }
            claim.state = ClaimState::Taken;
            let claims = if claim.mode == ClaimMode::Read {
                &mut vol.read_claims
            } else {
                &mut vol.write_claims
            };
            claims.insert(claim.allocation_id.clone(), claim);
        }
        ClaimMode::Release => release_claim(vol, claim),
    }

    vol.modify_index = index;
    Ok(())
}

fn release_claim(vol: &mut Volume, mut claim: Claim) {
    let alloc_id = claim.allocation_id.clone();
    if claim.state == ClaimState::ReadyToFree {
        vol.read_claims.remove(&alloc_id);
        vol.write_claims.remove(&alloc_id);
        vol.past_claims.remove(&alloc_id);
        return;
    }

    if let Some(held) = vol
        .read_claims
        .get(&alloc_id)
        .or_else(|| vol.write_claims.get(&alloc_id))
    {
        if claim.node_id.is_empty() {
            claim.node_id = held.node_id.clone();
        }
        if claim.external_node_id.is_empty() {
            claim.external_node_id = held.external_node_id.clone();
        }
    }

    match vol.past_claims.get(&alloc_id) {
        // an older view must not roll back recorded progress
        Some(existing) if existing.state > claim.state => {}
        _ => {
            vol.past_claims.insert(alloc_id, claim);
        }
    }
}

#[async_trait::async_trait]
impl ClaimWriter for StateStore {
    async fn upsert_volume_claims(&self, requests: Vec<ClaimRequest>) -> Result<u64> {
        self.apply_claim_batch(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::AllocClientStatus;

    fn alloc(id: &str, status: AllocClientStatus) -> Allocation {
        Allocation {
            id: id.to_string(),
            namespace: "default".to_string(),
            job_id: "job-1".to_string(),
            node_id: "node-1".to_string(),
            client_status: status,
            desired_stop: false,
        }
    }

    fn volume(id: &str) -> Volume {
        Volume {
            id: id.to_string(),
            namespace: "default".to_string(),
            external_id: format!("ext-{}", id),
            plugin_id: "plugin-1".to_string(),
            schedulable: true,
            controller_required: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_register_and_claim() {
        let store = StateStore::new();
        assert_eq!(store.upsert_allocs(vec![alloc("a1", AllocClientStatus::Running)]), 1);
        assert_eq!(store.volume_register(vec![volume("vol-1")]).unwrap(), 2);

        let index = store
            .volume_claim("default", "vol-1", Claim::new("a1", "", ClaimMode::Read))
            .unwrap();
        assert_eq!(index, 3);

        let vol = store.volume_by_id("default", "vol-1").unwrap();
        assert_eq!(vol.read_claims.len(), 1);
        assert_eq!(vol.read_claims["a1"].node_id, "node-1");
        assert_eq!(vol.create_index, 2);
        assert_eq!(vol.modify_index, 3);
        assert_eq!(store.volume_table_index(), 3);
        assert_eq!(store.volumes_with_claims().len(), 1);
    }

    #[test]
    fn test_claim_rejections() {
        let store = StateStore::new();
        store.upsert_allocs(
            vec![
                alloc("a1", AllocClientStatus::Running),
                alloc("a2", AllocClientStatus::Running),
                alloc("done", AllocClientStatus::Complete),
            ],
        );
        store.volume_register(vec![volume("vol-1")]).unwrap();

        let err = store
            .volume_claim("default", "vol-1", Claim::new("missing", "", ClaimMode::Read))
            .unwrap_err();
        assert!(matches!(err, Error::AllocNotFound(_)));

        let err = store
            .volume_claim("default", "vol-1", Claim::new("done", "", ClaimMode::Read))
            .unwrap_err();
        assert!(matches!(err, Error::ClaimRejected { .. }));

        store
            .volume_claim("default", "vol-1", Claim::new("a1", "", ClaimMode::Write))
            .unwrap();
        let err = store
            .volume_claim("default", "vol-1", Claim::new("a2", "", ClaimMode::Write))
            .unwrap_err();
        assert!(matches!(err, Error::ClaimRejected { .. }));

        let err = store
            .volume_claim("default", "nope", Claim::job_release())
            .unwrap_err();
        assert!(matches!(err, Error::VolumeNotFound { .. }));
        // rejected claims consume no index
        assert_eq!(store.latest_index(), 3);
    }

    #[test]
    fn test_release_never_regresses() {
        let store = StateStore::new();
        store.upsert_allocs(vec![alloc("a1", AllocClientStatus::Running)]);
        store.volume_register(vec![volume("vol-1")]).unwrap();
        store
            .volume_claim("default", "vol-1", Claim::new("a1", "", ClaimMode::Read))
            .unwrap();

        let detached = Claim::new("a1", "", ClaimMode::Release).with_state(ClaimState::NodeDetached);
        store.volume_claim("default", "vol-1", detached).unwrap();
        let stale = Claim::new("a1", "", ClaimMode::Release);
        store.volume_claim("default", "vol-1", stale).unwrap();

        let vol = store.volume_by_id("default", "vol-1").unwrap();
        assert_eq!(vol.past_claims["a1"].state, ClaimState::NodeDetached);
        assert_eq!(vol.past_claims["a1"].node_id, "node-1");

        let free = Claim::new("a1", "", ClaimMode::Release).with_state(ClaimState::ReadyToFree);
        store.volume_claim("default", "vol-1", free).unwrap();
        let vol = store.volume_by_id("default", "vol-1").unwrap();
        assert!(!vol.has_claims());
    }

    #[test]
    fn test_deregister_in_use() {
        let store = StateStore::new();
        store.upsert_allocs(vec![alloc("a1", AllocClientStatus::Running)]);
        store.volume_register(vec![volume("vol-1")]).unwrap();
        store
            .volume_claim("default", "vol-1", Claim::new("a1", "", ClaimMode::Read))
            .unwrap();

        let ids = vec!["vol-1".to_string()];
        assert!(matches!(
            store.volume_deregister("default", &ids, false),
            Err(Error::VolumeInUse(_))
        ));
        assert_eq!(store.volume_deregister("default", &ids, true).unwrap(), 4);
        assert!(store.volume_by_id("default", "vol-1").is_none());
    }

    #[test]
    fn test_claim_batch_allocates_index() {
        let store = StateStore::new();
        let registered = store.volume_register(vec![volume("vol-1"), volume("vol-2")]).unwrap();

        let requests = vec![
            ClaimRequest {
                volume_id: "vol-1".into(),
                namespace: "default".into(),
                claim: Claim::job_release(),
            },
            ClaimRequest {
                volume_id: "vol-2".into(),
                namespace: "default".into(),
                claim: Claim::job_release(),
            },
        ];
        let index = store.apply_claim_batch(requests).unwrap();
        assert_eq!(index, registered + 1);
        assert_eq!(store.volumes_modified_since(registered).len(), 2);

        let bad = vec![ClaimRequest {
            volume_id: "missing".into(),
            namespace: "default".into(),
            claim: Claim::job_release(),
        }];
        assert!(matches!(store.apply_claim_batch(bad), Err(Error::ClaimWrite(_))));
    }

    #[tokio::test]
    async fn test_wait_volume_change() {
        let store = std::sync::Arc::new(StateStore::new());
        let registered = store.volume_register(vec![volume("vol-1")]).unwrap();
        assert_eq!(store.wait_volume_change(0).await, registered);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_volume_change(registered).await })
        };
        // non-volume writes do not wake the waiter
        store.upsert_allocs(vec![alloc("a1", AllocClientStatus::Running)]);
        let second = store.volume_register(vec![volume("vol-2")]).unwrap();
        assert_eq!(second, registered + 2);
        assert_eq!(waiter.await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_claim_after_register_moves_index_forward() {
        let store = std::sync::Arc::new(StateStore::new());
        store.upsert_allocs(vec![alloc("a1", AllocClientStatus::Running)]);
        for i in 0..10 {
            store.upsert_node(Node {
                id: format!("node-{}", i),
                plugin_node_ids: HashMap::new(),
            });
        }
        let registered = store.volume_register(vec![volume("vol-1")]).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_volume_change(registered).await })
        };
        let claimed = store
            .volume_claim("default", "vol-1", Claim::new("a1", "", ClaimMode::Read))
            .unwrap();

        assert!(claimed > registered);
        let vol = store.volume_by_id("default", "vol-1").unwrap();
        assert_eq!(vol.modify_index, claimed);
        assert_eq!(store.volume_table_index(), claimed);
        let woke = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken by claim")
            .unwrap();
        assert_eq!(woke, claimed);
    }

    #[test]
    fn test_concurrent_writers_get_distinct_indexes() {
        let store = StateStore::new();
        store.volume_register(vec![volume("vol-1")]).unwrap();

        let mut indexes: Vec<u64> = std::thread::scope(|scope| {
            let writers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        (0..50)
                            .map(|i| {
                                if i % 2 == 0 {
                                    store.volume_register(vec![volume("vol-1")]).unwrap()
                                } else {
                                    store
                                        .apply_claim_batch(vec![ClaimRequest {
                                            volume_id: "vol-1".into(),
                                            namespace: "default".into(),
                                            claim: Claim::job_release(),
                                        }])
                                        .unwrap()
                                }
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            writers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        let total = indexes.len();
        indexes.sort_unstable();
        indexes.dedup();
        assert_eq!(indexes.len(), total);
        let vol = store.volume_by_id("default", "vol-1").unwrap();
        assert_eq!(vol.modify_index, store.latest_index());
    }
}
