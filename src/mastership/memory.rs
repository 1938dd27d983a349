//! In-memory mastership store.
//!
//! Keeps every device's role assignment in memory behind an `RwLock`. One
//! instance can be shared by several coordinators to model a whole cluster
//! inside a single process; every mutation is pushed to all subscribed
//! delegates after the device lock is released, in revision order.
//!
//! Promotion policy: standbys are kept in registration order and the
//! earliest one is promoted when the master steps down. A demoted master
//! re-registers at the back of the queue.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;

use super::store::{
    MastershipEvent, MastershipEventType, MastershipInfo, MastershipStore,
    MastershipStoreDelegate, MastershipTerm, StoreFuture, SubscriptionId,
};
use crate::net::{DeviceId, MastershipRole, NodeId};

#[derive(Debug, Default)]
struct RoleState {
    master: Option<NodeId>,
    standbys: Vec<NodeId>,
    term: u64,
    revision: u64,
}

impl RoleState {
    fn info(&self) -> MastershipInfo {
        MastershipInfo {
            term: self.term,
            master: self.master.clone(),
            backups: self.standbys.clone(),
            revision: self.revision,
        }
    }

    /// Never assigned a role: nothing worth keeping.
    fn is_vacant(&self) -> bool {
        self.master.is_none() && self.standbys.is_empty() && self.term == 0 && self.revision == 0
    }

    fn is_master(&self, node: &NodeId) -> bool {
        self.master.as_ref() == Some(node)
    }

    fn make_master(&mut self, node: &NodeId) -> Option<MastershipEventType> {
        if self.is_master(node) {
            return None;
        }
        self.standbys.retain(|n| n != node);
        if let Some(previous) = self.master.take() {
            self.standbys.push(previous);
        }
        self.master = Some(node.clone());
        self.term += 1;
        Some(MastershipEventType::MasterChanged)
    }

    /// Clear the master and promote the earliest standby, if there is one.
    fn step_down(&mut self) {
        self.master = None;
        if !self.standbys.is_empty() {
            let next = self.standbys.remove(0);
            self.master = Some(next);
            self.term += 1;
        }
    }

    fn make_standby(&mut self, node: &NodeId) -> Option<MastershipEventType> {
        if self.is_master(node) {
            self.step_down();
            self.standbys.push(node.clone());
            Some(MastershipEventType::MasterChanged)
        } else if self.standbys.contains(node) {
            None
        } else {
            self.standbys.push(node.clone());
            Some(MastershipEventType::BackupsChanged)
        }
    }

    fn make_none(&mut self, node: &NodeId) -> Option<MastershipEventType> {
        if self.is_master(node) {
            self.step_down();
            Some(MastershipEventType::MasterChanged)
        } else if self.standbys.contains(node) {
            self.standbys.retain(|n| n != node);
            Some(MastershipEventType::BackupsChanged)
        } else {
            None
        }
    }

    fn clear(&mut self) -> Option<MastershipEventType> {
        let kind = if self.master.is_some() {
            MastershipEventType::MasterChanged
        } else if !self.standbys.is_empty() {
            MastershipEventType::BackupsChanged
        } else {
            return None;
        };
        self.master = None;
        self.standbys.clear();
        Some(kind)
    }
}

pub struct MemoryMastershipStore {
    devices: RwLock<HashMap<DeviceId, RoleState>>,
    delegates: RwLock<Vec<(SubscriptionId, Arc<dyn MastershipStoreDelegate>)>>,
    /// Held from the end of a mutation until its delegates have been notified.
    publish: Mutex<()>,
    next_subscription: AtomicU64,
    available: AtomicBool,
    latency: Mutex<Duration>,
}

impl MemoryMastershipStore {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            delegates: RwLock::new(Vec::new()),
            publish: Mutex::new(()),
            next_subscription: AtomicU64::new(1),
            available: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Simulate losing (or regaining) the store; while unavailable every
    /// operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`, to exercise caller timeouts.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("mutex poisoned") = latency;
    }

    /// Wait out the configured latency, then fail if the store is down.
    async fn round_trip(&self) -> anyhow::Result<()> {
        let latency = *self.latency.lock().expect("mutex poisoned");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            anyhow::bail!("mastership store unreachable");
        }
        Ok(())
    }

    /// Apply `mutation` to `device` and publish the resulting event.
    ///
    /// The publish lock is taken before the device lock is released, so
    /// delegates receive each device's events in revision order.
    fn mutate<F>(&self, device: &DeviceId, mutation: F) -> Option<MastershipEvent>
    where
        F: FnOnce(&mut RoleState) -> Option<MastershipEventType>,
    {
        let (event, _publishing) = {
            let mut devices = self.devices.write().expect("rwlock poisoned");
            let state = devices.entry(device.clone()).or_default();
            let Some(kind) = mutation(state) else {
                if state.is_vacant() {
                    devices.remove(device);
                }
                return None;
            };
            state.revision += 1;
            let event = MastershipEvent::new(kind, device.clone(), state.info());
            (event, self.publish.lock().expect("mutex poisoned"))
        };
        debug!(
            device = %device,
            kind = event.kind.as_str(),
            term = event.info.term,
            "Mastership store updated"
        );
        let delegates: Vec<_> = self
            .delegates
            .read()
            .expect("rwlock poisoned")
            .iter()
            .map(|(_, d)| d.clone())
            .collect();
        for delegate in delegates {
            delegate.notify(event.clone());
        }
        Some(event)
    }

    fn read<T>(&self, device: &DeviceId, f: impl FnOnce(Option<&RoleState>) -> T) -> T {
        let devices = self.devices.read().expect("rwlock poisoned");
        f(devices.get(device))
    }
}

impl Default for MemoryMastershipStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MastershipStore for MemoryMastershipStore {
    fn set_role(
        &self,
        node: &NodeId,
        device: &DeviceId,
        role: MastershipRole,
    ) -> StoreFuture<'_, Option<MastershipEvent>> {
        let node = node.clone();
        let device = device.clone();
        Box::pin(async move {
            self.round_trip().await?;
            Ok(self.mutate(&device, |state| match role {
                MastershipRole::Master => state.make_master(&node),
                MastershipRole::Standby => state.make_standby(&node),
                MastershipRole::None => state.make_none(&node),
            }))
        })
    }

    fn relinquish_role(
        &self,
        node: &NodeId,
        device: &DeviceId,
    ) -> StoreFuture<'_, Option<MastershipEvent>> {
        let node = node.clone();
        let device = device.clone();
        Box::pin(async move {
            self.round_trip().await?;
            Ok(self.mutate(&device, |state| {
                if !state.is_master(&node) {
                    return None;
                }
                state.step_down();
                Some(MastershipEventType::MasterChanged)
            }))
        })
    }

    fn get_role(&self, node: &NodeId, device: &DeviceId) -> StoreFuture<'_, MastershipRole> {
        let node = node.clone();
        let device = device.clone();
        Box::pin(async move {
            self.round_trip().await?;
            Ok(self.read(&device, |state| {
                state.map_or(MastershipRole::None, |s| s.info().role_of(&node))
            }))
        })
    }

    fn get_term_for(&self, device: &DeviceId) -> StoreFuture<'_, MastershipTerm> {
        let device = device.clone();
        Box::pin(async move {
            self.round_trip().await?;
            Ok(self.read(&device, |state| {
                state.map(|s| s.info().mastership_term()).unwrap_or_default()
            }))
        })
    }

    fn get_master(&self, device: &DeviceId) -> StoreFuture<'_, Option<NodeId>> {
        let device = device.clone();
        Box::pin(async move {
            self.round_trip().await?;
            Ok(self.read(&device, |state| state.and_then(|s| s.master.clone())))
        })
    }

    fn get_nodes(&self, device: &DeviceId) -> StoreFuture<'_, MastershipInfo> {
        let device = device.clone();
        Box::pin(async move {
            self.round_trip().await?;
            Ok(self.read(&device, |state| {
                state.map(RoleState::info).unwrap_or_default()
            }))
        })
    }

    fn get_devices(&self, node: &NodeId) -> StoreFuture<'_, BTreeSet<DeviceId>> {
        let node = node.clone();
        Box::pin(async move {
            self.round_trip().await?;
            let devices = self.devices.read().expect("rwlock poisoned");
            Ok(devices
                .iter()
                .filter(|(_, s)| s.is_master(&node) || s.standbys.contains(&node))
                .map(|(d, _)| d.clone())
                .collect())
        })
    }

    fn clear_device(&self, device: &DeviceId) -> StoreFuture<'_, Option<MastershipEvent>> {
        let device = device.clone();
        Box::pin(async move {
            self.round_trip().await?;
            Ok(self.mutate(&device, RoleState::clear))
        })
    }

    fn subscribe(&self, delegate: Arc<dyn MastershipStoreDelegate>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.delegates
            .write()
            .expect("rwlock poisoned")
            .push((id, delegate));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.delegates
            .write()
            .expect("rwlock poisoned")
            .retain(|(sub, _)| *sub != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<MastershipEvent>>,
    }

    impl MastershipStoreDelegate for Collect {
        fn notify(&self, event: MastershipEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_first_master_gets_term_one() {
        let store = MemoryMastershipStore::new();
        let event = store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, MastershipEventType::MasterChanged);
        assert_eq!(event.info.term, 1);
        assert_eq!(store.get_master(&dev("x")).await.unwrap(), Some(node("a")));
    }

    #[tokio::test]
    async fn test_set_role_is_idempotent() {
        let store = MemoryMastershipStore::new();
        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        let again = store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(store.get_term_for(&dev("x")).await.unwrap().term_number, 1);

        store
            .set_role(&node("b"), &dev("x"), MastershipRole::Standby)
            .await
            .unwrap();
        let again = store
            .set_role(&node("b"), &dev("x"), MastershipRole::Standby)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_takeover_demotes_previous_master() {
        let store = MemoryMastershipStore::new();
        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        let event = store
            .set_role(&node("b"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.info.term, 2);
        assert_eq!(event.info.master, Some(node("b")));
        assert_eq!(event.info.backups, vec![node("a")]);
        assert_eq!(
            store.get_role(&node("a"), &dev("x")).await.unwrap(),
            MastershipRole::Standby
        );
    }

    #[tokio::test]
    async fn test_standby_registration_raises_backups_changed() {
        let store = MemoryMastershipStore::new();
        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        let event = store
            .set_role(&node("b"), &dev("x"), MastershipRole::Standby)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, MastershipEventType::BackupsChanged);
        assert_eq!(event.info.term, 1);
    }

    #[tokio::test]
    async fn test_relinquish_promotes_earliest_standby() {
        let store = MemoryMastershipStore::new();
        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        for n in ["c", "b"] {
            store
                .set_role(&node(n), &dev("x"), MastershipRole::Standby)
                .await
                .unwrap();
        }
        let event = store
            .relinquish_role(&node("a"), &dev("x"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.info.master, Some(node("c")));
        assert_eq!(event.info.backups, vec![node("b")]);
        assert_eq!(event.info.term, 2);
        assert_eq!(
            store.get_role(&node("a"), &dev("x")).await.unwrap(),
            MastershipRole::None
        );
    }

    #[tokio::test]
    async fn test_relinquish_without_standby_leaves_no_master() {
        let store = MemoryMastershipStore::new();
        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        let event = store
            .relinquish_role(&node("a"), &dev("x"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.info.master, None);
        assert_eq!(event.info.term, 1);
        assert_eq!(store.get_master(&dev("x")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_relinquish_by_non_master_is_noop() {
        let store = MemoryMastershipStore::new();
        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        store
            .set_role(&node("b"), &dev("x"), MastershipRole::Standby)
            .await
            .unwrap();
        assert!(store
            .relinquish_role(&node("b"), &dev("x"))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .relinquish_role(&node("z"), &dev("y"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.get_master(&dev("x")).await.unwrap(), Some(node("a")));
    }

    #[tokio::test]
    async fn test_master_stepping_to_standby() {
        let store = MemoryMastershipStore::new();
        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        store
            .set_role(&node("b"), &dev("x"), MastershipRole::Standby)
            .await
            .unwrap();
        let event = store
            .set_role(&node("a"), &dev("x"), MastershipRole::Standby)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, MastershipEventType::MasterChanged);
        assert_eq!(event.info.master, Some(node("b")));
        assert_eq!(event.info.backups, vec![node("a")]);
        assert_eq!(event.info.term, 2);
    }

    #[tokio::test]
    async fn test_get_devices_covers_master_and_standby() {
        let store = MemoryMastershipStore::new();
        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        store
            .set_role(&node("a"), &dev("y"), MastershipRole::Standby)
            .await
            .unwrap();
        store
            .set_role(&node("b"), &dev("z"), MastershipRole::Master)
            .await
            .unwrap();
        store
            .set_role(&node("a"), &dev("w"), MastershipRole::None)
            .await
            .unwrap();

        let devices = store.get_devices(&node("a")).await.unwrap();
        assert_eq!(devices, BTreeSet::from([dev("x"), dev("y")]));
    }

    #[tokio::test]
    async fn test_clear_device_keeps_term() {
        let store = MemoryMastershipStore::new();
        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        store
            .set_role(&node("b"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        let event = store.clear_device(&dev("x")).await.unwrap().unwrap();
        assert_eq!(event.info.master, None);
        assert!(event.info.backups.is_empty());
        assert!(store.get_devices(&node("a")).await.unwrap().is_empty());

        let event = store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.info.term, 3);
        assert!(store.clear_device(&dev("unknown")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delegates_see_every_change_in_revision_order() {
        let store = MemoryMastershipStore::new();
        let collect = Arc::new(Collect::default());
        let id = store.subscribe(collect.clone());

        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        store
            .set_role(&node("b"), &dev("x"), MastershipRole::Standby)
            .await
            .unwrap();
        store
            .set_role(&node("b"), &dev("x"), MastershipRole::Standby)
            .await
            .unwrap();
        store.unsubscribe(id);
        store
            .set_role(&node("b"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();

        let events = collect.events.lock().unwrap();
        let revisions: Vec<u64> = events.iter().map(|e| e.info.revision).collect();
        assert_eq!(revisions, vec![1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_publish_in_revision_order() {
        let store = Arc::new(MemoryMastershipStore::new());
        let collect = Arc::new(Collect::default());
        store.subscribe(collect.clone());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for k in 0..200 {
                    let who = node(&format!("n{i}-{}", k % 2));
                    store
                        .set_role(&who, &dev("x"), MastershipRole::Master)
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let events = collect.events.lock().unwrap();
        let revisions: Vec<u64> = events.iter().map(|e| e.info.revision).collect();
        let expected: Vec<u64> = (1..=revisions.len() as u64).collect();
        assert_eq!(revisions, expected);
        let terms: Vec<u64> = events.iter().map(|e| e.info.term).collect();
        assert!(terms.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_noop_requests_leave_no_state() {
        let store = MemoryMastershipStore::new();
        for i in 0..100 {
            let x = dev(&format!("x{i}"));
            assert!(store.relinquish_role(&node("a"), &x).await.unwrap().is_none());
            assert!(store
                .set_role(&node("a"), &x, MastershipRole::None)
                .await
                .unwrap()
                .is_none());
        }
        assert!(store.devices.read().unwrap().is_empty());

        store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        store.relinquish_role(&node("a"), &dev("x")).await.unwrap();
        assert!(store
            .relinquish_role(&node("a"), &dev("x"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.devices.read().unwrap().len(), 1);
        assert_eq!(store.get_nodes(&dev("x")).await.unwrap().term, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryMastershipStore::new();
        store.set_available(false);
        assert!(store
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .is_err());
        assert!(store.get_master(&dev("x")).await.is_err());

        store.set_available(true);
        assert!(store.get_master(&dev("x")).await.unwrap().is_none());
    }
}
