//! Mastership coordinator: the MastershipService API of one cluster node.
//!
//! Role requests are arbitrated by the [`MastershipStore`]; the coordinator
//! bounds every store call with a timeout, maps failures to
//! [`ControlError::StoreUnavailable`], and republishes the store's change
//! feed as [`MastershipEvent`]s on the local event bus.
//!
//! Events reach local listeners only through the store's change feed, so a
//! change made by this node and one made by a peer sharing the same store
//! are delivered the same way, exactly once. [`MastershipCoordinator::start`]
//! must be called before events flow.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use super::store::{
    MastershipEvent, MastershipEventType, MastershipInfo, MastershipStore,
    MastershipStoreDelegate, MastershipTerm, SubscriptionId,
};
use crate::config::MastershipConfig;
use crate::errors::ControlError;
use crate::event::{EventDispatcher, EventListener, ListenerRegistry};
use crate::metrics::{MASTERSHIP_EVENTS_TOTAL, STORE_ERRORS_TOTAL};
use crate::net::{DeviceId, MastershipRole, NodeId};

/// Listener for mastership changes.
pub type MastershipListener = dyn EventListener<MastershipEvent>;

/// Forwards the store's change feed onto the local event bus.
struct StoreFeed {
    local_node: NodeId,
    dispatcher: Arc<EventDispatcher>,
}

impl MastershipStoreDelegate for StoreFeed {
    fn notify(&self, event: MastershipEvent) {
        counter!(MASTERSHIP_EVENTS_TOTAL, "kind" => event.kind.as_str()).increment(1);
        if event.kind == MastershipEventType::MasterChanged {
            info!(
                node = %self.local_node,
                device = %event.device,
                master = ?event.info.master,
                term = event.info.term,
                "Master changed"
            );
        }
        self.dispatcher.post(event);
    }
}

pub struct MastershipCoordinator {
    local_node: NodeId,
    store: Arc<dyn MastershipStore>,
    dispatcher: Arc<EventDispatcher>,
    listeners: Arc<ListenerRegistry<MastershipEvent>>,
    store_timeout: Duration,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl MastershipCoordinator {
    /// Create a coordinator for `local_node` and register its listener
    /// registry as the dispatcher's mastership sink.
    pub fn new(
        local_node: NodeId,
        store: Arc<dyn MastershipStore>,
        dispatcher: Arc<EventDispatcher>,
        config: &MastershipConfig,
    ) -> Self {
        let listeners = Arc::new(ListenerRegistry::new());
        dispatcher.add_sink::<MastershipEvent>(listeners.clone());
        Self {
            local_node,
            store,
            dispatcher,
            listeners,
            store_timeout: config.store_timeout(),
            subscription: Mutex::new(None),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// Subscribe to the store's change feed. Idempotent.
    pub fn start(&self) {
        let mut subscription = self.subscription.lock().expect("mutex poisoned");
        if subscription.is_some() {
            return;
        }
        let feed = Arc::new(StoreFeed {
            local_node: self.local_node.clone(),
            dispatcher: self.dispatcher.clone(),
        });
        *subscription = Some(self.store.subscribe(feed));
        info!(node = %self.local_node, "Mastership coordinator started");
    }

    /// Stop republishing store changes. Idempotent.
    pub fn stop(&self) {
        if let Some(id) = self.subscription.lock().expect("mutex poisoned").take() {
            self.store.unsubscribe(id);
            info!(node = %self.local_node, "Mastership coordinator stopped");
        }
    }

    pub fn add_listener(&self, listener: Arc<MastershipListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<MastershipListener>) {
        self.listeners.remove(listener);
    }

    // -- Mutations -----------------------------------------------------------

    /// Request that `node` hold `role` for `device`.
    ///
    /// Repeating a request is a no-op and returns `Ok(None)`.
    pub async fn set_role(
        &self,
        node: &NodeId,
        device: &DeviceId,
        role: MastershipRole,
    ) -> Result<Option<MastershipEvent>, ControlError> {
        let event = self
            .call("set_role", self.store.set_role(node, device, role))
            .await?;
        if event.is_none() {
            debug!(node = %node, device = %device, role = %role, "Role already held");
        }
        Ok(event)
    }

    /// Give up mastership of `device` held by the local node.
    ///
    /// The earliest-registered standby takes over. Returns `Ok(None)` when
    /// the local node was not master.
    pub async fn relinquish_mastership(
        &self,
        device: &DeviceId,
    ) -> Result<Option<MastershipEvent>, ControlError> {
        let event = self
            .call(
                "relinquish_role",
                self.store.relinquish_role(&self.local_node, device),
            )
            .await?;
        if event.is_none() {
            debug!(node = %self.local_node, device = %device, "Not master, nothing to relinquish");
        }
        Ok(event)
    }

    /// Clear every role entry of a permanently deregistered device.
    pub async fn forget_device(
        &self,
        device: &DeviceId,
    ) -> Result<Option<MastershipEvent>, ControlError> {
        self.call("clear_device", self.store.clear_device(device))
            .await
    }

    // -- Queries -------------------------------------------------------------

    /// The local node's current role for `device`. Does not change any state.
    pub async fn request_role_for(&self, device: &DeviceId) -> Result<MastershipRole, ControlError> {
        self.call("get_role", self.store.get_role(&self.local_node, device))
            .await
    }

    /// The local node's current role for `device`.
    pub async fn get_local_role(&self, device: &DeviceId) -> Result<MastershipRole, ControlError> {
        self.request_role_for(device).await
    }

    pub async fn is_local_master(&self, device: &DeviceId) -> Result<bool, ControlError> {
        Ok(self.get_local_role(device).await? == MastershipRole::Master)
    }

    pub async fn get_master_for(&self, device: &DeviceId) -> Result<Option<NodeId>, ControlError> {
        self.call("get_master", self.store.get_master(device)).await
    }

    /// Devices for which `node` is master or standby.
    pub async fn get_devices_of(&self, node: &NodeId) -> Result<BTreeSet<DeviceId>, ControlError> {
        self.call("get_devices", self.store.get_devices(node)).await
    }

    pub async fn get_mastership_term(
        &self,
        device: &DeviceId,
    ) -> Result<MastershipTerm, ControlError> {
        self.call("get_term_for", self.store.get_term_for(device))
            .await
    }

    /// Master, standbys and term for `device`.
    pub async fn get_nodes_for(&self, device: &DeviceId) -> Result<MastershipInfo, ControlError> {
        self.call("get_nodes", self.store.get_nodes(device)).await
    }

    /// Await a store call under the configured timeout.
    async fn call<T, F>(&self, op: &'static str, request: F) -> Result<T, ControlError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let err = match tokio::time::timeout(self.store_timeout, request).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => anyhow::anyhow!("no answer within {:?}", self.store_timeout),
        };
        counter!(STORE_ERRORS_TOTAL, "op" => op).increment(1);
        let err = ControlError::store(op, err);
        warn!(
            node = %self.local_node,
            op,
            code = err.code(),
            error = %err,
            "Mastership store call failed"
        );
        Err(err)
    }
}

impl Drop for MastershipCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mastership::memory::MemoryMastershipStore;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    fn coordinator(local: &str, store: Arc<MemoryMastershipStore>) -> MastershipCoordinator {
        let coordinator = MastershipCoordinator::new(
            node(local),
            store,
            Arc::new(EventDispatcher::new()),
            &MastershipConfig {
                store_timeout_ms: 100,
            },
        );
        coordinator.start();
        coordinator
    }

    #[derive(Default)]
    struct Seen {
        events: Mutex<Vec<(MastershipEventType, Option<NodeId>, u64)>>,
    }

    impl EventListener<MastershipEvent> for Seen {
        fn event(&self, event: &MastershipEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push((
                event.kind,
                event.info.master.clone(),
                event.info.term,
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scenarios_one_to_three() {
        let store = Arc::new(MemoryMastershipStore::new());
        let a = coordinator("a", store.clone());
        let b = coordinator("b", store.clone());
        let x = dev("x");

        a.set_role(&node("a"), &x, MastershipRole::Master).await.unwrap();
        assert_eq!(a.get_master_for(&x).await.unwrap(), Some(node("a")));
        assert_eq!(a.get_mastership_term(&x).await.unwrap().term_number, 1);

        b.set_role(&node("b"), &x, MastershipRole::Master).await.unwrap();
        assert_eq!(b.get_master_for(&x).await.unwrap(), Some(node("b")));
        assert_eq!(a.get_local_role(&x).await.unwrap(), MastershipRole::Standby);
        assert_eq!(a.get_mastership_term(&x).await.unwrap().term_number, 2);

        a.set_role(&node("a"), &x, MastershipRole::Master).await.unwrap();
        assert!(a.is_local_master(&x).await.unwrap());
        assert!(!b.is_local_master(&x).await.unwrap());
        assert_eq!(a.get_mastership_term(&x).await.unwrap().term_number, 3);
    }

    #[tokio::test]
    async fn test_relinquish_scenarios() {
        let store = Arc::new(MemoryMastershipStore::new());
        let a = coordinator("a", store.clone());
        let x = dev("x");
        let y = dev("y");

        // Scenario 4: no standby.
        a.set_role(&node("a"), &x, MastershipRole::Master).await.unwrap();
        a.relinquish_mastership(&x).await.unwrap();
        assert_eq!(a.get_master_for(&x).await.unwrap(), None);
        assert_eq!(a.get_mastership_term(&x).await.unwrap().term_number, 1);

        // Scenario 5: B standing by.
        a.set_role(&node("a"), &y, MastershipRole::Master).await.unwrap();
        a.set_role(&node("b"), &y, MastershipRole::Standby).await.unwrap();
        a.relinquish_mastership(&y).await.unwrap();
        assert_eq!(a.get_master_for(&y).await.unwrap(), Some(node("b")));
        assert_eq!(a.get_mastership_term(&y).await.unwrap().term_number, 2);
        assert_eq!(a.request_role_for(&y).await.unwrap(), MastershipRole::None);

        // Not master any more: no-op.
        assert!(a.relinquish_mastership(&y).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listeners_on_every_node_see_changes() {
        let store = Arc::new(MemoryMastershipStore::new());
        let a = coordinator("a", store.clone());
        let b = coordinator("b", store.clone());
        let seen_a = Arc::new(Seen::default());
        let seen_b = Arc::new(Seen::default());
        a.add_listener(seen_a.clone());
        b.add_listener(seen_b.clone());

        a.set_role(&node("a"), &dev("x"), MastershipRole::Master).await.unwrap();
        b.set_role(&node("b"), &dev("x"), MastershipRole::Standby).await.unwrap();
        // Idempotent repeat: no event.
        b.set_role(&node("b"), &dev("x"), MastershipRole::Standby).await.unwrap();

        let expected = vec![
            (MastershipEventType::MasterChanged, Some(node("a")), 1),
            (MastershipEventType::BackupsChanged, Some(node("a")), 1),
        ];
        assert_eq!(*seen_a.events.lock().unwrap(), expected);
        assert_eq!(*seen_b.events.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_stopped_coordinator_publishes_nothing() {
        let store = Arc::new(MemoryMastershipStore::new());
        let a = coordinator("a", store.clone());
        let seen = Arc::new(Seen::default());
        a.add_listener(seen.clone());
        a.stop();

        let event = a
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        assert!(event.is_some());
        assert!(seen.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removed_listener_is_not_called() {
        let store = Arc::new(MemoryMastershipStore::new());
        let a = coordinator("a", store);
        let seen = Arc::new(Seen::default());
        let handle: Arc<MastershipListener> = seen.clone();
        a.add_listener(handle.clone());
        a.remove_listener(&handle);

        a.set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap();
        assert!(seen.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_devices_of() {
        let store = Arc::new(MemoryMastershipStore::new());
        let a = coordinator("a", store);
        a.set_role(&node("a"), &dev("x"), MastershipRole::Master).await.unwrap();
        a.set_role(&node("a"), &dev("y"), MastershipRole::Standby).await.unwrap();
        a.set_role(&node("b"), &dev("z"), MastershipRole::Master).await.unwrap();

        assert_eq!(
            a.get_devices_of(&node("a")).await.unwrap(),
            BTreeSet::from([dev("x"), dev("y")])
        );
        assert_eq!(
            a.get_devices_of(&node("b")).await.unwrap(),
            BTreeSet::from([dev("z")])
        );
    }

    #[tokio::test]
    async fn test_forget_device_clears_roles() {
        let store = Arc::new(MemoryMastershipStore::new());
        let a = coordinator("a", store);
        a.set_role(&node("a"), &dev("x"), MastershipRole::Master).await.unwrap();
        a.forget_device(&dev("x")).await.unwrap();
        assert!(a.get_devices_of(&node("a")).await.unwrap().is_empty());
        assert_eq!(a.get_nodes_for(&dev("x")).await.unwrap().term, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_surfaces_error() {
        let store = Arc::new(MemoryMastershipStore::new());
        let a = coordinator("a", store.clone());
        store.set_available(false);

        let err = a
            .set_role(&node("a"), &dev("x"), MastershipRole::Master)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::StoreUnavailable { op: "set_role", .. }
        ));
        assert_eq!(err.code(), "StoreUnavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let store = Arc::new(MemoryMastershipStore::new());
        let a = coordinator("a", store.clone());
        store.set_latency(Duration::from_secs(1));

        let err = a.get_master_for(&dev("x")).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::StoreUnavailable { op: "get_master", .. }
        ));
    }
}
