//! Composition root.
//!
//! [`Controller`] builds every coordination component for one cluster node
//! from explicit collaborators and owns their start/stop order. Nothing in
//! the crate is reachable through a global.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::event::EventDispatcher;
use crate::mastership::{MastershipCoordinator, MastershipListener, MastershipStore};
use crate::net::NodeId;
use crate::replica::ReplicaInfoTracker;
use crate::topology::{DeviceService, LinkService, TopologyProvider, TopologyProviderService};

pub struct Controller {
    node: NodeId,
    mastership: Arc<MastershipCoordinator>,
    replicas: Arc<ReplicaInfoTracker>,
    topology: Arc<TopologyProvider>,
}

impl Controller {
    /// Wire the components for `node`. Must be called within a tokio runtime.
    ///
    /// `dispatcher` must be the bus the inventory posts its device and link
    /// events on.
    pub fn new(
        node: NodeId,
        config: &Config,
        store: Arc<dyn MastershipStore>,
        dispatcher: Arc<EventDispatcher>,
        devices: Arc<dyn DeviceService>,
        links: Arc<dyn LinkService>,
        sink: Arc<dyn TopologyProviderService>,
    ) -> Self {
        let mastership = Arc::new(MastershipCoordinator::new(
            node.clone(),
            store,
            dispatcher.clone(),
            &config.mastership,
        ));
        let replicas = Arc::new(ReplicaInfoTracker::new(dispatcher));
        let tracker: Arc<MastershipListener> = replicas.clone();
        mastership.add_listener(tracker);
        let topology = Arc::new(TopologyProvider::new(devices, links, sink, &config.topology));
        Self {
            node,
            mastership,
            replicas,
            topology,
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn mastership(&self) -> &Arc<MastershipCoordinator> {
        &self.mastership
    }

    pub fn replicas(&self) -> &Arc<ReplicaInfoTracker> {
        &self.replicas
    }

    pub fn topology(&self) -> &Arc<TopologyProvider> {
        &self.topology
    }

    /// Start consumers before producers: replica notifier, then the
    /// mastership feed, then topology.
    pub fn start(&self) -> anyhow::Result<()> {
        self.replicas.start()?;
        self.mastership.start();
        self.topology.start();
        info!(node = %self.node, "Controller started");
        Ok(())
    }

    /// Stop producers before consumers. Replica notifications already queued
    /// are delivered before this returns.
    pub async fn stop(&self) {
        self.topology.stop().await;
        self.mastership.stop();
        let replicas = self.replicas.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || replicas.stop()).await {
            warn!(error = %e, "Replica-info tracker did not stop cleanly");
        }
        info!(node = %self.node, "Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mastership::memory::MemoryMastershipStore;
    use crate::net::{DeviceId, MastershipRole};
    use crate::replica::{ReplicaInfoEvent, ReplicaInfoListener};
    use crate::topology::{LatestTopology, MemoryInventory};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Node {
        controller: Controller,
        topology: Arc<LatestTopology>,
    }

    fn node(id: &str, store: Arc<MemoryMastershipStore>) -> (Node, Arc<MemoryInventory>) {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inventory = Arc::new(MemoryInventory::new(dispatcher.clone()));
        let topology = Arc::new(LatestTopology::new());
        let controller = Controller::new(
            NodeId::new(id),
            &Config::default(),
            store,
            dispatcher,
            inventory.clone(),
            inventory.clone(),
            topology.clone(),
        );
        controller.start().unwrap();
        (
            Node {
                controller,
                topology,
            },
            inventory,
        )
    }

    #[derive(Default)]
    struct Terms {
        terms: Mutex<Vec<u64>>,
    }

    impl crate::event::EventListener<ReplicaInfoEvent> for Terms {
        fn event(&self, event: &ReplicaInfoEvent) -> anyhow::Result<()> {
            self.terms.lock().unwrap().push(event.info.term());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_two_nodes_agree_on_replica_info() {
        let store = Arc::new(MemoryMastershipStore::new());
        let (a, _) = node("a", store.clone());
        let (b, _) = node("b", store.clone());
        let terms = Arc::new(Terms::default());
        let listener: Arc<ReplicaInfoListener> = terms.clone();
        b.controller.replicas().add_listener(listener);

        let x = DeviceId::new("x");
        let a_id = NodeId::new("a");
        let b_id = NodeId::new("b");
        let ms = a.controller.mastership();
        ms.set_role(&a_id, &x, MastershipRole::Master).await.unwrap();
        ms.set_role(&b_id, &x, MastershipRole::Master).await.unwrap();
        ms.set_role(&a_id, &x, MastershipRole::Master).await.unwrap();

        for n in [&a, &b] {
            let info = n.controller.replicas().get_replica_info_for(&x);
            assert_eq!(info.term(), 3);
            assert_eq!(info.master(), Some(&a_id));
        }
        assert_eq!(
            b.controller.mastership().get_local_role(&x).await.unwrap(),
            MastershipRole::Standby
        );

        a.controller.stop().await;
        b.controller.stop().await;
        assert_eq!(*terms.terms.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_relinquish_hands_device_to_standby() {
        let store = Arc::new(MemoryMastershipStore::new());
        let (a, _) = node("a", store.clone());
        let (b, _) = node("b", store.clone());
        let x = DeviceId::new("x");

        a.controller
            .mastership()
            .set_role(&NodeId::new("a"), &x, MastershipRole::Master)
            .await
            .unwrap();
        b.controller
            .mastership()
            .set_role(&NodeId::new("b"), &x, MastershipRole::Standby)
            .await
            .unwrap();
        a.controller
            .mastership()
            .relinquish_mastership(&x)
            .await
            .unwrap();

        assert!(b.controller.mastership().is_local_master(&x).await.unwrap());
        let info = a.controller.replicas().get_replica_info_for(&x);
        assert_eq!(info.term(), 2);
        assert_eq!(info.master(), Some(&NodeId::new("b")));
        assert!(info.backups().is_empty());

        a.controller.stop().await;
        b.controller.stop().await;
    }

    #[tokio::test]
    async fn test_topology_follows_inventory() {
        let store = Arc::new(MemoryMastershipStore::new());
        let (a, inventory) = node("a", store);

        inventory.add_device(DeviceId::new("of:1"));
        inventory.add_device(DeviceId::new("of:2"));
        inventory.add_link(crate::net::Link::new(
            "of:1/1".parse().unwrap(),
            "of:2/1".parse().unwrap(),
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let graph = a.topology.current().unwrap();
        assert_eq!(graph.device_count(), 2);
        assert_eq!(graph.link_count(), 1);
        assert!(a.topology.published() >= 2);
        a.controller.stop().await;
    }
}
