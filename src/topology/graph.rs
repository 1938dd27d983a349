//! Topology snapshots and the sink they are published to.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::info;

use super::inventory::{DeviceEvent, LinkEvent};
use crate::net::{Device, DeviceId, Link, LinkKey};

/// Immutable graph of available devices and the links between them.
#[derive(Debug, Clone)]
pub struct GraphDescription {
    timestamp: u64,
    created_at: DateTime<Utc>,
    devices: BTreeMap<DeviceId, Device>,
    links: BTreeMap<LinkKey, Link>,
}

impl GraphDescription {
    /// Build a graph from an inventory snapshot.
    ///
    /// Unavailable devices are left out, as is any link with an endpoint
    /// that is not among the remaining devices.
    pub fn new(timestamp: u64, devices: Vec<Device>, links: Vec<Link>) -> Self {
        let devices: BTreeMap<DeviceId, Device> = devices
            .into_iter()
            .filter(|d| d.available)
            .map(|d| (d.id.clone(), d))
            .collect();
        let links = links
            .into_iter()
            .filter(|l| devices.contains_key(&l.src.device) && devices.contains_key(&l.dst.device))
            .map(|l| (l.key(), l))
            .collect();
        Self {
            timestamp,
            created_at: Utc::now(),
            devices,
            links,
        }
    }

    /// Monotonic build timestamp in nanoseconds. Strictly increases from one
    /// snapshot to the next.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn contains_device(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    /// Links leaving `device`.
    pub fn egress_links<'a>(&'a self, device: &'a DeviceId) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.values().filter(move |l| &l.src.device == device)
    }
}

/// An inventory change that contributed to a topology build.
#[derive(Debug, Clone)]
pub enum TopologyReason {
    Device(DeviceEvent),
    Link(LinkEvent),
}

/// Consumer of topology snapshots.
pub trait TopologyProviderService: Send + Sync {
    /// Called once per published snapshot, in build submission order.
    /// `reasons` is empty for builds not caused by inventory events.
    fn topology_changed(&self, graph: Arc<GraphDescription>, reasons: Vec<TopologyReason>);
}

/// Keeps the most recent snapshot and logs each publication.
#[derive(Default)]
pub struct LatestTopology {
    latest: RwLock<Option<Arc<GraphDescription>>>,
    published: AtomicU64,
}

impl LatestTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<GraphDescription>> {
        self.latest.read().expect("rwlock poisoned").clone()
    }

    /// Number of snapshots received so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl TopologyProviderService for LatestTopology {
    fn topology_changed(&self, graph: Arc<GraphDescription>, reasons: Vec<TopologyReason>) {
        info!(
            timestamp = graph.timestamp(),
            devices = graph.device_count(),
            links = graph.link_count(),
            reasons = reasons.len(),
            "Topology changed"
        );
        *self.latest.write().expect("rwlock poisoned") = Some(graph);
        self.published.fetch_add(1, Ordering::SeqCst);
    }
}
