//! Device and link inventory: the DeviceService / LinkService boundary.
//!
//! Discovery adapters own the real inventory; topology assembly only needs a
//! consistent snapshot (`get_devices`, `get_links`) plus the change events,
//! which arrive through the [`EventDispatcher`]. [`MemoryInventory`] is the
//! in-process implementation used by the binary and by tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::event::{Event, EventDispatcher, EventListener, ListenerRegistry};
use crate::net::{Device, DeviceId, Link, LinkKey};

// -- Events ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventType {
    DeviceAdded,
    DeviceRemoved,
    DeviceAvailabilityChanged,
    DeviceUpdated,
    PortAdded,
    PortUpdated,
    PortRemoved,
}

#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub kind: DeviceEventType,
    /// Device state after the change (before it, for removals).
    pub device: Device,
    /// Port concerned by `Port*` events.
    pub port: Option<u32>,
    pub time: DateTime<Utc>,
}

impl DeviceEvent {
    pub fn new(kind: DeviceEventType, device: Device) -> Self {
        Self {
            kind,
            device,
            port: None,
            time: Utc::now(),
        }
    }

    pub fn for_port(kind: DeviceEventType, device: Device, port: u32) -> Self {
        Self {
            port: Some(port),
            ..Self::new(kind, device)
        }
    }
}

impl Event for DeviceEvent {
    type Kind = DeviceEventType;
    type Subject = Device;
    const NAME: &'static str = "device";

    fn kind(&self) -> DeviceEventType {
        self.kind
    }

    fn subject(&self) -> &Device {
        &self.device
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEventType {
    LinkAdded,
    LinkRemoved,
    LinkUpdated,
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub kind: LinkEventType,
    pub link: Link,
    pub time: DateTime<Utc>,
}

impl LinkEvent {
    pub fn new(kind: LinkEventType, link: Link) -> Self {
        Self {
            kind,
            link,
            time: Utc::now(),
        }
    }
}

impl Event for LinkEvent {
    type Kind = LinkEventType;
    type Subject = Link;
    const NAME: &'static str = "link";

    fn kind(&self) -> LinkEventType {
        self.kind
    }

    fn subject(&self) -> &Link {
        &self.link
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

pub type DeviceListener = dyn EventListener<DeviceEvent>;
pub type LinkListener = dyn EventListener<LinkEvent>;

// -- Service traits ----------------------------------------------------------

/// Read access to the device inventory plus its change events.
///
/// Reads are synchronous and cheap; they are taken while the topology
/// assembler holds its submission lock.
pub trait DeviceService: Send + Sync {
    fn get_devices(&self) -> anyhow::Result<Vec<Device>>;
    fn add_listener(&self, listener: Arc<DeviceListener>);
    fn remove_listener(&self, listener: &Arc<DeviceListener>);
}

/// Read access to the link inventory plus its change events.
pub trait LinkService: Send + Sync {
    fn get_links(&self) -> anyhow::Result<Vec<Link>>;
    fn add_listener(&self, listener: Arc<LinkListener>);
    fn remove_listener(&self, listener: &Arc<LinkListener>);
}

// -- In-memory implementation ------------------------------------------------

#[derive(Default)]
struct Inventory {
    devices: BTreeMap<DeviceId, Device>,
    ports: BTreeMap<DeviceId, BTreeSet<u32>>,
    links: BTreeMap<LinkKey, Link>,
}

/// In-memory device and link inventory.
///
/// Every mutation posts the matching [`DeviceEvent`] or [`LinkEvent`] on the
/// dispatcher once the inventory lock has been released.
pub struct MemoryInventory {
    inner: RwLock<Inventory>,
    dispatcher: Arc<EventDispatcher>,
    device_listeners: Arc<ListenerRegistry<DeviceEvent>>,
    link_listeners: Arc<ListenerRegistry<LinkEvent>>,
    failing: AtomicBool,
}

impl MemoryInventory {
    /// Create an empty inventory and register the device and link sinks.
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        let device_listeners = Arc::new(ListenerRegistry::new());
        let link_listeners = Arc::new(ListenerRegistry::new());
        dispatcher.add_sink::<DeviceEvent>(device_listeners.clone());
        dispatcher.add_sink::<LinkEvent>(link_listeners.clone());
        Self {
            inner: RwLock::new(Inventory::default()),
            dispatcher,
            device_listeners,
            link_listeners,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every snapshot read fail until reset. Models an unreachable
    /// inventory backend.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_readable(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("inventory is unavailable");
        }
        Ok(())
    }

    /// Register a device. Re-adding a known device is a no-op.
    pub fn add_device(&self, id: DeviceId) -> bool {
        let device = {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            if inner.devices.contains_key(&id) {
                return false;
            }
            let device = Device::new(id.clone());
            inner.devices.insert(id, device.clone());
            device
        };
        self.dispatcher
            .post(DeviceEvent::new(DeviceEventType::DeviceAdded, device));
        true
    }

    /// Deregister a device along with its ports and every link touching it.
    pub fn remove_device(&self, id: &DeviceId) -> bool {
        let (device, links) = {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            let Some(device) = inner.devices.remove(id) else {
                return false;
            };
            inner.ports.remove(id);
            let keys: Vec<LinkKey> = inner
                .links
                .keys()
                .filter(|k| &k.src.device == id || &k.dst.device == id)
                .cloned()
                .collect();
            let links: Vec<Link> = keys
                .iter()
                .filter_map(|k| inner.links.remove(k))
                .collect();
            (device, links)
        };
        for link in links {
            self.dispatcher
                .post(LinkEvent::new(LinkEventType::LinkRemoved, link));
        }
        self.dispatcher
            .post(DeviceEvent::new(DeviceEventType::DeviceRemoved, device));
        true
    }

    /// Mark a device reachable or unreachable. No event if unchanged.
    pub fn set_availability(&self, id: &DeviceId, available: bool) -> bool {
        let device = {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            match inner.devices.get_mut(id) {
                Some(device) if device.available != available => {
                    device.available = available;
                    device.clone()
                }
                _ => return false,
            }
        };
        self.dispatcher.post(DeviceEvent::new(
            DeviceEventType::DeviceAvailabilityChanged,
            device,
        ));
        true
    }

    /// Signal a description change of a known device.
    pub fn update_device(&self, id: &DeviceId) -> bool {
        let Some(device) = self.device(id) else {
            return false;
        };
        self.dispatcher
            .post(DeviceEvent::new(DeviceEventType::DeviceUpdated, device));
        true
    }

    pub fn add_port(&self, id: &DeviceId, port: u32) -> bool {
        self.port_change(id, port, DeviceEventType::PortAdded)
    }

    pub fn update_port(&self, id: &DeviceId, port: u32) -> bool {
        self.port_change(id, port, DeviceEventType::PortUpdated)
    }

    pub fn remove_port(&self, id: &DeviceId, port: u32) -> bool {
        self.port_change(id, port, DeviceEventType::PortRemoved)
    }

    fn port_change(&self, id: &DeviceId, port: u32, kind: DeviceEventType) -> bool {
        let device = {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            let Some(device) = inner.devices.get(id).cloned() else {
                return false;
            };
            let ports = inner.ports.entry(id.clone()).or_default();
            let changed = match kind {
                DeviceEventType::PortAdded => ports.insert(port),
                DeviceEventType::PortRemoved => ports.remove(&port),
                _ => ports.contains(&port),
            };
            if !changed {
                return false;
            }
            device
        };
        self.dispatcher
            .post(DeviceEvent::for_port(kind, device, port));
        true
    }

    /// Register or refresh a link. Refreshing a known link posts `LinkUpdated`.
    pub fn add_link(&self, link: Link) {
        let kind = {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            match inner.links.insert(link.key(), link.clone()) {
                Some(_) => LinkEventType::LinkUpdated,
                None => LinkEventType::LinkAdded,
            }
        };
        self.dispatcher.post(LinkEvent::new(kind, link));
    }

    pub fn remove_link(&self, key: &LinkKey) -> bool {
        let removed = self.inner.write().expect("rwlock poisoned").links.remove(key);
        match removed {
            Some(link) => {
                self.dispatcher
                    .post(LinkEvent::new(LinkEventType::LinkRemoved, link));
                true
            }
            None => {
                debug!(src = %key.src, dst = %key.dst, "Unknown link, nothing to remove");
                false
            }
        }
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.inner
            .read()
            .expect("rwlock poisoned")
            .devices
            .get(id)
            .cloned()
    }

    pub fn ports(&self, id: &DeviceId) -> BTreeSet<u32> {
        self.inner
            .read()
            .expect("rwlock poisoned")
            .ports
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

impl DeviceService for MemoryInventory {
    fn get_devices(&self) -> anyhow::Result<Vec<Device>> {
        self.check_readable()?;
        let inner = self.inner.read().expect("rwlock poisoned");
        Ok(inner.devices.values().cloned().collect())
    }

    fn add_listener(&self, listener: Arc<DeviceListener>) {
        self.device_listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<DeviceListener>) {
        self.device_listeners.remove(listener);
    }
}

impl LinkService for MemoryInventory {
    fn get_links(&self) -> anyhow::Result<Vec<Link>> {
        self.check_readable()?;
        let inner = self.inner.read().expect("rwlock poisoned");
        Ok(inner.links.values().cloned().collect())
    }

    fn add_listener(&self, listener: Arc<LinkListener>) {
        self.link_listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<LinkListener>) {
        self.link_listeners.remove(listener);
    }
}
