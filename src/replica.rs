//! Replica-info propagation: the ReplicaInfoService API.
//!
//! [`ReplicaInfoTracker`] listens to mastership events, derives an
//! immutable [`ReplicaInfo`] for the device, and hands a
//! [`ReplicaInfoEvent`] to a FIFO queue drained by a single dedicated
//! notifier thread. The thread delivering mastership events therefore never
//! waits on replica listeners, while listeners still see each device's
//! events in the order they were produced.
//!
//! The cache update and the enqueue happen under one lock, and an event
//! whose store revision is not newer than the cached one is discarded, so
//! the terms a listener observes for a device never go backwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::event::{Event, EventDispatcher, EventListener, ListenerRegistry};
use crate::mastership::{MastershipEvent, MastershipEventType, MastershipInfo};
use crate::metrics::{REPLICA_EVENTS_TOTAL, REPLICA_QUEUE_DEPTH, REPLICA_STALE_EVENTS_TOTAL};
use crate::net::{DeviceId, NodeId};

/// Who is master and who backs it up for a device.
///
/// Never mutated; a new instance replaces the old one on every change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplicaInfo {
    term: u64,
    master: Option<NodeId>,
    backups: Vec<NodeId>,
}

impl ReplicaInfo {
    pub fn new(term: u64, master: Option<NodeId>, backups: Vec<NodeId>) -> Self {
        Self {
            term,
            master,
            backups,
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn master(&self) -> Option<&NodeId> {
        self.master.as_ref()
    }

    /// Standby nodes, next-in-line first.
    pub fn backups(&self) -> &[NodeId] {
        &self.backups
    }
}

impl From<&MastershipInfo> for ReplicaInfo {
    fn from(info: &MastershipInfo) -> Self {
        ReplicaInfo::new(info.term, info.master.clone(), info.backups.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaInfoEventType {
    MasterChanged,
    BackupsChanged,
}

impl ReplicaInfoEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaInfoEventType::MasterChanged => "master_changed",
            ReplicaInfoEventType::BackupsChanged => "backups_changed",
        }
    }
}

impl From<MastershipEventType> for ReplicaInfoEventType {
    fn from(kind: MastershipEventType) -> Self {
        match kind {
            MastershipEventType::MasterChanged => ReplicaInfoEventType::MasterChanged,
            MastershipEventType::BackupsChanged => ReplicaInfoEventType::BackupsChanged,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaInfoEvent {
    pub kind: ReplicaInfoEventType,
    pub device: DeviceId,
    pub info: Arc<ReplicaInfo>,
    pub time: DateTime<Utc>,
}

impl Event for ReplicaInfoEvent {
    type Kind = ReplicaInfoEventType;
    type Subject = DeviceId;
    const NAME: &'static str = "replica_info";

    fn kind(&self) -> ReplicaInfoEventType {
        self.kind
    }

    fn subject(&self) -> &DeviceId {
        &self.device
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Listener for replica-info changes.
pub type ReplicaInfoListener = dyn EventListener<ReplicaInfoEvent>;

struct Cached {
    revision: u64,
    info: Arc<ReplicaInfo>,
}

struct TrackerState {
    cache: HashMap<DeviceId, Cached>,
    /// `None` once stopped.
    queue: Option<UnboundedSender<ReplicaInfoEvent>>,
}

pub struct ReplicaInfoTracker {
    state: RwLock<TrackerState>,
    dispatcher: Arc<EventDispatcher>,
    listeners: Arc<ListenerRegistry<ReplicaInfoEvent>>,
    /// Held until `start` hands it to the notifier thread.
    receiver: Mutex<Option<UnboundedReceiver<ReplicaInfoEvent>>>,
    notifier: Mutex<Option<JoinHandle<()>>>,
    depth: Arc<AtomicUsize>,
}

impl ReplicaInfoTracker {
    /// Create a tracker and register its listener registry as the
    /// dispatcher's replica-info sink. Events produced before
    /// [`ReplicaInfoTracker::start`] are queued.
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        let listeners = Arc::new(ListenerRegistry::new());
        dispatcher.add_sink::<ReplicaInfoEvent>(listeners.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: RwLock::new(TrackerState {
                cache: HashMap::new(),
                queue: Some(tx),
            }),
            dispatcher,
            listeners,
            receiver: Mutex::new(Some(rx)),
            notifier: Mutex::new(None),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn the notifier thread. Calling it again is a no-op.
    pub fn start(&self) -> anyhow::Result<()> {
        let Some(mut rx) = self.receiver.lock().expect("mutex poisoned").take() else {
            return Ok(());
        };
        let dispatcher = self.dispatcher.clone();
        let depth = self.depth.clone();
        let handle = std::thread::Builder::new()
            .name("replica-info-notifier".to_string())
            .spawn(move || {
                while let Some(event) = rx.blocking_recv() {
                    let remaining = depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                    gauge!(REPLICA_QUEUE_DEPTH).set(remaining as f64);
                    counter!(REPLICA_EVENTS_TOTAL, "kind" => event.kind.as_str()).increment(1);
                    dispatcher.post(event);
                }
                debug!("Replica-info notifier drained, exiting");
            })?;
        *self.notifier.lock().expect("mutex poisoned") = Some(handle);
        info!("Replica-info tracker started");
        Ok(())
    }

    /// Close the queue, wait until everything already queued has been
    /// delivered, and join the notifier thread. Blocks the caller.
    pub fn stop(&self) {
        self.state.write().expect("rwlock poisoned").queue = None;
        let handle = self.notifier.lock().expect("mutex poisoned").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Replica-info notifier thread panicked");
            }
            info!("Replica-info tracker stopped");
        }
    }

    /// Latest replica info for `device`: term 0 with no master when no
    /// mastership change has been seen yet.
    pub fn get_replica_info_for(&self, device: &DeviceId) -> Arc<ReplicaInfo> {
        let state = self.state.read().expect("rwlock poisoned");
        state
            .cache
            .get(device)
            .map(|c| c.info.clone())
            .unwrap_or_default()
    }

    pub fn add_listener(&self, listener: Arc<ReplicaInfoListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<ReplicaInfoListener>) {
        self.listeners.remove(listener);
    }

    /// Events accepted but not yet handed to listeners.
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl EventListener<MastershipEvent> for ReplicaInfoTracker {
    fn event(&self, event: &MastershipEvent) -> anyhow::Result<()> {
        let info = Arc::new(ReplicaInfo::from(&event.info));
        let mut state = self.state.write().expect("rwlock poisoned");

        if let Some(cached) = state.cache.get(&event.device) {
            if cached.revision >= event.info.revision {
                counter!(REPLICA_STALE_EVENTS_TOTAL).increment(1);
                debug!(
                    device = %event.device,
                    revision = event.info.revision,
                    cached = cached.revision,
                    "Discarding stale mastership event"
                );
                return Ok(());
            }
        }
        state.cache.insert(
            event.device.clone(),
            Cached {
                revision: event.info.revision,
                info: info.clone(),
            },
        );

        let replica_event = ReplicaInfoEvent {
            kind: event.kind.into(),
            device: event.device.clone(),
            info,
            time: Utc::now(),
        };
        let Some(queue) = &state.queue else {
            debug!(device = %event.device, "Replica-info tracker stopped, not notifying");
            return Ok(());
        };
        // Count before sending: the notifier may dequeue before `send` returns.
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if queue.send(replica_event).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            debug!(device = %event.device, "Replica-info notifier gone, not notifying");
            return Ok(());
        }
        gauge!(REPLICA_QUEUE_DEPTH).set(depth as f64);
        Ok(())
    }

    fn name(&self) -> &str {
        "replica-info-tracker"
    }
}

impl Drop for ReplicaInfoTracker {
    fn drop(&mut self) {
        // Closing the queue lets a detached notifier thread exit on its own.
        if let Ok(mut state) = self.state.write() {
            state.queue = None;
        }
    }
}
