//! Abstract mastership store trait.
//!
//! The store is the cluster-wide authority on who is master or standby for
//! each device.  Any backend (a consensus-backed map in production, the
//! in-memory [`super::memory::MemoryMastershipStore`] in tests and
//! single-process deployments) must implement [`MastershipStore`] and is
//! assumed linearizable.  Methods use manually desugared pinned futures so
//! the trait stays object safe.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::event::Event;
use crate::net::{DeviceId, MastershipRole, NodeId};

/// Boxed future returned by every store operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

// -- Term and role snapshots -------------------------------------------------

/// Fencing token for a device: the current master and its term number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MastershipTerm {
    /// Current master, if any.
    pub master: Option<NodeId>,
    /// Incremented once per new master; never decreases.
    pub term_number: u64,
}

/// Full role assignment for one device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MastershipInfo {
    /// Term number of the current (or last) master.
    pub term: u64,
    /// Current master, if any.
    pub master: Option<NodeId>,
    /// Standby nodes in registration order; the first is promoted next.
    pub backups: Vec<NodeId>,
    /// Bumped on every mutation of this device; orders events.
    pub revision: u64,
}

impl MastershipInfo {
    /// Role of `node` in this assignment.
    pub fn role_of(&self, node: &NodeId) -> MastershipRole {
        if self.master.as_ref() == Some(node) {
            MastershipRole::Master
        } else if self.backups.contains(node) {
            MastershipRole::Standby
        } else {
            MastershipRole::None
        }
    }

    pub fn mastership_term(&self) -> MastershipTerm {
        MastershipTerm {
            master: self.master.clone(),
            term_number: self.term,
        }
    }
}

// -- Events ------------------------------------------------------------------

/// What changed in a device's role assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MastershipEventType {
    /// The master changed, including to or from "no master".
    MasterChanged,
    /// Only the standby list changed.
    BackupsChanged,
}

impl MastershipEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MastershipEventType::MasterChanged => "master_changed",
            MastershipEventType::BackupsChanged => "backups_changed",
        }
    }
}

/// A role assignment change for one device.
#[derive(Debug, Clone)]
pub struct MastershipEvent {
    pub kind: MastershipEventType,
    pub device: DeviceId,
    /// Assignment after the change.
    pub info: MastershipInfo,
    pub time: DateTime<Utc>,
}

impl MastershipEvent {
    pub fn new(kind: MastershipEventType, device: DeviceId, info: MastershipInfo) -> Self {
        Self {
            kind,
            device,
            info,
            time: Utc::now(),
        }
    }
}

impl Event for MastershipEvent {
    type Kind = MastershipEventType;
    type Subject = DeviceId;
    const NAME: &'static str = "mastership";

    fn kind(&self) -> MastershipEventType {
        self.kind
    }

    fn subject(&self) -> &DeviceId {
        &self.device
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

// -- Change feed -------------------------------------------------------------

/// Receives every change the store applies, whichever node caused it.
pub trait MastershipStoreDelegate: Send + Sync {
    fn notify(&self, event: MastershipEvent);
}

/// Handle returned by [`MastershipStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

// -- Trait -------------------------------------------------------------------

/// Async mastership store contract.
///
/// Mutations return the event they caused, or `None` when the request was
/// a no-op. The same event is also pushed to every subscribed delegate.
pub trait MastershipStore: Send + Sync + 'static {
    /// Assign `role` to `node` for `device`.
    fn set_role(
        &self,
        node: &NodeId,
        device: &DeviceId,
        role: MastershipRole,
    ) -> StoreFuture<'_, Option<MastershipEvent>>;

    /// Give up mastership of `device` held by `node`, promoting the
    /// earliest standby. No-op unless `node` is master.
    fn relinquish_role(
        &self,
        node: &NodeId,
        device: &DeviceId,
    ) -> StoreFuture<'_, Option<MastershipEvent>>;

    /// Role of `node` for `device`.
    fn get_role(&self, node: &NodeId, device: &DeviceId) -> StoreFuture<'_, MastershipRole>;

    /// Current term for `device`.
    fn get_term_for(&self, device: &DeviceId) -> StoreFuture<'_, MastershipTerm>;

    /// Current master of `device`.
    fn get_master(&self, device: &DeviceId) -> StoreFuture<'_, Option<NodeId>>;

    /// Full assignment for `device`.
    fn get_nodes(&self, device: &DeviceId) -> StoreFuture<'_, MastershipInfo>;

    /// Devices for which `node` is master or standby.
    fn get_devices(&self, node: &NodeId) -> StoreFuture<'_, BTreeSet<DeviceId>>;

    /// Drop every role entry of a deregistered device. The term is kept.
    fn clear_device(&self, device: &DeviceId) -> StoreFuture<'_, Option<MastershipEvent>>;

    /// Register a delegate for the change feed.
    fn subscribe(&self, delegate: Arc<dyn MastershipStoreDelegate>) -> SubscriptionId;

    /// Remove a delegate registered with [`MastershipStore::subscribe`].
    fn unsubscribe(&self, id: SubscriptionId);
}
