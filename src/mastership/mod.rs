//! Mastership arbitration.
//!
//! The [`store::MastershipStore`] trait is the boundary to the cluster-wide
//! role store; [`memory::MemoryMastershipStore`] is the in-process
//! implementation and [`coordinator::MastershipCoordinator`] is the
//! per-node service built on top of it.

pub mod coordinator;
pub mod memory;
pub mod store;

pub use coordinator::{MastershipCoordinator, MastershipListener};
pub use store::{
    MastershipEvent, MastershipEventType, MastershipInfo, MastershipStore, MastershipTerm,
};
