//! Batched topology assembly.
//!
//! Device and link events from the [`inventory`] are debounced by the
//! [`accumulator`], turned into [`graph::GraphDescription`] snapshots by the
//! [`assembler`], and published in order. [`provider::TopologyProvider`]
//! wires the pieces together.

pub mod accumulator;
pub mod assembler;
pub mod graph;
pub mod inventory;
pub mod provider;

pub use accumulator::{Accumulator, AccumulatorSettings, Processor};
pub use assembler::TopologyAssembler;
pub use graph::{GraphDescription, LatestTopology, TopologyProviderService, TopologyReason};
pub use inventory::{
    DeviceEvent, DeviceEventType, DeviceService, LinkEvent, LinkEventType, LinkService,
    MemoryInventory,
};
pub use provider::TopologyProvider;
