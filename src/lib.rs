//! Switchyard library: control-plane coordination for a clustered network
//! controller.
//!
//! This crate decides which cluster node is master for each managed device,
//! propagates that decision to interested subsystems, and turns bursts of
//! device and link changes into ordered topology snapshots.

pub mod config;
pub mod controller;
pub mod errors;
pub mod event;
pub mod mastership;
pub mod metrics;
pub mod net;
pub mod replica;
pub mod topology;

pub use controller::Controller;
pub use errors::ControlError;
