//! Topology assembler.
//!
//! Each trigger takes an inventory snapshot under the submission lock,
//! stamps it with a strictly increasing timestamp and a sequence number, and
//! builds the [`GraphDescription`] on a worker pool bounded to
//! `build_workers` concurrent builds. Builds may complete in any order; the
//! sequencer releases them to the [`TopologyProviderService`] strictly in
//! submission order and skips the slots of builds that failed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use metrics::counter;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::accumulator::Processor;
use super::graph::{GraphDescription, TopologyProviderService, TopologyReason};
use super::inventory::{DeviceService, LinkService};
use crate::metrics::TOPOLOGY_BUILDS_TOTAL;

/// Releases numbered results in ascending order, holding back any that
/// arrive before their predecessors. `None` marks a slot that produced
/// nothing.
struct Reorder<T> {
    next: u64,
    pending: BTreeMap<u64, Option<T>>,
}

impl<T> Reorder<T> {
    fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    fn complete(&mut self, seq: u64, result: Option<T>) -> Vec<T> {
        self.pending.insert(seq, result);
        let mut ready = Vec::new();
        while let Some(result) = self.pending.remove(&self.next) {
            self.next += 1;
            ready.extend(result);
        }
        ready
    }
}

struct BuildState {
    started: bool,
    /// Bumped on every start so builds from an earlier run are never published.
    generation: u64,
    next_seq: u64,
    last_timestamp: u64,
}

struct Built {
    generation: u64,
    graph: Arc<GraphDescription>,
    reasons: Vec<TopologyReason>,
}

struct Inner {
    devices: Arc<dyn DeviceService>,
    links: Arc<dyn LinkService>,
    provider: Arc<dyn TopologyProviderService>,
    state: Mutex<BuildState>,
    sequencer: Mutex<Reorder<Built>>,
    workers: Arc<Semaphore>,
    epoch: Instant,
    runtime: Handle,
}

pub struct TopologyAssembler {
    inner: Arc<Inner>,
}

impl TopologyAssembler {
    /// Create a stopped assembler. Must be called within a tokio runtime;
    /// builds are spawned onto that runtime.
    pub fn new(
        devices: Arc<dyn DeviceService>,
        links: Arc<dyn LinkService>,
        provider: Arc<dyn TopologyProviderService>,
        build_workers: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                devices,
                links,
                provider,
                state: Mutex::new(BuildState {
                    started: false,
                    generation: 0,
                    next_seq: 0,
                    last_timestamp: 0,
                }),
                sequencer: Mutex::new(Reorder::new()),
                workers: Arc::new(Semaphore::new(build_workers.max(1))),
                epoch: Instant::now(),
                runtime: Handle::current(),
            }),
        }
    }

    /// Accept triggers and submit an initial build.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock().expect("mutex poisoned");
            if state.started {
                return;
            }
            state.started = true;
            state.generation += 1;
        }
        info!("Topology assembler started");
        self.trigger_build(Vec::new());
    }

    /// Drop further triggers. Builds still in flight are not published.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().expect("mutex poisoned");
        if state.started {
            state.started = false;
            info!("Topology assembler stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().expect("mutex poisoned").started
    }

    /// Rebuild from the current inventory without any triggering event.
    pub fn trigger_recompute(&self) {
        self.trigger_build(Vec::new());
    }

    /// Snapshot the inventory and submit a build for `reasons`.
    pub fn trigger_build(&self, reasons: Vec<TopologyReason>) {
        let inner = &self.inner;
        let (generation, seq, timestamp, devices, links) = {
            let mut state = inner.state.lock().expect("mutex poisoned");
            if !state.started {
                debug!(reasons = reasons.len(), "Assembler stopped, dropping trigger");
                return;
            }
            let snapshot = inner
                .devices
                .get_devices()
                .and_then(|d| Ok((d, inner.links.get_links()?)));
            let (devices, links) = match snapshot {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    counter!(TOPOLOGY_BUILDS_TOTAL, "outcome" => "failed").increment(1);
                    warn!(error = %e, reasons = reasons.len(), "Inventory snapshot failed, skipping build");
                    return;
                }
            };
            let now = inner.epoch.elapsed().as_nanos() as u64;
            let timestamp = now.max(state.last_timestamp + 1);
            state.last_timestamp = timestamp;
            let seq = state.next_seq;
            state.next_seq += 1;
            (state.generation, seq, timestamp, devices, links)
        };

        let task_inner = inner.clone();
        inner.runtime.spawn(async move {
            let built = match task_inner.workers.clone().acquire_owned().await {
                Ok(permit) => {
                    tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        GraphDescription::new(timestamp, devices, links)
                    })
                    .await
                }
                Err(e) => {
                    warn!(seq, error = %e, "Build pool closed");
                    task_inner.publish(seq, None);
                    return;
                }
            };
            let built = match built {
                Ok(graph) => Some(Built {
                    generation,
                    graph: Arc::new(graph),
                    reasons,
                }),
                Err(e) => {
                    counter!(TOPOLOGY_BUILDS_TOTAL, "outcome" => "failed").increment(1);
                    warn!(seq, error = %e, "Topology build failed");
                    None
                }
            };
            task_inner.publish(seq, built);
        });
    }
}

impl Inner {
    /// Record the outcome of build `seq` and publish every build that is now
    /// next in line.
    fn publish(&self, seq: u64, built: Option<Built>) {
        let mut sequencer = self.sequencer.lock().expect("mutex poisoned");
        for built in sequencer.complete(seq, built) {
            let live = {
                let state = self.state.lock().expect("mutex poisoned");
                state.started && state.generation == built.generation
            };
            if !live {
                counter!(TOPOLOGY_BUILDS_TOTAL, "outcome" => "abandoned").increment(1);
                debug!(timestamp = built.graph.timestamp(), "Discarding build finished after shutdown");
                continue;
            }
            counter!(TOPOLOGY_BUILDS_TOTAL, "outcome" => "published").increment(1);
            self.provider.topology_changed(built.graph, built.reasons);
        }
    }
}

impl Processor<TopologyReason> for TopologyAssembler {
    fn process_items(&self, items: Vec<TopologyReason>) {
        self.trigger_build(items);
    }

    fn is_ready(&self) -> bool {
        self.is_started()
    }
}
