//! Topology provider: wires inventory events through the accumulator into
//! the assembler.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::accumulator::{Accumulator, AccumulatorSettings, Processor};
use super::assembler::TopologyAssembler;
use super::graph::{TopologyProviderService, TopologyReason};
use super::inventory::{
    DeviceEvent, DeviceEventType, DeviceListener, DeviceService, LinkEvent, LinkListener,
    LinkService,
};
use crate::config::TopologyConfig;
use crate::event::EventListener;

/// Feeds topology-relevant device and link events to the accumulator.
struct InventoryFeed {
    accumulator: Mutex<Option<Accumulator<TopologyReason>>>,
}

impl InventoryFeed {
    fn push(&self, reason: TopologyReason) {
        let accumulator = self.accumulator.lock().expect("mutex poisoned");
        match accumulator.as_ref() {
            Some(acc) => {
                acc.add(reason);
            }
            None => debug!("Topology provider not running, ignoring inventory event"),
        }
    }
}

impl EventListener<DeviceEvent> for InventoryFeed {
    fn event(&self, event: &DeviceEvent) -> anyhow::Result<()> {
        self.push(TopologyReason::Device(event.clone()));
        Ok(())
    }

    /// Port and description updates do not change the graph.
    fn is_relevant(&self, event: &DeviceEvent) -> bool {
        matches!(
            event.kind,
            DeviceEventType::DeviceAdded
                | DeviceEventType::DeviceRemoved
                | DeviceEventType::DeviceAvailabilityChanged
        )
    }

    fn name(&self) -> &str {
        "topology-provider"
    }
}

impl EventListener<LinkEvent> for InventoryFeed {
    fn event(&self, event: &LinkEvent) -> anyhow::Result<()> {
        self.push(TopologyReason::Link(event.clone()));
        Ok(())
    }

    fn name(&self) -> &str {
        "topology-provider"
    }
}

pub struct TopologyProvider {
    devices: Arc<dyn DeviceService>,
    links: Arc<dyn LinkService>,
    assembler: Arc<TopologyAssembler>,
    settings: AccumulatorSettings,
    feed: Arc<InventoryFeed>,
}

impl TopologyProvider {
    /// Must be called within a tokio runtime.
    pub fn new(
        devices: Arc<dyn DeviceService>,
        links: Arc<dyn LinkService>,
        sink: Arc<dyn TopologyProviderService>,
        config: &TopologyConfig,
    ) -> Self {
        let assembler = Arc::new(TopologyAssembler::new(
            devices.clone(),
            links.clone(),
            sink,
            config.build_workers,
        ));
        Self {
            devices,
            links,
            assembler,
            settings: AccumulatorSettings::from(config),
            feed: Arc::new(InventoryFeed {
                accumulator: Mutex::new(None),
            }),
        }
    }

    /// Start the accumulator and the assembler, publish the initial
    /// snapshot and begin listening to the inventory. Idempotent.
    pub fn start(&self) {
        {
            let mut accumulator = self.feed.accumulator.lock().expect("mutex poisoned");
            if accumulator.is_some() {
                return;
            }
            let processor: Arc<dyn Processor<TopologyReason>> = self.assembler.clone();
            *accumulator = Some(Accumulator::spawn(self.settings, processor));
        }
        self.assembler.start();
        self.devices.add_listener(self.device_listener());
        self.links.add_listener(self.link_listener());
        info!(
            max_events = self.settings.max_events,
            max_batch_ms = self.settings.max_batch.as_millis() as u64,
            max_idle_ms = self.settings.max_idle.as_millis() as u64,
            "Topology provider started"
        );
    }

    /// Stop listening, flush what is buffered and stop the assembler.
    pub async fn stop(&self) {
        self.devices.remove_listener(&self.device_listener());
        self.links.remove_listener(&self.link_listener());
        let accumulator = self.feed.accumulator.lock().expect("mutex poisoned").take();
        if let Some(accumulator) = accumulator {
            accumulator.close().await;
            self.assembler.stop();
            info!("Topology provider stopped");
        }
    }

    /// Force a rebuild from the current inventory.
    pub fn trigger_recompute(&self) {
        self.assembler.trigger_recompute();
    }

    /// Flush buffered events now instead of waiting for a threshold.
    pub fn flush(&self) {
        if let Some(acc) = self.feed.accumulator.lock().expect("mutex poisoned").as_ref() {
            acc.flush();
        }
    }

    pub fn assembler(&self) -> &Arc<TopologyAssembler> {
        &self.assembler
    }

    fn device_listener(&self) -> Arc<DeviceListener> {
        self.feed.clone()
    }

    fn link_listener(&self) -> Arc<LinkListener> {
        self.feed.clone()
    }
}
