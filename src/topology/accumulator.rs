//! Debouncing event accumulator.
//!
//! Items are buffered and handed to a [`Processor`] in one batch when the
//! first of three thresholds is reached:
//!
//! - `max_events` items are buffered,
//! - `max_batch` has elapsed since the first buffered item,
//! - `max_idle` has elapsed since the last item arrived.
//!
//! The buffer and its timer are owned by a single tokio task. Producers only
//! push onto an unbounded channel, so [`Accumulator::add`] never blocks and
//! a timer firing can never race an arriving item.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::TopologyConfig;
use crate::metrics::{ACCUMULATOR_BATCH_SIZE, ACCUMULATOR_FLUSHES_TOTAL};

/// Receives accumulated batches. Runs on the accumulator task and must not
/// block.
pub trait Processor<T>: Send + Sync {
    fn process_items(&self, items: Vec<T>);

    /// Return `false` to postpone a threshold flush; the batch is kept and
    /// retried once the idle window has passed again.
    fn is_ready(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorSettings {
    pub max_events: usize,
    pub max_batch: Duration,
    pub max_idle: Duration,
}

impl From<&TopologyConfig> for AccumulatorSettings {
    fn from(config: &TopologyConfig) -> Self {
        Self {
            max_events: config.max_events,
            max_batch: config.max_batch(),
            max_idle: config.max_idle(),
        }
    }
}

enum Command<T> {
    Add(T),
    Flush,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Count,
    Batch,
    Idle,
    Manual,
    Shutdown,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Trigger::Count => "count",
            Trigger::Batch => "batch",
            Trigger::Idle => "idle",
            Trigger::Manual => "manual",
            Trigger::Shutdown => "shutdown",
        }
    }
}

/// Handle to a running accumulator task.
pub struct Accumulator<T> {
    commands: Mutex<Option<UnboundedSender<Command<T>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Accumulator<T> {
    /// Spawn the accumulator task. Must be called within a tokio runtime.
    pub fn spawn(settings: AccumulatorSettings, processor: Arc<dyn Processor<T>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(settings, rx, processor));
        Self {
            commands: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Buffer one item. Returns `false` once the accumulator is closed.
    pub fn add(&self, item: T) -> bool {
        self.send(Command::Add(item))
    }

    /// Hand whatever is buffered to the processor now, ready or not.
    pub fn flush(&self) -> bool {
        self.send(Command::Flush)
    }

    fn send(&self, command: Command<T>) -> bool {
        let commands = self.commands.lock().expect("mutex poisoned");
        match commands.as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Stop accepting items, flush the remainder and wait for the task.
    pub async fn close(&self) {
        self.commands.lock().expect("mutex poisoned").take();
        let task = self.task.lock().expect("mutex poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Accumulator task failed");
            }
        }
    }
}

async fn run<T>(
    settings: AccumulatorSettings,
    mut commands: UnboundedReceiver<Command<T>>,
    processor: Arc<dyn Processor<T>>,
) {
    let mut buffer: Vec<T> = Vec::new();
    let mut first = Instant::now();
    let mut last = first;

    loop {
        let armed = !buffer.is_empty();
        let deadline = (first + settings.max_batch).min(last + settings.max_idle);
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Add(item)) => {
                    let now = Instant::now();
                    if buffer.is_empty() {
                        first = now;
                    }
                    last = now;
                    buffer.push(item);
                    if buffer.len() >= settings.max_events && processor.is_ready() {
                        flush(&mut buffer, processor.as_ref(), Trigger::Count);
                    }
                }
                Some(Command::Flush) => flush(&mut buffer, processor.as_ref(), Trigger::Manual),
                None => break,
            },
            _ = sleep_until(deadline), if armed => {
                let now = Instant::now();
                if processor.is_ready() {
                    let trigger = if now >= first + settings.max_batch {
                        Trigger::Batch
                    } else {
                        Trigger::Idle
                    };
                    flush(&mut buffer, processor.as_ref(), trigger);
                } else {
                    debug!(buffered = buffer.len(), "Processor not ready, postponing flush");
                    first = now;
                    last = now;
                }
            }
        }
    }

    flush(&mut buffer, processor.as_ref(), Trigger::Shutdown);
    debug!("Accumulator closed");
}

fn flush<T>(buffer: &mut Vec<T>, processor: &dyn Processor<T>, trigger: Trigger) {
    if buffer.is_empty() {
        return;
    }
    let items = std::mem::take(buffer);
    counter!(ACCUMULATOR_FLUSHES_TOTAL, "trigger" => trigger.as_str()).increment(1);
    histogram!(ACCUMULATOR_BATCH_SIZE).record(items.len() as f64);
    debug!(items = items.len(), trigger = trigger.as_str(), "Flushing accumulated items");
    processor.process_items(items);
}
