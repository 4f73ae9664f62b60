//! Controller notifications
//!
//! The engine reports exactly one event per device transition. Delivery is
//! best effort: a notifier that cannot deliver logs and drops the event, it
//! never stops reconciliation.

use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Event sent to the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    /// A device appeared; carries its attribute snapshot
    DevCreated { dev_data: Map<String, Value> },
    /// A device went away
    DevDeleted { ifindex: u32 },
}

impl ControllerEvent {
    pub fn ifindex(&self) -> Option<u32> {
        match self {
            ControllerEvent::DevCreated { dev_data } => dev_data
                .get("ifindex")
                .and_then(Value::as_u64)
                .and_then(|i| u32::try_from(i).ok()),
            ControllerEvent::DevDeleted { ifindex } => Some(*ifindex),
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, ControllerEvent::DevCreated { .. })
    }
}

/// Outbound event sink
pub trait ControllerNotifier: Send {
    fn notify(&mut self, event: ControllerEvent) -> Result<()>;
}

/// Writes one JSON record per line
pub struct JsonLinesNotifier<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesNotifier<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ControllerNotifier for JsonLinesNotifier<W> {
    fn notify(&mut self, event: ControllerEvent) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Hands events to an async task (the controller connection)
///
/// The queue is bounded. While the controller is unreachable the writer task
/// stops consuming, and once `capacity` events are waiting further events are
/// dropped and counted instead of growing memory.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<ControllerEvent>,
    dropped: u64,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ControllerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, dropped: 0 }, rx)
    }

    /// Events discarded because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl ControllerNotifier for ChannelNotifier {
    fn notify(&mut self, event: ControllerEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped += 1;
                warn!(
                    ifindex = ?event.ifindex(),
                    dropped = self.dropped,
                    "Controller queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped += 1;
                warn!(dropped = self.dropped, "Controller channel closed, dropping event");
            }
        }
        Ok(())
    }
}

/// Collects events in memory; clones share the buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    events: Arc<Mutex<Vec<ControllerEvent>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ControllerEvent> {
        self.events.lock().clone()
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<ControllerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn created(&self) -> Vec<u32> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.is_created())
            .filter_map(ControllerEvent::ifindex)
            .collect()
    }

    pub fn deleted(&self) -> Vec<u32> {
        self.events
            .lock()
            .iter()
            .filter(|e| !e.is_created())
            .filter_map(ControllerEvent::ifindex)
            .collect()
    }
}

impl ControllerNotifier for MemoryNotifier {
    fn notify(&mut self, event: ControllerEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
