//! Broadcast bus for terminal request events

use crate::domain::events::VolumeEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// In-process `EventPublisher`
///
/// Publishing never fails: with no subscriber attached the event is dropped.
pub struct EventBus {
    sender: broadcast::Sender<VolumeEvent>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            sender,
            published: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.sender.subscribe()
    }

    /// Events published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event: VolumeEvent) -> Result<()> {
        debug!(
            request_id = %event.request_id,
            operation = %event.operation,
            success = event.is_success(),
            "Publishing volume event"
        );
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(event);
        Ok(())
    }
}
