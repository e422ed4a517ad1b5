//! Internal resource event bus.
//!
//! The dispatcher publishes a [`ResourceEvent`] for every committed
//! mutation; the [`EventWorker`] consumes them off-request and drives
//! the notification and announcement managers. Publishing never blocks
//! and never fails the originating request.

use log::warn;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cse::Cse;
use crate::resource::Resource;

/// The fixed set of resource event kinds.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    Created {
        resource: Resource,
        parent_ri: String,
    },
    Updated {
        resource: Resource,
        modified: Map<String, Value>,
    },
    Deleted {
        resource: Resource,
    },
    /// Deleted by the expiration sweep rather than by request
    Expired {
        resource: Resource,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<ResourceEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ResourceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: ResourceEvent) {
        if self.tx.send(event).is_err() {
            warn!("event worker gone, dropping resource event");
        }
    }
}

/// Drains the event channel and fans events out to the notification and
/// announcement managers.
pub struct EventWorker {
    cse: Arc<Cse>,
    rx: mpsc::UnboundedReceiver<ResourceEvent>,
}

impl EventWorker {
    pub fn new(cse: Arc<Cse>, rx: mpsc::UnboundedReceiver<ResourceEvent>) -> Self {
        Self { cse, rx }
    }

    /// Process events until the bus closes. Run this on its own task.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
        }
    }

    /// Process everything currently queued, then return. Lets tests and
    /// shutdown paths observe a quiesced system.
    pub async fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.handle(event).await;
        }
    }

    async fn handle(&self, event: ResourceEvent) {
        let cse = &self.cse;
        cse.notification.on_resource_event(cse, &event).await;
        cse.announcement.on_resource_event(cse, &event).await;
    }
}
