//! Publish side of the realtime channel.

use super::events::{ChangeEvent, Room};
use super::registry::{FanoutReport, Mailbox, SessionManager, SubscriberId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

/// Default number of queued events per subscriber.
pub const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus is shut down")]
    Closed,
}

/// Routes change events to subscribers.
///
/// Cloning is cheap; all clones share one registry. `publish` never blocks
/// on a subscriber, so it is safe to call from request handlers.
#[derive(Clone)]
pub struct EventBus {
    sessions: Arc<SessionManager>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(MAILBOX_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: SessionManager::new(capacity),
        }
    }

    /// Register a subscriber. It receives only events published after this returns.
    pub fn subscribe(&self) -> Result<Mailbox, BusError> {
        self.sessions.register().ok_or(BusError::Closed)
    }

    pub fn join(&self, id: SubscriberId, room: Room) -> bool {
        self.sessions.join(id, room)
    }

    pub fn leave(&self, id: SubscriberId, room: Room) {
        self.sessions.leave(id, room)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.sessions.unregister(id)
    }

    /// Route one event to its targets.
    pub fn publish(&self, event: ChangeEvent) -> Result<FanoutReport, BusError> {
        if self.sessions.is_shut_down() {
            warn!(event = event.kind(), task_id = event.task_id(), "publish after shutdown");
            return Err(BusError::Closed);
        }
        let targets = event.targets();
        let kind = event.kind();
        let report = self.sessions.fanout(Arc::new(event), &targets);
        trace!(
            event = kind,
            delivered = report.delivered,
            overrun = report.overrun,
            "event published"
        );
        Ok(report)
    }

    /// Close every mailbox. Later publishes fail with [`BusError::Closed`].
    pub fn shutdown(&self) {
        self.sessions.shutdown();
    }

    pub fn subscriber_count(&self) -> usize {
        self.sessions.subscriber_count()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }
}
