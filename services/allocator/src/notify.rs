//! Notification emission.
//!
//! The allocation core reports every flow through a [`Notifier`]. Delivery is
//! not our concern: the default notifier turns notifications into structured
//! log events.

use std::sync::{Arc, Mutex, PoisonError};

use metalloc_events::{
    AllocationPayload, Notification, NotificationLevel, NotificationStatus,
};
use metalloc_id::RequestId;
use tracing::{debug, error, info, warn};

/// Publisher name stamped on every notification.
pub const PUBLISHER: &str = "metalloc-allocator";

/// Receives notifications.
pub trait Notifier: Send + Sync + 'static {
    fn emit(&self, notification: Notification);
}

/// Writes notifications as `tracing` events at their own level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn emit(&self, n: Notification) {
        let payload = serde_json::to_string(&n.payload).unwrap_or_default();
        let request_id = n.request_id.map(|r| r.to_string()).unwrap_or_default();
        macro_rules! log {
            ($level:ident) => {
                $level!(
                    notification_id = %n.notification_id,
                    event_type = %n.event_type,
                    status = %n.status,
                    allocation = %n.payload.uuid,
                    node = ?n.payload.node_uuid,
                    request_id = %request_id,
                    payload = %payload,
                    "notification"
                )
            };
        }
        match n.level {
            NotificationLevel::Debug => log!(debug),
            NotificationLevel::Info => log!(info),
            NotificationLevel::Warning => log!(warn),
            NotificationLevel::Error | NotificationLevel::Critical => log!(error),
        }
    }
}

/// Discards notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn emit(&self, _notification: Notification) {}
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    emitted: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far, oldest first.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(status, level)` of each notification of `event_type` about
    /// `allocation`, oldest first.
    pub fn flow(
        &self,
        event_type: &str,
        allocation: uuid::Uuid,
    ) -> Vec<(NotificationStatus, NotificationLevel)> {
        self.snapshot()
            .into_iter()
            .filter(|n| n.event_type == event_type && n.payload.uuid == allocation)
            .map(|n| (n.status, n.level))
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn emit(&self, notification: Notification) {
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}

/// Builds notifications and hands them to a [`Notifier`].
#[derive(Clone)]
pub struct Emitter {
    notifier: Arc<dyn Notifier>,
}

impl Emitter {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub fn emit(
        &self,
        event_type: &'static str,
        level: NotificationLevel,
        status: NotificationStatus,
        payload: AllocationPayload,
        request_id: Option<RequestId>,
    ) {
        let built = Notification::builder()
            .publisher(PUBLISHER)
            .event_type(event_type)
            .level(level)
            .status(status)
            .request_id(request_id)
            .payload(payload)
            .build();

        match built {
            Ok(notification) => self.notifier.emit(notification),
            Err(e) => warn!(error = %e, event_type, "Dropping malformed notification"),
        }
    }
}
