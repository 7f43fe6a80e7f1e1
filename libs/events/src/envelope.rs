//! Notification envelope - the common wrapper for all notifications.

use chrono::{DateTime, Utc};
use metalloc_id::{NotificationId, RequestId};
use serde::{Deserialize, Serialize};

use crate::{event_types, AllocationPayload, EventError, NotificationLevel, NotificationStatus};

/// The notification envelope - common metadata for all notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification<P = AllocationPayload> {
    /// Unique notification identifier.
    pub notification_id: NotificationId,

    /// When the notification was emitted.
    pub occurred_at: DateTime<Utc>,

    /// Service that emitted the notification.
    pub publisher: String,

    /// The event type (e.g., "allocation.create").
    pub event_type: String,

    /// Severity.
    pub level: NotificationLevel,

    /// Position in the flow.
    pub status: NotificationStatus,

    /// Request correlation ID, absent for background work.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> Notification<P> {
    /// Creates a new notification builder.
    pub fn builder() -> NotificationBuilder<P> {
        NotificationBuilder::new()
    }
}

/// Builder for constructing notifications.
#[derive(Debug)]
pub struct NotificationBuilder<P> {
    occurred_at: Option<DateTime<Utc>>,
    publisher: Option<String>,
    event_type: Option<String>,
    level: NotificationLevel,
    status: Option<NotificationStatus>,
    request_id: Option<RequestId>,
    payload: Option<P>,
}

impl<P> NotificationBuilder<P> {
    pub fn new() -> Self {
        Self {
            occurred_at: None,
            publisher: None,
            event_type: None,
            level: NotificationLevel::Info,
            status: None,
            request_id: None,
            payload: None,
        }
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn level(mut self, level: NotificationLevel) -> Self {
        self.level = level;
        self
    }

    pub fn status(mut self, status: NotificationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn request_id(mut self, request_id: Option<RequestId>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the notification.
    ///
    /// Fails if a required field is missing or the event type is unknown.
    pub fn build(self) -> Result<Notification<P>, EventError> {
        let event_type = self.event_type.ok_or(EventError::MissingField("event_type"))?;
        if !event_types::ALL.contains(&event_type.as_str()) {
            return Err(EventError::UnknownEventType(event_type));
        }

        Ok(Notification {
            notification_id: NotificationId::new(),
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            publisher: self.publisher.ok_or(EventError::MissingField("publisher"))?,
            event_type,
            level: self.level,
            status: self.status.ok_or(EventError::MissingField("status"))?,
            request_id: self.request_id,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for NotificationBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
