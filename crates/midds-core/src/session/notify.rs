//! User-visible notifications

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Mutex;
use tracing::{error, info};

use super::lock;

/// An event shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Short headline, e.g. "Serial port error"
    pub title: String,
    /// When the event was raised
    pub timestamp: DateTime<Local>,
    /// Details
    pub body: String,
}

/// Holds the latest unacknowledged notification of one kind
#[derive(Debug, Default)]
pub struct NotificationSlot(Mutex<Option<Notification>>);

impl NotificationSlot {
    /// Replace the pending notification
    pub fn raise(&self, title: impl Into<String>, body: impl Into<String>) {
        *lock(&self.0) = Some(Notification {
            title: title.into(),
            timestamp: Local::now(),
            body: body.into(),
        });
    }

    /// Acknowledge and return the pending notification
    pub fn take(&self) -> Option<Notification> {
        lock(&self.0).take()
    }
}

/// Error and informational notification slots
#[derive(Debug, Default)]
pub struct Notifications {
    errors: NotificationSlot,
    messages: NotificationSlot,
}

impl Notifications {
    /// Log and publish an error
    pub fn raise_error(&self, title: &str, body: impl Into<String>) {
        let body = body.into();
        error!("{}: {}", title, body);
        self.errors.raise(title, body);
    }

    /// Log and publish an informational message
    pub fn raise_message(&self, title: &str, body: impl Into<String>) {
        let body = body.into();
        info!("{}: {}", title, body);
        self.messages.raise(title, body);
    }

    /// Acknowledge the latest error
    pub fn take_error(&self) -> Option<Notification> {
        self.errors.take()
    }

    /// Acknowledge the latest informational message
    pub fn take_message(&self) -> Option<Notification> {
        self.messages.take()
    }
}
