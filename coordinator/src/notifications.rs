//! Bounded feed of payment status notifications, newest first.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::api::types::{QrRequestId, QrStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub request_id: Option<QrRequestId>,
    pub status: QrStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Settled payments are shown with emphasis.
    pub fn is_highlighted(&self) -> bool {
        self.status == QrStatus::Paid
    }
}

#[derive(Debug, Clone)]
pub struct NotificationFeed {
    entries: Arc<RwLock<VecDeque<Notification>>>,
    capacity: usize,
}

impl NotificationFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(
        &self,
        request_id: Option<QrRequestId>,
        status: QrStatus,
        message: impl Into<String>,
    ) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4(),
            request_id,
            status,
            message: message.into(),
            created_at: Utc::now(),
        };

        let mut entries = self.entries.write();
        entries.push_front(notification.clone());
        entries.truncate(self.capacity);
        notification
    }

    pub fn list(&self) -> Vec<Notification> {
        self.entries.read().iter().cloned().collect()
    }

    /// Returns whether a notification with this id was present.
    pub fn dismiss(&self, id: Uuid) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Drop notifications older than `age`, returning how many were removed.
    pub fn prune_older_than(&self, age: Duration) -> usize {
        let cutoff = Utc::now() - age;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.created_at >= cutoff);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
