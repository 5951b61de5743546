//! In-process notifications posted by works.

use crate::attachment::AttachmentCategory;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 64;

/// Application notifications posted by works.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A message row is about to be deleted.
    WillDeleteMessage {
        /// Id of the message
        message_id: String,
    },
    /// Unreferenced files of a category have been removed.
    AttachmentCategoryCleaned {
        /// The cleaned category
        category: AttachmentCategory,
    },
}

/// Fire-and-forget publish/subscribe hub.
///
/// Posting never blocks and never fails; subscribers that fall behind lose
/// the oldest notifications.
#[derive(Debug, Clone)]
pub struct NotificationCenter {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl NotificationCenter {
    /// Create a notification center without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `notification` to every current subscriber.
    pub fn post(&self, notification: Notification) {
        trace!(?notification, "Posting notification");
        // Nobody listening is fine.
        let _ = self.sender.send(notification);
    }

    /// Receive every notification posted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}
