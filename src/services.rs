//! Collaborators the concrete works call into.
//!
//! Works receive them through [`Services`], the environment of the queue.

use crate::attachment::AttachmentContainer;
use crate::notification::NotificationCenter;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Category of a plain text message.
pub const PLAIN_TEXT: &str = "PLAIN_TEXT";

/// A message that can be deleted together with its attachments.
pub trait DeletableMessage {
    /// Id of the message
    fn message_id(&self) -> &str;
    /// Id of the conversation the message belongs to
    fn conversation_id(&self) -> &str;
    /// Message category, e.g. `SIGNAL_IMAGE`
    fn category(&self) -> &str;
    /// Filename of the attached media, if any
    fn media_url(&self) -> Option<&str>;
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Id of the message
    pub message_id: String,
    /// Id of the conversation
    pub conversation_id: String,
    /// Message category, e.g. `SIGNAL_IMAGE`
    pub category: String,
    /// Filename of the attached media
    pub media_url: Option<String>,
}

impl DeletableMessage for Message {
    fn message_id(&self) -> &str {
        &self.message_id
    }

    fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn media_url(&self) -> Option<&str> {
        self.media_url.as_deref()
    }
}

/// A user known to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Id of the user
    pub user_id: String,
    /// Display name
    pub full_name: String,
    /// Whether the user is a bot
    pub is_bot: bool,
}

/// A message handed to the [`MessageSender`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMessage {
    /// Id of the new message
    pub message_id: String,
    /// Id of the conversation
    pub conversation_id: String,
    /// Id of the sender
    pub user_id: String,
    /// Message category
    pub category: String,
    /// Message body
    pub content: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl OutgoingMessage {
    /// A new plain text message from `user_id`.
    pub fn plain_text(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            category: PLAIN_TEXT.to_owned(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Access to stored messages.
pub trait MessageDao: Send + Sync {
    /// Delete a message row. Deleting a missing row is a no-op.
    fn delete(&self, message_id: &str, conversation_id: &str);

    /// Media filenames referenced by messages of the given categories.
    fn media_urls(&self, categories: &[&str]) -> Vec<String>;
}

/// Access to the messages embedded in transcripts.
pub trait TranscriptMessageDao: Send + Sync {
    /// Ids of the messages embedded in a transcript.
    fn children_message_ids(&self, transcript_id: &str) -> Vec<String>;

    /// Delete every message embedded in a transcript.
    fn delete_transcript_messages(&self, transcript_id: &str);
}

/// Access to stored users.
pub trait UserDao: Send + Sync {
    /// Store a user, returning the stored version.
    fn save_user(&self, user: User) -> Option<User>;
}

/// Access to stored conversations.
pub trait ConversationDao: Send + Sync {
    /// Id of the one-to-one conversation between two users.
    fn make_conversation_id(&self, user_id: &str, owner_user_id: &str) -> String;
}

/// Remote user operations.
pub trait UserApi: Send + Sync {
    /// Add `user_id` to the contacts of the current user.
    fn add_friend<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<User>>;
}

/// Outgoing message delivery.
pub trait MessageSender: Send + Sync {
    /// Queue a message for delivery.
    fn send_message(&self, message: OutgoingMessage, owner: &User, is_group_message: bool);
}

/// Persistent user preferences.
pub trait Preferences: Send + Sync {
    /// When unreferenced attachments were last removed.
    fn last_attachment_cleanup(&self) -> Option<DateTime<Utc>>;

    /// Record when unreferenced attachments were removed.
    fn set_last_attachment_cleanup(&self, date: DateTime<Utc>);
}

/// Id of the one-to-one conversation between two users.
///
/// The id does not depend on the order of the arguments.
pub fn one_to_one_conversation_id(user_id: &str, other_user_id: &str) -> String {
    let (first, second) = if user_id <= other_user_id {
        (user_id, other_user_id)
    } else {
        (other_user_id, user_id)
    };
    let name = format!("{first}{second}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// The environment every concrete work runs with.
#[derive(Clone)]
pub struct Services {
    /// Id of the signed-in user
    pub my_user_id: String,
    /// Message storage
    pub messages: Arc<dyn MessageDao>,
    /// Transcript message storage
    pub transcript_messages: Arc<dyn TranscriptMessageDao>,
    /// User storage
    pub users: Arc<dyn UserDao>,
    /// Conversation storage
    pub conversations: Arc<dyn ConversationDao>,
    /// Remote user API
    pub user_api: Arc<dyn UserApi>,
    /// Outgoing messages
    pub message_sender: Arc<dyn MessageSender>,
    /// User preferences
    pub preferences: Arc<dyn Preferences>,
    /// Attachment files
    pub attachments: AttachmentContainer,
    /// Application notifications
    pub notifications: NotificationCenter,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("my_user_id", &self.my_user_id)
            .field("attachments", &self.attachments)
            .finish_non_exhaustive()
    }
}
