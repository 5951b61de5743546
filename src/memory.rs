//! In-memory implementations of the [`services`](crate::services) traits.

use crate::attachment::AttachmentContainer;
use crate::notification::NotificationCenter;
use crate::services::{
    ConversationDao, Message, MessageDao, MessageSender, OutgoingMessage, Preferences, Services,
    TranscriptMessageDao, User, UserApi, UserDao, one_to_one_conversation_id,
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Tables {
    messages: BTreeMap<String, Message>,
    transcript_messages: Vec<(String, String)>,
    users: HashMap<String, User>,
    directory: HashMap<String, User>,
    sent: Vec<OutgoingMessage>,
    last_attachment_cleanup: Option<DateTime<Utc>>,
}

/// Messages, users and preferences kept in memory.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
}

impl MemoryDatabase {
    /// An empty database.
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a message.
    pub fn insert_message(&self, message: Message) {
        self.tables()
            .messages
            .insert(message.message_id.clone(), message);
    }

    /// A stored message.
    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.tables().messages.get(message_id).cloned()
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.tables().messages.len()
    }

    /// Embed `message_id` in the transcript `transcript_id`.
    pub fn insert_transcript_message(&self, transcript_id: &str, message_id: &str) {
        self.tables()
            .transcript_messages
            .push((transcript_id.to_owned(), message_id.to_owned()));
    }

    /// Make `user` reachable through [`UserApi::add_friend`].
    pub fn publish_user(&self, user: User) {
        self.tables().directory.insert(user.user_id.clone(), user);
    }

    /// A saved user.
    pub fn user(&self, user_id: &str) -> Option<User> {
        self.tables().users.get(user_id).cloned()
    }

    /// Every message handed to [`MessageSender::send_message`].
    pub fn sent_messages(&self) -> Vec<OutgoingMessage> {
        self.tables().sent.clone()
    }
}

impl MessageDao for MemoryDatabase {
    fn delete(&self, message_id: &str, conversation_id: &str) {
        let mut tables = self.tables();
        if tables
            .messages
            .get(message_id)
            .is_some_and(|message| message.conversation_id == conversation_id)
        {
            tables.messages.remove(message_id);
        }
    }

    fn media_urls(&self, categories: &[&str]) -> Vec<String> {
        self.tables()
            .messages
            .values()
            .filter(|message| categories.contains(&message.category.as_str()))
            .filter_map(|message| message.media_url.clone())
            .collect()
    }
}

impl TranscriptMessageDao for MemoryDatabase {
    fn children_message_ids(&self, transcript_id: &str) -> Vec<String> {
        self.tables()
            .transcript_messages
            .iter()
            .filter(|(transcript, _)| transcript == transcript_id)
            .map(|(_, message_id)| message_id.clone())
            .collect()
    }

    fn delete_transcript_messages(&self, transcript_id: &str) {
        self.tables()
            .transcript_messages
            .retain(|(transcript, _)| transcript != transcript_id);
    }
}

impl UserDao for MemoryDatabase {
    fn save_user(&self, user: User) -> Option<User> {
        self.tables()
            .users
            .insert(user.user_id.clone(), user.clone());
        Some(user)
    }
}

impl ConversationDao for MemoryDatabase {
    fn make_conversation_id(&self, user_id: &str, owner_user_id: &str) -> String {
        one_to_one_conversation_id(user_id, owner_user_id)
    }
}

impl UserApi for MemoryDatabase {
    fn add_friend<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, anyhow::Result<User>> {
        async move {
            self.tables()
                .directory
                .get(user_id)
                .cloned()
                .ok_or_else(|| anyhow!("user {user_id} not found"))
        }
        .boxed()
    }
}

impl MessageSender for MemoryDatabase {
    fn send_message(&self, message: OutgoingMessage, _owner: &User, _is_group_message: bool) {
        self.tables().sent.push(message);
    }
}

impl Preferences for MemoryDatabase {
    fn last_attachment_cleanup(&self) -> Option<DateTime<Utc>> {
        self.tables().last_attachment_cleanup
    }

    fn set_last_attachment_cleanup(&self, date: DateTime<Utc>) {
        self.tables().last_attachment_cleanup = Some(date);
    }
}

impl Services {
    /// Services backed entirely by `database`.
    pub fn in_memory(
        my_user_id: impl Into<String>,
        attachments: AttachmentContainer,
        database: &Arc<MemoryDatabase>,
    ) -> Self {
        Self {
            my_user_id: my_user_id.into(),
            messages: database.clone(),
            transcript_messages: database.clone(),
            users: database.clone(),
            conversations: database.clone(),
            user_api: database.clone(),
            message_sender: database.clone(),
            preferences: database.clone(),
            attachments,
            notifications: NotificationCenter::new(),
        }
    }
}
