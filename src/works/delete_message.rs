use crate::errors::InvalidContext;
use crate::execution::Execution;
use crate::notification::Notification;
use crate::services::{DeletableMessage, Services};
use crate::work::{PersistableWork, Work, decode_context, encode_context};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const MEDIA_SUFFIXES: [&str; 4] = ["_IMAGE", "_DATA", "_AUDIO", "_VIDEO"];
const TRANSCRIPT_SUFFIX: &str = "_TRANSCRIPT";

/// Id of the work downloading the attachment of `message_id`, embedded in the
/// transcript `transcript_id`.
pub fn attachment_download_work_id(transcript_id: &str, message_id: &str) -> String {
    format!("attachment-download-{transcript_id}-{message_id}")
}

/// Files to remove together with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeletedAttachment {
    /// A single media file
    Media {
        /// Message category, e.g. `SIGNAL_VIDEO`
        category: String,
        /// Filename of the media
        filename: String,
    },
    /// Everything attached to the messages of a transcript
    Transcript,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Context {
    message_id: String,
    conversation_id: String,
    attachment: Option<DeletedAttachment>,
}

/// Deletes a message row and its attachments.
///
/// The row is deleted as soon as the work is persisted, so the message
/// disappears immediately. Attachment files are removed when the work runs.
#[derive(Debug)]
pub struct DeleteMessageWork {
    id: String,
    message_id: String,
    conversation_id: String,
    attachment: Option<DeletedAttachment>,
    has_database_record_deleted: AtomicBool,
}

impl DeleteMessageWork {
    /// A work deleting `message` and whatever its category attaches to it.
    pub fn new(message: &impl DeletableMessage) -> Self {
        let category = message.category();
        let attachment = match message.media_url() {
            Some(filename) if MEDIA_SUFFIXES.iter().any(|suffix| category.ends_with(suffix)) => {
                Some(DeletedAttachment::Media {
                    category: category.to_owned(),
                    filename: filename.to_owned(),
                })
            }
            _ if category.ends_with(TRANSCRIPT_SUFFIX) => Some(DeletedAttachment::Transcript),
            _ => None,
        };

        Self::with_attachment(message.message_id(), message.conversation_id(), attachment)
    }

    /// A work deleting a message and the given attachment.
    pub fn with_attachment(
        message_id: impl Into<String>,
        conversation_id: impl Into<String>,
        attachment: Option<DeletedAttachment>,
    ) -> Self {
        let message_id = message_id.into();
        Self {
            id: format!("delete-message-{message_id}"),
            message_id,
            conversation_id: conversation_id.into(),
            attachment,
            has_database_record_deleted: AtomicBool::new(false),
        }
    }

    /// Id of the deleted message.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The attachment removed by this work.
    pub fn attachment(&self) -> Option<&DeletedAttachment> {
        self.attachment.as_ref()
    }

    /// Whether the message row is already gone.
    pub fn has_database_record_deleted(&self) -> bool {
        self.has_database_record_deleted.load(Ordering::Acquire)
    }

    fn delete_database_record(&self, env: &Services) {
        env.messages.delete(&self.message_id, &self.conversation_id);
        self.has_database_record_deleted
            .store(true, Ordering::Release);
        debug!(message.id = %self.message_id, "Message deleted from database");
    }
}

impl Work for DeleteMessageWork {
    type Env = Services;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &'static str {
        Self::TYPE_IDENTIFIER
    }

    fn run<'a>(&'a self, env: Services, execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            if !self.has_database_record_deleted() {
                self.delete_database_record(&env);
            }

            match &self.attachment {
                Some(DeletedAttachment::Media { category, filename }) => {
                    env.attachments.remove_media_files(filename, category).await;
                }
                Some(DeletedAttachment::Transcript) => {
                    let transcript_id = &self.message_id;
                    let children = env.transcript_messages.children_message_ids(transcript_id);
                    for child in &children {
                        let id = attachment_download_work_id(transcript_id, child);
                        if execution.cancel_work(&id).await {
                            debug!(work.id = %id, "Cancelled attachment download");
                        }
                    }
                    env.attachments.remove_all(transcript_id).await;
                    env.transcript_messages
                        .delete_transcript_messages(transcript_id);
                }
                None => {}
            }

            Ok(())
        }
        .boxed()
    }
}

impl PersistableWork for DeleteMessageWork {
    const TYPE_IDENTIFIER: &'static str = "delete_message";

    fn context(&self) -> Option<Vec<u8>> {
        encode_context(&Context {
            message_id: self.message_id.clone(),
            conversation_id: self.conversation_id.clone(),
            attachment: self.attachment.clone(),
        })
    }

    fn restore(_id: &str, context: Option<&[u8]>) -> Result<Self, InvalidContext> {
        let context: Context = decode_context(context)?;
        Ok(Self::with_attachment(
            context.message_id,
            context.conversation_id,
            context.attachment,
        ))
    }

    fn persistence_did_complete(&self, env: &Services) {
        env.notifications.post(Notification::WillDeleteMessage {
            message_id: self.message_id.clone(),
        });
        self.delete_database_record(env);
    }
}
