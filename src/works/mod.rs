//! The works shipped with the crate.
//!
//! They all run with [`Services`](crate::services::Services) as environment.

mod attachment_cleaning;
mod delete_message;
mod initialize_bot;

pub use self::attachment_cleaning::AttachmentCleaningWork;
pub use self::delete_message::{DeleteMessageWork, DeletedAttachment, attachment_download_work_id};
pub use self::initialize_bot::InitializeBotWork;

use crate::registry::WorkRegistry;
use crate::services::Services;

/// A registry knowing every persistable work of this module.
pub fn registry() -> WorkRegistry<Services> {
    let mut registry = WorkRegistry::default();
    registry.register::<AttachmentCleaningWork>();
    registry.register::<DeleteMessageWork>();
    registry
}
