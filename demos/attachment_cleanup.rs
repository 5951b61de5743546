//! Attachment clean-up example for the work queue.
//!
//! This example creates a few attachment files, some referenced by messages
//! and some orphaned, and lets an `AttachmentCleaningWork` remove the orphans.
//! The process is killed right after enqueueing the work, and the work runs
//! after the restart. Everything lives in a temporary directory:
//!
//! ```bash
//! cargo run --example attachment_cleanup
//! ```

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use work_queue::attachment::{AttachmentCategory, AttachmentContainer};
use work_queue::memory::MemoryDatabase;
use work_queue::notification::Notification;
use work_queue::services::{Message, Services};
use work_queue::works::{self, AttachmentCleaningWork};
use work_queue::{WorkQueue, WorkStore};

async fn create_attachment(
    container: &AttachmentContainer,
    category: AttachmentCategory,
    filename: &str,
) -> Result<()> {
    tokio::fs::create_dir_all(container.directory(category)).await?;
    tokio::fs::write(container.url(category, filename), b"attachment").await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with compact formatting
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,attachment_cleanup=info,work_queue=info".into()),
        )
        .compact()
        .init();

    let dir = tempfile::tempdir()?;
    let database_path = dir.path().join("works.sqlite");
    let container = AttachmentContainer::new(dir.path().join("attachments"));

    let database = Arc::new(MemoryDatabase::new());
    for (index, (category, message_category, filename)) in [
        (AttachmentCategory::Photos, "SIGNAL_IMAGE", "sunset.jpg"),
        (AttachmentCategory::Files, "PLAIN_DATA", "report.pdf"),
        (AttachmentCategory::Videos, "SIGNAL_VIDEO", "holiday.mp4"),
    ]
    .into_iter()
    .enumerate()
    {
        create_attachment(&container, category, filename).await?;
        database.insert_message(Message {
            message_id: format!("message-{index}"),
            conversation_id: "conversation".into(),
            category: message_category.into(),
            media_url: Some(filename.into()),
        });
    }
    create_attachment(&container, AttachmentCategory::Videos, "holiday.jpg").await?;
    for (category, filename) in [
        (AttachmentCategory::Photos, "deleted-photo.jpg"),
        (AttachmentCategory::Audios, "deleted-voice.ogg"),
        (AttachmentCategory::Files, "deleted-file.zip"),
        (AttachmentCategory::Videos, "deleted-video.mp4"),
    ] {
        create_attachment(&container, category, filename).await?;
    }

    // First run: the work is persisted, then the process dies before it runs.
    {
        let services = Services::in_memory("me", container.clone(), &database);
        let store = WorkStore::open(&database_path).await?;
        let queue = WorkQueue::builder(store.clone(), services)
            .registry(works::registry())
            .build();

        queue
            .enqueue_persistable(AttachmentCleaningWork::new())
            .await?;
        info!("Clean-up enqueued, simulating a crash");
        store.close().await;
    }

    // Second run: the persisted work is restored and runs to completion.
    {
        let services = Services::in_memory("me", container.clone(), &database);
        let mut notifications = services.notifications.subscribe();
        let store = WorkStore::open(&database_path).await?;
        println!("Pending works after restart: {}", store.count().await?);

        let queue = WorkQueue::builder(store.clone(), services)
            .registry(works::registry())
            .shutdown_when_queue_empty()
            .build();
        queue.start().await?.wait_for_shutdown().await;
        println!("Pending works after clean-up: {}", store.count().await?);

        while let Ok(notification) = notifications.try_recv() {
            if let Notification::AttachmentCategoryCleaned { category } = notification {
                println!("Cleaned {category}");
            }
        }
    }

    for category in AttachmentCategory::ALL {
        let mut filenames = container.filenames(category).await.unwrap_or_default();
        filenames.sort();
        println!("{category}: {filenames:?}");
    }

    Ok(())
}
