//! Message deletion example for the work queue.
//!
//! Messages disappear from the database as soon as their `DeleteMessageWork`
//! is persisted; attachment files are removed in the background. Listeners
//! are told about the deletion before the row goes away.
//!
//! ```bash
//! cargo run --example delete_messages
//! ```

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use work_queue::attachment::{AttachmentCategory, AttachmentContainer};
use work_queue::memory::MemoryDatabase;
use work_queue::notification::Notification;
use work_queue::services::{Message, Services};
use work_queue::works::{self, DeleteMessageWork};
use work_queue::{WorkEvent, WorkQueue, WorkStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with compact formatting
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,delete_messages=info,work_queue=info".into()),
        )
        .compact()
        .init();

    let dir = tempfile::tempdir()?;
    let container = AttachmentContainer::new(dir.path().join("attachments"));
    let database = Arc::new(MemoryDatabase::new());
    let services = Services::in_memory("me", container.clone(), &database);

    let messages = [
        ("hello", "PLAIN_TEXT", None),
        ("photo", "SIGNAL_IMAGE", Some("photo.jpg")),
        ("clip", "SIGNAL_VIDEO", Some("clip.mp4")),
        ("transcript", "SIGNAL_TRANSCRIPT", None),
    ]
    .map(|(id, category, media_url)| Message {
        message_id: id.into(),
        conversation_id: "conversation".into(),
        category: category.into(),
        media_url: media_url.map(Into::into),
    });

    for message in &messages {
        database.insert_message(message.clone());
    }
    for (category, filename) in [
        (AttachmentCategory::Photos, "photo.jpg"),
        (AttachmentCategory::Videos, "clip.mp4"),
        (AttachmentCategory::Videos, "clip.jpg"),
    ] {
        tokio::fs::create_dir_all(container.directory(category)).await?;
        tokio::fs::write(container.url(category, filename), b"attachment").await?;
    }
    database.insert_transcript_message("transcript", "quoted");
    let transcript_file = container.transcript_directory("transcript").join("quoted.jpg");
    tokio::fs::create_dir_all(container.transcript_directory("transcript")).await?;
    tokio::fs::write(&transcript_file, b"attachment").await?;

    let mut notifications = services.notifications.subscribe();
    let store = WorkStore::open(dir.path().join("works.sqlite")).await?;
    let queue = WorkQueue::builder(store.clone(), services)
        .registry(works::registry())
        .num_workers(2)
        .poll_interval(Duration::from_millis(100))
        .build();
    let mut events = queue.subscribe();
    let runner = queue.start().await?;

    for message in &messages {
        queue
            .enqueue_persistable(DeleteMessageWork::new(message))
            .await?;
    }
    println!(
        "Messages left in the database: {}, pending works: {}",
        database.message_count(),
        store.count().await?
    );

    while let Ok(Notification::WillDeleteMessage { message_id }) = notifications.try_recv() {
        info!(message.id = %message_id, "Message will be deleted");
    }

    queue.drain().await;
    queue.shutdown();
    runner.wait_for_shutdown().await;

    while let Ok(event) = events.try_recv() {
        if let WorkEvent::Finished { id } = event {
            println!("{id} finished");
        }
    }

    println!("Pending works after draining: {}", store.count().await?);
    for category in [AttachmentCategory::Photos, AttachmentCategory::Videos] {
        let filenames = container.filenames(category).await.unwrap_or_default();
        println!("{category}: {filenames:?}");
    }
    println!(
        "Transcript attachments left: {}",
        container.transcript_directory("transcript").exists()
    );

    Ok(())
}
