use crate::attachment::AttachmentCategory;
use crate::errors::InvalidContext;
use crate::execution::Execution;
use crate::notification::Notification;
use crate::schema::Priority;
use crate::services::Services;
use crate::work::{PersistableWork, Work, decode_context, encode_context};
use chrono::{TimeDelta, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

const CLEANUP_INTERVAL_DAYS: i64 = 7;

/// Removes attachment files no message refers to anymore.
///
/// Runs at most once every seven days. Progress is checkpointed after every
/// category, so a restarted work only processes the remaining ones.
#[derive(Debug, Default)]
pub struct AttachmentCleaningWork {
    finished_categories: Mutex<BTreeSet<AttachmentCategory>>,
}

impl AttachmentCleaningWork {
    /// Id shared by every clean-up, so at most one is queued at a time.
    pub const ID: &'static str = "attachment_clean";

    /// A clean-up of every category.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clean-up skipping `finished_categories`.
    pub fn with_finished_categories(
        finished_categories: impl IntoIterator<Item = AttachmentCategory>,
    ) -> Self {
        Self {
            finished_categories: Mutex::new(finished_categories.into_iter().collect()),
        }
    }

    /// Categories already cleaned by this work.
    pub fn finished_categories(&self) -> BTreeSet<AttachmentCategory> {
        self.finished().clone()
    }

    fn finished(&self) -> MutexGuard<'_, BTreeSet<AttachmentCategory>> {
        self.finished_categories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the unreferenced files of `category`.
    ///
    /// Returns `false` if the directory is missing, unreadable or empty.
    async fn clean(&self, env: &Services, category: AttachmentCategory) -> bool {
        let filenames = match env.attachments.filenames(category).await {
            Ok(filenames) if !filenames.is_empty() => filenames,
            Ok(_) => {
                debug!(%category, "No attachments to clean");
                return false;
            }
            Err(error) => {
                debug!(%category, %error, "Failed to list attachments");
                return false;
            }
        };

        let referenced = env.messages.media_urls(&category.message_categories());
        let unreferenced: Vec<String> = if category == AttachmentCategory::Videos {
            // Thumbnails share the stem of their video.
            let stems: Vec<String> = referenced
                .iter()
                .map(|url| {
                    Path::new(url)
                        .file_stem()
                        .map_or_else(|| url.clone(), |stem| stem.to_string_lossy().into_owned())
                })
                .collect();
            filenames
                .into_iter()
                .filter(|filename| !stems.iter().any(|stem| filename.contains(stem.as_str())))
                .collect()
        } else {
            let referenced: HashSet<&str> = referenced.iter().map(String::as_str).collect();
            filenames
                .into_iter()
                .filter(|filename| !referenced.contains(filename.as_str()))
                .collect()
        };

        debug!(%category, count = unreferenced.len(), "Removing unreferenced attachments");
        for filename in &unreferenced {
            env.attachments
                .remove_file(&env.attachments.url(category, filename))
                .await;
        }
        true
    }
}

impl Work for AttachmentCleaningWork {
    type Env = Services;

    fn id(&self) -> &str {
        Self::ID
    }

    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn name(&self) -> &'static str {
        Self::TYPE_IDENTIFIER
    }

    fn run<'a>(&'a self, env: Services, execution: &'a Execution) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            if let Some(last_cleanup) = env.preferences.last_attachment_cleanup() {
                if Utc::now() - last_cleanup < TimeDelta::days(CLEANUP_INTERVAL_DAYS) {
                    debug!(%last_cleanup, "Attachments were cleaned recently, skipping");
                    return Ok(());
                }
            }

            let finished = self.finished_categories();
            let categories = AttachmentCategory::ALL
                .into_iter()
                .filter(|category| !finished.contains(category));

            for category in categories {
                execution.check_cancelled()?;

                debug!(%category, "Cleaning attachments");
                if !self.clean(&env, category).await {
                    continue;
                }

                self.finished().insert(category);
                execution.checkpoint(self).await?;
                env.notifications
                    .post(Notification::AttachmentCategoryCleaned { category });
                info!(%category, "Attachments cleaned up");
            }

            env.preferences.set_last_attachment_cleanup(Utc::now());
            Ok(())
        }
        .boxed()
    }
}

impl PersistableWork for AttachmentCleaningWork {
    const TYPE_IDENTIFIER: &'static str = "attachment_clean";

    fn context(&self) -> Option<Vec<u8>> {
        encode_context(&self.finished_categories())
    }

    fn restore(_id: &str, context: Option<&[u8]>) -> Result<Self, InvalidContext> {
        // Progress is only an optimization: start over if it cannot be read.
        let finished = match decode_context::<Vec<AttachmentCategory>>(context) {
            Ok(finished) => finished,
            Err(error) => {
                debug!(%error, "Restoring attachment clean-up without progress");
                Vec::new()
            }
        };
        Ok(Self::with_finished_categories(finished))
    }
}
