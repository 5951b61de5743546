//! On-disk layout of attachment files.
//!
//! Each [`AttachmentCategory`] has its own directory under the container
//! root; attachments embedded in a transcript live in a directory named
//! after the transcript message.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const TRANSCRIPT_DIRECTORY: &str = "Transcript";
const VIDEO_THUMBNAIL_EXTENSION: &str = "jpg";

/// Kind of attachment, each stored in its own directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttachmentCategory {
    /// Images
    Photos,
    /// Voice messages
    Audios,
    /// Arbitrary files
    Files,
    /// Videos and their thumbnails
    Videos,
}

impl AttachmentCategory {
    /// All categories, in clean-up order.
    pub const ALL: [Self; 4] = [Self::Photos, Self::Audios, Self::Files, Self::Videos];

    /// Name of the directory holding this category.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photos => "Photos",
            Self::Audios => "Audios",
            Self::Files => "Files",
            Self::Videos => "Videos",
        }
    }

    /// Message categories whose media is stored in this category.
    pub fn message_categories(self) -> [&'static str; 3] {
        match self {
            Self::Photos => ["SIGNAL_IMAGE", "PLAIN_IMAGE", "ENCRYPTED_IMAGE"],
            Self::Audios => ["SIGNAL_AUDIO", "PLAIN_AUDIO", "ENCRYPTED_AUDIO"],
            Self::Files => ["SIGNAL_DATA", "PLAIN_DATA", "ENCRYPTED_DATA"],
            Self::Videos => ["SIGNAL_VIDEO", "PLAIN_VIDEO", "ENCRYPTED_VIDEO"],
        }
    }

    /// The category storing the media of a message category, if any.
    pub fn for_message_category(category: &str) -> Option<Self> {
        if category.ends_with("_IMAGE") {
            Some(Self::Photos)
        } else if category.ends_with("_AUDIO") {
            Some(Self::Audios)
        } else if category.ends_with("_DATA") {
            Some(Self::Files)
        } else if category.ends_with("_VIDEO") {
            Some(Self::Videos)
        } else {
            None
        }
    }
}

impl fmt::Display for AttachmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachment files on disk, below a single root directory.
#[derive(Debug, Clone)]
pub struct AttachmentContainer {
    root: PathBuf,
}

impl AttachmentContainer {
    /// A container rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `category`.
    pub fn directory(&self, category: AttachmentCategory) -> PathBuf {
        self.root.join(category.as_str())
    }

    /// Path of `filename` in `category`.
    pub fn url(&self, category: AttachmentCategory, filename: &str) -> PathBuf {
        self.directory(category).join(filename)
    }

    /// Directory holding the attachments of a transcript message.
    pub fn transcript_directory(&self, transcript_id: &str) -> PathBuf {
        self.root.join(TRANSCRIPT_DIRECTORY).join(transcript_id)
    }

    /// Names of the files currently stored in `category`.
    pub async fn filenames(&self, category: AttachmentCategory) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(self.directory(category)).await?;
        let mut filenames = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                filenames.push(name.to_owned());
            }
        }
        Ok(filenames)
    }

    /// Remove a file, ignoring failures.
    pub async fn remove_file(&self, path: &Path) {
        if let Err(error) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), %error, "Failed to remove attachment");
        }
    }

    /// Remove the media of a message with `message_category`, including the
    /// thumbnail of a video.
    pub async fn remove_media_files(&self, media_url: &str, message_category: &str) {
        let Some(category) = AttachmentCategory::for_message_category(message_category) else {
            debug!(%message_category, "No attachment category for message");
            return;
        };

        self.remove_file(&self.url(category, media_url)).await;
        if category == AttachmentCategory::Videos {
            let thumbnail = Path::new(media_url).with_extension(VIDEO_THUMBNAIL_EXTENSION);
            self.remove_file(&self.directory(category).join(thumbnail))
                .await;
        }
    }

    /// Remove every attachment of a transcript message, ignoring failures.
    pub async fn remove_all(&self, transcript_id: &str) {
        let path = self.transcript_directory(transcript_id);
        if let Err(error) = tokio::fs::remove_dir_all(&path).await {
            debug!(path = %path.display(), %error, "Failed to remove transcript attachments");
        }
    }
}
