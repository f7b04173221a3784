use serde::{Deserialize, Serialize};

use crate::util::{now_millis, random_string};
use crate::MediaRef;

/// An entry in the shared queue.
///
/// Playlists are opaque: the queue never looks inside them, the player widget
/// owns all intra-playlist progression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum QueueItem {
    Video {
        id: String,
        video_id: String,
        title: Option<String>,
        /// Length in seconds, if known at add time
        duration: Option<f32>,
        added_by: String,
        added_at: i64,
    },
    Playlist {
        id: String,
        playlist_id: String,
        added_by: String,
        added_at: i64,
    },
}

impl QueueItem {
    pub fn video(
        video_id: impl Into<String>,
        title: Option<String>,
        duration: Option<f32>,
        added_by: impl Into<String>,
    ) -> Self {
        Self::Video {
            id: random_string(12),
            video_id: video_id.into(),
            title,
            duration,
            added_by: added_by.into(),
            added_at: now_millis(),
        }
    }

    pub fn playlist(playlist_id: impl Into<String>, added_by: impl Into<String>) -> Self {
        Self::Playlist {
            id: random_string(12),
            playlist_id: playlist_id.into(),
            added_by: added_by.into(),
            added_at: now_millis(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            QueueItem::Video { id, .. } => id,
            QueueItem::Playlist { id, .. } => id,
        }
    }

    pub fn media_ref(&self) -> MediaRef {
        match self {
            QueueItem::Video { video_id, .. } => MediaRef::Video(video_id.clone()),
            QueueItem::Playlist { playlist_id, .. } => MediaRef::Playlist(playlist_id.clone()),
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            QueueItem::Video { title, .. } => title.as_deref(),
            QueueItem::Playlist { .. } => None,
        }
    }

    /// Length in seconds, if known. Playlists never report one.
    pub fn duration(&self) -> Option<f32> {
        match self {
            QueueItem::Video { duration, .. } => *duration,
            QueueItem::Playlist { .. } => None,
        }
    }

    pub fn added_by(&self) -> &str {
        match self {
            QueueItem::Video { added_by, .. } => added_by,
            QueueItem::Playlist { added_by, .. } => added_by,
        }
    }

    pub fn is_playlist(&self) -> bool {
        matches!(self, QueueItem::Playlist { .. })
    }

    /// Whether two items reference the same media, regardless of who added
    /// them or when. Used for duplicate detection.
    pub fn same_media(&self, other: &QueueItem) -> bool {
        self.media_ref() == other.media_ref()
    }
}
