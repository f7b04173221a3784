use std::fmt::{self, Display};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// A reference to externally-hosted media. The queue and the heartbeat
/// protocol only ever deal in these, never in media data itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MediaRef {
    Video(String),
    Playlist(String),
}

impl MediaRef {
    pub fn is_playlist(&self) -> bool {
        matches!(self, MediaRef::Playlist(_))
    }
}

impl Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaRef::Video(id) => write!(f, "video:{}", id),
            MediaRef::Playlist(id) => write!(f, "playlist:{}", id),
        }
    }
}

/// The playback state a participant believes its player to be in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    Paused,
    #[default]
    Stopped,
    Loading,
}

/// The cached view of the external player widget.
///
/// This is the fallback source for heartbeat snapshots when the widget does
/// not answer a live query in time.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Whether the widget has reported itself ready for commands
    pub is_ready: bool,
    /// The media the player currently has loaded, if any
    pub current_ref: Option<MediaRef>,
    pub playback: PlaybackState,
    /// The playback position in seconds
    pub current_time: f32,
    /// The length of the loaded media in seconds, 0 when unknown
    pub duration: f32,
    /// Unix millis of the last heartbeat seen or sent
    pub last_heartbeat: Option<i64>,
}

impl PlayerState {
    pub fn is_playing(&self) -> bool {
        self.playback == PlaybackState::Playing
    }
}

/// A live answer from the player widget to a state query.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveState {
    pub media: Option<MediaRef>,
    pub current_time: f32,
    pub duration: f32,
    pub playing: bool,
}

/// The widget-reported playback status, as emitted by state change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetStatus {
    Playing,
    Paused,
    Ended,
    Buffering,
    Cued,
}

/// Error codes reported by the player widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerErrorCode {
    /// The media owner disabled playback outside its host platform
    EmbeddingDisabled,
    /// The referenced media does not exist
    NotFound,
    /// The reference was malformed
    InvalidId,
    /// Any other widget error code
    Other(u16),
}

impl PlayerErrorCode {
    /// Whether the error should be recovered from by skipping ahead rather
    /// than failing the session.
    pub fn is_auto_skippable(&self) -> bool {
        matches!(
            self,
            PlayerErrorCode::EmbeddingDisabled
                | PlayerErrorCode::NotFound
                | PlayerErrorCode::InvalidId
        )
    }
}

/// Events emitted by the player widget.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// The widget finished initializing and accepts commands
    Ready,
    StateChanged(WidgetStatus),
    Error(PlayerErrorCode),
    /// The widget finished the last entry of a loaded playlist.
    /// Distinct from [WidgetStatus::Ended], which fires per entry.
    PlaylistEnded,
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Player is not ready")]
    NotReady,
    #[error("Player did not answer in time")]
    Unresponsive,
    #[error("Player command failed: {0}")]
    Command(String),
}

/// Represents the external player widget a participant drives.
///
/// The widget owns all intra-playlist progression. The coordination layer
/// only loads references, applies transport commands, and queries state.
#[async_trait]
pub trait PlayerWidget: Send + Sync {
    /// Loads the given media at a position and starts playing it.
    async fn load(&self, media: &MediaRef, at_seconds: f32) -> Result<(), PlayerError>;
    /// Loads the given media at a position without starting playback.
    async fn cue(&self, media: &MediaRef, at_seconds: f32) -> Result<(), PlayerError>;

    async fn play(&self) -> Result<(), PlayerError>;
    async fn pause(&self) -> Result<(), PlayerError>;
    async fn seek_to(&self, seconds: f32) -> Result<(), PlayerError>;

    /// Skips to the next entry inside a loaded playlist.
    async fn next_in_playlist(&self) -> Result<(), PlayerError>;
    /// Returns to the previous entry inside a loaded playlist.
    async fn previous_in_playlist(&self) -> Result<(), PlayerError>;
    /// Jumps to a specific entry inside a loaded playlist.
    async fn play_at(&self, index: usize) -> Result<(), PlayerError>;

    /// Sets the local volume. Volume is never synchronized.
    async fn set_volume(&self, volume: f32) -> Result<(), PlayerError>;

    /// Queries the widget for its live state.
    async fn query(&self) -> Result<LiveState, PlayerError>;

    /// Returns a receiver of the widget's event stream.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PlayerEvent>;
}
