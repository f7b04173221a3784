use serde::{Deserialize, Serialize};

use djbooth_core::util::now_millis;
use djbooth_core::{Direction, MediaRef, QueueItem, QueueState, SessionMember};

/// What the DJ broadcasts every liveness round: enough playback state for a
/// listener to converge on the DJ's position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub media_ref: Option<MediaRef>,
    /// The DJ's playback position in seconds
    pub current_time: f32,
    pub is_playing: bool,
    pub duration: f32,
    /// Unix millis at the DJ when the snapshot was built
    pub origin_timestamp: i64,
}

/// The wrapper every broadcast travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: String,
    pub timestamp: i64,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender_id: &str, message: Message) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            timestamp: now_millis(),
            message,
        }
    }
}

/// Everything participants say to each other.
///
/// Delivery is at-least-once and unordered, so every variant is handled
/// idempotently: replays and reorderings must never corrupt state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    UserJoin {
        user_name: String,
    },
    UserLeave,
    /// Accepted iff the receiver's role is locally vacant
    DjClaim,
    /// Accepted iff the sender is the locally recorded holder
    DjRelease,
    DjRequest {
        user_name: String,
    },
    DjHandoff {
        target_user_id: String,
    },
    /// A forced claim; the moderator capability is checked at the sender
    ModOverride,
    /// Late-join bootstrap probe
    StateRequest,
    StateResponse {
        dj_user_id: Option<String>,
        members: Vec<SessionMember>,
        queue: QueueState,
        current_playback: Option<HeartbeatSnapshot>,
    },
    Heartbeat(HeartbeatSnapshot),
    /// Liveness ack, consumed by the DJ's activity tracking
    HeartbeatResponse,
    QueueAdd {
        item: QueueItem,
    },
    QueueRemove {
        item_id: String,
    },
    /// A navigation step; `item_id` is the item the sender landed on,
    /// which makes replays detectable
    QueueNext {
        direction: Direction,
        item_id: String,
    },
    /// Wholesale queue replacement for structural changes
    QueueUpdate {
        queue: QueueState,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_catalogue_tags() {
        let envelope = Envelope::new("u1", Message::DjClaim);
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["sender_id"], "u1");
        assert_eq!(value["message"]["type"], "DJ_CLAIM");

        let value = serde_json::to_value(Message::UserJoin {
            user_name: "john".to_string(),
        })
        .unwrap();

        assert_eq!(value["type"], "USER_JOIN");
        assert_eq!(value["payload"]["user_name"], "john");
    }

    #[test]
    fn test_roundtrip() {
        let message = Message::Heartbeat(HeartbeatSnapshot {
            media_ref: Some(MediaRef::Video("z09GolEktUw".to_string())),
            current_time: 23.5,
            is_playing: true,
            duration: 212.0,
            origin_timestamp: now_millis(),
        });

        let value = serde_json::to_value(&message).unwrap();
        let parsed: Message = serde_json::from_value(value).unwrap();

        match parsed {
            Message::Heartbeat(snapshot) => {
                assert_eq!(snapshot.current_time, 23.5);
                assert!(snapshot.is_playing);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
