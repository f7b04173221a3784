use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PlayerState, QueueItem};

/// The full state of one participant's view of the session.
///
/// Every participant holds one of these inside a [StateStore](super::StateStore);
/// there is no global instance.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoothState {
    pub session: SessionState,
    pub player: PlayerState,
    pub queue: QueueState,
}

impl BoothState {
    /// Restores state from a persisted value.
    ///
    /// Persisted data is never trusted: anything that fails structural
    /// validation is replaced with a default, and the session slice is
    /// sanitized before use.
    pub fn restore(value: Option<&Value>) -> Self {
        let mut state: BoothState = value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        state.session.sanitize();

        if !state.queue.index_is_valid() {
            state.queue.current_index = if state.queue.items.is_empty() {
                None
            } else {
                Some(0)
            };
        }

        // Connection status and join flags are runtime facts, not data
        state.session.connection_status = ConnectionStatus::Disconnected;
        state.session.has_joined_session = false;
        state.player = PlayerState::default();

        state
    }
}

/// A participant in the shared session, unique by user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMember {
    pub user_id: String,
    pub name: String,
    pub is_dj: bool,
    pub is_active: bool,
    pub missed_heartbeats: u32,
    /// Unix millis of the last liveness ack observed for this member
    pub last_activity: i64,
}

impl SessionMember {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            is_dj: false,
            is_active: true,
            missed_heartbeats: 0,
            last_activity: crate::util::now_millis(),
        }
    }
}

/// A pending request to take over the DJ role, unique by user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DjRequest {
    pub user_id: String,
    pub user_name: String,
    pub timestamp: i64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub members: Vec<SessionMember>,
    /// The id of the member currently holding the DJ role.
    /// Invariant: `None`, or it matches exactly one member with `is_dj`.
    pub dj_user_id: Option<String>,
    pub connection_status: ConnectionStatus,
    pub has_joined_session: bool,
    pub active_requests: Vec<DjRequest>,
}

impl SessionState {
    pub fn member(&self, user_id: &str) -> Option<&SessionMember> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    pub fn is_active_member(&self, user_id: &str) -> bool {
        self.member(user_id).map(|m| m.is_active).unwrap_or(false)
    }

    pub fn is_dj(&self, user_id: &str) -> bool {
        self.dj_user_id.as_deref() == Some(user_id)
    }

    pub fn is_vacant(&self) -> bool {
        self.dj_user_id.is_none()
    }

    /// Repairs a loaded session slice: duplicate members are collapsed to the
    /// first occurrence, a recorded DJ that is not among the members clears
    /// the role, and member flags are realigned with the recorded holder.
    pub fn sanitize(&mut self) {
        let mut seen = Vec::new();

        self.members.retain(|m| {
            if seen.contains(&m.user_id) {
                false
            } else {
                seen.push(m.user_id.clone());
                true
            }
        });

        let dj_present = self
            .dj_user_id
            .as_deref()
            .map(|id| self.members.iter().any(|m| m.user_id == id))
            .unwrap_or(false);

        if !dj_present {
            self.dj_user_id = None;
        }

        for member in &mut self.members {
            member.is_dj = self.dj_user_id.as_deref() == Some(member.user_id.as_str());
            member.missed_heartbeats = 0;
        }
    }
}

/// Determines who may mutate the queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Only the current DJ may mutate the queue
    #[default]
    SingleAuthority,
    /// Any active member may add items, the DJ retains remove and reorder
    Collaborative,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub items: Vec<QueueItem>,
    /// Invariant: `None` iff `items` is empty, otherwise within bounds
    pub current_index: Option<usize>,
    pub mode: QueueMode,
}

impl QueueState {
    pub fn current_item(&self) -> Option<&QueueItem> {
        self.current_index.and_then(|i| self.items.get(i))
    }

    pub fn position_of(&self, item_id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.id() == item_id)
    }

    pub fn index_is_valid(&self) -> bool {
        match self.current_index {
            None => self.items.is_empty(),
            Some(i) => i < self.items.len(),
        }
    }
}
