use crate::{ConnectionStatus, DjRequest, MediaRef, PlaybackState, QueueItem, QueueMode};

use super::{BoothState, SessionMember};

/// A partial update to a [BoothState].
///
/// Merging is recursive over the record structure: a `None` slice leaves that
/// slice untouched, a `Some` slice merges field-by-field. Lists and scalars
/// are replaced wholesale, never merged element-wise.
#[derive(Debug, Default, Clone)]
pub struct StatePatch {
    pub session: Option<SessionPatch>,
    pub player: Option<PlayerPatch>,
    pub queue: Option<QueuePatch>,
}

impl StatePatch {
    pub fn session(patch: SessionPatch) -> Self {
        Self {
            session: Some(patch),
            ..Default::default()
        }
    }

    pub fn player(patch: PlayerPatch) -> Self {
        Self {
            player: Some(patch),
            ..Default::default()
        }
    }

    pub fn queue(patch: QueuePatch) -> Self {
        Self {
            queue: Some(patch),
            ..Default::default()
        }
    }

    /// Applies the patch, returning the dot-style paths of fields that
    /// actually changed value.
    pub(super) fn apply(self, state: &mut BoothState) -> Vec<String> {
        let mut changed = Vec::new();

        if let Some(patch) = self.session {
            patch.apply(&mut state.session, &mut changed);
        }

        if let Some(patch) = self.player {
            patch.apply(&mut state.player, &mut changed);
        }

        if let Some(patch) = self.queue {
            patch.apply(&mut state.queue, &mut changed);
        }

        changed
    }
}

/// Replaces the target field if the patch carries a differing value,
/// recording the path when it does.
fn merge_field<T: PartialEq>(
    target: &mut T,
    value: Option<T>,
    path: &'static str,
    changed: &mut Vec<String>,
) {
    if let Some(value) = value {
        if *target != value {
            *target = value;
            changed.push(path.to_string());
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionPatch {
    pub members: Option<Vec<SessionMember>>,
    pub dj_user_id: Option<Option<String>>,
    pub connection_status: Option<ConnectionStatus>,
    pub has_joined_session: Option<bool>,
    pub active_requests: Option<Vec<DjRequest>>,
}

impl SessionPatch {
    fn apply(self, state: &mut super::SessionState, changed: &mut Vec<String>) {
        merge_field(&mut state.members, self.members, "session.members", changed);
        merge_field(
            &mut state.dj_user_id,
            self.dj_user_id,
            "session.dj_user_id",
            changed,
        );
        merge_field(
            &mut state.connection_status,
            self.connection_status,
            "session.connection_status",
            changed,
        );
        merge_field(
            &mut state.has_joined_session,
            self.has_joined_session,
            "session.has_joined_session",
            changed,
        );
        merge_field(
            &mut state.active_requests,
            self.active_requests,
            "session.active_requests",
            changed,
        );
    }
}

#[derive(Debug, Default, Clone)]
pub struct PlayerPatch {
    pub is_ready: Option<bool>,
    pub current_ref: Option<Option<MediaRef>>,
    pub playback: Option<PlaybackState>,
    pub current_time: Option<f32>,
    pub duration: Option<f32>,
    pub last_heartbeat: Option<Option<i64>>,
}

impl PlayerPatch {
    fn apply(self, state: &mut crate::PlayerState, changed: &mut Vec<String>) {
        merge_field(&mut state.is_ready, self.is_ready, "player.is_ready", changed);
        merge_field(
            &mut state.current_ref,
            self.current_ref,
            "player.current_ref",
            changed,
        );
        merge_field(&mut state.playback, self.playback, "player.playback", changed);
        merge_field(
            &mut state.current_time,
            self.current_time,
            "player.current_time",
            changed,
        );
        merge_field(&mut state.duration, self.duration, "player.duration", changed);
        merge_field(
            &mut state.last_heartbeat,
            self.last_heartbeat,
            "player.last_heartbeat",
            changed,
        );
    }
}

#[derive(Debug, Default, Clone)]
pub struct QueuePatch {
    pub items: Option<Vec<QueueItem>>,
    pub current_index: Option<Option<usize>>,
    pub mode: Option<QueueMode>,
}

impl QueuePatch {
    fn apply(self, state: &mut super::QueueState, changed: &mut Vec<String>) {
        merge_field(&mut state.items, self.items, "queue.items", changed);
        merge_field(
            &mut state.current_index,
            self.current_index,
            "queue.current_index",
            changed,
        );
        merge_field(&mut state.mode, self.mode, "queue.mode", changed);
    }
}
