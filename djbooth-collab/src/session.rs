use std::collections::HashSet;

use log::{debug, info, warn};
use thiserror::Error;

use djbooth_core::util::now_millis;
use djbooth_core::{ConnectionStatus, SessionMember, SessionPatch, StatePatch};

use crate::{BoothContext, BoothEvent, Message};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("The DJ role is already held by {holder}")]
    RoleConflict { holder: String },
    #[error("Only the current DJ may {0}")]
    NotDj(&'static str),
    #[error("{0} is not an active session member")]
    NotAMember(String),
    #[error("The moderator capability is required")]
    NotModerator,
    #[error("There is no pending request from {0}")]
    NoSuchRequest(String),
    #[error("Member names may not be empty")]
    EmptyName,
}

/// Manages the DJ role state machine and session membership.
///
/// The role is either vacant or claimed. Claims are not globally serialized:
/// every participant applies incoming claims with "accept iff locally vacant"
/// and a sender's own belief is never retroactively corrected by a peer's
/// rejection. Competing claims can therefore produce a transient window where
/// two participants both believe they hold the role; applying the same rule
/// to the same message stream converges, but is not linearizable.
#[derive(Clone)]
pub struct SessionManager {
    context: BoothContext,
}

impl SessionManager {
    pub fn new(context: &BoothContext) -> Self {
        Self {
            context: context.clone(),
        }
    }

    fn self_id(&self) -> &str {
        &self.context.identity.user_id
    }

    /// Announces the local participant to the session and probes for state.
    pub async fn join_session(&self) -> Result<(), SessionError> {
        let name = self.context.identity.name.clone();

        if name.trim().is_empty() {
            return Err(SessionError::EmptyName);
        }

        self.add_or_update_member(self.self_id(), &name);

        self.context.state.update(StatePatch::session(SessionPatch {
            has_joined_session: Some(true),
            connection_status: Some(ConnectionStatus::Connecting),
            ..Default::default()
        }));

        self.context
            .broadcast(Message::UserJoin { user_name: name })
            .await;
        self.context.broadcast(Message::StateRequest).await;

        Ok(())
    }

    /// Leaves the session, vacating the role if the local participant held it.
    pub async fn leave_session(&self) {
        self.context.broadcast(Message::UserLeave).await;

        self.remove_member_local(self.self_id());

        self.context.state.update(StatePatch::session(SessionPatch {
            has_joined_session: Some(false),
            connection_status: Some(ConnectionStatus::Disconnected),
            ..Default::default()
        }));
    }

    /// Claims the DJ role if it is locally vacant.
    pub async fn claim_dj_role(&self) -> Result<(), SessionError> {
        let session = self.context.state.state().session;

        match session.dj_user_id {
            Some(holder) if holder == self.self_id() => Ok(()),
            Some(holder) => Err(SessionError::RoleConflict { holder }),
            None => {
                self.set_role(Some(self.self_id().to_string()));
                self.context.broadcast(Message::DjClaim).await;

                Ok(())
            }
        }
    }

    /// Steps down from the DJ role.
    pub async fn release_dj_role(&self) -> Result<(), SessionError> {
        if !self.context.is_self_dj() {
            return Err(SessionError::NotDj("release it"));
        }

        self.set_role(None);
        self.context.broadcast(Message::DjRelease).await;

        Ok(())
    }

    /// Takes the role regardless of the current holder. Moderators only.
    pub async fn moderator_override(&self) -> Result<(), SessionError> {
        if !self.context.identity.moderator {
            return Err(SessionError::NotModerator);
        }

        info!("Moderator {} overrides the DJ role", self.self_id());

        self.set_role(Some(self.self_id().to_string()));
        self.context.broadcast(Message::ModOverride).await;

        Ok(())
    }

    /// Hands the role to another active member.
    pub async fn handoff_dj_role(&self, target: &str) -> Result<(), SessionError> {
        if !self.context.is_self_dj() {
            return Err(SessionError::NotDj("hand it off"));
        }

        let session = self.context.state.state().session;

        if !session.is_active_member(target) {
            return Err(SessionError::NotAMember(target.to_string()));
        }

        self.set_role(Some(target.to_string()));
        self.context
            .broadcast(Message::DjHandoff {
                target_user_id: target.to_string(),
            })
            .await;

        Ok(())
    }

    /// Requests the role: an immediate claim when vacant, otherwise a pending
    /// request the holder gets notified about. A request from the current
    /// holder is a no-op.
    pub async fn request_dj_role(&self) -> Result<(), SessionError> {
        let session = self.context.state.state().session;

        if session.is_dj(self.self_id()) {
            return Ok(());
        }

        if session.is_vacant() {
            return self.claim_dj_role().await;
        }

        let name = self.context.identity.name.clone();
        self.append_request(self.self_id(), &name);

        self.context
            .broadcast(Message::DjRequest { user_name: name })
            .await;

        Ok(())
    }

    /// Grants a pending request by handing the role off to the requester.
    pub async fn approve_dj_request(&self, user_id: &str) -> Result<(), SessionError> {
        if !self.context.is_self_dj() {
            return Err(SessionError::NotDj("approve requests"));
        }

        let session = self.context.state.state().session;

        if !session.active_requests.iter().any(|r| r.user_id == user_id) {
            return Err(SessionError::NoSuchRequest(user_id.to_string()));
        }

        // The handoff clears the request on every participant
        self.handoff_dj_role(user_id).await
    }

    /// Clears a pending request without a role change.
    ///
    /// The denial stays local: the message catalogue carries no denial
    /// broadcast, so peers keep the entry until the next role change or the
    /// requester's departure clears it.
    pub fn deny_dj_request(&self, user_id: &str) -> Result<(), SessionError> {
        if !self.context.is_self_dj() {
            return Err(SessionError::NotDj("deny requests"));
        }

        let mut found = false;

        self.context.state.update_with(|state| {
            let session = &state.session;

            if !session.active_requests.iter().any(|r| r.user_id == user_id) {
                return StatePatch::default();
            }

            found = true;

            let requests = session
                .active_requests
                .iter()
                .filter(|r| r.user_id != user_id)
                .cloned()
                .collect();

            StatePatch::session(SessionPatch {
                active_requests: Some(requests),
                ..Default::default()
            })
        });

        if found {
            Ok(())
        } else {
            Err(SessionError::NoSuchRequest(user_id.to_string()))
        }
    }

    /// Upserts a member. Idempotent: a duplicate join refreshes the existing
    /// entry instead of creating a second one.
    pub fn add_or_update_member(&self, user_id: &str, name: &str) -> SessionMember {
        let mut is_new = false;
        let mut member = SessionMember::new(user_id, name);

        self.context.state.update_with(|state| {
            let session = &state.session;
            let mut members = session.members.clone();

            match members.iter().position(|m| m.user_id == user_id) {
                Some(index) => {
                    let existing = &mut members[index];
                    existing.is_active = true;
                    existing.last_activity = now_millis();

                    if !name.is_empty() {
                        existing.name = name.to_string();
                    }

                    member = existing.clone();
                }
                None => {
                    is_new = true;
                    member.is_dj = session.is_dj(user_id);
                    members.push(member.clone());
                }
            }

            StatePatch::session(SessionPatch {
                members: Some(members),
                ..Default::default()
            })
        });

        if is_new {
            self.context.emit(BoothEvent::MemberJoined {
                member: member.clone(),
            });
        }

        member
    }

    /// Removes a member, vacating the role and scheduling auto-recovery when
    /// the removed member held it.
    pub fn remove_member(&self, user_id: &str) {
        self.remove_member_local(user_id);
    }

    fn remove_member_local(&self, user_id: &str) {
        let mut was_member = false;
        let mut was_dj = false;

        self.context.state.update_with(|state| {
            let session = &state.session;

            if session.member(user_id).is_none() {
                return StatePatch::default();
            }

            was_member = true;
            was_dj = session.is_dj(user_id);

            let members = session
                .members
                .iter()
                .filter(|m| m.user_id != user_id)
                .cloned()
                .collect();
            let requests = session
                .active_requests
                .iter()
                .filter(|r| r.user_id != user_id)
                .cloned()
                .collect();

            StatePatch::session(SessionPatch {
                members: Some(members),
                active_requests: Some(requests),
                ..Default::default()
            })
        });

        if !was_member {
            return;
        }

        self.context.emit(BoothEvent::MemberLeft {
            user_id: user_id.to_string(),
        });

        if was_dj {
            self.vacate_and_schedule_recovery();
        }
    }

    /// One liveness round: members the DJ observed acking reset their missed
    /// count, everyone else increments, and whoever crosses the threshold is
    /// removed immediately.
    pub fn apply_activity_round(&self, observed: &HashSet<String>) {
        let threshold = self.context.config.missed_heartbeat_threshold;
        let mut evicted = Vec::new();
        let mut dj_evicted = false;

        self.context.state.update_with(|state| {
            let mut members = state.session.members.clone();
            let now = now_millis();

            for member in &mut members {
                if member.user_id == self.self_id() || observed.contains(&member.user_id) {
                    member.missed_heartbeats = 0;
                    member.last_activity = now;
                    member.is_active = true;
                } else {
                    member.missed_heartbeats += 1;

                    if member.missed_heartbeats > threshold {
                        evicted.push(member.user_id.clone());
                    }
                }
            }

            members.retain(|m| !evicted.contains(&m.user_id));
            dj_evicted = evicted.iter().any(|id| state.session.is_dj(id));

            StatePatch::session(SessionPatch {
                members: Some(members),
                ..Default::default()
            })
        });

        for user_id in evicted {
            warn!("Evicting {} after too many missed liveness rounds", user_id);

            self.context.emit(BoothEvent::MemberEvicted { user_id });
        }

        if dj_evicted {
            self.vacate_and_schedule_recovery();
        }
    }

    // --- remote message application ---

    pub fn apply_user_join(&self, sender: &str, user_name: &str) {
        self.add_or_update_member(sender, user_name);
    }

    pub fn apply_user_leave(&self, sender: &str) {
        self.remove_member_local(sender);
    }

    /// Accept iff locally vacant. A rejected claim is simply dropped; the
    /// sender is never corrected, see the type-level notes.
    pub fn apply_dj_claim(&self, sender: &str) {
        let session = self.context.state.state().session;

        if !session.is_vacant() {
            debug!("Dropping claim from {}: role is held", sender);
            return;
        }

        // A claim can outrun its sender's join announcement
        if session.member(sender).is_none() {
            self.add_or_update_member(sender, sender);
        }

        self.set_role(Some(sender.to_string()));
    }

    pub fn apply_dj_release(&self, sender: &str) {
        let session = self.context.state.state().session;

        if session.is_dj(sender) {
            self.set_role(None);
        }
    }

    pub fn apply_dj_request(&self, sender: &str, user_name: &str) {
        let session = self.context.state.state().session;

        if session.is_vacant() {
            // A request against a vacant role is an auto-approved claim
            if session.member(sender).is_none() {
                self.add_or_update_member(sender, user_name);
            }

            self.set_role(Some(sender.to_string()));
            return;
        }

        let added = self.append_request(sender, user_name);

        if added && self.context.is_self_dj() {
            let session = self.context.state.state().session;

            if let Some(request) = session
                .active_requests
                .iter()
                .find(|r| r.user_id == sender)
            {
                self.context.emit(BoothEvent::DjRequestReceived {
                    request: request.clone(),
                });
            }
        }
    }

    pub fn apply_dj_handoff(&self, sender: &str, target: &str) {
        let session = self.context.state.state().session;

        if !session.is_dj(sender) {
            debug!("Dropping handoff from {}: not the recorded holder", sender);
            return;
        }

        if session.member(target).is_none() {
            self.add_or_update_member(target, target);
        }

        self.set_role(Some(target.to_string()));
    }

    /// A forced claim. The moderator capability was checked at the sender;
    /// participants are trusted, fault tolerance here is not Byzantine.
    pub fn apply_mod_override(&self, sender: &str) {
        let session = self.context.state.state().session;

        if session.member(sender).is_none() {
            self.add_or_update_member(sender, sender);
        }

        self.set_role(Some(sender.to_string()));
    }

    /// Applies a late-join bootstrap answer. Only honored until the first one
    /// lands, so stale answers cannot clobber newer local state.
    pub fn apply_bootstrap(&self, dj_user_id: Option<String>, members: Vec<SessionMember>) {
        self.context.state.update_with(|state| {
            let session = &state.session;

            if session.connection_status == ConnectionStatus::Connected {
                return StatePatch::default();
            }

            let mut merged: Vec<SessionMember> = Vec::new();

            for member in members {
                if !merged.iter().any(|m| m.user_id == member.user_id) {
                    merged.push(member);
                }
            }

            // The local participant knows itself best
            for member in &session.members {
                if !merged.iter().any(|m| m.user_id == member.user_id) {
                    merged.push(member.clone());
                }
            }

            let dj_user_id = dj_user_id.filter(|id| merged.iter().any(|m| &m.user_id == id));

            for member in &mut merged {
                member.is_dj = dj_user_id.as_deref() == Some(member.user_id.as_str());
            }

            StatePatch::session(SessionPatch {
                members: Some(merged),
                dj_user_id: Some(dj_user_id),
                connection_status: Some(ConnectionStatus::Connected),
                ..Default::default()
            })
        });
    }

    // --- internals ---

    fn append_request(&self, user_id: &str, user_name: &str) -> bool {
        let mut added = false;

        self.context.state.update_with(|state| {
            let session = &state.session;

            if session.active_requests.iter().any(|r| r.user_id == user_id) {
                return StatePatch::default();
            }

            added = true;

            let mut requests = session.active_requests.clone();
            requests.push(djbooth_core::DjRequest {
                user_id: user_id.to_string(),
                user_name: user_name.to_string(),
                timestamp: now_millis(),
            });

            StatePatch::session(SessionPatch {
                active_requests: Some(requests),
                ..Default::default()
            })
        });

        added
    }

    /// Records a role change, realigning member flags and clearing any
    /// pending request from the new holder.
    fn set_role(&self, holder: Option<String>) {
        let mut changed = false;

        self.context.state.update_with(|state| {
            let session = &state.session;

            if session.dj_user_id == holder {
                return StatePatch::default();
            }

            changed = true;

            let mut members = session.members.clone();

            for member in &mut members {
                member.is_dj = holder.as_deref() == Some(member.user_id.as_str());
            }

            let requests = session
                .active_requests
                .iter()
                .filter(|r| Some(&r.user_id) != holder.as_ref())
                .cloned()
                .collect();

            StatePatch::session(SessionPatch {
                dj_user_id: Some(holder.clone()),
                members: Some(members),
                active_requests: Some(requests),
                ..Default::default()
            })
        });

        if !changed {
            return;
        }

        info!(
            "DJ role is now {}",
            holder.as_deref().unwrap_or("vacant")
        );

        self.context.emit(BoothEvent::RoleChanged {
            dj_user_id: holder,
        });
    }

    /// Vacates the role and lets any remaining active member auto-claim it
    /// after a grace delay. The delay shrinks, but cannot eliminate, the
    /// window for simultaneous claims.
    fn vacate_and_schedule_recovery(&self) {
        self.set_role(None);

        let session = self.clone();
        let grace = self.context.config.autoclaim_grace;

        self.context.tasks.spawn(async move {
            tokio::time::sleep(grace).await;

            let state = session.context.state.state().session;
            let me = session.self_id().to_string();

            if state.is_vacant() && state.has_joined_session && state.is_active_member(&me) {
                if let Err(err) = session.claim_dj_role().await {
                    debug!("Auto-claim lost the race: {}", err);
                }
            }
        });
    }
}
