use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value;

use djbooth_core::{
    ConnectionStatus, Direction, PlaybackState, PlayerEvent, PlayerPatch, QueueError, QueueItem,
    QueueManager, QueuePatch, StatePatch, WidgetStatus,
};

use crate::{BoothContext, BoothEvent, Envelope, HeartbeatService, Message, SessionManager};

/// Routes incoming broadcasts and player widget events to the managers.
///
/// Every remote handler is idempotent, so an at-least-once transport that
/// replays or reorders messages cannot corrupt state.
pub struct MessageDispatch {
    context: BoothContext,
    session: SessionManager,
    queue: Arc<QueueManager>,
    heartbeat: Arc<HeartbeatService>,
}

impl MessageDispatch {
    pub fn new(
        context: &BoothContext,
        session: SessionManager,
        queue: Arc<QueueManager>,
        heartbeat: Arc<HeartbeatService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context: context.clone(),
            session,
            queue,
            heartbeat,
        })
    }

    /// Spawns the transport and player event loops into the task group.
    pub fn spawn_loops(self: &Arc<Self>) {
        let dispatch = self.clone();
        let mut incoming = self.context.transport.subscribe();

        self.context.tasks.spawn(async move {
            while let Some(value) = incoming.recv().await {
                dispatch.handle_incoming(value).await;
            }
        });

        let dispatch = self.clone();
        let mut events = self.context.player.subscribe();

        self.context.tasks.spawn(async move {
            while let Some(event) = events.recv().await {
                dispatch.handle_player_event(event).await;
            }
        });
    }

    async fn handle_incoming(&self, value: Value) {
        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Dropping malformed broadcast: {}", err);
                return;
            }
        };

        // Loopback of our own broadcasts
        if envelope.sender_id == self.context.identity.user_id {
            return;
        }

        self.handle_envelope(envelope).await;
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        let sender = envelope.sender_id.as_str();

        match envelope.message {
            Message::UserJoin { user_name } => self.session.apply_user_join(sender, &user_name),
            Message::UserLeave => self.session.apply_user_leave(sender),
            Message::DjClaim => self.session.apply_dj_claim(sender),
            Message::DjRelease => self.session.apply_dj_release(sender),
            Message::DjRequest { user_name } => self.session.apply_dj_request(sender, &user_name),
            Message::DjHandoff { target_user_id } => {
                self.session.apply_dj_handoff(sender, &target_user_id)
            }
            Message::ModOverride => self.session.apply_mod_override(sender),
            Message::StateRequest => self.answer_state_request(sender).await,
            Message::StateResponse {
                dj_user_id,
                members,
                queue,
                current_playback,
            } => {
                self.apply_state_response(sender, dj_user_id, members, queue, current_playback)
                    .await
            }
            Message::Heartbeat(snapshot) => {
                self.heartbeat.handle_heartbeat(sender, &snapshot).await
            }
            Message::HeartbeatResponse => self.heartbeat.record_ack(sender),
            Message::QueueAdd { item } => self.queue.apply_remote_add(sender, item),
            Message::QueueRemove { item_id } => self.queue.apply_remote_remove(sender, &item_id),
            Message::QueueNext { direction, item_id } => {
                self.queue.apply_remote_advance(sender, direction, &item_id)
            }
            Message::QueueUpdate { queue } => self.queue.apply_remote_replace(sender, queue),
        }
    }

    /// Answers a late joiner's probe. The DJ always answers; a privileged
    /// participant answers too so a session without a DJ can still be
    /// bootstrapped.
    async fn answer_state_request(&self, sender: &str) {
        let state = self.context.state.state();

        if !state.session.has_joined_session {
            return;
        }

        let is_dj = self.context.is_self_dj();

        if !is_dj && !self.context.identity.privileged {
            return;
        }

        let current_playback = if is_dj {
            Some(self.heartbeat.build_snapshot().await)
        } else {
            None
        };

        debug!("Answering state request from {}", sender);

        self.context
            .broadcast(Message::StateResponse {
                dj_user_id: state.session.dj_user_id.clone(),
                members: state.session.members.clone(),
                queue: state.queue,
                current_playback,
            })
            .await;
    }

    /// Applies a bootstrap answer. Only the first one counts; anything
    /// arriving after the session is connected is stale by definition.
    async fn apply_state_response(
        &self,
        sender: &str,
        dj_user_id: Option<String>,
        members: Vec<djbooth_core::SessionMember>,
        mut queue: djbooth_core::QueueState,
        current_playback: Option<crate::HeartbeatSnapshot>,
    ) {
        let state = self.context.state.state();

        if state.session.connection_status == ConnectionStatus::Connected {
            return;
        }

        self.session.apply_bootstrap(dj_user_id, members);

        // Never trust a broadcast to uphold the index invariant
        if !queue.index_is_valid() {
            queue.current_index = if queue.items.is_empty() { None } else { Some(0) };
        }

        self.context.state.update(StatePatch::queue(QueuePatch {
            items: Some(queue.items),
            current_index: Some(queue.current_index),
            mode: Some(queue.mode),
        }));

        if let Some(snapshot) = current_playback {
            self.heartbeat.handle_heartbeat(sender, &snapshot).await;
        }
    }

    async fn handle_player_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::Ready => {
                self.context.state.update(StatePatch::player(PlayerPatch {
                    is_ready: Some(true),
                    ..Default::default()
                }));
            }
            PlayerEvent::StateChanged(status) => self.apply_widget_status(status).await,
            PlayerEvent::PlaylistEnded => {
                if self.context.is_self_dj() && self.queue.has_more_items() {
                    self.advance_after_playback(Direction::Next).await;
                }
            }
            PlayerEvent::Error(code) => self.handle_player_error(code).await,
        }
    }

    async fn apply_widget_status(&self, status: WidgetStatus) {
        let playback = match status {
            WidgetStatus::Playing => Some(PlaybackState::Playing),
            WidgetStatus::Paused | WidgetStatus::Cued => Some(PlaybackState::Paused),
            WidgetStatus::Buffering => Some(PlaybackState::Loading),
            WidgetStatus::Ended => None,
        };

        if let Some(playback) = playback {
            self.context.state.update(StatePatch::player(PlayerPatch {
                playback: Some(playback),
                ..Default::default()
            }));
            return;
        }

        // The current item finished. A playlist handles its own succession
        // and reports PlaylistEnded when the whole list is done, so only a
        // finished video moves the queue, and only on the DJ.
        self.context.state.update(StatePatch::player(PlayerPatch {
            playback: Some(PlaybackState::Stopped),
            ..Default::default()
        }));

        let current_is_video = self
            .queue
            .current_item()
            .map(|item| !item.is_playlist())
            .unwrap_or(false);

        if self.context.is_self_dj() && current_is_video && self.queue.has_more_items() {
            self.advance_after_playback(Direction::Next).await;
        }
    }

    /// Unplayable media gets skipped instead of stalling the session.
    async fn handle_player_error(&self, code: djbooth_core::PlayerErrorCode) {
        warn!("Player reported an error: {:?}", code);

        if code.is_auto_skippable() {
            let current = self.queue.current_item();

            if current.as_ref().map(|i| i.is_playlist()).unwrap_or(false) {
                // Skip within the playlist first
                if self.context.player.next_in_playlist().await.is_ok() {
                    return;
                }
            }

            if self.context.is_self_dj() && self.queue.has_more_items() {
                self.advance_after_playback(Direction::Next).await;
                return;
            }
        }

        self.context.emit(BoothEvent::PlayerErrorSurfaced { code });
    }

    async fn advance_after_playback(&self, direction: Direction) {
        let result = advance_and_sync(&self.context, &self.queue, direction).await;

        if let Err(err) = result {
            warn!("Failed to advance after playback ended: {}", err);
        }
    }
}

/// Rotates the queue as the local participant, drives the local player to the
/// new item, and propagates the step.
pub(crate) async fn advance_and_sync(
    context: &BoothContext,
    queue: &QueueManager,
    direction: Direction,
) -> Result<QueueItem, QueueError> {
    let item = queue.advance(&context.identity.user_id, direction)?;
    let media = item.media_ref();

    if let Err(err) = context.player.load(&media, 0.0).await {
        warn!("Failed to load {}: {}", media, err);
    }

    context.state.update(StatePatch::player(PlayerPatch {
        current_ref: Some(Some(media)),
        current_time: Some(0.0),
        playback: Some(PlaybackState::Playing),
        ..Default::default()
    }));

    context
        .broadcast(Message::QueueNext {
            direction,
            item_id: item.id().to_string(),
        })
        .await;

    Ok(item)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::mock_context;
    use crate::HeartbeatSnapshot;

    use djbooth_core::util::now_millis;
    use djbooth_core::{MediaRef, PlayerErrorCode};

    fn dispatch_for(context: &BoothContext) -> Arc<MessageDispatch> {
        let session = SessionManager::new(context);
        let queue = Arc::new(QueueManager::new(context.state.clone(), context.config.clone()));
        let heartbeat = Arc::new(HeartbeatService::new(context));

        MessageDispatch::new(context, session, queue, heartbeat)
    }

    #[tokio::test]
    async fn test_own_broadcasts_are_skipped() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        let envelope = Envelope::new("u1", Message::DjClaim);
        dispatch
            .handle_incoming(serde_json::to_value(envelope).unwrap())
            .await;

        // Not applied: a participant's own claim goes through the manager
        assert!(context.state.state().session.is_vacant());
    }

    #[tokio::test]
    async fn test_malformed_broadcast_is_dropped() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        dispatch
            .handle_incoming(serde_json::json!({ "nonsense": true }))
            .await;

        assert!(context.state.state().session.members.is_empty());
    }

    #[tokio::test]
    async fn test_replayed_join_and_claim() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        for _ in 0..3 {
            let join = Envelope::new("u2", Message::UserJoin { user_name: "mary".to_string() });
            dispatch
                .handle_incoming(serde_json::to_value(join).unwrap())
                .await;

            let claim = Envelope::new("u2", Message::DjClaim);
            dispatch
                .handle_incoming(serde_json::to_value(claim).unwrap())
                .await;
        }

        let session = context.state.state().session;
        assert_eq!(session.members.len(), 1);
        assert_eq!(session.dj_user_id.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_state_request_unanswered_by_plain_listener() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        dispatch.session.join_session().await.unwrap();
        dispatch.answer_state_request("u2").await;

        // Not the DJ and not privileged, so nothing was sent
        let mut incoming = context.transport.subscribe();
        assert!(incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_state_response_is_ignored() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        dispatch.session.join_session().await.unwrap();

        // First answer connects the session
        dispatch
            .apply_state_response(
                "u2",
                Some("u2".to_string()),
                vec![djbooth_core::SessionMember::new("u2", "mary")],
                Default::default(),
                None,
            )
            .await;

        assert_eq!(
            context.state.state().session.connection_status,
            ConnectionStatus::Connected
        );

        // A late duplicate changes nothing
        dispatch
            .apply_state_response("u3", Some("u3".to_string()), vec![], Default::default(), None)
            .await;

        assert_eq!(
            context.state.state().session.dj_user_id.as_deref(),
            Some("u2")
        );
    }

    #[tokio::test]
    async fn test_ended_video_advances_queue_on_dj() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        dispatch.session.join_session().await.unwrap();
        dispatch.session.claim_dj_role().await.unwrap();

        dispatch
            .queue
            .add_video("u1", "aaaaaaaaaaa", Some("First".to_string()), Some(60.0))
            .unwrap();
        dispatch
            .queue
            .add_video("u1", "bbbbbbbbbbb", Some("Second".to_string()), Some(60.0))
            .unwrap();

        dispatch
            .handle_player_event(PlayerEvent::StateChanged(WidgetStatus::Ended))
            .await;

        let current = dispatch.queue.current_item().unwrap();
        assert_eq!(current.title(), Some("Second"));
    }

    #[tokio::test]
    async fn test_ended_video_does_not_advance_on_listener() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        dispatch.session.join_session().await.unwrap();
        dispatch.session.apply_user_join("u2", "mary");
        dispatch.session.apply_dj_claim("u2");

        let add = Envelope::new(
            "u2",
            Message::QueueAdd {
                item: QueueItem::video("aaaaaaaaaaa", None, Some(60.0), "mary"),
            },
        );
        dispatch
            .handle_incoming(serde_json::to_value(add).unwrap())
            .await;
        let add = Envelope::new(
            "u2",
            Message::QueueAdd {
                item: QueueItem::video("bbbbbbbbbbb", None, Some(60.0), "mary"),
            },
        );
        dispatch
            .handle_incoming(serde_json::to_value(add).unwrap())
            .await;

        let before = dispatch.queue.current_item().unwrap();

        dispatch
            .handle_player_event(PlayerEvent::StateChanged(WidgetStatus::Ended))
            .await;

        assert_eq!(dispatch.queue.current_item().unwrap().id(), before.id());
    }

    #[tokio::test]
    async fn test_playlist_end_advances_queue_on_dj() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        dispatch.session.join_session().await.unwrap();
        dispatch.session.claim_dj_role().await.unwrap();

        dispatch
            .queue
            .add_playlist("u1", "PL23A657E4BD523733")
            .unwrap();
        dispatch
            .queue
            .add_video("u1", "aaaaaaaaaaa", Some("After".to_string()), Some(60.0))
            .unwrap();

        dispatch.handle_player_event(PlayerEvent::PlaylistEnded).await;

        let current = dispatch.queue.current_item().unwrap();
        assert_eq!(current.title(), Some("After"));
    }

    #[tokio::test]
    async fn test_ended_inside_playlist_does_not_advance() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        dispatch.session.join_session().await.unwrap();
        dispatch.session.claim_dj_role().await.unwrap();

        dispatch
            .queue
            .add_playlist("u1", "PL23A657E4BD523733")
            .unwrap();
        dispatch
            .queue
            .add_video("u1", "aaaaaaaaaaa", Some("After".to_string()), Some(60.0))
            .unwrap();

        // A playlist handles its own succession, so one entry ending must
        // not rotate the queue even on the DJ
        dispatch
            .handle_player_event(PlayerEvent::StateChanged(WidgetStatus::Ended))
            .await;

        let current = dispatch.queue.current_item().unwrap();
        assert!(current.is_playlist());
        assert_eq!(
            context.state.state().player.playback,
            PlaybackState::Stopped
        );
    }

    #[tokio::test]
    async fn test_unplayable_video_is_skipped_by_dj() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        dispatch.session.join_session().await.unwrap();
        dispatch.session.claim_dj_role().await.unwrap();

        dispatch
            .queue
            .add_video("u1", "aaaaaaaaaaa", None, Some(60.0))
            .unwrap();
        dispatch
            .queue
            .add_video("u1", "bbbbbbbbbbb", None, Some(60.0))
            .unwrap();

        dispatch
            .handle_player_event(PlayerEvent::Error(PlayerErrorCode::EmbeddingDisabled))
            .await;

        let current = dispatch.queue.current_item().unwrap();
        assert_eq!(current.media_ref(), MediaRef::Video("bbbbbbbbbbb".to_string()));
    }

    #[tokio::test]
    async fn test_heartbeat_ack_is_recorded() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        dispatch.session.join_session().await.unwrap();
        dispatch.session.claim_dj_role().await.unwrap();
        dispatch.session.apply_user_join("u2", "mary");

        let ack = Envelope::new("u2", Message::HeartbeatResponse);
        dispatch
            .handle_incoming(serde_json::to_value(ack).unwrap())
            .await;

        // The next round sees the ack and keeps the member fresh
        dispatch
            .heartbeat
            .dj_tick(&dispatch.session)
            .await;

        let member = context.state.state().session.member("u2").unwrap().clone();
        assert_eq!(member.missed_heartbeats, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_playback_converges() {
        let context = mock_context("u1");
        let dispatch = dispatch_for(&context);

        dispatch.session.join_session().await.unwrap();

        let snapshot = HeartbeatSnapshot {
            media_ref: Some(MediaRef::Video("z09GolEktUw".to_string())),
            current_time: 95.0,
            is_playing: true,
            duration: 212.0,
            origin_timestamp: now_millis(),
        };

        dispatch
            .apply_state_response(
                "u2",
                Some("u2".to_string()),
                vec![djbooth_core::SessionMember::new("u2", "mary")],
                Default::default(),
                Some(snapshot),
            )
            .await;

        let player = context.state.state().player;
        assert_eq!(
            player.current_ref,
            Some(MediaRef::Video("z09GolEktUw".to_string()))
        );
        assert_eq!(player.current_time, 95.0);
    }
}
