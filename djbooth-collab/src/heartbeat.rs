use std::collections::HashSet;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::time::timeout;

use djbooth_core::util::now_millis;
use djbooth_core::{PlaybackState, PlayerPatch, StatePatch};

use crate::{BoothContext, BoothEvent, HeartbeatSnapshot, Message, SessionManager};

/// Drives liveness and playback convergence.
///
/// As the DJ, one tick per period: fold the acks collected since the last
/// tick into the activity tracking, then broadcast a snapshot of the player.
/// As a listener, every incoming snapshot is answered with an ack and used
/// to pull the local player toward the DJ's position.
pub struct HeartbeatService {
    context: BoothContext,
    acks: Mutex<HashSet<String>>,
}

impl HeartbeatService {
    pub fn new(context: &BoothContext) -> Self {
        Self {
            context: context.clone(),
            acks: Mutex::new(HashSet::new()),
        }
    }

    /// Records an ack from a listener. Consumed by the next DJ tick.
    pub fn record_ack(&self, sender: &str) {
        self.acks.lock().insert(sender.to_string());
    }

    fn drain_acks(&self) -> HashSet<String> {
        std::mem::take(&mut *self.acks.lock())
    }

    /// One DJ-side liveness round.
    pub async fn dj_tick(&self, session: &SessionManager) {
        session.apply_activity_round(&self.drain_acks());

        let snapshot = self.build_snapshot().await;

        self.context.state.update(StatePatch::player(PlayerPatch {
            last_heartbeat: Some(Some(snapshot.origin_timestamp)),
            ..Default::default()
        }));

        self.context.broadcast(Message::Heartbeat(snapshot)).await;
    }

    /// Builds a playback snapshot. Never fails: a live player query is
    /// preferred, but when the player is unresponsive the cached state
    /// stands in so the liveness signal keeps flowing.
    pub async fn build_snapshot(&self) -> HeartbeatSnapshot {
        let live = timeout(
            self.context.config.live_query_timeout,
            self.context.player.query(),
        )
        .await;

        if let Ok(Ok(live)) = live {
            self.context.state.update(StatePatch::player(PlayerPatch {
                current_ref: Some(live.media.clone()),
                playback: Some(if live.playing {
                    PlaybackState::Playing
                } else {
                    PlaybackState::Paused
                }),
                current_time: Some(live.current_time),
                duration: Some(live.duration),
                ..Default::default()
            }));

            return HeartbeatSnapshot {
                media_ref: live.media,
                current_time: live.current_time,
                is_playing: live.playing,
                duration: live.duration,
                origin_timestamp: now_millis(),
            };
        }

        debug!("Player query failed or timed out, snapshotting from cache");

        let player = self.context.state.state().player;

        HeartbeatSnapshot {
            media_ref: player.current_ref.clone(),
            current_time: player.current_time,
            is_playing: player.is_playing(),
            duration: player.duration,
            origin_timestamp: now_millis(),
        }
    }

    /// Listener-side convergence. Three steps, each isolated so a failing
    /// player command never blocks the rest or the ack:
    ///
    /// 1. media identity, loading the DJ's item at its position
    /// 2. play/pause parity
    /// 3. a seek when the position drifted past the tolerance
    pub async fn handle_heartbeat(&self, sender: &str, snapshot: &HeartbeatSnapshot) {
        if self.context.is_self_dj() {
            return;
        }

        self.context.state.update(StatePatch::player(PlayerPatch {
            last_heartbeat: Some(Some(snapshot.origin_timestamp)),
            duration: Some(snapshot.duration),
            ..Default::default()
        }));

        let cached = self.context.state.state().player;
        let mut loaded_this_round = false;

        if cached.current_ref != snapshot.media_ref {
            if let Some(media) = &snapshot.media_ref {
                match self.context.player.load(media, snapshot.current_time).await {
                    Ok(_) => {
                        loaded_this_round = true;

                        // Loading autoplays, the parity step below pauses
                        // again when the DJ is not playing
                        self.context.state.update(StatePatch::player(PlayerPatch {
                            current_ref: Some(snapshot.media_ref.clone()),
                            current_time: Some(snapshot.current_time),
                            playback: Some(PlaybackState::Playing),
                            ..Default::default()
                        }));
                    }
                    Err(err) => warn!("Failed to load {}: {}", media, err),
                }
            }
        }

        let cached = self.context.state.state().player;

        if cached.is_playing() != snapshot.is_playing {
            let result = if snapshot.is_playing {
                self.context.player.play().await
            } else {
                self.context.player.pause().await
            };

            match result {
                Ok(_) => {
                    self.context.state.update(StatePatch::player(PlayerPatch {
                        playback: Some(if snapshot.is_playing {
                            PlaybackState::Playing
                        } else {
                            PlaybackState::Paused
                        }),
                        ..Default::default()
                    }));
                }
                Err(err) => warn!("Failed to toggle playback: {}", err),
            }
        }

        // A fresh load is already at the DJ's position and likely buffering,
        // so the drift check waits for the next round
        if !loaded_this_round && snapshot.media_ref.is_some() {
            self.correct_drift(snapshot).await;
        }

        debug!("Acking heartbeat from {}", sender);
        self.context.broadcast(Message::HeartbeatResponse).await;
    }

    async fn correct_drift(&self, snapshot: &HeartbeatSnapshot) {
        let live = timeout(
            self.context.config.live_query_timeout,
            self.context.player.query(),
        )
        .await;

        let local_time = match live {
            Ok(Ok(live)) => live.current_time,
            _ => self.context.state.state().player.current_time,
        };

        let drift = (snapshot.current_time - local_time).abs();

        if drift <= self.context.config.drift_tolerance {
            return;
        }

        match self.context.player.seek_to(snapshot.current_time).await {
            Ok(_) => {
                self.context.state.update(StatePatch::player(PlayerPatch {
                    current_time: Some(snapshot.current_time),
                    ..Default::default()
                }));

                self.context.emit(BoothEvent::DriftCorrected { drift });
            }
            Err(err) => warn!("Failed to seek for drift correction: {}", err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{mock_context, mock_context_with_player};

    use std::sync::Arc;

    use djbooth_core::{MediaRef, PlayerState};
    use djbooth_impls::SimulatedPlayer;

    fn snapshot(media: Option<MediaRef>, time: f32, playing: bool) -> HeartbeatSnapshot {
        HeartbeatSnapshot {
            media_ref: media,
            current_time: time,
            is_playing: playing,
            duration: 212.0,
            origin_timestamp: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_prefers_live_state() {
        let player = Arc::new(SimulatedPlayer::new());
        player.set_media(Some(MediaRef::Video("z09GolEktUw".to_string())));
        player.set_position(42.0);
        player.set_playing(true);

        let context = mock_context_with_player("u1", player);
        let service = HeartbeatService::new(&context);

        let snapshot = service.build_snapshot().await;

        assert_eq!(snapshot.current_time, 42.0);
        assert!(snapshot.is_playing);
        assert!(matches!(snapshot.media_ref, Some(MediaRef::Video(_))));
    }

    #[tokio::test]
    async fn test_snapshot_falls_back_to_cache() {
        let player = Arc::new(SimulatedPlayer::new());
        player.set_unresponsive(true);

        let context = mock_context_with_player("u1", player);

        context.state.update(StatePatch::player(PlayerPatch {
            current_ref: Some(Some(MediaRef::Video("z09GolEktUw".to_string()))),
            playback: Some(PlaybackState::Paused),
            current_time: Some(30.0),
            ..Default::default()
        }));

        let service = HeartbeatService::new(&context);
        let snapshot = service.build_snapshot().await;

        assert_eq!(snapshot.current_time, 30.0);
        assert!(!snapshot.is_playing);
        assert!(snapshot.media_ref.is_some());
    }

    #[tokio::test]
    async fn test_listener_loads_missing_media() {
        let player = Arc::new(SimulatedPlayer::new());
        let context = mock_context_with_player("u1", player.clone());
        let service = HeartbeatService::new(&context);

        let media = MediaRef::Video("z09GolEktUw".to_string());
        service
            .handle_heartbeat("dj", &snapshot(Some(media.clone()), 30.0, true))
            .await;

        assert_eq!(player.current_media(), Some(media));
        assert!(player
            .commands()
            .iter()
            .any(|c| c.starts_with("load video:z09GolEktUw")));
    }

    #[tokio::test]
    async fn test_listener_pauses_after_loading_paused_media() {
        let player = Arc::new(SimulatedPlayer::new());
        let context = mock_context_with_player("u1", player.clone());
        let service = HeartbeatService::new(&context);

        // The DJ has the media loaded but paused; loading autoplays, so the
        // parity step has to pause right after
        let media = MediaRef::Video("z09GolEktUw".to_string());
        service
            .handle_heartbeat("dj", &snapshot(Some(media), 30.0, false))
            .await;

        assert!(!player.is_playing());
        assert_eq!(
            context.state.state().player.playback,
            PlaybackState::Paused
        );
    }

    #[tokio::test]
    async fn test_listener_seeks_past_tolerance() {
        let player = Arc::new(SimulatedPlayer::new());
        let media = MediaRef::Video("z09GolEktUw".to_string());
        player.set_media(Some(media.clone()));
        player.set_position(20.0);
        player.set_playing(true);

        let context = mock_context_with_player("u1", player.clone());

        context.state.update(StatePatch::player(PlayerPatch {
            current_ref: Some(Some(media.clone())),
            playback: Some(PlaybackState::Playing),
            current_time: Some(20.0),
            ..Default::default()
        }));

        let service = HeartbeatService::new(&context);

        // 3.5 seconds behind, tolerance is 1.0
        service
            .handle_heartbeat("dj", &snapshot(Some(media.clone()), 23.5, true))
            .await;

        assert!(player.commands().contains(&"seek_to 23.5".to_string()));
        assert_eq!(player.position(), 23.5);
    }

    #[tokio::test]
    async fn test_listener_tolerates_small_drift() {
        let player = Arc::new(SimulatedPlayer::new());
        let media = MediaRef::Video("z09GolEktUw".to_string());
        player.set_media(Some(media.clone()));
        player.set_position(22.7);
        player.set_playing(true);

        let context = mock_context_with_player("u1", player.clone());

        context.state.update(StatePatch::player(PlayerPatch {
            current_ref: Some(Some(media.clone())),
            playback: Some(PlaybackState::Playing),
            current_time: Some(22.7),
            ..Default::default()
        }));

        let service = HeartbeatService::new(&context);

        service
            .handle_heartbeat("dj", &snapshot(Some(media), 23.5, true))
            .await;

        assert!(!player.commands().iter().any(|c| c.starts_with("seek_to")));
    }

    #[tokio::test]
    async fn test_listener_matches_pause() {
        let player = Arc::new(SimulatedPlayer::new());
        let media = MediaRef::Video("z09GolEktUw".to_string());
        player.set_media(Some(media.clone()));
        player.set_playing(true);

        let context = mock_context_with_player("u1", player.clone());

        context.state.update(StatePatch::player(PlayerPatch {
            current_ref: Some(Some(media.clone())),
            playback: Some(PlaybackState::Playing),
            ..Default::default()
        }));

        let service = HeartbeatService::new(&context);

        service
            .handle_heartbeat("dj", &snapshot(Some(media), 0.0, false))
            .await;

        assert!(!player.is_playing());
        assert_eq!(
            context.state.state().player.playback,
            PlaybackState::Paused
        );
    }

    #[tokio::test]
    async fn test_dj_ignores_incoming_heartbeats() {
        let context = mock_context("u1");
        let session = SessionManager::new(&context);

        session.join_session().await.unwrap();
        session.claim_dj_role().await.unwrap();

        let service = HeartbeatService::new(&context);

        service
            .handle_heartbeat(
                "other",
                &snapshot(Some(MediaRef::Video("z09GolEktUw".to_string())), 10.0, true),
            )
            .await;

        // The local player was not touched
        assert_eq!(context.state.state().player, PlayerState::default());
    }

    #[tokio::test]
    async fn test_acks_are_drained_per_round() {
        let context = mock_context("u1");
        let service = HeartbeatService::new(&context);

        service.record_ack("u2");
        service.record_ack("u2");
        service.record_ack("u3");

        let drained = service.drain_acks();
        assert_eq!(drained.len(), 2);
        assert!(service.drain_acks().is_empty());
    }
}
