//! The coordination layer of a booth: role management, liveness, queue
//! propagation, and the [Booth] facade tying it all together on top of a
//! [Transport] and a [PlayerWidget].

mod dispatch;
mod events;
mod heartbeat;
mod messages;
mod session;
mod util;

use std::sync::Arc;

use log::{debug, info, warn};

use djbooth_core::{
    BoothState, Config, Direction, KvStore, PlaybackState, PlayerPatch, PlayerWidget, QueueError,
    QueueItem, QueueManager, QueueMode, StatePatch, StateStore, Transport,
};

pub use dispatch::MessageDispatch;
pub use events::{BoothEvent, EventReceiver, EventSender};
pub use heartbeat::HeartbeatService;
pub use messages::{Envelope, HeartbeatSnapshot, Message};
pub use session::{SessionError, SessionManager};
pub use util::TaskGroup;

/// Who the local participant is.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user_id: String,
    pub name: String,
    /// Moderators may override the DJ role
    pub moderator: bool,
    /// The privileged participant is the only one writing to the store and
    /// answers bootstrap probes when no DJ is around
    pub privileged: bool,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            moderator: false,
            privileged: false,
        }
    }

    pub fn moderator(mut self) -> Self {
        self.moderator = true;
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// Everything the coordination services share.
#[derive(Clone)]
pub struct BoothContext {
    pub config: Config,
    pub identity: LocalIdentity,
    pub state: Arc<StateStore>,
    pub transport: Arc<dyn Transport>,
    pub player: Arc<dyn PlayerWidget>,
    pub tasks: Arc<TaskGroup>,
    event_sender: EventSender,
}

impl BoothContext {
    pub fn is_self_dj(&self) -> bool {
        self.state.state().session.is_dj(&self.identity.user_id)
    }

    pub(crate) fn emit(&self, event: BoothEvent) {
        // Nobody listening is fine
        let _ = self.event_sender.send(event);
    }

    /// Broadcasts a message, retrying transient failures with a doubling
    /// backoff. Local state is applied before any broadcast, so exhausting
    /// the retries only delays convergence, it never loses the local change.
    pub(crate) async fn broadcast(&self, message: Message) {
        let envelope = Envelope::new(&self.identity.user_id, message);

        let value = match serde_json::to_value(&envelope) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to encode a broadcast: {}", err);
                return;
            }
        };

        let mut backoff = self.config.broadcast_backoff;
        let mut attempts = 0;

        loop {
            match self.transport.broadcast(value.clone()).await {
                Ok(_) => return,
                Err(err) if err.is_transient() && attempts < self.config.broadcast_retries => {
                    attempts += 1;
                    debug!("Broadcast failed, retrying in {:?}: {}", backoff, err);

                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => {
                    warn!("Giving up on a broadcast: {}", err);

                    self.emit(BoothEvent::BroadcastFailed {
                        description: err.to_string(),
                    });

                    return;
                }
            }
        }
    }
}

/// A participant in a synchronized listening session.
///
/// Construction wires the services together and spawns the background loops;
/// the methods here are the entire surface an embedder needs.
pub struct Booth {
    context: BoothContext,
    session: SessionManager,
    queue: Arc<QueueManager>,
    event_receiver: EventReceiver,
}

impl Booth {
    pub async fn new(
        config: Config,
        identity: LocalIdentity,
        transport: Arc<dyn Transport>,
        kv_store: Option<Arc<dyn KvStore>>,
        player: Arc<dyn PlayerWidget>,
    ) -> Self {
        let (event_sender, event_receiver) = crossbeam::channel::unbounded();

        let mut initial_state = BoothState::default();

        // Only the privileged participant touches the store
        if identity.privileged {
            if let Some(kv) = &kv_store {
                match kv.get(Config::PERSIST_KEY).await {
                    Ok(value) => initial_state = BoothState::restore(value.as_ref()),
                    Err(err) => warn!("Failed to read persisted state: {}", err),
                }
            }
        }

        let state = Arc::new(StateStore::with_state(initial_state));

        if identity.privileged {
            if let Some(kv) = kv_store {
                state.attach_persistence(kv, Config::PERSIST_KEY, config.persist_debounce);
            }
        }

        let forward = event_sender.clone();
        state.subscribe(move |change| {
            let _ = forward.send(BoothEvent::StateChanged {
                changed: change.changed.clone(),
            });
        });

        let context = BoothContext {
            config: config.clone(),
            identity,
            state: state.clone(),
            transport,
            player,
            tasks: Arc::new(TaskGroup::default()),
            event_sender,
        };

        let session = SessionManager::new(&context);
        let queue = Arc::new(QueueManager::new(state, config));
        let heartbeat = Arc::new(HeartbeatService::new(&context));

        let dispatch = MessageDispatch::new(&context, session.clone(), queue.clone(), heartbeat.clone());
        dispatch.spawn_loops();

        // The liveness loop runs for everyone but only acts while holding
        // the DJ role, so role changes need no task churn
        let loop_context = context.clone();
        let loop_session = session.clone();

        context.tasks.spawn(async move {
            loop {
                tokio::time::sleep(loop_context.config.heartbeat_period).await;

                if loop_context.is_self_dj() {
                    heartbeat.dj_tick(&loop_session).await;
                }
            }
        });

        info!("Booth initialized for {}", context.identity.user_id);

        Self {
            context,
            session,
            queue,
            event_receiver,
        }
    }

    /// Returns a receiver of booth events. Clones share one queue, so every
    /// event is consumed by exactly one receiver.
    pub fn events(&self) -> EventReceiver {
        self.event_receiver.clone()
    }

    /// Returns a snapshot of the shared state.
    pub fn state(&self) -> BoothState {
        self.context.state.state()
    }

    fn me(&self) -> &str {
        &self.context.identity.user_id
    }

    // --- session ---

    pub async fn join_session(&self) -> Result<(), SessionError> {
        self.session.join_session().await
    }

    pub async fn leave_session(&self) {
        self.session.leave_session().await
    }

    pub async fn claim_dj_role(&self) -> Result<(), SessionError> {
        self.session.claim_dj_role().await
    }

    pub async fn release_dj_role(&self) -> Result<(), SessionError> {
        self.session.release_dj_role().await
    }

    pub async fn request_dj_role(&self) -> Result<(), SessionError> {
        self.session.request_dj_role().await
    }

    pub async fn approve_dj_request(&self, user_id: &str) -> Result<(), SessionError> {
        self.session.approve_dj_request(user_id).await
    }

    pub fn deny_dj_request(&self, user_id: &str) -> Result<(), SessionError> {
        self.session.deny_dj_request(user_id)
    }

    pub async fn handoff_dj_role(&self, target: &str) -> Result<(), SessionError> {
        self.session.handoff_dj_role(target).await
    }

    pub async fn moderator_override(&self) -> Result<(), SessionError> {
        self.session.moderator_override().await
    }

    // --- queue ---

    pub async fn add_video(
        &self,
        video_id: &str,
        title: Option<String>,
        duration: Option<f32>,
    ) -> Result<QueueItem, QueueError> {
        let item = self.queue.add_video(self.me(), video_id, title, duration)?;

        self.context
            .broadcast(Message::QueueAdd { item: item.clone() })
            .await;

        Ok(item)
    }

    pub async fn add_playlist(&self, playlist_id: &str) -> Result<QueueItem, QueueError> {
        let item = self.queue.add_playlist(self.me(), playlist_id)?;

        self.context
            .broadcast(Message::QueueAdd { item: item.clone() })
            .await;

        Ok(item)
    }

    pub async fn remove_item(&self, item_id: &str) -> Result<QueueItem, QueueError> {
        let item = self.queue.remove(self.me(), item_id)?;

        self.context
            .broadcast(Message::QueueRemove {
                item_id: item_id.to_string(),
            })
            .await;

        Ok(item)
    }

    /// Rotates forward and starts playing the new current item.
    pub async fn next_video(&self) -> Result<QueueItem, QueueError> {
        dispatch::advance_and_sync(&self.context, &self.queue, Direction::Next).await
    }

    /// Rotates backward and starts playing the new current item.
    pub async fn previous_video(&self) -> Result<QueueItem, QueueError> {
        dispatch::advance_and_sync(&self.context, &self.queue, Direction::Previous).await
    }

    /// Jumps directly to the item at the given position.
    pub async fn play_now(&self, index: usize) -> Result<QueueItem, QueueError> {
        let item = self.queue.play_now(self.me(), index)?;
        let media = item.media_ref();

        if let Err(err) = self.context.player.load(&media, 0.0).await {
            warn!("Failed to load {}: {}", media, err);
        }

        self.context.state.update(StatePatch::player(PlayerPatch {
            current_ref: Some(Some(media)),
            current_time: Some(0.0),
            playback: Some(PlaybackState::Playing),
            ..Default::default()
        }));

        self.broadcast_queue_snapshot().await;
        Ok(item)
    }

    pub async fn reorder(&self, from: usize, to: usize) -> Result<(), QueueError> {
        self.queue.reorder(self.me(), from, to)?;
        self.broadcast_queue_snapshot().await;

        Ok(())
    }

    pub async fn move_up(&self, item_id: &str) -> Result<(), QueueError> {
        self.queue.move_up(self.me(), item_id)?;
        self.broadcast_queue_snapshot().await;

        Ok(())
    }

    pub async fn move_down(&self, item_id: &str) -> Result<(), QueueError> {
        self.queue.move_down(self.me(), item_id)?;
        self.broadcast_queue_snapshot().await;

        Ok(())
    }

    pub async fn clear_queue(&self) -> Result<(), QueueError> {
        self.queue.clear(self.me())?;
        self.broadcast_queue_snapshot().await;

        Ok(())
    }

    pub async fn set_queue_mode(&self, mode: QueueMode) -> Result<(), QueueError> {
        self.queue.set_mode(self.me(), mode)?;
        self.broadcast_queue_snapshot().await;

        Ok(())
    }

    /// Structural changes travel as a wholesale replacement instead of a
    /// step, since their outcome cannot be re-derived from a delta alone.
    async fn broadcast_queue_snapshot(&self) {
        let queue = self.context.state.state().queue;

        self.context
            .broadcast(Message::QueueUpdate { queue })
            .await;
    }

    // --- playback, DJ only. Listeners converge through heartbeats ---

    pub async fn play(&self) -> Result<(), SessionError> {
        self.ensure_dj("control playback")?;

        if let Err(err) = self.context.player.play().await {
            warn!("Failed to start playback: {}", err);
        }

        self.context.state.update(StatePatch::player(PlayerPatch {
            playback: Some(PlaybackState::Playing),
            ..Default::default()
        }));

        Ok(())
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.ensure_dj("control playback")?;

        if let Err(err) = self.context.player.pause().await {
            warn!("Failed to pause playback: {}", err);
        }

        self.context.state.update(StatePatch::player(PlayerPatch {
            playback: Some(PlaybackState::Paused),
            ..Default::default()
        }));

        Ok(())
    }

    pub async fn seek(&self, seconds: f32) -> Result<(), SessionError> {
        self.ensure_dj("seek")?;

        if let Err(err) = self.context.player.seek_to(seconds).await {
            warn!("Failed to seek: {}", err);
        }

        self.context.state.update(StatePatch::player(PlayerPatch {
            current_time: Some(seconds),
            ..Default::default()
        }));

        Ok(())
    }

    fn ensure_dj(&self, action: &'static str) -> Result<(), SessionError> {
        if !self.context.is_self_dj() {
            return Err(SessionError::NotDj(action));
        }

        Ok(())
    }

    /// Tears down the background loops. The booth is unusable afterwards.
    pub fn shutdown(&self) {
        self.context.tasks.abort_all();
    }
}

impl Drop for Booth {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    use std::time::Duration;

    use djbooth_impls::{LoopbackHub, SimulatedPlayer};

    /// A config with delays short enough for tests.
    pub fn test_config() -> Config {
        Config {
            heartbeat_period: Duration::from_millis(50),
            live_query_timeout: Duration::from_millis(50),
            autoclaim_grace: Duration::from_millis(100),
            persist_debounce: Duration::from_millis(20),
            broadcast_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    pub fn mock_context(user_id: &str) -> BoothContext {
        mock_context_with_player(user_id, Arc::new(SimulatedPlayer::new()))
    }

    pub fn mock_context_with_player(
        user_id: &str,
        player: Arc<SimulatedPlayer>,
    ) -> BoothContext {
        let hub = LoopbackHub::new();
        let (event_sender, _) = crossbeam::channel::unbounded();

        BoothContext {
            config: test_config(),
            identity: LocalIdentity::new(user_id, user_id),
            state: Arc::new(StateStore::new()),
            transport: Arc::new(hub.endpoint()),
            player,
            tasks: Arc::new(TaskGroup::default()),
            event_sender,
        }
    }
}
