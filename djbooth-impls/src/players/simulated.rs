use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use djbooth_core::{LiveState, MediaRef, PlayerError, PlayerEvent, PlayerWidget};

#[derive(Default)]
struct SimulatedState {
    media: Option<MediaRef>,
    playing: bool,
    position: f32,
    duration: f32,
}

/// A deterministic stand-in for the external player widget.
///
/// Playback time does not advance on its own; tests move it explicitly with
/// [SimulatedPlayer::set_position]. Every received command is recorded so
/// tests can assert on what the coordination layer asked the player to do.
#[derive(Default)]
pub struct SimulatedPlayer {
    state: Mutex<SimulatedState>,
    commands: Mutex<Vec<String>>,
    event_queues: Mutex<Vec<mpsc::UnboundedSender<PlayerEvent>>>,
    unresponsive: AtomicBool,
}

impl SimulatedPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes [PlayerWidget::query] hang forever, simulating a widget that
    /// never answers a live-state query.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Moves the simulated playhead.
    pub fn set_position(&self, seconds: f32) {
        self.state.lock().position = seconds;
    }

    pub fn set_media(&self, media: Option<MediaRef>) {
        self.state.lock().media = media;
    }

    pub fn set_playing(&self, playing: bool) {
        self.state.lock().playing = playing;
    }

    pub fn set_duration(&self, seconds: f32) {
        self.state.lock().duration = seconds;
    }

    pub fn current_media(&self) -> Option<MediaRef> {
        self.state.lock().media.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn position(&self) -> f32 {
        self.state.lock().position
    }

    /// Returns every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Pushes a widget event to all subscribers, as the real widget would.
    pub fn emit(&self, event: PlayerEvent) {
        let mut queues = self.event_queues.lock();
        queues.retain(|q| q.send(event.clone()).is_ok());
    }

    fn record(&self, command: String) {
        self.commands.lock().push(command);
    }
}

#[async_trait]
impl PlayerWidget for SimulatedPlayer {
    async fn load(&self, media: &MediaRef, at_seconds: f32) -> Result<(), PlayerError> {
        self.record(format!("load {} @ {}", media, at_seconds));

        let mut state = self.state.lock();
        state.media = Some(media.clone());
        state.position = at_seconds;
        state.playing = true;

        Ok(())
    }

    async fn cue(&self, media: &MediaRef, at_seconds: f32) -> Result<(), PlayerError> {
        self.record(format!("cue {} @ {}", media, at_seconds));

        let mut state = self.state.lock();
        state.media = Some(media.clone());
        state.position = at_seconds;
        state.playing = false;

        Ok(())
    }

    async fn play(&self) -> Result<(), PlayerError> {
        self.record("play".to_string());
        self.state.lock().playing = true;
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        self.record("pause".to_string());
        self.state.lock().playing = false;
        Ok(())
    }

    async fn seek_to(&self, seconds: f32) -> Result<(), PlayerError> {
        self.record(format!("seek_to {}", seconds));
        self.state.lock().position = seconds;
        Ok(())
    }

    async fn next_in_playlist(&self) -> Result<(), PlayerError> {
        self.record("next_in_playlist".to_string());
        Ok(())
    }

    async fn previous_in_playlist(&self) -> Result<(), PlayerError> {
        self.record("previous_in_playlist".to_string());
        Ok(())
    }

    async fn play_at(&self, index: usize) -> Result<(), PlayerError> {
        self.record(format!("play_at {}", index));
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> Result<(), PlayerError> {
        self.record(format!("set_volume {}", volume));
        Ok(())
    }

    async fn query(&self) -> Result<LiveState, PlayerError> {
        if self.unresponsive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let state = self.state.lock();

        Ok(LiveState {
            media: state.media.clone(),
            current_time: state.position,
            duration: state.duration,
            playing: state.playing,
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PlayerEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.event_queues.lock().push(sender);

        receiver
    }
}
