use std::time::Duration;

/// The configuration of a booth participant.
///
/// All timing constants of the coordination protocol live here, so state
/// structs only ever carry runtime data.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the DJ broadcasts a playback snapshot
    pub heartbeat_period: Duration,
    /// How far a listener may drift from the DJ before a seek is issued, in seconds
    pub drift_tolerance: f32,
    /// How long to wait for a live answer from the player widget before
    /// falling back to cached state
    pub live_query_timeout: Duration,
    /// How many consecutive missed liveness rounds a member survives
    pub missed_heartbeat_threshold: u32,
    /// How long a vacated DJ role stays unclaimable before members may auto-claim
    pub autoclaim_grace: Duration,
    /// How long state changes are coalesced before being persisted
    pub persist_debounce: Duration,
    /// How many times a failed broadcast is retried before giving up
    pub broadcast_retries: u32,
    /// The base delay between broadcast retries, doubled on each attempt
    pub broadcast_backoff: Duration,
    /// The maximum number of items the queue accepts
    pub max_queue_items: usize,
    /// The maximum estimated total duration of the queue, in seconds
    pub max_queue_duration: f32,
    /// The duration assumed for items whose real length is unknown, in seconds
    pub assumed_item_duration: f32,
}

impl Config {
    /// The key under which session state is persisted.
    pub const PERSIST_KEY: &'static str = "djbooth.session";

    /// Returns the estimated duration of an item, substituting the assumed
    /// length when the real one is unknown.
    pub fn estimated_duration(&self, duration: Option<f32>) -> f32 {
        duration.unwrap_or(self.assumed_item_duration)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_millis(2000),
            // Anything below a second of drift is imperceptible in practice
            drift_tolerance: 1.0,
            live_query_timeout: Duration::from_millis(250),
            missed_heartbeat_threshold: 5,
            autoclaim_grace: Duration::from_secs(2),
            // Enough to coalesce a burst of updates without feeling laggy
            persist_debounce: Duration::from_millis(100),
            broadcast_retries: 3,
            broadcast_backoff: Duration::from_millis(250),
            max_queue_items: 100,
            max_queue_duration: 60. * 60. * 4.,
            // Most tracks are around 5 minutes long
            assumed_item_duration: 60. * 5.,
        }
    }
}
