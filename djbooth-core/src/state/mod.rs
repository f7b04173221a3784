mod data;
mod patch;

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

pub use data::*;
pub use patch::*;

use crate::KvStore;

type Subscriber = Box<dyn Fn(&StateChange) + Send + Sync>;

/// Describes one applied update.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub previous: BoothState,
    pub current: BoothState,
    /// Dot-style paths of the fields that changed value
    pub changed: Vec<String>,
}

/// Bridges state updates to the external store, coalescing bursts of updates
/// into one debounced write. Only installed on the privileged participant.
struct PersistenceBridge {
    store: Arc<dyn KvStore>,
    key: String,
    debounce: Duration,
    pending: Option<JoinHandle<()>>,
}

/// The canonical state container of one participant.
///
/// All managers share one store and mutate it exclusively through
/// [StateStore::update], so every logical operation lands as a single
/// atomic merge.
pub struct StateStore {
    state: Mutex<BoothState>,
    subscribers: Mutex<Vec<Subscriber>>,
    persistence: Mutex<Option<PersistenceBridge>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_state(BoothState::default())
    }

    pub fn with_state(state: BoothState) -> Self {
        Self {
            state: Mutex::new(state),
            subscribers: Default::default(),
            persistence: Default::default(),
        }
    }

    /// Returns an isolated snapshot of the current state.
    pub fn state(&self) -> BoothState {
        self.state.lock().clone()
    }

    /// Registers a subscriber invoked synchronously on every applied update.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Box::new(subscriber));
    }

    /// Installs the debounced write-through to the external store.
    ///
    /// Must only be called by the privileged participant; everyone else
    /// propagates changes via messages and never writes directly.
    pub fn attach_persistence(&self, store: Arc<dyn KvStore>, key: &str, debounce: Duration) {
        *self.persistence.lock() = Some(PersistenceBridge {
            store,
            key: key.to_string(),
            debounce,
            pending: None,
        });
    }

    /// Merges a partial update into the state.
    ///
    /// Records merge field-by-field, lists and scalars replace wholesale.
    /// Subscribers run synchronously before this returns. The in-memory
    /// state is updated regardless of whether persistence later succeeds.
    pub fn update(&self, patch: StatePatch) -> StateChange {
        self.update_with(|_| patch)
    }

    /// Computes a patch from the current state and applies it in one atomic
    /// step: nothing can change between the closure observing the state and
    /// the patch landing. Every read-modify-write cycle must go through
    /// here, since a separate `state()` + `update()` pair racing another
    /// writer loses one of the writes.
    ///
    /// The closure runs under the state lock and must not call back into
    /// the store.
    pub fn update_with<F>(&self, f: F) -> StateChange
    where
        F: FnOnce(&BoothState) -> StatePatch,
    {
        let change = {
            let mut state = self.state.lock();
            let patch = f(&*state);
            let previous = state.clone();
            let changed = patch.apply(&mut state);

            StateChange {
                previous,
                current: state.clone(),
                changed,
            }
        };

        if !change.changed.is_empty() {
            for subscriber in self.subscribers.lock().iter() {
                subscriber(&change);
            }

            self.schedule_persist(change.current.clone());
        }

        change
    }

    /// Replaces the entire state, used for late-join bootstrap and restore.
    pub fn replace(&self, new_state: BoothState) -> StateChange {
        let change = {
            let mut state = self.state.lock();
            let previous = state.clone();
            *state = new_state;

            StateChange {
                previous,
                current: state.clone(),
                changed: vec!["session".to_string(), "player".to_string(), "queue".to_string()],
            }
        };

        for subscriber in self.subscribers.lock().iter() {
            subscriber(&change);
        }

        self.schedule_persist(change.current.clone());
        change
    }

    fn schedule_persist(&self, snapshot: BoothState) {
        let mut guard = self.persistence.lock();

        let Some(bridge) = guard.as_mut() else {
            return;
        };

        // A newer snapshot supersedes any write still waiting out its debounce
        if let Some(pending) = bridge.pending.take() {
            pending.abort();
        }

        let store = bridge.store.clone();
        let key = bridge.key.clone();
        let debounce = bridge.debounce;

        bridge.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            match serde_json::to_value(&snapshot) {
                Ok(value) => {
                    if let Err(err) = store.set(&key, value).await {
                        warn!("Failed to persist state: {}", err);
                    }
                }
                Err(err) => warn!("Failed to serialize state for persistence: {}", err),
            }
        }));
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::{ConnectionStatus, KvStoreError, PlaybackState, PlayerPatch, SessionPatch};

    #[test]
    fn test_merge_semantics() {
        let store = StateStore::new();

        // Patching one slice leaves the others untouched
        let change = store.update(StatePatch::player(PlayerPatch {
            playback: Some(PlaybackState::Playing),
            current_time: Some(12.5),
            ..Default::default()
        }));

        assert_eq!(
            change.changed,
            vec!["player.playback".to_string(), "player.current_time".to_string()]
        );
        assert_eq!(change.previous.player.playback, PlaybackState::Stopped);
        assert_eq!(store.state().player.current_time, 12.5);
        assert_eq!(store.state().session, change.previous.session);

        // Fields merge within a record: playback survives a time-only patch
        store.update(StatePatch::player(PlayerPatch {
            current_time: Some(13.0),
            ..Default::default()
        }));

        assert_eq!(store.state().player.playback, PlaybackState::Playing);
    }

    #[test]
    fn test_lists_replace_wholesale() {
        let store = StateStore::new();

        store.update(StatePatch::session(SessionPatch {
            members: Some(vec![
                SessionMember::new("u1", "one"),
                SessionMember::new("u2", "two"),
            ]),
            ..Default::default()
        }));

        store.update(StatePatch::session(SessionPatch {
            members: Some(vec![SessionMember::new("u3", "three")]),
            ..Default::default()
        }));

        let members = store.state().session.members;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, "u3");
    }

    #[test]
    fn test_unchanged_patch_does_not_notify() {
        let store = StateStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let change = store.update(StatePatch::session(SessionPatch {
            has_joined_session: Some(false),
            ..Default::default()
        }));

        assert!(change.changed.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        store.update(StatePatch::session(SessionPatch {
            has_joined_session: Some(true),
            ..Default::default()
        }));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_update_with_is_atomic_under_contention() {
        let store = Arc::new(StateStore::new());

        // Four writers appending through update_with must never overwrite
        // each other, even though lists replace wholesale
        let mut writers = Vec::new();

        for t in 0..4 {
            let store = store.clone();

            writers.push(tokio::spawn(async move {
                for n in 0..50 {
                    store.update_with(|state| {
                        let mut members = state.session.members.clone();
                        let id = format!("u{}-{}", t, n);
                        members.push(SessionMember::new(&id, &id));

                        StatePatch::session(SessionPatch {
                            members: Some(members),
                            ..Default::default()
                        })
                    });
                }
            }));
        }

        for writer in writers {
            writer.await.unwrap();
        }

        assert_eq!(store.state().session.members.len(), 200);
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let store = StateStore::new();

        let mut snapshot = store.state();
        snapshot.session.has_joined_session = true;

        assert!(!store.state().session.has_joined_session);
    }

    #[test]
    fn test_restore_rejects_corrupt_state() {
        let corrupt = serde_json::json!({ "session": 42 });
        let state = BoothState::restore(Some(&corrupt));

        assert_eq!(state, BoothState::default());
    }

    #[test]
    fn test_restore_sanitizes_members() {
        let mut persisted = BoothState::default();
        persisted
            .session
            .members
            .push(SessionMember::new("u1", "one"));
        persisted
            .session
            .members
            .push(SessionMember::new("u1", "one again"));
        // A DJ that is no longer a member must not survive the load
        persisted.session.dj_user_id = Some("ghost".to_string());
        persisted.session.connection_status = ConnectionStatus::Connected;

        let value = serde_json::to_value(&persisted).unwrap();
        let state = BoothState::restore(Some(&value));

        assert_eq!(state.session.members.len(), 1);
        assert_eq!(state.session.dj_user_id, None);
        assert_eq!(state.session.connection_status, ConnectionStatus::Disconnected);
    }

    struct CountingStore {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl KvStore for CountingStore {
        async fn get(&self, _key: &str) -> Result<Option<Value>, KvStoreError> {
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: Value) -> Result<(), KvStoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_debounced_persistence_coalesces() {
        let kv = Arc::new(CountingStore {
            writes: AtomicUsize::new(0),
        });

        let store = StateStore::new();
        store.attach_persistence(kv.clone(), "test", Duration::from_millis(20));

        for i in 0..5 {
            store.update(StatePatch::player(PlayerPatch {
                current_time: Some(i as f32),
                ..Default::default()
            }));
        }

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(kv.writes.load(Ordering::SeqCst), 1);
    }
}
