mod queue_item;

use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use queue_item::*;

use crate::{
    ident, BoothState, Config, MediaRef, QueueMode, QueuePatch, QueueState, StatePatch, StateStore,
};

/// The direction of a queue navigation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Next,
    Previous,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("User {user_id} is not permitted to {action} the queue")]
    PermissionDenied { action: &'static str, user_id: String },
    #[error("{0:?} is not a valid video id")]
    InvalidVideoId(String),
    #[error("{0:?} is not a valid playlist id")]
    InvalidPlaylistId(String),
    #[error("{0} is already in the queue")]
    Duplicate(MediaRef),
    #[error("The queue is limited to {max} items")]
    Full { max: usize },
    #[error("Adding this item would exceed the queue duration limit of {max} seconds")]
    DurationExceeded { max: f32 },
    #[error("Index {index} is out of range for a queue of {len} items")]
    OutOfRange { index: usize, len: usize },
    #[error("The queue is empty")]
    Empty,
    #[error("No queue item with id {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Add,
    Modify,
    Advance,
}

impl Action {
    fn name(self) -> &'static str {
        match self {
            Action::Add => "add to",
            Action::Modify => "modify",
            Action::Advance => "advance",
        }
    }
}

/// Manages the shared queue inside a [StateStore].
///
/// Navigation is rotation, not a moving pointer: advancing relocates the
/// current item to the opposite end of the list and the adjacent item becomes
/// current. A non-empty queue therefore always has a next item and never
/// needs an end-of-queue stop condition.
pub struct QueueManager {
    store: Arc<StateStore>,
    config: Config,
}

impl QueueManager {
    pub fn new(store: Arc<StateStore>, config: Config) -> Self {
        Self { store, config }
    }

    /// Validates and adds a video reference to the queue.
    pub fn add_video(
        &self,
        actor: &str,
        video_id: &str,
        title: Option<String>,
        duration: Option<f32>,
    ) -> Result<QueueItem, QueueError> {
        if !ident::is_valid_video_id(video_id) {
            return Err(QueueError::InvalidVideoId(video_id.to_string()));
        }

        let added_by = self.display_name_of(actor);
        self.add_item(actor, QueueItem::video(video_id, title, duration, added_by))
    }

    /// Validates and adds an opaque playlist reference to the queue.
    pub fn add_playlist(&self, actor: &str, playlist_id: &str) -> Result<QueueItem, QueueError> {
        if !ident::is_valid_playlist_id(playlist_id) {
            return Err(QueueError::InvalidPlaylistId(playlist_id.to_string()));
        }

        let added_by = self.display_name_of(actor);
        self.add_item(actor, QueueItem::playlist(playlist_id, added_by))
    }

    /// Applies an add that originated from another participant.
    ///
    /// Idempotent: replayed or out-of-order duplicates are dropped. The
    /// permission gate mirrors the local one, with the sender as the actor.
    pub fn apply_remote_add(&self, sender: &str, item: QueueItem) {
        let mut dropped = None;

        self.store.update_with(|state| {
            if state.queue.position_of(item.id()).is_some() {
                return StatePatch::default();
            }

            if let Err(err) = self.ensure_permission(sender, Action::Add, state) {
                dropped = Some(err);
                return StatePatch::default();
            }

            if let Err(err) = self.check_add_limits(&item, &state.queue) {
                dropped = Some(err);
                return StatePatch::default();
            }

            append_patch(&state.queue, item.clone())
        });

        if let Some(err) = dropped {
            warn!("Dropping queue add from {}: {}", sender, err);
        }
    }

    fn add_item(&self, actor: &str, item: QueueItem) -> Result<QueueItem, QueueError> {
        let mut outcome = Ok(());

        self.store.update_with(|state| {
            if let Err(err) = self.ensure_permission(actor, Action::Add, state) {
                outcome = Err(err);
                return StatePatch::default();
            }

            if let Err(err) = self.check_add_limits(&item, &state.queue) {
                outcome = Err(err);
                return StatePatch::default();
            }

            append_patch(&state.queue, item.clone())
        });

        outcome.map(|_| item)
    }

    fn check_add_limits(&self, item: &QueueItem, queue: &QueueState) -> Result<(), QueueError> {
        if queue.items.iter().any(|i| i.same_media(item)) {
            return Err(QueueError::Duplicate(item.media_ref()));
        }

        if queue.items.len() >= self.config.max_queue_items {
            return Err(QueueError::Full {
                max: self.config.max_queue_items,
            });
        }

        let total: f32 = queue
            .items
            .iter()
            .map(|i| self.config.estimated_duration(i.duration()))
            .sum();

        if total + self.config.estimated_duration(item.duration()) > self.config.max_queue_duration
        {
            return Err(QueueError::DurationExceeded {
                max: self.config.max_queue_duration,
            });
        }

        Ok(())
    }

    /// Removes an item. When the current item is removed, the item that
    /// followed it takes the current slot, clamped to the new tail.
    pub fn remove(&self, actor: &str, item_id: &str) -> Result<QueueItem, QueueError> {
        let mut outcome = Err(QueueError::NotFound(item_id.to_string()));

        self.store.update_with(|state| {
            if let Err(err) = self.ensure_permission(actor, Action::Modify, state) {
                outcome = Err(err);
                return StatePatch::default();
            }

            let Some(position) = state.queue.position_of(item_id) else {
                return StatePatch::default();
            };

            let mut items = state.queue.items.clone();
            let removed = items.remove(position);
            let current_index =
                reindex_after_removal(state.queue.current_index, position, items.len());

            outcome = Ok(removed);

            StatePatch::queue(QueuePatch {
                items: Some(items),
                current_index: Some(current_index),
                ..Default::default()
            })
        });

        outcome
    }

    /// Applies a removal that originated from another participant.
    pub fn apply_remote_remove(&self, sender: &str, item_id: &str) {
        let state = self.store.state();

        if state.queue.position_of(item_id).is_none() {
            return;
        }

        if !state.session.is_dj(sender) {
            warn!("Dropping queue removal from {}: not the DJ", sender);
            return;
        }

        // Permission verified against the sender, so this cannot fail on it
        let _ = self.remove(sender, item_id);
    }

    /// Removes every item from the queue.
    pub fn clear(&self, actor: &str) -> Result<(), QueueError> {
        let mut outcome = Ok(());

        self.store.update_with(|state| {
            if let Err(err) = self.ensure_permission(actor, Action::Modify, state) {
                outcome = Err(err);
                return StatePatch::default();
            }

            StatePatch::queue(QueuePatch {
                items: Some(Vec::new()),
                current_index: Some(None),
                ..Default::default()
            })
        });

        outcome
    }

    /// Moves the item at `from` so it ends up at `to`, re-deriving the
    /// current index from the moved item's new position.
    pub fn reorder(&self, actor: &str, from: usize, to: usize) -> Result<(), QueueError> {
        let mut outcome = Ok(());

        self.store.update_with(|state| {
            if let Err(err) = self.ensure_permission(actor, Action::Modify, state) {
                outcome = Err(err);
                return StatePatch::default();
            }

            let len = state.queue.items.len();

            if from >= len {
                outcome = Err(QueueError::OutOfRange { index: from, len });
                return StatePatch::default();
            }

            if to >= len {
                outcome = Err(QueueError::OutOfRange { index: to, len });
                return StatePatch::default();
            }

            let mut items = state.queue.items.clone();
            let item = items.remove(from);
            items.insert(to, item);

            let current_index = state.queue.current_index.map(|current| {
                if current == from {
                    // The current item itself moved
                    to
                } else {
                    // Removing shifts everything after `from` left, inserting
                    // shifts everything at or after `to` right
                    let mut index = current;

                    if from < index {
                        index -= 1;
                    }

                    if to <= index {
                        index += 1;
                    }

                    index
                }
            });

            StatePatch::queue(QueuePatch {
                items: Some(items),
                current_index: Some(current_index),
                ..Default::default()
            })
        });

        outcome
    }

    /// Moves an item one position towards the front. No-op at the front.
    pub fn move_up(&self, actor: &str, item_id: &str) -> Result<(), QueueError> {
        let position = self.position_or_not_found(item_id)?;

        if position == 0 {
            return Ok(());
        }

        self.reorder(actor, position, position - 1)
    }

    /// Moves an item one position towards the back. No-op at the back.
    pub fn move_down(&self, actor: &str, item_id: &str) -> Result<(), QueueError> {
        let state = self.store.state();
        let position = self.position_or_not_found(item_id)?;

        if position + 1 >= state.queue.items.len() {
            return Ok(());
        }

        self.reorder(actor, position, position + 1)
    }

    fn position_or_not_found(&self, item_id: &str) -> Result<usize, QueueError> {
        self.store
            .state()
            .queue
            .position_of(item_id)
            .ok_or_else(|| QueueError::NotFound(item_id.to_string()))
    }

    /// Advances the queue by rotation and returns the new current item.
    pub fn advance(&self, actor: &str, direction: Direction) -> Result<QueueItem, QueueError> {
        let mut outcome = Err(QueueError::Empty);

        self.store.update_with(|state| {
            if let Err(err) = self.ensure_permission(actor, Action::Advance, state) {
                outcome = Err(err);
                return StatePatch::default();
            }

            match rotation_patch(&state.queue, direction) {
                Ok((patch, item)) => {
                    outcome = Ok(item);
                    patch
                }
                Err(err) => {
                    outcome = Err(err);
                    StatePatch::default()
                }
            }
        });

        outcome
    }

    /// Applies a navigation step that originated from the DJ.
    ///
    /// `expected_current_id` is the item the sender landed on, making replays
    /// detectable: a step whose outcome is already current is dropped.
    pub fn apply_remote_advance(
        &self,
        sender: &str,
        direction: Direction,
        expected_current_id: &str,
    ) {
        let mut outcome = None;

        self.store.update_with(|state| {
            if !state.session.is_dj(sender) {
                outcome = Some(Err(QueueError::PermissionDenied {
                    action: Action::Advance.name(),
                    user_id: sender.to_string(),
                }));
                return StatePatch::default();
            }

            // A replay's outcome is already current
            if state
                .queue
                .current_item()
                .map(|i| i.id() == expected_current_id)
                .unwrap_or(false)
            {
                return StatePatch::default();
            }

            match rotation_patch(&state.queue, direction) {
                Ok((patch, item)) => {
                    outcome = Some(Ok(item));
                    patch
                }
                Err(err) => {
                    outcome = Some(Err(err));
                    StatePatch::default()
                }
            }
        });

        match outcome {
            Some(Ok(item)) => {
                if item.id() != expected_current_id {
                    warn!(
                        "Queue advance from {} landed on {} instead of {}",
                        sender,
                        item.id(),
                        expected_current_id
                    );
                }
            }
            Some(Err(err)) => warn!("Dropping queue advance from {}: {}", sender, err),
            None => {}
        }
    }

    /// Jumps directly to the item at the given position.
    pub fn play_now(&self, actor: &str, index: usize) -> Result<QueueItem, QueueError> {
        let mut outcome = Err(QueueError::Empty);

        self.store.update_with(|state| {
            if let Err(err) = self.ensure_permission(actor, Action::Advance, state) {
                outcome = Err(err);
                return StatePatch::default();
            }

            let len = state.queue.items.len();

            let Some(item) = state.queue.items.get(index).cloned() else {
                outcome = Err(QueueError::OutOfRange { index, len });
                return StatePatch::default();
            };

            outcome = Ok(item);

            StatePatch::queue(QueuePatch {
                current_index: Some(Some(index)),
                ..Default::default()
            })
        });

        outcome
    }

    /// Switches between single-authority and collaborative permissions.
    pub fn set_mode(&self, actor: &str, mode: QueueMode) -> Result<(), QueueError> {
        let mut outcome = Ok(());

        self.store.update_with(|state| {
            if let Err(err) = self.ensure_permission(actor, Action::Modify, state) {
                outcome = Err(err);
                return StatePatch::default();
            }

            StatePatch::queue(QueuePatch {
                mode: Some(mode),
                ..Default::default()
            })
        });

        outcome
    }

    /// Replaces the whole queue slice, used when the DJ propagates a
    /// structural change (reorder, clear, jump, mode switch).
    pub fn apply_remote_replace(&self, sender: &str, mut queue: QueueState) {
        let mut from_dj = true;

        self.store.update_with(|state| {
            if !state.session.is_dj(sender) {
                from_dj = false;
                return StatePatch::default();
            }

            // Never trust a broadcast to uphold the index invariant
            if !queue.index_is_valid() {
                queue.current_index = if queue.items.is_empty() { None } else { Some(0) };
            }

            StatePatch::queue(QueuePatch {
                items: Some(std::mem::take(&mut queue.items)),
                current_index: Some(queue.current_index),
                mode: Some(queue.mode),
            })
        });

        if !from_dj {
            warn!("Dropping queue replacement from {}: not the DJ", sender);
        }
    }

    pub fn current_item(&self) -> Option<QueueItem> {
        self.store.state().queue.current_item().cloned()
    }

    /// Whether any item besides the current one exists.
    pub fn has_more_items(&self) -> bool {
        self.store.state().queue.items.len() > 1
    }

    fn ensure_permission(
        &self,
        actor: &str,
        action: Action,
        state: &BoothState,
    ) -> Result<(), QueueError> {
        let session = &state.session;

        let allowed = match action {
            Action::Add => match state.queue.mode {
                QueueMode::SingleAuthority => session.is_dj(actor),
                QueueMode::Collaborative => session.is_active_member(actor),
            },
            Action::Modify | Action::Advance => session.is_dj(actor),
        };

        if allowed {
            Ok(())
        } else {
            Err(QueueError::PermissionDenied {
                action: action.name(),
                user_id: actor.to_string(),
            })
        }
    }

    fn display_name_of(&self, user_id: &str) -> String {
        self.store
            .state()
            .session
            .member(user_id)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| user_id.to_string())
    }
}

/// Builds the patch appending an item, initializing the current index on the
/// first add.
fn append_patch(queue: &QueueState, item: QueueItem) -> StatePatch {
    let mut items = queue.items.clone();
    items.push(item);

    StatePatch::queue(QueuePatch {
        items: Some(items),
        current_index: Some(queue.current_index.or(Some(0))),
        ..Default::default()
    })
}

/// Builds the patch rotating the queue, returning it with the item that
/// becomes current.
fn rotation_patch(
    queue: &QueueState,
    direction: Direction,
) -> Result<(StatePatch, QueueItem), QueueError> {
    let index = queue.current_index.ok_or(QueueError::Empty)?;
    let mut items = queue.items.clone();
    let new_index = rotate(&mut items, index, direction);
    let item = items[new_index].clone();

    Ok((
        StatePatch::queue(QueuePatch {
            items: Some(items),
            current_index: Some(Some(new_index)),
            ..Default::default()
        }),
        item,
    ))
}

/// Rotates the list around the current index and returns the new one.
///
/// The current item is relocated to the opposite end of the list and the
/// adjacent item becomes current. This genuinely mutates the order, it is not
/// a looping pointer.
fn rotate(items: &mut Vec<QueueItem>, index: usize, direction: Direction) -> usize {
    if items.len() < 2 {
        return index;
    }

    match direction {
        Direction::Next => {
            let current = items.remove(index);
            items.push(current);

            // The item that followed now sits at the same position, except
            // when the current item was already last, which wraps to the front
            if index < items.len() - 1 {
                index
            } else {
                0
            }
        }
        Direction::Previous => {
            let current = items.remove(index);
            items.insert(0, current);

            if index > 0 {
                index
            } else {
                items.len() - 1
            }
        }
    }
}

fn reindex_after_removal(
    current: Option<usize>,
    removed_at: usize,
    new_len: usize,
) -> Option<usize> {
    if new_len == 0 {
        return None;
    }

    current.map(|index| {
        if removed_at < index {
            index - 1
        } else if removed_at == index {
            // Clamp: the following item takes the slot
            index.min(new_len - 1)
        } else {
            index
        }
    })
}
