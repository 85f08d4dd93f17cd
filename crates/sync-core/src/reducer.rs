use std::collections::HashSet;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::types::{EntityEvent, EntityId, Message, Notification, PushEvent};

/// An entity held by a reducer store: unique by id, with a read flag.
pub trait Entity: Clone + Serialize + DeserializeOwned {
    fn id(&self) -> &EntityId;

    /// Whether the entity counts towards the unread counter.
    fn is_unread(&self) -> bool;

    fn set_read(&mut self);
}

impl Entity for Notification {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn is_unread(&self) -> bool {
        !self.is_read
    }

    fn set_read(&mut self) {
        self.is_read = true;
    }
}

impl Entity for Message {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn is_unread(&self) -> bool {
        !self.is_read && !self.is_own
    }

    fn set_read(&mut self) {
        self.is_read = true;
    }
}

/// What a reducer did with one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReduceOutcome {
    /// A new entity was added.
    Inserted,
    /// A known entity was replaced (duplicate delivery or refresh).
    Replaced,
    /// A known entity was patched.
    Updated,
    /// An entity was removed.
    Removed,
    /// A provisional entity was replaced by its confirmed counterpart.
    Reconciled { provisional_id: EntityId },
    /// Handshake acknowledgement; only counters may have changed.
    Acknowledged,
    /// The input referenced nothing this store holds.
    Ignored,
}

impl ReduceOutcome {
    /// Whether the owning collection was mutated.
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Acknowledged | Self::Ignored)
    }
}

/// Unread counter: locally derived, optionally overridden by the server.
///
/// A server count stays authoritative until the next local mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounter {
    derived: u64,
    authoritative: Option<u64>,
}

impl UnreadCounter {
    pub fn value(&self) -> u64 {
        self.authoritative.unwrap_or(self.derived)
    }

    pub fn derived(&self) -> u64 {
        self.derived
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative.is_some()
    }

    pub(crate) fn recompute(&mut self, derived: u64, authoritative: Option<u64>) {
        self.derived = derived;
        self.authoritative = authoritative;
    }

    pub(crate) fn set_authoritative(&mut self, count: u64) {
        self.authoritative = Some(count);
    }

    pub(crate) fn set_derived(&mut self, derived: u64) {
        self.derived = derived;
    }
}

/// Apply a partial update to an entity through its JSON form.
pub fn apply_patch<T: Entity>(entity: &T, patch: &Map<String, Value>) -> Result<T, serde_json::Error> {
    let mut value = serde_json::to_value(entity)?;
    if let Value::Object(fields) = &mut value {
        for (key, field) in patch {
            fields.insert(key.clone(), field.clone());
        }
    }
    serde_json::from_value(value)
}

/// Replace `existing` with `incoming`, never flipping a read entity back to unread.
pub(crate) fn absorb<T: Entity>(existing: &mut T, incoming: T) {
    let was_read = !existing.is_unread();
    *existing = incoming;
    if was_read {
        existing.set_read();
    }
}

pub(crate) fn count_unread<T: Entity>(items: &[T]) -> u64 {
    items.iter().filter(|item| item.is_unread()).count() as u64
}

/// Canonical collection for one entity kind, in display order.
///
/// Creation events land at the front; unseen entities from page loads are
/// appended after the existing ones. Deleted ids are remembered so a stale
/// page cannot bring them back; only a later creation event can.
#[derive(Debug, Clone)]
pub struct EntityStore<T> {
    items: Vec<T>,
    unread: UnreadCounter,
    deleted: HashSet<EntityId>,
}

/// Notifications list plus unread counter.
pub type NotificationStore = EntityStore<Notification>;

impl<T: Entity> Default for EntityStore<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            unread: UnreadCounter::default(),
            deleted: HashSet::new(),
        }
    }
}

impl<T: Entity> EntityStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current items in display order.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn get(&self, id: &EntityId) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unread_count(&self) -> u64 {
        self.unread.value()
    }

    pub fn unread(&self) -> UnreadCounter {
        self.unread
    }

    /// Fold one push event into the store.
    pub fn apply(&mut self, push: PushEvent<T>) -> ReduceOutcome {
        let outcome = match push.event {
            EntityEvent::Created(entity) => {
                self.deleted.remove(entity.id());
                self.upsert_front(entity)
            }
            EntityEvent::Updated { id, patch } => self.patch(&id, &patch),
            EntityEvent::Deleted { id } => {
                let outcome = match self.position(&id) {
                    Some(idx) => {
                        self.items.remove(idx);
                        ReduceOutcome::Removed
                    }
                    None => ReduceOutcome::Ignored,
                };
                self.deleted.insert(id);
                outcome
            }
            EntityEvent::ConnectionAck => ReduceOutcome::Acknowledged,
        };

        if outcome.changed() {
            self.unread
                .recompute(count_unread(&self.items), push.unread_count);
        } else if let Some(count) = push.unread_count {
            self.unread.set_authoritative(count);
        }
        outcome
    }

    /// Merge one REST page by id union. Returns the number of new entities.
    ///
    /// A server count supplied earlier stays authoritative. Deleted ids are
    /// skipped.
    pub fn merge_page(&mut self, page: Vec<T>) -> usize {
        let mut added = 0;
        for incoming in page {
            if self.deleted.contains(incoming.id()) {
                continue;
            }
            match self.position(incoming.id()) {
                Some(idx) => absorb(&mut self.items[idx], incoming),
                None => {
                    self.items.push(incoming);
                    added += 1;
                }
            }
        }
        self.unread.set_derived(count_unread(&self.items));
        added
    }

    /// Local read flip. Returns `false` when the id is unknown or already read.
    pub fn mark_read(&mut self, id: &EntityId) -> bool {
        let Some(idx) = self.position(id) else {
            return false;
        };
        let item = &mut self.items[idx];
        if !item.is_unread() {
            return false;
        }
        item.set_read();
        self.recount_local();
        true
    }

    /// Flip every held entity to read. Returns how many changed.
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for item in self.items.iter_mut().filter(|item| item.is_unread()) {
            item.set_read();
            changed += 1;
        }
        self.recount_local();
        changed
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<T> {
        self.deleted.insert(id.clone());
        let idx = self.position(id)?;
        let removed = self.items.remove(idx);
        self.recount_local();
        Some(removed)
    }

    /// Record a server-supplied unread recount.
    pub fn set_authoritative_unread(&mut self, count: u64) {
        self.unread.set_authoritative(count);
    }

    fn upsert_front(&mut self, entity: T) -> ReduceOutcome {
        match self.position(entity.id()) {
            Some(idx) => {
                absorb(&mut self.items[idx], entity);
                ReduceOutcome::Replaced
            }
            None => {
                self.items.insert(0, entity);
                ReduceOutcome::Inserted
            }
        }
    }

    fn patch(&mut self, id: &EntityId, patch: &Map<String, Value>) -> ReduceOutcome {
        let Some(idx) = self.position(id) else {
            return ReduceOutcome::Ignored;
        };
        match apply_patch(&self.items[idx], patch) {
            Ok(updated) => {
                self.items[idx] = updated;
                ReduceOutcome::Updated
            }
            Err(_) => ReduceOutcome::Ignored,
        }
    }

    fn position(&self, id: &EntityId) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    fn recount_local(&mut self) {
        self.unread.recompute(count_unread(&self.items), None);
    }
}
