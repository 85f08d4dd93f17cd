use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::{
    reducer::{ReduceOutcome, UnreadCounter, absorb, apply_patch, count_unread},
    types::{Conversation, EntityEvent, EntityId, Message, PushEvent},
};

/// Default window in which a server echo may confirm a provisional message.
pub const DEFAULT_RECONCILE_WINDOW: Duration = Duration::from_secs(30);

/// Ordered message list for one conversation.
///
/// Messages are kept in ascending `created_at` order; equal timestamps keep
/// arrival order. Provisional messages (ids from [`EntityId::provisional`])
/// live in the same list until a confirmed message replaces them.
#[derive(Debug, Clone)]
pub struct MessageStore {
    conversation_id: EntityId,
    messages: Vec<Message>,
    unread: UnreadCounter,
    deleted: HashSet<EntityId>,
    reconcile_window_ms: i64,
}

impl MessageStore {
    pub fn new(conversation_id: EntityId) -> Self {
        Self::with_reconcile_window(conversation_id, DEFAULT_RECONCILE_WINDOW)
    }

    pub fn with_reconcile_window(conversation_id: EntityId, window: Duration) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            unread: UnreadCounter::default(),
            deleted: HashSet::new(),
            reconcile_window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn conversation_id(&self) -> &EntityId {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &EntityId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Unread messages sent by other participants.
    pub fn unread_count(&self) -> u64 {
        self.unread.value()
    }

    /// Messages still waiting for server confirmation, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(|message| message.id.is_provisional())
    }

    /// Insert a locally composed message before the server confirmed it.
    pub fn insert_provisional(
        &mut self,
        provisional_id: EntityId,
        sender_id: EntityId,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Message {
        let message = Message {
            id: provisional_id,
            conversation_id: self.conversation_id.clone(),
            sender_id,
            content: content.into(),
            created_at,
            is_own: true,
            is_read: true,
        };
        self.insert_sorted(message.clone());
        message
    }

    /// Fold one chat push event into the list.
    ///
    /// An own creation that matches no known id confirms the oldest pending
    /// message with identical content inside the reconcile window.
    pub fn apply(&mut self, push: PushEvent<Message>) -> ReduceOutcome {
        let outcome = match push.event {
            EntityEvent::Created(message) => {
                self.deleted.remove(&message.id);
                self.absorb_created(message)
            }
            EntityEvent::Updated { id, patch } => self.patch(&id, &patch),
            EntityEvent::Deleted { id } => {
                let outcome = match self.position(&id) {
                    Some(idx) => {
                        self.messages.remove(idx);
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
                .recompute(count_unread(&self.messages), push.unread_count);
        } else if let Some(count) = push.unread_count {
            self.unread.set_authoritative(count);
        }
        outcome
    }

    /// Replace a specific provisional message with the server's copy.
    ///
    /// Tolerates the echo having arrived first: the confirmed id is then
    /// refreshed in place and any leftover provisional copy dropped.
    pub fn confirm_provisional(
        &mut self,
        provisional_id: &EntityId,
        confirmed: Message,
    ) -> ReduceOutcome {
        let had_provisional = match self.position(provisional_id) {
            Some(idx) => {
                self.messages.remove(idx);
                true
            }
            None => false,
        };

        let outcome = match self.position(&confirmed.id) {
            Some(idx) => {
                absorb(&mut self.messages[idx], confirmed);
                ReduceOutcome::Replaced
            }
            None => {
                self.insert_sorted(confirmed);
                ReduceOutcome::Inserted
            }
        };
        self.recount_local();

        if had_provisional {
            ReduceOutcome::Reconciled {
                provisional_id: provisional_id.clone(),
            }
        } else {
            outcome
        }
    }

    /// Drop a provisional message whose send failed.
    pub fn discard_provisional(&mut self, provisional_id: &EntityId) -> bool {
        if !provisional_id.is_provisional() {
            return false;
        }
        match self.position(provisional_id) {
            Some(idx) => {
                self.messages.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Merge one REST page of history. Returns the number of new messages.
    ///
    /// Messages deleted by a push event are skipped.
    pub fn merge_page(&mut self, page: Vec<Message>) -> usize {
        let mut added = 0;
        for message in page {
            if message.conversation_id != self.conversation_id
                || self.deleted.contains(&message.id)
            {
                continue;
            }
            if matches!(self.absorb_created(message), ReduceOutcome::Inserted) {
                added += 1;
            }
        }
        self.unread.set_derived(count_unread(&self.messages));
        added
    }

    /// Flip every message to read. Returns how many changed.
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for message in self.messages.iter_mut().filter(|m| !m.is_read) {
            message.is_read = true;
            changed += 1;
        }
        self.recount_local();
        changed
    }

    fn absorb_created(&mut self, message: Message) -> ReduceOutcome {
        if message.conversation_id != self.conversation_id {
            return ReduceOutcome::Ignored;
        }
        if let Some(idx) = self.position(&message.id) {
            absorb(&mut self.messages[idx], message);
            return ReduceOutcome::Replaced;
        }
        if message.is_own
            && let Some(idx) = self.matching_provisional(&message)
        {
            let provisional = self.messages.remove(idx);
            self.insert_sorted(message);
            return ReduceOutcome::Reconciled {
                provisional_id: provisional.id,
            };
        }
        self.insert_sorted(message);
        ReduceOutcome::Inserted
    }

    fn matching_provisional(&self, confirmed: &Message) -> Option<usize> {
        self.messages.iter().position(|candidate| {
            candidate.id.is_provisional()
                && candidate.content == confirmed.content
                && (confirmed.created_at - candidate.created_at)
                    .num_milliseconds()
                    .abs()
                    <= self.reconcile_window_ms
        })
    }

    fn patch(&mut self, id: &EntityId, patch: &Map<String, Value>) -> ReduceOutcome {
        let Some(idx) = self.position(id) else {
            return ReduceOutcome::Ignored;
        };
        match apply_patch(&self.messages[idx], patch) {
            Ok(updated) => {
                let reorder = updated.created_at != self.messages[idx].created_at;
                if reorder {
                    self.messages.remove(idx);
                    self.insert_sorted(updated);
                } else {
                    self.messages[idx] = updated;
                }
                ReduceOutcome::Updated
            }
            Err(_) => ReduceOutcome::Ignored,
        }
    }

    fn insert_sorted(&mut self, message: Message) {
        let idx = self
            .messages
            .partition_point(|existing| existing.created_at <= message.created_at);
        self.messages.insert(idx, message);
    }

    fn position(&self, id: &EntityId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    fn recount_local(&mut self) {
        self.unread.recompute(count_unread(&self.messages), None);
    }
}

/// Conversation list ordered by most recent activity.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &EntityId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Sum of per-conversation unread counts.
    pub fn unread_total(&self) -> u64 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    /// Insert or replace one conversation.
    pub fn upsert(&mut self, conversation: Conversation) -> ReduceOutcome {
        let outcome = match self.position(&conversation.id) {
            Some(idx) => {
                self.conversations[idx] = conversation;
                ReduceOutcome::Replaced
            }
            None => {
                self.conversations.push(conversation);
                ReduceOutcome::Inserted
            }
        };
        self.sort();
        outcome
    }

    /// Merge a REST page field by field. Returns the number of new conversations.
    ///
    /// Activity observed live (a newer `last_message` and the unread count
    /// that came with it) survives a slower or cached page.
    pub fn merge_page(&mut self, page: Vec<Conversation>) -> usize {
        let mut added = 0;
        for incoming in page {
            match self.position(&incoming.id) {
                Some(idx) => merge_from_server(&mut self.conversations[idx], incoming),
                None => {
                    self.conversations.push(incoming);
                    added += 1;
                }
            }
        }
        self.sort();
        added
    }

    /// Bump a conversation for a newly observed message.
    ///
    /// Messages from other participants that are still unread increment the
    /// conversation's unread count.
    pub fn record_message(&mut self, message: &Message) -> ReduceOutcome {
        let Some(idx) = self.position(&message.conversation_id) else {
            return ReduceOutcome::Ignored;
        };
        let conversation = &mut self.conversations[idx];

        let newer = conversation
            .last_message
            .as_ref()
            .is_none_or(|last| last.created_at <= message.created_at);
        if newer {
            conversation.last_message = Some(message.clone());
        }
        if conversation
            .updated_at
            .is_none_or(|updated| updated < message.created_at)
        {
            conversation.updated_at = Some(message.created_at);
        }
        if !message.is_own && !message.is_read {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }

        self.sort();
        ReduceOutcome::Updated
    }

    /// Zero one conversation's unread count. Returns `false` when nothing changed.
    pub fn mark_read(&mut self, id: &EntityId) -> bool {
        match self.position(id) {
            Some(idx) if self.conversations[idx].unread_count > 0 => {
                self.conversations[idx].unread_count = 0;
                true
            }
            _ => false,
        }
    }

    fn position(&self, id: &EntityId) -> Option<usize> {
        self.conversations.iter().position(|c| &c.id == id)
    }

    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }
}

fn merge_from_server(local: &mut Conversation, incoming: Conversation) {
    let local_is_newer = match (&local.last_message, &incoming.last_message) {
        (Some(held), Some(fetched)) => held.created_at > fetched.created_at,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if !local_is_newer {
        local.last_message = incoming.last_message;
        local.unread_count = incoming.unread_count;
    }
    if !incoming.participants.is_empty() {
        local.participants = incoming.participants;
    }
    local.updated_at = local.updated_at.max(incoming.updated_at);
}
