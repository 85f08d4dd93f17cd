//! Messages facade: conversation list, per-conversation history, live chat
//! channels and provisional sends.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sync_core::{
    ConnectionState, Conversation, ConversationStore, EntityEvent, EntityId, Message,
    MessageStore, OutboundPayload, PageRequest, PushEvent, ReduceOutcome, SendOutcome, StreamKey,
    SyncError, SyncErrorCategory, SyncEvent, SyncEventBus, decode_entity, decode_push_value,
    normalization::snake_case_keys, normalize_list, normalize_send_outcome,
};
use sync_platform::{Clock, IdSource};
use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    connection::{ChannelEvent, ChannelEventKind, ConnectionManager},
    fetch::ResilientFetcher,
    pump::{PumpEvent, PumpRegistry},
    rest::RestRequest,
};

const CONVERSATIONS_PATH: &str = "conversations/";
const SEARCH_PATH: &str = "conversations/search/";

#[derive(Default)]
struct MessagesState {
    conversations: ConversationStore,
    threads: HashMap<EntityId, MessageStore>,
}

impl MessagesState {
    fn thread(&mut self, conversation_id: &EntityId, window: Duration) -> &mut MessageStore {
        self.threads
            .entry(conversation_id.clone())
            .or_insert_with(|| MessageStore::with_reconcile_window(conversation_id.clone(), window))
    }
}

/// Injected services the messages facade needs beyond the shared runtime.
pub struct MessagesDeps {
    pub fetcher: ResilientFetcher,
    pub connections: ConnectionManager,
    pub bus: SyncEventBus,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdSource>,
}

struct MessagesInner {
    config: Arc<SyncConfig>,
    user_id: EntityId,
    deps: MessagesDeps,
    state: Mutex<MessagesState>,
    pumps: PumpRegistry,
}

impl MessagesInner {
    fn state(&self) -> MutexGuard<'_, MessagesState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_thread(&self, conversation_id: &EntityId, unread_count: u64) {
        self.deps.bus.emit(SyncEvent::MessagesUpdated {
            conversation_id: conversation_id.clone(),
            unread_count,
        });
    }

    fn emit_conversations(&self, unread_total: u64) {
        self.deps
            .bus
            .emit(SyncEvent::ConversationsUpdated { unread_total });
    }

    fn decode_message(&self, value: Value, conversation_id: &EntityId) -> Result<Message, SyncError> {
        let mut message: Message = decode_entity(with_conversation_id(value, conversation_id))?;
        message.is_own = message.sender_id == self.user_id;
        Ok(message)
    }

    fn decode_conversation(&self, value: Value) -> Result<Conversation, SyncError> {
        let mut value = snake_case_keys(value);
        if let Value::Object(map) = &mut value
            && let Some(id) = map.get("id").cloned()
            && let Some(Value::Object(last)) = map.get_mut("last_message")
        {
            last.entry("conversation_id").or_insert(id);
        }

        let mut conversation: Conversation = serde_json::from_value(value)?;
        if let Some(last) = conversation.last_message.as_mut() {
            last.is_own = last.sender_id == self.user_id;
        }
        Ok(conversation)
    }

    fn decode_conversations(&self, body: Value) -> Result<Vec<Conversation>, SyncError> {
        normalize_list::<Value>(body)?
            .into_iter()
            .map(|value| self.decode_conversation(value))
            .collect()
    }

    fn decode_frame(
        &self,
        conversation_id: &EntityId,
        text: &str,
    ) -> Result<PushEvent<Message>, SyncError> {
        let mut frame: Value = serde_json::from_str(text)?;
        if let Some(entity) = frame.get_mut("entity") {
            *entity = with_conversation_id(entity.take(), conversation_id);
        }

        let mut push = decode_push_value::<Message>(frame)?;
        if let EntityEvent::Created(message) = &mut push.event {
            message.is_own = message.sender_id == self.user_id;
        }
        Ok(push)
    }

    fn handle_pump_event(self: &Arc<Self>, conversation_id: &EntityId, event: PumpEvent) {
        match event {
            PumpEvent::Channel(event) => self.handle_event(conversation_id, event),
            PumpEvent::Lagged { key, skipped } => {
                warn!(key = %key, skipped, "chat events lost; resynchronizing");
                self.resync(conversation_id.clone());
            }
        }
    }

    /// Reload the newest history page of one conversation, bypassing cached pages.
    fn resync(self: &Arc<Self>, conversation_id: EntityId) {
        self.deps.fetcher.invalidate_prefix(CONVERSATIONS_PATH);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = inner.load(&conversation_id, inner.config.first_page()).await {
                warn!(conversation_id = %conversation_id, error = %err, "chat history reload failed");
            }
        });
    }

    async fn load(
        &self,
        conversation_id: &EntityId,
        page: PageRequest,
    ) -> Result<Vec<Message>, SyncError> {
        let mut request = RestRequest::get(format!("{CONVERSATIONS_PATH}{conversation_id}/messages/"));
        for (key, value) in page.params() {
            request = request.with_param(key, value);
        }
        let body = self.deps.fetcher.get(&request).await?;
        let messages = normalize_list::<Value>(body)?
            .into_iter()
            .map(|value| self.decode_message(value, conversation_id))
            .collect::<Result<Vec<_>, _>>()?;

        let unread_count = {
            let mut state = self.state();
            let thread = state.thread(conversation_id, self.config.reconcile_window());
            thread.merge_page(messages.clone());
            thread.unread_count()
        };
        self.emit_thread(conversation_id, unread_count);
        Ok(messages)
    }

    fn handle_event(&self, conversation_id: &EntityId, event: ChannelEvent) {
        match event.kind {
            ChannelEventKind::State(state) => {
                self.deps.bus.emit(SyncEvent::ConnectionChanged {
                    key: event.key,
                    state,
                });
            }
            ChannelEventKind::Frame(text) => match self.decode_frame(conversation_id, &text) {
                Ok(push) => self.apply_push(conversation_id, push),
                Err(err) => {
                    warn!(key = %event.key, error = %err, "dropping undecodable chat frame");
                }
            },
        }
    }

    fn apply_push(&self, conversation_id: &EntityId, push: PushEvent<Message>) {
        let created = match &push.event {
            EntityEvent::Created(message) => Some(message.clone()),
            _ => None,
        };

        let mut state = self.state();
        let thread = state.thread(conversation_id, self.config.reconcile_window());
        let outcome = thread.apply(push);
        let unread_count = thread.unread_count();

        let mut ack = None;
        let mut unread_total = None;
        if let Some(message) = created
            && matches!(
                outcome,
                ReduceOutcome::Inserted | ReduceOutcome::Reconciled { .. }
            )
        {
            if let ReduceOutcome::Reconciled { provisional_id } = &outcome {
                ack = Some(normalize_send_outcome(
                    provisional_id.clone(),
                    SendOutcome::Success {
                        message_id: message.id.clone(),
                    },
                ));
            }
            if state.conversations.record_message(&message).changed() {
                unread_total = Some(state.conversations.unread_total());
            }
        }
        drop(state);

        debug!(conversation_id = %conversation_id, ?outcome, unread_count, "chat event applied");
        if matches!(
            outcome,
            ReduceOutcome::Inserted | ReduceOutcome::Reconciled { .. } | ReduceOutcome::Removed
        ) {
            self.deps.fetcher.invalidate_prefix(CONVERSATIONS_PATH);
        }
        if outcome.changed() {
            self.emit_thread(conversation_id, unread_count);
        }
        if let Some(unread_total) = unread_total {
            self.emit_conversations(unread_total);
        }
        if let Some(ack) = ack {
            self.deps.bus.emit(ack);
        }
    }

    fn confirm_send(&self, conversation_id: &EntityId, provisional_id: &EntityId, confirmed: Message) {
        let mut state = self.state();
        let thread = state.thread(conversation_id, self.config.reconcile_window());
        let outcome = thread.confirm_provisional(provisional_id, confirmed.clone());
        let unread_count = thread.unread_count();

        let mut unread_total = None;
        if matches!(
            outcome,
            ReduceOutcome::Inserted | ReduceOutcome::Reconciled { .. }
        ) && state.conversations.record_message(&confirmed).changed()
        {
            unread_total = Some(state.conversations.unread_total());
        }
        drop(state);

        self.emit_thread(conversation_id, unread_count);
        if let Some(unread_total) = unread_total {
            self.emit_conversations(unread_total);
        }
        // Otherwise the channel echo got there first and already acknowledged it.
        if matches!(outcome, ReduceOutcome::Reconciled { .. }) {
            self.deps.bus.emit(normalize_send_outcome(
                provisional_id.clone(),
                SendOutcome::Success {
                    message_id: confirmed.id,
                },
            ));
        }
    }

    fn fail_send(&self, conversation_id: &EntityId, provisional_id: &EntityId, error: SyncError) {
        let unread_count = {
            let mut state = self.state();
            let thread = state.thread(conversation_id, self.config.reconcile_window());
            thread.discard_provisional(provisional_id);
            thread.unread_count()
        };
        warn!(
            conversation_id = %conversation_id,
            provisional_id = %provisional_id,
            error = %error,
            "message send failed"
        );
        self.emit_thread(conversation_id, unread_count);
        self.deps
            .bus
            .emit(normalize_send_outcome(provisional_id.clone(), SendOutcome::Failure { error }));
    }
}

/// Fill in the owning conversation when a message payload omits it.
fn with_conversation_id(mut value: Value, conversation_id: &EntityId) -> Value {
    if let Value::Object(map) = &mut value
        && !map.contains_key("conversation_id")
        && !map.contains_key("conversationId")
    {
        map.insert(
            "conversation_id".to_owned(),
            Value::String(conversation_id.to_string()),
        );
    }
    value
}

fn timestamp(now_ms: u64) -> DateTime<Utc> {
    i64::try_from(now_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_default()
}

/// Conversations and messages for the local user.
#[derive(Clone)]
pub struct MessagesFacade {
    inner: Arc<MessagesInner>,
}

impl MessagesFacade {
    pub fn new(config: Arc<SyncConfig>, user_id: EntityId, deps: MessagesDeps) -> Self {
        Self {
            inner: Arc::new(MessagesInner {
                config,
                user_id,
                deps,
                state: Mutex::new(MessagesState::default()),
                pumps: PumpRegistry::default(),
            }),
        }
    }

    /// Fetch one page of the conversation list.
    pub async fn load_conversations(
        &self,
        page: PageRequest,
    ) -> Result<Vec<Conversation>, SyncError> {
        let mut request = RestRequest::get(CONVERSATIONS_PATH);
        for (key, value) in page.params() {
            request = request.with_param(key, value);
        }
        let body = self.inner.deps.fetcher.get(&request).await?;
        let conversations = self.inner.decode_conversations(body)?;

        let unread_total = {
            let mut state = self.inner.state();
            state.conversations.merge_page(conversations.clone());
            state.conversations.unread_total()
        };
        self.inner.emit_conversations(unread_total);
        Ok(conversations)
    }

    /// Fetch one page of history for a conversation.
    pub async fn load(
        &self,
        conversation_id: &EntityId,
        page: PageRequest,
    ) -> Result<Vec<Message>, SyncError> {
        self.inner.load(conversation_id, page).await
    }

    /// Subscribe to a conversation's chat channel. A no-op when live channels are off.
    pub fn open(&self, conversation_id: &EntityId) -> Result<(), SyncError> {
        if !self.inner.config.live_channels {
            debug!(conversation_id = %conversation_id, "live channels disabled; chat uses REST only");
            return Ok(());
        }
        let url = self.inner.config.chat_url(conversation_id)?;
        let handle = self
            .inner
            .deps
            .connections
            .subscribe(&StreamKey::chat(conversation_id), &url);

        let inner = Arc::clone(&self.inner);
        let conversation_id = conversation_id.clone();
        self.inner.pumps.attach(handle, move |event| {
            inner.handle_pump_event(&conversation_id, event);
        });
        Ok(())
    }

    pub fn close(&self, conversation_id: &EntityId) {
        let key = StreamKey::chat(conversation_id);
        self.inner.deps.connections.unsubscribe(&key);
        self.inner.pumps.detach(&key);
    }

    /// Send a chat message.
    ///
    /// A provisional message is inserted before any I/O. Over an open channel
    /// the server echo confirms it later; otherwise the message is posted
    /// once through REST and the provisional copy is confirmed or dropped.
    pub async fn send(&self, conversation_id: &EntityId, content: &str) -> Result<Message, SyncError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "empty_message",
                "message content is empty",
            ));
        }

        let provisional_id = EntityId::provisional(self.inner.deps.ids.next_id());
        let created_at = timestamp(self.inner.deps.clock.now_ms());
        let (provisional, unread_count) = {
            let mut state = self.inner.state();
            let thread = state.thread(conversation_id, self.inner.config.reconcile_window());
            let message = thread.insert_provisional(
                provisional_id.clone(),
                self.inner.user_id.clone(),
                content,
                created_at,
            );
            (message, thread.unread_count())
        };
        self.inner.emit_thread(conversation_id, unread_count);

        let key = StreamKey::chat(conversation_id);
        match self
            .inner
            .deps
            .connections
            .send(&key, &OutboundPayload::chat(content))
        {
            Ok(()) => {
                debug!(key = %key, provisional_id = %provisional_id, "message queued on channel");
                return Ok(provisional);
            }
            Err(err) => {
                debug!(key = %key, reason = %err, "sending message through REST");
            }
        }

        let request = RestRequest::post(
            format!("{CONVERSATIONS_PATH}{conversation_id}/messages/"),
            json!({ "content": content }),
        );
        let confirmed = match self.inner.deps.fetcher.mutate_once(&request).await {
            Ok(body) => self.inner.decode_message(body, conversation_id),
            Err(err) => Err(err),
        };
        match confirmed {
            Ok(message) => {
                self.inner
                    .confirm_send(conversation_id, &provisional_id, message.clone());
                Ok(message)
            }
            Err(err) => {
                self.inner
                    .fail_send(conversation_id, &provisional_id, err.clone());
                Err(err)
            }
        }
    }

    /// Mark a conversation read locally, then on the server.
    pub async fn mark_read(&self, conversation_id: &EntityId) -> Result<(), SyncError> {
        let (unread_count, unread_total) = {
            let mut state = self.inner.state();
            let thread = state.thread(conversation_id, self.inner.config.reconcile_window());
            thread.mark_all_read();
            let unread_count = thread.unread_count();
            state.conversations.mark_read(conversation_id);
            (unread_count, state.conversations.unread_total())
        };
        self.inner.emit_thread(conversation_id, unread_count);
        self.inner.emit_conversations(unread_total);

        self.inner
            .deps
            .fetcher
            .mutate(&RestRequest::post(
                format!("{CONVERSATIONS_PATH}{conversation_id}/mark_as_read/"),
                json!({}),
            ))
            .await
            .map(|_| ())
    }

    /// Search conversations. Results are not merged into the list.
    pub async fn search(&self, query: &str) -> Result<Vec<Conversation>, SyncError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let body = self
            .inner
            .deps
            .fetcher
            .get(&RestRequest::get(SEARCH_PATH).with_param("q", query))
            .await?;
        self.inner.decode_conversations(body)
    }

    /// Create (or fetch the existing) conversation with one participant.
    pub async fn start_conversation(
        &self,
        participant_id: &EntityId,
    ) -> Result<Conversation, SyncError> {
        let body = self
            .inner
            .deps
            .fetcher
            .mutate(&RestRequest::post(
                CONVERSATIONS_PATH,
                json!({ "participant_id": participant_id }),
            ))
            .await?;
        let conversation = self.inner.decode_conversation(body)?;
        info!(conversation_id = %conversation.id, "conversation started");

        let unread_total = {
            let mut state = self.inner.state();
            state.conversations.upsert(conversation.clone());
            state.conversations.unread_total()
        };
        self.inner.emit_conversations(unread_total);
        Ok(conversation)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.state().conversations.conversations().to_vec()
    }

    pub fn messages(&self, conversation_id: &EntityId) -> Vec<Message> {
        self.inner
            .state()
            .threads
            .get(conversation_id)
            .map(|thread| thread.messages().to_vec())
            .unwrap_or_default()
    }

    /// Messages of a conversation still awaiting confirmation.
    pub fn pending(&self, conversation_id: &EntityId) -> Vec<Message> {
        self.inner
            .state()
            .threads
            .get(conversation_id)
            .map(|thread| thread.pending().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unread_total(&self) -> u64 {
        self.inner.state().conversations.unread_total()
    }

    pub fn connection_state(&self, conversation_id: &EntityId) -> Option<ConnectionState> {
        self.inner
            .deps
            .connections
            .state(&StreamKey::chat(conversation_id))
    }

    pub(crate) fn shutdown(&self) {
        self.inner.pumps.abort_all();
    }
}
