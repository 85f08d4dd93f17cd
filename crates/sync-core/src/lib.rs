//! Core synchronization contract shared between the runtime and UI consumers.
//!
//! This crate defines the push/REST payload types, the connection lifecycle
//! model, retry policies, reducers for the in-memory stores, the response
//! cache and the event bus. Nothing in here performs I/O.

/// Response cache keyed by request fingerprint.
pub mod cache;
/// Broadcast bus for facade events.
pub mod channel;
/// Message and conversation stores with provisional reconciliation.
pub mod conversation;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Payload normalization helpers (lists, push frames, send acknowledgements).
pub mod normalization;
/// Generic entity reducer and unread counter.
pub mod reducer;
/// Backoff policies used by reconnect and fetch retry loops.
pub mod retry;
/// Push channel connection state machine.
pub mod state_machine;
/// Entity, wire and event types.
pub mod types;

pub use cache::{Fingerprint, ResponseCache};
pub use channel::{EventStream, SyncEventBus};
pub use conversation::{ConversationStore, DEFAULT_RECONCILE_WINDOW, MessageStore};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use normalization::{
    SendOutcome, decode_entity, decode_push, decode_push_value, normalize_list,
    normalize_send_outcome, unread_count_from,
};
pub use reducer::{Entity, EntityStore, NotificationStore, ReduceOutcome, UnreadCounter};
pub use retry::{FetchRetryPolicy, ReconnectPolicy};
pub use state_machine::{CloseReason, ConnectionDirective, ConnectionStateMachine};
pub use types::{
    ConnectionState, Conversation, EntityEvent, EntityId, MAX_PAGE_LIMIT, Message, Notification,
    NotificationCommand, NotificationKind, OutboundPayload, PageRequest, PushEnvelope, PushEvent,
    PushKind, SendAck, StreamKey, SyncEvent,
};
