use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SyncError;

const PROVISIONAL_ID_PREFIX: &str = "local-";

/// Identifier of one push channel instance.
///
/// Notifications are keyed by user, chat channels by conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamKey(String);

impl StreamKey {
    /// Build a key from an already-formatted value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Stream carrying notifications for one user.
    pub fn notifications(user_id: &EntityId) -> Self {
        Self(format!("notifications:{user_id}"))
    }

    /// Stream carrying chat messages for one conversation.
    pub fn chat(conversation_id: &EntityId) -> Self {
        Self(format!("chat:{conversation_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned or locally synthesized entity identifier.
///
/// The backend emits numeric ids; they are kept as text so provisional ids
/// (`local-<token>`) share the same type. Ids in canonical decimal form
/// serialize back as JSON numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Build a provisional id for a locally created entity.
    pub fn provisional(token: impl fmt::Display) -> Self {
        Self(format!("{PROVISIONAL_ID_PREFIX}{token}"))
    }

    /// Whether this id was synthesized locally and still awaits reconciliation.
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.parse::<u64>() {
            Ok(number) if number.to_string() == self.0 => serializer.serialize_u64(number),
            _ => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(number) => Self(number.to_string()),
            Raw::Text(text) => Self(text),
        })
    }
}

/// Lifecycle state of one push channel connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created but not yet asked to connect.
    Idle,
    /// Handshake in flight.
    Connecting,
    /// Handshake completed; frames flow in both directions.
    Open,
    /// Clean close (code 1000) requested by the local side.
    Closing,
    /// Waiting for the backoff timer before the next connect attempt.
    Reconnecting,
    /// Terminal; no further reconnection is attempted.
    Closed,
}

impl ConnectionState {
    /// States in which a second subscribe reuses the existing connection.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Connecting | Self::Open | Self::Reconnecting
        )
    }
}

/// Kind of marketplace notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A provider postulated to one of the customer's petitions.
    NewPostulation,
    /// The customer accepted the provider's postulation.
    PostulationAccepted,
    /// The customer rejected the provider's postulation.
    PostulationRejected,
    /// A petition the user follows changed.
    PetitionUpdated,
    /// A chat message arrived.
    NewMessage,
    /// Platform announcement.
    System,
    #[default]
    #[serde(other)]
    Other,
}

/// Notification entity as held by the notifications store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: EntityId,
    #[serde(rename = "type", default)]
    pub kind: NotificationKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Server-rendered relative time ("5 minutes ago").
    #[serde(default)]
    pub time_ago: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Chat message entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: EntityId,
    pub conversation_id: EntityId,
    pub sender_id: EntityId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Sent by the local user. Derived by the messages facade from `sender_id`.
    #[serde(default)]
    pub is_own: bool,
    #[serde(default)]
    pub is_read: bool,
}

/// Conversation entity shown in the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: EntityId,
    #[serde(default)]
    pub participants: Vec<EntityId>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Upper bound applied to every page size sent to the backend.
pub const MAX_PAGE_LIMIT: u16 = 100;

/// One page of a paginated REST list (`?page=&limit=`), 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u16,
}

impl PageRequest {
    pub fn new(page: u32, limit: u16) -> Self {
        Self {
            page: page.max(1),
            limit: Self::bounded_limit(limit, MAX_PAGE_LIMIT),
        }
    }

    /// Clamp a requested pagination limit against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(MAX_PAGE_LIMIT)
    }

    /// Query parameters for this page.
    pub fn params(&self) -> [(&'static str, String); 2] {
        [("page", self.page.to_string()), ("limit", self.limit.to_string())]
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// Discriminator of an inbound push payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    Creation,
    Update,
    Deletion,
    ConnectionAck,
}

/// Raw inbound push payload: `{ type, entity, unread_count? }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushEnvelope {
    #[serde(rename = "type")]
    pub kind: PushKind,
    #[serde(default)]
    pub entity: serde_json::Value,
    #[serde(default)]
    pub unread_count: Option<u64>,
}

/// Typed change decoded from a push envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent<T> {
    /// A new entity (or a redelivery of a known one).
    Created(T),
    /// Partial update of a known entity, keyed by id.
    Updated {
        id: EntityId,
        patch: serde_json::Map<String, serde_json::Value>,
    },
    /// Entity removal.
    Deleted { id: EntityId },
    /// Channel handshake acknowledgement; may carry only an unread count.
    ConnectionAck,
}

/// One decoded push event plus the optional authoritative unread count.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent<T> {
    pub event: EntityEvent<T>,
    pub unread_count: Option<u64>,
}

impl<T> PushEvent<T> {
    pub fn new(event: EntityEvent<T>) -> Self {
        Self {
            event,
            unread_count: None,
        }
    }

    pub fn with_unread_count(mut self, unread_count: u64) -> Self {
        self.unread_count = Some(unread_count);
        self
    }
}

/// Typed notification commands sent over the notifications channel.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationCommand {
    MarkAsRead { id: EntityId },
    GetUnreadCount,
}

/// Outbound channel payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OutboundPayload {
    /// Chat text: `{ "message": "..." }`.
    Chat { message: String },
    /// Notification command: `{ "type": "...", ... }`.
    Command(NotificationCommand),
}

impl OutboundPayload {
    pub fn chat(message: impl Into<String>) -> Self {
        Self::Chat {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(SyncError::from)
    }
}

/// Acknowledgement for a provisional message send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Provisional id the message was inserted under.
    pub provisional_id: EntityId,
    /// Server id on success.
    pub message_id: Option<EntityId>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Event broadcast by the synchronization facades.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncEvent {
    /// A push channel changed state.
    ConnectionChanged {
        key: StreamKey,
        state: ConnectionState,
    },
    /// The notifications store changed.
    NotificationsUpdated { unread_count: u64 },
    /// The conversation list changed.
    ConversationsUpdated { unread_total: u64 },
    /// The message list of one conversation changed.
    MessagesUpdated {
        conversation_id: EntityId,
        unread_count: u64,
    },
    /// Outcome of a provisional send.
    SendAck(SendAck),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn entity_ids_accept_numbers_and_strings() {
        let numeric: EntityId = serde_json::from_value(json!(7)).expect("numeric id should parse");
        let text: EntityId = serde_json::from_value(json!("abc")).expect("text id should parse");
        assert_eq!(numeric, EntityId::from(7));
        assert_eq!(text.as_str(), "abc");
    }

    #[test]
    fn numeric_entity_ids_serialize_as_numbers() {
        assert_eq!(
            serde_json::to_value(EntityId::from(42)).expect("id should serialize"),
            json!(42)
        );
        assert_eq!(
            serde_json::to_value(EntityId::provisional("x1")).expect("id should serialize"),
            json!("local-x1")
        );
    }

    #[test]
    fn padded_numeric_text_ids_stay_text() {
        let id = EntityId::from("007");
        assert_eq!(
            serde_json::to_value(&id).expect("id should serialize"),
            json!("007")
        );
        let back: EntityId =
            serde_json::from_value(json!("007")).expect("id should deserialize");
        assert_eq!(back, id);
        assert_eq!(
            serde_json::to_value(EntityId::from("+5")).expect("id should serialize"),
            json!("+5")
        );
    }

    #[test]
    fn provisional_ids_are_recognized() {
        assert!(EntityId::provisional(3).is_provisional());
        assert!(!EntityId::from(3).is_provisional());
    }

    #[test]
    fn stream_keys_are_scoped_by_channel_kind() {
        let id = EntityId::from(42);
        assert_eq!(StreamKey::notifications(&id).as_str(), "notifications:42");
        assert_eq!(StreamKey::chat(&id).as_str(), "chat:42");
    }

    #[test]
    fn unknown_notification_kinds_fall_back_to_other() {
        let notification: Notification = serde_json::from_value(json!({
            "id": 1,
            "type": "brand_new_kind",
        }))
        .expect("notification should parse");
        assert_eq!(notification.kind, NotificationKind::Other);
        assert!(!notification.is_read);
    }

    #[test]
    fn outbound_payloads_match_wire_shapes() {
        assert_eq!(
            OutboundPayload::chat("hi").to_json().expect("chat payload"),
            r#"{"message":"hi"}"#
        );
        assert_eq!(
            OutboundPayload::Command(NotificationCommand::MarkAsRead {
                id: EntityId::from(7)
            })
            .to_json()
            .expect("mark payload"),
            r#"{"type":"mark_as_read","id":7}"#
        );
        assert_eq!(
            OutboundPayload::Command(NotificationCommand::GetUnreadCount)
                .to_json()
                .expect("count payload"),
            r#"{"type":"get_unread_count"}"#
        );
    }

    #[test]
    fn bounds_page_limit_for_safety() {
        assert_eq!(PageRequest::bounded_limit(0, 200), 1);
        assert_eq!(PageRequest::bounded_limit(25, 10), 10);
        assert_eq!(PageRequest::bounded_limit(150, 500), 100);
        assert_eq!(PageRequest::new(0, 500), PageRequest { page: 1, limit: 100 });
    }

    #[test]
    fn push_envelope_defaults_optional_fields() {
        let envelope: PushEnvelope =
            serde_json::from_str(r#"{"type":"connection_ack"}"#).expect("envelope should parse");
        assert_eq!(envelope.kind, PushKind::ConnectionAck);
        assert_eq!(envelope.unread_count, None);
        assert!(envelope.entity.is_null());
    }
}
