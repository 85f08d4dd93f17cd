use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::{
    error::{SyncError, SyncErrorCategory},
    types::{EntityEvent, EntityId, PushEnvelope, PushEvent, PushKind, SendAck, SyncEvent},
};

/// Internal helper describing send success/failure before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The backend confirmed the message under this id.
    Success { message_id: EntityId },
    /// The send failed with error details.
    Failure { error: SyncError },
}

/// Convert a send outcome to a stable `SyncEvent::SendAck`.
pub fn normalize_send_outcome(provisional_id: EntityId, outcome: SendOutcome) -> SyncEvent {
    match outcome {
        SendOutcome::Success { message_id } => SyncEvent::SendAck(SendAck {
            provisional_id,
            message_id: Some(message_id),
            error_code: None,
        }),
        SendOutcome::Failure { error } => SyncEvent::SendAck(SendAck {
            provisional_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Normalize a list response into entities.
///
/// Accepts a bare array or a `{ "results": [...] }` envelope.
pub fn normalize_list<T: DeserializeOwned>(body: Value) -> Result<Vec<T>, SyncError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            _ => return Err(unexpected_shape("list response has no 'results' array")),
        },
        Value::Null => Vec::new(),
        _ => return Err(unexpected_shape("list response is neither array nor object")),
    };

    items.into_iter().map(decode_entity).collect()
}

/// Decode one entity after normalizing its keys to snake_case.
pub fn decode_entity<T: DeserializeOwned>(value: Value) -> Result<T, SyncError> {
    serde_json::from_value(snake_case_keys(value)).map_err(SyncError::from)
}

/// Extract an unread count from `{ "unread_count": n }`, `{ "count": n }` or a bare number.
pub fn unread_count_from(body: &Value) -> Option<u64> {
    match body {
        Value::Number(number) => number.as_u64(),
        Value::Object(map) => map
            .get("unread_count")
            .or_else(|| map.get("unreadCount"))
            .or_else(|| map.get("count"))
            .and_then(Value::as_u64),
        _ => None,
    }
}

/// Decode one inbound push frame into a typed event.
pub fn decode_push<T: DeserializeOwned>(frame: &str) -> Result<PushEvent<T>, SyncError> {
    decode_push_value(serde_json::from_str(frame)?)
}

/// [`decode_push`] for a frame that was already parsed.
pub fn decode_push_value<T: DeserializeOwned>(frame: Value) -> Result<PushEvent<T>, SyncError> {
    let envelope: PushEnvelope = serde_json::from_value(frame)?;
    let event = match envelope.kind {
        PushKind::Creation => EntityEvent::Created(decode_entity(envelope.entity)?),
        PushKind::Update => {
            let patch = match snake_case_keys(envelope.entity) {
                Value::Object(map) => map,
                _ => return Err(unexpected_shape("update entity is not an object")),
            };
            EntityEvent::Updated {
                id: entity_id_of(&patch)?,
                patch,
            }
        }
        PushKind::Deletion => {
            let entity = snake_case_keys(envelope.entity);
            let id = match &entity {
                Value::Object(map) => entity_id_of(map)?,
                other => serde_json::from_value(other.clone())?,
            };
            EntityEvent::Deleted { id }
        }
        PushKind::ConnectionAck => EntityEvent::ConnectionAck,
    };

    Ok(PushEvent {
        event,
        unread_count: envelope.unread_count,
    })
}

/// Rewrite camelCase object keys to snake_case, recursively.
///
/// Values under `metadata` are opaque and left untouched.
pub fn snake_case_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let key = to_snake_case(&key);
                    let value = if key == "metadata" {
                        value
                    } else {
                        snake_case_keys(value)
                    };
                    (key, value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(snake_case_keys).collect()),
        other => other,
    }
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (idx, ch) in key.char_indices() {
        if ch.is_ascii_uppercase() {
            if idx > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn entity_id_of(map: &Map<String, Value>) -> Result<EntityId, SyncError> {
    let raw = map
        .get("id")
        .cloned()
        .ok_or_else(|| unexpected_shape("entity has no 'id'"))?;
    serde_json::from_value(raw).map_err(SyncError::from)
}

fn unexpected_shape(message: &str) -> SyncError {
    SyncError::new(
        SyncErrorCategory::Serialization,
        "unexpected_payload_shape",
        message,
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::Notification;

    #[test]
    fn maps_success_to_send_ack() {
        let event = normalize_send_outcome(
            EntityId::provisional("a"),
            SendOutcome::Success {
                message_id: EntityId::from(90),
            },
        );

        match event {
            SyncEvent::SendAck(ack) => {
                assert_eq!(ack.provisional_id.as_str(), "local-a");
                assert_eq!(ack.message_id, Some(EntityId::from(90)));
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failure_to_send_ack_with_stable_error_code() {
        let event = normalize_send_outcome(
            EntityId::provisional("b"),
            SendOutcome::Failure {
                error: SyncError::http(400, "empty body"),
            },
        );

        match event {
            SyncEvent::SendAck(ack) => {
                assert_eq!(ack.message_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("http_400"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn normalizes_bare_arrays_and_result_envelopes() {
        let bare: Vec<Notification> =
            normalize_list(json!([{ "id": 1 }, { "id": 2 }])).expect("bare array");
        let wrapped: Vec<Notification> = normalize_list(json!({
            "count": 2,
            "next": null,
            "results": [{ "id": 1 }, { "id": 2 }],
        }))
        .expect("results envelope");

        assert_eq!(bare, wrapped);
        assert_eq!(bare.len(), 2);
    }

    #[test]
    fn rejects_unknown_list_shapes() {
        let err = normalize_list::<Notification>(json!("nope")).expect_err("string is not a list");
        assert_eq!(err.code, "unexpected_payload_shape");
    }

    #[test]
    fn camel_case_keys_are_normalized() {
        let notification: Notification = decode_entity(json!({
            "id": 7,
            "isRead": true,
            "timeAgo": "now",
            "metadata": { "petitionId": 3 },
        }))
        .expect("camelCase notification");

        assert!(notification.is_read);
        assert_eq!(notification.time_ago.as_deref(), Some("now"));
        assert_eq!(notification.metadata, json!({ "petitionId": 3 }));
    }

    #[test]
    fn decodes_push_event_variants() {
        let created: PushEvent<Notification> =
            decode_push(r#"{"type":"creation","entity":{"id":7,"is_read":false},"unread_count":4}"#)
                .expect("creation");
        assert!(matches!(created.event, EntityEvent::Created(ref n) if n.id == EntityId::from(7)));
        assert_eq!(created.unread_count, Some(4));

        let updated: PushEvent<Notification> =
            decode_push(r#"{"type":"update","entity":{"id":7,"isRead":true}}"#).expect("update");
        match updated.event {
            EntityEvent::Updated { id, patch } => {
                assert_eq!(id, EntityId::from(7));
                assert_eq!(patch.get("is_read"), Some(&json!(true)));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let deleted: PushEvent<Notification> =
            decode_push(r#"{"type":"deletion","entity":7}"#).expect("deletion by bare id");
        assert_eq!(
            deleted.event,
            EntityEvent::Deleted {
                id: EntityId::from(7)
            }
        );
    }

    #[test]
    fn update_without_id_is_rejected() {
        let err = decode_push::<Notification>(r#"{"type":"update","entity":{"is_read":true}}"#)
            .expect_err("update needs an id");
        assert_eq!(err.category, SyncErrorCategory::Serialization);
    }

    #[test]
    fn reads_unread_count_shapes() {
        assert_eq!(unread_count_from(&json!({ "unread_count": 3 })), Some(3));
        assert_eq!(unread_count_from(&json!({ "count": 2 })), Some(2));
        assert_eq!(unread_count_from(&json!(9)), Some(9));
        assert_eq!(unread_count_from(&json!("x")), None);
    }
}
