//! Message-descriptor and diagnostic JSON helpers.
//!
//! The application exchanges messages with the core as small JSON
//! descriptors; error reports travel the same way through the state-report
//! callback. Message ids are time-based UUIDs so the receive pipeline can
//! judge message age without trusting a separate timestamp field.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreError;

/// Age threshold after which an inbound message is flagged as old.
pub const OLD_MESSAGE_SECONDS: i64 = 31 * 86_400;

// ── Message descriptors ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SendDescriptorRepr {
    recipient: Option<String>,
    #[serde(rename = "msgId")]
    msg_id: Option<String>,
    message: Option<String>,
}

#[derive(Debug)]
pub struct MsgDescriptor {
    pub recipient: String,
    pub msg_id: String,
    pub message: String,
}

/// Parse the application's send descriptor:
/// `{"recipient": ..., "msgId": ..., "message": ...}`.
pub fn parse_msg_descriptor(descriptor: &str) -> Result<MsgDescriptor, CoreError> {
    let repr: SendDescriptorRepr = serde_json::from_str(descriptor)
        .map_err(|_| CoreError::FieldMissing("messageDescriptor"))?;
    Ok(MsgDescriptor {
        recipient: repr.recipient.ok_or(CoreError::FieldMissing("recipient"))?,
        msg_id: repr.msg_id.ok_or(CoreError::FieldMissing("msgId"))?,
        message: repr.message.ok_or(CoreError::FieldMissing("message"))?,
    })
}

/// Descriptor delivered to the application for a received message.
pub fn build_receive_descriptor(
    sender: &str,
    device_id: &str,
    msg_id: &str,
    plaintext: &[u8],
) -> String {
    json!({
        "version": 1,
        "sender": sender,
        "scClientDevId": device_id,
        "msgId": msg_id,
        "message": String::from_utf8_lossy(plaintext),
    })
    .to_string()
}

/// Convenience for applications building a send descriptor.
pub fn build_send_descriptor(recipient: &str, msg_id: &str, message: &str) -> String {
    json!({
        "version": 1,
        "recipient": recipient,
        "msgId": msg_id,
        "message": message,
    })
    .to_string()
}

// ── Supplement blob ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct SupplementRepr {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    attachments: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    attributes: String,
}

/// Bundle attachment descriptor + message attributes into the supplement
/// plaintext. Empty when there is nothing to carry.
pub fn create_supplement(attachment_descriptor: &str, message_attributes: &str) -> String {
    if attachment_descriptor.is_empty() && message_attributes.is_empty() {
        return String::new();
    }
    serde_json::to_string(&SupplementRepr {
        attachments: attachment_descriptor.to_string(),
        attributes: message_attributes.to_string(),
    })
    .unwrap_or_default()
}

/// Split a decrypted supplement back into (attachment descriptor,
/// message attributes).
pub fn parse_supplement(supplement: &[u8]) -> (String, String) {
    match serde_json::from_slice::<SupplementRepr>(supplement) {
        Ok(repr) => (repr.attachments, repr.attributes),
        Err(_) => (String::new(), String::new()),
    }
}

// ── Message ids ──────────────────────────────────────────────────────────────

/// Time-based UUID, with the node id derived from the device id.
pub fn new_msg_id(device_id: &str) -> String {
    let digest = Sha256::digest(device_id.as_bytes());
    let mut node = [0u8; 6];
    node.copy_from_slice(&digest[..6]);
    Uuid::now_v1(&node).to_string()
}

/// Seconds-since-epoch embedded in a time-based message id, when present.
pub fn msg_id_time(msg_id: &str) -> Option<i64> {
    let uuid = Uuid::parse_str(msg_id).ok()?;
    let ts = uuid.get_timestamp()?;
    let (secs, _nanos) = ts.to_unix();
    i64::try_from(secs).ok()
}

/// Whether a message id places the message past the 31-day horizon.
pub fn is_old_message(msg_id: &str) -> bool {
    match msg_id_time(msg_id) {
        Some(sent) => Utc::now().timestamp() - sent >= OLD_MESSAGE_SECONDS,
        None => false,
    }
}

// ── Error detail objects ─────────────────────────────────────────────────────

/// JSON details object for receive-side failures, including a hex prefix of
/// the offending ciphertext for diagnosis.
#[allow(clippy::too_many_arguments)]
pub fn receive_error_json(
    sender: &str,
    sender_device_id: &str,
    msg_id: &str,
    ciphertext: &[u8],
    error_code: i32,
    sent_to_id: &str,
    sql_code: i32,
    msg_type: i32,
) -> String {
    let prefix_len = ciphertext.len().min(16);
    let mut details = json!({
        "name": sender,
        "scClientDevId": sender_device_id,
        "otherInfo": hex::encode(&ciphertext[..prefix_len]),
        "msgId": msg_id,
        "errorCode": error_code,
        "sentToId": sent_to_id,
    });
    if sql_code != 0 {
        details["sqlErrorCode"] = json!(sql_code);
    }
    json!({
        "version": 1,
        "details": details,
        "msgType": msg_type,
    })
    .to_string()
}

/// JSON details object for send-side failures.
pub fn send_error_json(recipient: &str, device_id: &str, msg_id: &str, error_code: i32) -> String {
    json!({
        "version": 1,
        "details": {
            "name": recipient,
            "scClientDevId": device_id,
            "msgId": msg_id,
            "errorCode": error_code,
        },
    })
    .to_string()
}

/// Attributes blob for an outbound error command to the message sender.
pub fn error_command_attributes(command: &str, msg_id: &str) -> String {
    json!({
        "cmd": command,
        "msgId": msg_id,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_descriptor_roundtrip() {
        let descriptor = build_send_descriptor("bob", "id-1", "hello");
        let parsed = parse_msg_descriptor(&descriptor).unwrap();
        assert_eq!(parsed.recipient, "bob");
        assert_eq!(parsed.msg_id, "id-1");
        assert_eq!(parsed.message, "hello");
    }

    #[test]
    fn missing_descriptor_fields_are_named() {
        let err = parse_msg_descriptor(r#"{"recipient": "bob"}"#).unwrap_err();
        assert!(matches!(err, CoreError::FieldMissing("msgId")));
        let err = parse_msg_descriptor("no json").unwrap_err();
        assert!(matches!(err, CoreError::FieldMissing("messageDescriptor")));
    }

    #[test]
    fn supplement_roundtrip() {
        let supplement = create_supplement("{\"file\":\"x\"}", "{\"readReceipt\":true}");
        let (attachment, attributes) = parse_supplement(supplement.as_bytes());
        assert_eq!(attachment, "{\"file\":\"x\"}");
        assert_eq!(attributes, "{\"readReceipt\":true}");

        assert!(create_supplement("", "").is_empty());
        assert_eq!(parse_supplement(b"garbage"), (String::new(), String::new()));
    }

    #[test]
    fn msg_ids_carry_current_time() {
        let id = new_msg_id("deadbeef");
        let time = msg_id_time(&id).unwrap();
        let now = Utc::now().timestamp();
        assert!((now - time).abs() < 5, "uuid time {time} vs now {now}");
        assert!(!is_old_message(&id));
    }

    #[test]
    fn random_ids_are_not_old() {
        // v4 ids carry no timestamp; they must not be flagged as old.
        assert!(!is_old_message(&Uuid::new_v4().to_string()));
        assert!(!is_old_message("not-a-uuid"));
    }

    #[test]
    fn error_json_includes_hex_prefix_and_sql_code() {
        let details = receive_error_json("bob", "dev", "id-1", &[0xde, 0xad, 0xbe], -23, "", 0, 0);
        let parsed: serde_json::Value = serde_json::from_str(&details).unwrap();
        assert_eq!(parsed["details"]["otherInfo"], "deadbe");
        assert_eq!(parsed["details"]["errorCode"], -23);
        assert!(parsed["details"].get("sqlErrorCode").is_none());

        let details = receive_error_json("bob", "dev", "id-1", &[], -400, "", 5, 0);
        let parsed: serde_json::Value = serde_json::from_str(&details).unwrap();
        assert_eq!(parsed["details"]["sqlErrorCode"], 5);
    }
}
