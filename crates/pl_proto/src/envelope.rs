//! The message envelope — the record the transport carries.
//!
//! Required fields are the sender name, sender device id, message id and
//! the ciphertext itself; everything else is optional. Session-initiating
//! messages additionally carry the consumed pre-key id and the initiator's
//! identity and ephemeral publics (tags 10–12) so the responder can derive
//! the session before decrypting.
//!
//! The serialized record is base64-encoded for transport.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::codec::{
    put_bytes_field, put_string_field, put_uint_field, CodecError, FieldReader, FieldValue,
};

pub const MSG_NORMAL: u32 = 0;
pub const MSG_CMD: u32 = 1;
pub const GROUP_MSG_NORMAL: u32 = 10;
pub const GROUP_MSG_CMD: u32 = 11;

const TAG_NAME: u32 = 1;
const TAG_DEVICE_ID: u32 = 2;
const TAG_SUPPLEMENT: u32 = 3;
const TAG_MESSAGE: u32 = 4;
const TAG_MSG_ID: u32 = 5;
const TAG_MSG_TYPE: u32 = 6;
const TAG_RECV_ID_HASH: u32 = 7;
const TAG_SENDER_ID_HASH: u32 = 8;
const TAG_RECV_DEV_ID_BIN: u32 = 9;
const TAG_PREKEY_ID: u32 = 10;
const TAG_SENDER_IDENTITY_KEY: u32 = 11;
const TAG_SENDER_PREKEY: u32 = 12;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Sender's human-readable alias.
    pub name: String,
    /// Sender's device id (hex).
    pub sc_client_dev_id: String,
    /// Ciphertext of the attachment descriptor + attributes blob.
    pub supplement: Option<Vec<u8>>,
    /// Ciphertext of the body: ratchet header ‖ body ‖ truncated MAC.
    pub message: Vec<u8>,
    /// Time-based UUID.
    pub msg_id: String,
    pub msg_type: u32,
    /// First 4 bytes of SHA-256 over the receiver's identity public key.
    pub recv_id_hash: Option<[u8; 4]>,
    /// First 4 bytes of SHA-256 over the sender's identity public key.
    pub sender_id_hash: Option<[u8; 4]>,
    /// First 4 bytes of the intended receiver's device id binary.
    pub recv_dev_id_bin: Option<[u8; 4]>,
    /// Pre-key id consumed by the initiator; present on session-initiating
    /// messages only.
    pub prekey_id: Option<u32>,
    /// Initiator's serialized identity public key (initiating messages).
    pub sender_identity_key: Option<Vec<u8>>,
    /// Initiator's serialized ephemeral pre-key public (initiating messages).
    pub sender_prekey: Option<Vec<u8>>,
}

impl MessageEnvelope {
    pub fn is_initiation(&self) -> bool {
        self.prekey_id.is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.message.len());
        put_string_field(&mut buf, TAG_NAME, &self.name);
        put_string_field(&mut buf, TAG_DEVICE_ID, &self.sc_client_dev_id);
        if let Some(supplement) = &self.supplement {
            put_bytes_field(&mut buf, TAG_SUPPLEMENT, supplement);
        }
        put_bytes_field(&mut buf, TAG_MESSAGE, &self.message);
        put_string_field(&mut buf, TAG_MSG_ID, &self.msg_id);
        if self.msg_type != MSG_NORMAL {
            put_uint_field(&mut buf, TAG_MSG_TYPE, u64::from(self.msg_type));
        }
        if let Some(hash) = &self.recv_id_hash {
            put_bytes_field(&mut buf, TAG_RECV_ID_HASH, hash);
        }
        if let Some(hash) = &self.sender_id_hash {
            put_bytes_field(&mut buf, TAG_SENDER_ID_HASH, hash);
        }
        if let Some(dev) = &self.recv_dev_id_bin {
            put_bytes_field(&mut buf, TAG_RECV_DEV_ID_BIN, dev);
        }
        if let Some(id) = self.prekey_id {
            put_uint_field(&mut buf, TAG_PREKEY_ID, u64::from(id));
        }
        if let Some(key) = &self.sender_identity_key {
            put_bytes_field(&mut buf, TAG_SENDER_IDENTITY_KEY, key);
        }
        if let Some(key) = &self.sender_prekey {
            put_bytes_field(&mut buf, TAG_SENDER_PREKEY, key);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut envelope = MessageEnvelope::default();
        let mut has_name = false;
        let mut has_device_id = false;
        let mut has_message = false;
        let mut has_msg_id = false;

        let mut reader = FieldReader::new(data);
        while let Some(field) = reader.next_field()? {
            match (field.number, field.value) {
                (TAG_NAME, FieldValue::Bytes(b)) => {
                    envelope.name = String::from_utf8_lossy(b).into_owned();
                    has_name = true;
                }
                (TAG_DEVICE_ID, FieldValue::Bytes(b)) => {
                    envelope.sc_client_dev_id = String::from_utf8_lossy(b).into_owned();
                    has_device_id = true;
                }
                (TAG_SUPPLEMENT, FieldValue::Bytes(b)) => {
                    envelope.supplement = Some(b.to_vec());
                }
                (TAG_MESSAGE, FieldValue::Bytes(b)) => {
                    envelope.message = b.to_vec();
                    has_message = true;
                }
                (TAG_MSG_ID, FieldValue::Bytes(b)) => {
                    envelope.msg_id = String::from_utf8_lossy(b).into_owned();
                    has_msg_id = true;
                }
                (TAG_MSG_TYPE, FieldValue::Varint(v)) => {
                    envelope.msg_type = v as u32;
                }
                (TAG_RECV_ID_HASH, FieldValue::Bytes(b)) => {
                    envelope.recv_id_hash = Some(fixed4(TAG_RECV_ID_HASH, b)?);
                }
                (TAG_SENDER_ID_HASH, FieldValue::Bytes(b)) => {
                    envelope.sender_id_hash = Some(fixed4(TAG_SENDER_ID_HASH, b)?);
                }
                (TAG_RECV_DEV_ID_BIN, FieldValue::Bytes(b)) => {
                    envelope.recv_dev_id_bin = Some(fixed4(TAG_RECV_DEV_ID_BIN, b)?);
                }
                (TAG_PREKEY_ID, FieldValue::Varint(v)) => {
                    envelope.prekey_id = Some(v as u32);
                }
                (TAG_SENDER_IDENTITY_KEY, FieldValue::Bytes(b)) => {
                    envelope.sender_identity_key = Some(b.to_vec());
                }
                (TAG_SENDER_PREKEY, FieldValue::Bytes(b)) => {
                    envelope.sender_prekey = Some(b.to_vec());
                }
                // Unknown fields and type mismatches are skipped for
                // forward compatibility.
                _ => {}
            }
        }

        if !has_name {
            return Err(CodecError::FieldMissing("name"));
        }
        if !has_device_id {
            return Err(CodecError::FieldMissing("scClientDevId"));
        }
        if !has_message {
            return Err(CodecError::FieldMissing("message"));
        }
        if !has_msg_id {
            return Err(CodecError::FieldMissing("msgId"));
        }
        Ok(envelope)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.encode())
    }

    pub fn from_base64(data: &str) -> Result<Self, CodecError> {
        Self::decode(&STANDARD.decode(data.trim())?)
    }
}

fn fixed4(tag: u32, bytes: &[u8]) -> Result<[u8; 4], CodecError> {
    <[u8; 4]>::try_from(bytes).map_err(|_| CodecError::FieldLength(tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::put_string_field as put_string;

    fn sample() -> MessageEnvelope {
        MessageEnvelope {
            name: "alice".into(),
            sc_client_dev_id: "4261a5".into(),
            supplement: Some(vec![9, 8, 7]),
            message: vec![1, 2, 3, 4, 5],
            msg_id: "6ba7b810-9dad-11d1-80b4-00c04fd430c8".into(),
            msg_type: MSG_CMD,
            recv_id_hash: Some([1, 2, 3, 4]),
            sender_id_hash: Some([5, 6, 7, 8]),
            recv_dev_id_bin: Some([0xab, 0xcd, 0xef, 0x01]),
            prekey_id: Some(12345),
            sender_identity_key: Some(vec![1; 33]),
            sender_prekey: Some(vec![2; 33]),
        }
    }

    #[test]
    fn full_roundtrip() {
        let envelope = sample();
        let decoded = MessageEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.is_initiation());
    }

    #[test]
    fn minimal_roundtrip() {
        let envelope = MessageEnvelope {
            name: "bob".into(),
            sc_client_dev_id: "deadbeef".into(),
            message: vec![42],
            msg_id: "id-1".into(),
            ..Default::default()
        };
        let decoded = MessageEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.msg_type, MSG_NORMAL);
        assert!(!decoded.is_initiation());
    }

    #[test]
    fn base64_transport_roundtrip() {
        let envelope = sample();
        let b64 = envelope.to_base64();
        assert!(b64.bytes().all(|b| b.is_ascii()));
        assert_eq!(MessageEnvelope::from_base64(&b64).unwrap(), envelope);
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        // Hand-build a record without the msgId field.
        let mut encoded = Vec::new();
        put_string(&mut encoded, 1, "alice");
        put_string(&mut encoded, 2, "deadbeef");
        crate::codec::put_bytes_field(&mut encoded, 4, &[1]);
        assert!(matches!(
            MessageEnvelope::decode(&encoded),
            Err(CodecError::FieldMissing("msgId"))
        ));

        let mut encoded = Vec::new();
        put_string(&mut encoded, 1, "alice");
        put_string(&mut encoded, 2, "deadbeef");
        put_string(&mut encoded, 5, "id");
        assert!(matches!(
            MessageEnvelope::decode(&encoded),
            Err(CodecError::FieldMissing("message"))
        ));
    }

    #[test]
    fn missing_name_is_rejected() {
        let mut encoded = Vec::new();
        put_string(&mut encoded, 2, "deadbeef");
        crate::codec::put_bytes_field(&mut encoded, 4, &[1]);
        put_string(&mut encoded, 5, "id");
        assert!(matches!(
            MessageEnvelope::decode(&encoded),
            Err(CodecError::FieldMissing("name"))
        ));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut encoded = sample().encode();
        // Append an unknown length-delimited field 60.
        crate::codec::put_bytes_field(&mut encoded, 60, b"future");
        let decoded = MessageEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn wrong_id_hash_length_is_rejected() {
        let mut encoded = Vec::new();
        put_string(&mut encoded, 2, "deadbeef");
        put_string(&mut encoded, 5, "id");
        crate::codec::put_bytes_field(&mut encoded, 4, &[1]);
        crate::codec::put_bytes_field(&mut encoded, 7, &[1, 2, 3]);
        assert!(matches!(
            MessageEnvelope::decode(&encoded),
            Err(CodecError::FieldLength(7))
        ));
    }

    #[test]
    fn garbage_base64_is_rejected() {
        assert!(MessageEnvelope::from_base64("!!!not base64!!!").is_err());
    }
}
