//! Capability traits for the external collaborators, injected at
//! construction: the provisioning server, the message transport, and the
//! application callbacks. Production wires these to HTTP/SIP clients and
//! UI bridges; tests plug in fakes.

use crate::error::CoreError;

/// A peer device as reported by the provisioning server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
}

/// One pre-key bundle fetched for a (user, device): the pre-key id, the
/// peer's serialized identity public key and the serialized one-shot
/// pre-key public.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub prekey_id: u32,
    pub identity_key: Vec<u8>,
    pub prekey: Vec<u8>,
}

pub trait Provisioning: Send + Sync {
    fn get_prekey_bundle(&self, user: &str, device_id: &str) -> Result<PreKeyBundle, CoreError>;

    fn get_devices(&self, user: &str) -> Result<Vec<DeviceInfo>, CoreError>;

    /// Upload a registration bundle (identity key + pre-keys, JSON).
    /// Returns the HTTP status code.
    fn register_device(&self, bundle_json: &str) -> Result<i32, CoreError>;
}

/// One framed payload bound for a single device.
#[derive(Debug, Clone)]
pub struct TransportItem {
    pub device_id: String,
    /// Base64-encoded envelope.
    pub payload: String,
    /// 64-bit id the application can correlate state reports with: upper
    /// 60 bits random identity, lower 4 bits the message-type tag.
    pub transport_id: u64,
}

pub trait Transport: Send + Sync {
    fn send(&self, recipient: &str, items: &[TransportItem]) -> Result<(), CoreError>;
}

pub trait AppCallbacks: Send + Sync {
    /// Deliver a decrypted message. A non-negative return acknowledges the
    /// message; a negative return keeps the durable temp record for a
    /// later redelivery sweep.
    fn receive(
        &self,
        message_descriptor: &str,
        attachment_descriptor: &str,
        message_attributes: &str,
    ) -> i32;

    /// Report a processing state change or failure, with a JSON details
    /// object (see `descriptor::receive_error_json`).
    fn state_report(&self, transport_id: u64, error_code: i32, details_json: &str);
}
