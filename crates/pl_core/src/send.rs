//! Send pipeline: device resolution, first-contact session bootstrap,
//! encrypt, envelope framing, transport hand-off.
//!
//! `prepare_message` resolves the target devices and mints one work item
//! per device; the run queue then drives `process_send` for each. The
//! conversation is persisted after every successful encrypt, before the
//! payload goes to the transport.

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

use pl_crypto::curve::decode_point;
use pl_crypto::{initiate, ratchet, Conversation, CryptoError};
use pl_proto::MessageEnvelope;

use crate::api::Core;
use crate::collaborators::TransportItem;
use crate::descriptor::{create_supplement, parse_msg_descriptor};
use crate::error::CoreError;

pub(crate) struct SendItem {
    pub recipient: String,
    pub device_id: String,
    pub device_name: String,
    pub msg_id: String,
    pub message: String,
    pub attachment_descriptor: String,
    pub message_attributes: String,
    pub msg_type: u32,
    pub transport_id: u64,
    /// No conversation exists yet; fetch a pre-key bundle first.
    pub new_device: bool,
}

/// Upper 60 bits random identity, lower 4 bits the message-type tag.
fn new_transport_id(msg_type: u32) -> u64 {
    (OsRng.next_u64() & !0xf) | u64::from(msg_type & 0xf)
}

/// Resolve the recipient's devices and build one queue item per device.
/// For sibling sends the recipient is the local user and the sending
/// device filters itself out.
pub(crate) fn prepare_message(
    core: &Core,
    message_descriptor: &str,
    attachment_descriptor: &str,
    message_attributes: &str,
    msg_type: u32,
    to_siblings: bool,
) -> Result<Vec<SendItem>, CoreError> {
    let descriptor = parse_msg_descriptor(message_descriptor)?;
    let recipient = if to_siblings {
        core.local_user.clone()
    } else {
        descriptor.recipient.clone()
    };

    let devices = core.provisioning.get_devices(&recipient)?;
    let devices: Vec<_> = devices
        .into_iter()
        .filter(|device| !(recipient == core.local_user && device.device_id == core.device_id))
        .collect();
    if devices.is_empty() {
        return Err(CoreError::NoDevices(recipient));
    }

    let mut items = Vec::with_capacity(devices.len());
    for device in devices {
        // Missing or reset conversations both need the pre-key bootstrap.
        let new_device = match core
            .store
            .load_conversation(&core.local_user, &recipient, &device.device_id)?
        {
            Some(conv) => conv.root_key().is_none(),
            None => true,
        };
        items.push(SendItem {
            recipient: recipient.clone(),
            device_id: device.device_id,
            device_name: device.device_name,
            msg_id: descriptor.msg_id.clone(),
            message: descriptor.message.clone(),
            attachment_descriptor: attachment_descriptor.to_string(),
            message_attributes: message_attributes.to_string(),
            msg_type,
            transport_id: new_transport_id(msg_type),
            new_device,
        });
    }
    Ok(items)
}

/// Encrypt and hand one payload to the transport, creating the session on
/// first contact.
pub(crate) fn process_send(core: &Core, item: SendItem) -> Result<(), CoreError> {
    if item.new_device {
        bootstrap_session(core, &item)?;
    }

    let mut conv = core
        .store
        .load_conversation(&core.local_user, &item.recipient, &item.device_id)?
        .ok_or_else(|| CoreError::Crypto(CryptoError::SessionNotInitialized))?;

    let supplement = create_supplement(&item.attachment_descriptor, &item.message_attributes);
    let encrypted = ratchet::encrypt(&mut conv, item.message.as_bytes(), supplement.as_bytes())
        .map_err(|err| {
            conv.set_error_code(err.code());
            err
        })?;

    let mut envelope = MessageEnvelope {
        name: core.local_user.clone(),
        sc_client_dev_id: core.device_id.clone(),
        supplement: encrypted.supplement,
        message: encrypted.wire,
        msg_id: item.msg_id.clone(),
        msg_type: item.msg_type,
        ..Default::default()
    };
    if core.config.send_id_hashes {
        if let Some((recv_hash, sender_hash)) = conv.id_hashes() {
            envelope.recv_id_hash = Some(recv_hash);
            envelope.sender_id_hash = Some(sender_hash);
        }
    }
    envelope.recv_dev_id_bin = device_id_bin(&item.device_id);
    if let Some(pending) = conv.pending_prekey() {
        // Initiation material rides along until the peer's first reply.
        envelope.prekey_id = Some(conv.prekey_id());
        envelope.sender_prekey = Some(pending.public().serialize());
        envelope.sender_identity_key = conv
            .identity_pair()
            .map(|pair| pair.public().serialize());
    }

    core.store.store_conversation(&conv)?;

    core.transport.send(
        &item.recipient,
        &[TransportItem {
            device_id: item.device_id.clone(),
            payload: envelope.to_base64(),
            transport_id: item.transport_id,
        }],
    )?;

    debug!(
        recipient = %item.recipient,
        device = %item.device_id,
        msg_id = %item.msg_id,
        "message sent"
    );
    Ok(())
}

/// First contact with a device: fetch a pre-key bundle and run the
/// initiator-side setup. A session that appeared in the meantime is fine.
fn bootstrap_session(core: &Core, item: &SendItem) -> Result<(), CoreError> {
    let bundle = core.provisioning.get_prekey_bundle(&item.recipient, &item.device_id)?;
    let identity = core.ensure_local_identity()?;

    let mut conv = core
        .store
        .load_conversation(&core.local_user, &item.recipient, &item.device_id)?
        .unwrap_or_else(|| Conversation::new(&core.local_user, &item.recipient, &item.device_id));
    conv.set_partner_alias(&item.device_name);

    let peer_identity = decode_point(&bundle.identity_key)?;
    let peer_prekey = decode_point(&bundle.prekey)?;

    match initiate::setup_alice(&mut conv, &identity, peer_identity, peer_prekey, bundle.prekey_id)
    {
        Ok(()) => {}
        Err(CryptoError::ConversationExists) => {
            warn!(
                recipient = %item.recipient,
                device = %item.device_id,
                "session already exists, keeping it"
            );
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }
    core.store.store_conversation(&conv)?;
    Ok(())
}

/// First 4 bytes of the hex-decoded device id, when it is hex at all.
pub(crate) fn device_id_bin(device_id: &str) -> Option<[u8; 4]> {
    let decoded = hex::decode(device_id).ok()?;
    decoded.get(..4)?.try_into().ok()
}
