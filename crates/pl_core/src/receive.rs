//! Receive pipeline.
//!
//! Every inbound frame is made durable first (raw queue), then processed by
//! the run queue: duplicate suppression by frame hash, envelope parse,
//! device and age checks, session lookup or responder-side bootstrap,
//! decrypt, and a single-transaction commit of everything the decrypt
//! produced. Delivery to the application goes through a durable temp
//! record so a crash between commit and callback redelivers instead of
//! losing the message.
//!
//! Failures split by kind: cryptographic ones drop the frame, report a
//! structured error to the application and send an error command back to
//! the sender; transient store failures leave the raw record queued for
//! the next retry sweep.

use tracing::{debug, info, warn};

use pl_crypto::curve::decode_point;
use pl_crypto::error::codes;
use pl_crypto::hash::sha256;
use pl_crypto::prekey::MIN_NUM_PRE_KEYS;
use pl_crypto::{initiate, ratchet, Conversation};
use pl_proto::envelope::MSG_CMD;
use pl_proto::MessageEnvelope;

use crate::api::Core;
use crate::descriptor::{
    build_receive_descriptor, build_send_descriptor, error_command_attributes, is_old_message,
    new_msg_id, parse_supplement, receive_error_json,
};
use crate::error::CoreError;
use crate::queue::Command;
use crate::send::{device_id_bin, prepare_message};

/// Queue an inbound frame durably and hand back the follow-up command.
pub(crate) fn receive_message(
    core: &Core,
    envelope_b64: &str,
    uid: &str,
    display_name: &str,
) -> Result<Command, CoreError> {
    let sequence = core.store.insert_received_raw(envelope_b64, uid, display_name)?;
    Ok(Command::ReceivedRawData {
        sequence,
        data: envelope_b64.to_string(),
        sender: uid.to_string(),
        display_name: display_name.to_string(),
    })
}

/// Process one raw frame. Returns follow-up commands (the temp-delivery
/// item, error commands to the sender). A returned error means "transient,
/// keep the raw record"; permanent failures are handled inside.
pub(crate) fn process_raw(
    core: &Core,
    sequence: i64,
    data: &str,
    sender_uid: &str,
    _display_name: &str,
) -> Result<Vec<Command>, CoreError> {
    let msg_hash = sha256(data.as_bytes());

    // Silent duplicate: drop the raw record, no callback, no mutation.
    if core.store.has_msg_hash(&msg_hash)? {
        debug!(sequence, "duplicate frame dropped");
        core.store.delete_received_raw(sequence)?;
        return Ok(Vec::new());
    }

    let envelope = match MessageEnvelope::from_base64(data) {
        Ok(envelope) => envelope,
        Err(err) => {
            // Unparseable data can never succeed later: drop and report.
            warn!(sequence, "undecodable frame: {err}");
            core.store.delete_received_raw(sequence)?;
            core.callbacks.state_report(
                0,
                codes::CORRUPT_DATA,
                &receive_error_json("", "", "", &[], codes::CORRUPT_DATA, "", 0, -1),
            );
            return Ok(Vec::new());
        }
    };

    let sender = if sender_uid.is_empty() { envelope.name.clone() } else { sender_uid.to_string() };
    let sender_device = envelope.sc_client_dev_id.clone();

    let mut warning: Option<CoreError> = None;
    if let (Some(expected), Some(own)) = (envelope.recv_dev_id_bin, device_id_bin(&core.device_id))
    {
        if expected != own {
            warn!(sequence, "message addressed to a different device of ours");
            warning = Some(CoreError::WrongRecvDevice);
        }
    }
    if is_old_message(&envelope.msg_id) {
        info!(sequence, msg_id = %envelope.msg_id, "message older than retention horizon");
        warning = Some(CoreError::OldMessage);
    }

    let mut conv = core
        .store
        .load_conversation(&core.local_user, &sender, &sender_device)?
        .unwrap_or_else(|| Conversation::new(&core.local_user, &sender, &sender_device));

    // Responder-side session bootstrap for pre-key-tagged messages.
    let mut consumed_prekey = None;
    if let Some(prekey_id) = envelope.prekey_id {
        match core.store.load_prekey(prekey_id)? {
            Some(prekey) => {
                let setup = setup_responder(core, &mut conv, &envelope, prekey.pair);
                if let Err(err) = setup {
                    return Ok(fail_message(core, sequence, &envelope, &sender, err));
                }
                consumed_prekey = Some(prekey_id);
            }
            None if conv.root_key().is_some() => {
                // The initiator re-sent its pre-key message before our
                // answer arrived; the session already covers it.
                debug!(prekey_id, "duplicate pre-key message for established session");
            }
            None => {
                return Ok(fail_message(
                    core,
                    sequence,
                    &envelope,
                    &sender,
                    CoreError::NoPreKeyFound(prekey_id),
                ));
            }
        }
    }

    // Identity id-hash checks are diagnostics only. The envelope's
    // receiver hash must match our own identity key, its sender hash the
    // identity we have on file for the peer.
    if let Some((peer_hash, own_hash)) = conv.id_hashes() {
        if let Some(sent_to) = envelope.recv_id_hash {
            if sent_to != own_hash && warning.is_none() {
                warning = Some(CoreError::ReceiveIdWrong);
            }
        }
        if let Some(sent_from) = envelope.sender_id_hash {
            if sent_from != peer_hash && warning.is_none() {
                warning = Some(CoreError::SenderIdWrong);
            }
        }
    }

    let staged_keys = core.store.load_staged_mks(&core.local_user, &sender, &sender_device)?;
    let decrypted = match ratchet::decrypt(
        &mut conv,
        &envelope.message,
        envelope.supplement.as_deref(),
        &staged_keys,
    ) {
        Ok(decrypted) => decrypted,
        Err(err) => {
            return Ok(fail_message(core, sequence, &envelope, &sender, err.into()));
        }
    };

    let descriptor =
        build_receive_descriptor(&sender, &sender_device, &envelope.msg_id, &decrypted.plaintext);
    let supplement_plain = decrypted
        .supplement
        .as_deref()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default();

    let temp_sequence = core.store.commit_receive(pl_store::ReceiveCommit {
        msg_hash: &msg_hash,
        conversation: &conv,
        staged: &decrypted.staged,
        consumed_staged: decrypted.consumed_staged.as_deref(),
        consumed_prekey,
        temp: Some(pl_store::TempInsert {
            descriptor: &descriptor,
            supplement: &supplement_plain,
            msg_type: envelope.msg_type as i32,
        }),
        raw_sequence: sequence,
    })?;

    if let Some(warning) = warning {
        core.callbacks.state_report(
            0,
            warning.code(),
            &receive_error_json(
                &sender,
                &sender_device,
                &envelope.msg_id,
                &envelope.message,
                warning.code(),
                &core.device_id,
                0,
                envelope.msg_type as i32,
            ),
        );
    }

    Ok(temp_sequence
        .map(|sequence| Command::ReceivedTempMsg {
            sequence,
            descriptor,
            supplement: supplement_plain,
            msg_type: envelope.msg_type as i32,
        })
        .into_iter()
        .collect())
}

/// Responder-side pre-key setup from the envelope's initiation tags.
fn setup_responder(
    core: &Core,
    conv: &mut Conversation,
    envelope: &MessageEnvelope,
    own_prekey: pl_crypto::curve::KeyPair,
) -> Result<(), CoreError> {
    let identity = core.ensure_local_identity()?;
    let peer_identity_bytes = envelope
        .sender_identity_key
        .as_deref()
        .ok_or(CoreError::FieldMissing("senderIdentityKey"))?;
    let peer_prekey_bytes = envelope
        .sender_prekey
        .as_deref()
        .ok_or(CoreError::FieldMissing("senderPreKey"))?;

    initiate::setup_bob(
        conv,
        &identity,
        decode_point(peer_identity_bytes)?,
        decode_point(peer_prekey_bytes)?,
        own_prekey,
    )?;
    conv.set_partner_alias(&envelope.name);
    Ok(())
}

/// Permanent per-message failure: drop the raw record, report a structured
/// error to the application, and queue an error command to the sender.
fn fail_message(
    core: &Core,
    sequence: i64,
    envelope: &MessageEnvelope,
    sender: &str,
    err: CoreError,
) -> Vec<Command> {
    warn!(sequence, code = err.code(), "message dropped: {err}");
    if let Err(store_err) = core.store.delete_received_raw(sequence) {
        warn!(sequence, "raw record cleanup failed: {store_err}");
    }

    core.callbacks.state_report(
        0,
        err.code(),
        &receive_error_json(
            sender,
            &envelope.sc_client_dev_id,
            &envelope.msg_id,
            &envelope.message,
            err.code(),
            &core.device_id,
            err.sql_code(),
            envelope.msg_type as i32,
        ),
    );

    error_command(core, sender, &envelope.msg_id)
}

/// Build the outbound "DECRYPTION_FAILED" command for the sender. Failure
/// to prepare it is logged and swallowed; the error report above already
/// reached the application.
fn error_command(core: &Core, sender: &str, failed_msg_id: &str) -> Vec<Command> {
    let descriptor = build_send_descriptor(sender, &new_msg_id(&core.device_id), "");
    let attributes = error_command_attributes("DECRYPTION_FAILED", failed_msg_id);
    match prepare_message(core, &descriptor, "", &attributes, MSG_CMD, false) {
        Ok(items) => items.into_iter().map(|item| Command::SendMessage(Box::new(item))).collect(),
        Err(err) => {
            debug!("error command not sent: {err}");
            Vec::new()
        }
    }
}

/// Deliver one decrypted message to the application; the temp record is
/// retired only on a non-negative acknowledgement.
pub(crate) fn process_temp(
    core: &Core,
    sequence: i64,
    descriptor: &str,
    supplement: &str,
    _msg_type: i32,
) {
    let (attachment_descriptor, message_attributes) = parse_supplement(supplement.as_bytes());
    let rc = core.callbacks.receive(descriptor, &attachment_descriptor, &message_attributes);
    if rc >= 0 {
        if let Err(err) = core.store.delete_temp_plaintext(sequence) {
            warn!(sequence, "temp record cleanup failed: {err}");
        }
    } else {
        info!(sequence, rc, "application deferred message, keeping temp record");
    }
}

/// Startup / periodic sweep: replay durable raw and temp records in
/// sequence order, drop expired retention records, and top up the pre-key
/// store.
pub(crate) fn check_for_retry(core: &Core) -> Vec<Command> {
    let mut commands = Vec::new();

    match core.store.load_received_raw() {
        Ok(records) => {
            for record in records {
                commands.push(Command::ReceivedRawData {
                    sequence: record.sequence,
                    data: record.data,
                    sender: record.sender,
                    display_name: record.display_name,
                });
            }
        }
        Err(err) => warn!("raw replay failed: {err}"),
    }

    match core.store.load_temp_plaintext() {
        Ok(records) => {
            for record in records {
                commands.push(Command::ReceivedTempMsg {
                    sequence: record.sequence,
                    descriptor: record.descriptor,
                    supplement: record.supplement,
                    msg_type: record.msg_type,
                });
            }
        }
        Err(err) => warn!("temp replay failed: {err}"),
    }

    if let Err(err) = core.store.cleanup_expired() {
        warn!("retention cleanup failed: {err}");
    }

    match core.store.prekey_count() {
        Ok(count) if count < MIN_NUM_PRE_KEYS => {
            match core.store.generate_prekeys(core.config.prekey_batch) {
                Ok(batch) => info!(generated = batch.len(), "pre-key store refilled"),
                Err(err) => warn!("pre-key refill failed: {err}"),
            }
        }
        Ok(_) => {}
        Err(err) => warn!("pre-key count failed: {err}"),
    }

    commands
}
