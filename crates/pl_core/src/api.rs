//! The public messaging API.
//!
//! One [`AppInterface`] per local user wires the store and the collaborator
//! traits together and owns the run-queue processor. Construction enqueues
//! a retry sweep, which replays any raw or temp records a previous run left
//! behind.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use tracing::info;

use pl_crypto::curve::{generate_key_pair, KeyPair};
use pl_crypto::initiate::ExternalStaging;
use pl_crypto::prekey::NUM_PRE_KEYS;
use pl_crypto::Conversation;
use pl_proto::envelope::MSG_NORMAL;
use pl_store::Store;

use crate::collaborators::{AppCallbacks, Provisioning, Transport};
use crate::error::CoreError;
use crate::queue::{Command, RunQueue};
use crate::{receive, send};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Pre-keys per registration batch / refill.
    pub prekey_batch: usize,
    /// Attach the 4-byte sender/receiver identity hashes to envelopes.
    pub send_id_hashes: bool,
    /// Process queue items on the caller's thread instead of the worker.
    /// Deterministic; meant for tests.
    pub inline_processing: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            prekey_batch: NUM_PRE_KEYS,
            send_id_hashes: true,
            inline_processing: false,
        }
    }
}

/// Read-only session snapshot for the application.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub state: pl_crypto::SessionState,
    pub identity_key_changed: bool,
    pub verify_state: i32,
    pub context_id: u32,
}

pub(crate) struct Core {
    pub store: Store,
    pub provisioning: Arc<dyn Provisioning>,
    pub transport: Arc<dyn Transport>,
    pub callbacks: Arc<dyn AppCallbacks>,
    pub local_user: String,
    pub device_id: String,
    pub config: CoreConfig,
    pub staging: ExternalStaging,
}

impl Core {
    /// The local long-term identity, created on first use and kept in the
    /// distinguished local conversation.
    pub(crate) fn ensure_local_identity(&self) -> Result<KeyPair, CoreError> {
        if let Some(local) =
            self.store.load_conversation(&self.local_user, &self.local_user, "")?
        {
            return local.identity_pair().cloned().ok_or(CoreError::NoOwnIdentity);
        }
        let pair = generate_key_pair();
        let mut conv = Conversation::local(&self.local_user);
        conv.set_identity_pair(Some(pair.clone()));
        self.store.store_conversation(&conv)?;
        info!(user = %self.local_user, "local identity created");
        Ok(pair)
    }
}

pub struct AppInterface {
    core: Arc<Core>,
    queue: RunQueue,
}

impl AppInterface {
    pub fn new(
        store: Store,
        provisioning: Arc<dyn Provisioning>,
        transport: Arc<dyn Transport>,
        callbacks: Arc<dyn AppCallbacks>,
        local_user: &str,
        device_id: &str,
        config: CoreConfig,
    ) -> Self {
        let inline = config.inline_processing;
        let core = Arc::new(Core {
            store,
            provisioning,
            transport,
            callbacks,
            local_user: local_user.to_string(),
            device_id: device_id.to_string(),
            config,
            staging: ExternalStaging::new(),
        });
        let queue = RunQueue::start(Arc::clone(&core), inline);
        let interface = Self { core, queue };
        // Crash recovery: replay whatever the previous run left queued.
        interface.queue.enqueue(Command::CheckForRetry);
        interface
    }

    // ── Registration ─────────────────────────────────────────────────────

    /// Create the local identity if needed, generate a pre-key batch, and
    /// upload the registration bundle. Returns the HTTP status.
    pub fn register_device(&self) -> Result<i32, CoreError> {
        let identity = self.core.ensure_local_identity()?;
        let prekeys = self.core.store.generate_prekeys(self.core.config.prekey_batch)?;

        let prekey_list: Vec<_> = prekeys
            .iter()
            .map(|prekey| {
                json!({
                    "keyId": prekey.id,
                    "preKey": STANDARD.encode(prekey.pair.public().serialize()),
                })
            })
            .collect();
        let bundle = json!({
            "version": 1,
            "scClientDevId": self.core.device_id,
            "identityKey": STANDARD.encode(identity.public().serialize()),
            "preKeys": prekey_list,
        });
        self.core.provisioning.register_device(&bundle.to_string())
    }

    /// Base64 of the serialized local identity public key.
    pub fn own_identity_key(&self) -> Result<String, CoreError> {
        let identity = self.core.ensure_local_identity()?;
        Ok(STANDARD.encode(identity.public().serialize()))
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Encrypt and send a message to every device of the recipient named in
    /// the descriptor. Returns the per-device transport ids.
    pub fn send_message(
        &self,
        message_descriptor: &str,
        attachment_descriptor: &str,
        message_attributes: &str,
    ) -> Result<Vec<u64>, CoreError> {
        self.queue_send(message_descriptor, attachment_descriptor, message_attributes, false)
    }

    /// Same, but to the local user's other devices.
    pub fn send_message_to_siblings(
        &self,
        message_descriptor: &str,
        attachment_descriptor: &str,
        message_attributes: &str,
    ) -> Result<Vec<u64>, CoreError> {
        self.queue_send(message_descriptor, attachment_descriptor, message_attributes, true)
    }

    fn queue_send(
        &self,
        message_descriptor: &str,
        attachment_descriptor: &str,
        message_attributes: &str,
        to_siblings: bool,
    ) -> Result<Vec<u64>, CoreError> {
        let items = send::prepare_message(
            &self.core,
            message_descriptor,
            attachment_descriptor,
            message_attributes,
            MSG_NORMAL,
            to_siblings,
        )?;
        let ids = items.iter().map(|item| item.transport_id).collect();
        for item in items {
            self.queue.enqueue(Command::SendMessage(Box::new(item)));
        }
        Ok(ids)
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// Hand an inbound transport frame to the core. The frame is made
    /// durable before this returns; decryption and delivery happen on the
    /// processor.
    pub fn receive_message(
        &self,
        envelope_b64: &str,
        uid: &str,
        display_name: &str,
    ) -> Result<(), CoreError> {
        let command = receive::receive_message(&self.core, envelope_b64, uid, display_name)?;
        self.queue.enqueue(command);
        Ok(())
    }

    // ── Session control ──────────────────────────────────────────────────

    /// Read-only view of one session's public state.
    pub fn session_info(
        &self,
        partner: &str,
        device_id: &str,
    ) -> Result<Option<SessionInfo>, CoreError> {
        let conv = self.core.store.load_conversation(&self.core.local_user, partner, device_id)?;
        Ok(conv.map(|conv| SessionInfo {
            state: conv.state(),
            identity_key_changed: conv.identity_key_changed(),
            verify_state: conv.verify_state(),
            context_id: conv.context_id(),
        }))
    }

    /// Wipe the ratchet state of one session; the conversation record and
    /// its context survive for re-initiation.
    pub fn reset_session(&self, partner: &str, device_id: &str) -> Result<(), CoreError> {
        let mut conv = self
            .core
            .store
            .load_conversation(&self.core.local_user, partner, device_id)?
            .ok_or_else(|| CoreError::NoSession(partner.to_string()))?;
        conv.reset();
        self.core.store.store_conversation(&conv)?;
        info!(partner, device_id, "session reset");
        Ok(())
    }

    /// Schedule a retry sweep: replay durable queues, refill pre-keys,
    /// drop expired retention records.
    pub fn run_retry_sweep(&self) {
        self.queue.enqueue(Command::CheckForRetry);
    }

    /// Stop the background processor. Called automatically on drop.
    pub fn stop(&self) {
        self.queue.stop();
    }

    // ── Externally-keyed initiation ──────────────────────────────────────

    /// Start an externally-keyed setup with a peer device: stages own keys
    /// and returns the public-key blob for the out-of-band channel. Fails
    /// if a live session already exists.
    pub fn external_key_offer(
        &self,
        partner: &str,
        device_id: &str,
    ) -> Result<Vec<u8>, CoreError> {
        if let Some(conv) =
            self.core.store.load_conversation(&self.core.local_user, partner, device_id)?
        {
            if conv.root_key().is_some() {
                return Err(pl_crypto::CryptoError::ConversationExists.into());
            }
        }
        let identity = self.core.ensure_local_identity()?;
        Ok(self.core.staging.public_key_data(&self.core.local_user, partner, device_id, &identity))
    }

    /// Record the peer's public-key blob from the out-of-band channel.
    pub fn external_key_peer_data(&self, data: &[u8]) -> Result<(), CoreError> {
        Ok(self.core.staging.set_public_key_data(&self.core.local_user, data)?)
    }

    /// Commit the exported 32-byte shared secret: installs the session for
    /// the staged partner/device and persists it.
    pub fn external_key_commit(&self, exported_key: &[u8; 32]) -> Result<(), CoreError> {
        let (partner, device_id) = self
            .core
            .staging
            .staged_target(&self.core.local_user)
            .ok_or(CoreError::FieldMissing("stagedKeyAgreement"))?;
        let mut conv = self
            .core
            .store
            .load_conversation(&self.core.local_user, &partner, &device_id)?
            .unwrap_or_else(|| Conversation::new(&self.core.local_user, &partner, &device_id));
        self.core
            .staging
            .set_exported_key(&self.core.local_user, exported_key, &mut conv)?;
        self.core.store.store_conversation(&conv)?;
        Ok(())
    }
}

impl Drop for AppInterface {
    fn drop(&mut self) {
        self.queue.stop();
    }
}
