//! SQLite-backed store.
//!
//! One connection behind a mutex; all callers are short-lived statements or
//! explicit transactions. WAL journal mode and foreign-key enforcement are
//! configured at connection time, not in the schema script, because SQLite
//! refuses to switch `journal_mode` inside a transaction.

use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use pl_crypto::conversation::Conversation;
use pl_crypto::prekey::{random_prekey_id, PreKey};

use crate::error::StoreError;

/// Staged message keys and received-frame hashes are dropped after 31 days.
pub const RETENTION_SECONDS: i64 = 31 * 86_400;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    local_user    TEXT NOT NULL,
    partner       TEXT NOT NULL,
    device_id     TEXT NOT NULL,
    data          TEXT NOT NULL,
    peer_identity TEXT,
    updated_at    INTEGER NOT NULL,
    PRIMARY KEY (local_user, partner, device_id)
);

CREATE TABLE IF NOT EXISTS staged_mks (
    local_user   TEXT NOT NULL,
    partner      TEXT NOT NULL,
    device_id    TEXT NOT NULL,
    key_material BLOB NOT NULL,
    inserted_at  INTEGER NOT NULL,
    PRIMARY KEY (local_user, partner, device_id, key_material)
);

CREATE TABLE IF NOT EXISTS prekeys (
    id   INTEGER PRIMARY KEY,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS msg_hashes (
    hash        BLOB PRIMARY KEY,
    inserted_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS received_raw (
    sequence     INTEGER PRIMARY KEY AUTOINCREMENT,
    data         TEXT NOT NULL,
    sender       TEXT NOT NULL,
    display_name TEXT NOT NULL,
    inserted_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS temp_plaintext (
    sequence    INTEGER PRIMARY KEY AUTOINCREMENT,
    descriptor  TEXT NOT NULL,
    supplement  TEXT NOT NULL,
    msg_type    INTEGER NOT NULL,
    inserted_at INTEGER NOT NULL
);
";

/// A durably queued, still-encrypted inbound frame.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub sequence: i64,
    pub data: String,
    pub sender: String,
    pub display_name: String,
}

/// A decrypted message awaiting confirmed delivery to the application.
#[derive(Debug, Clone)]
pub struct TempRecord {
    pub sequence: i64,
    pub descriptor: String,
    pub supplement: String,
    pub msg_type: i32,
}

pub struct TempInsert<'a> {
    pub descriptor: &'a str,
    pub supplement: &'a str,
    pub msg_type: i32,
}

/// Everything the receive pipeline commits in one transaction after a
/// successful decrypt.
pub struct ReceiveCommit<'a> {
    pub msg_hash: &'a [u8],
    pub conversation: &'a Conversation,
    /// Newly staged skipped-message keys.
    pub staged: &'a [Vec<u8>],
    /// Staged key used up by this message.
    pub consumed_staged: Option<&'a [u8]>,
    /// Pre-key consumed by a session-initiating message.
    pub consumed_prekey: Option<u32>,
    pub temp: Option<TempInsert<'a>>,
    /// Raw-queue record to retire.
    pub raw_sequence: i64,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ── Conversations ────────────────────────────────────────────────────

    pub fn has_conversation(
        &self,
        local_user: &str,
        partner: &str,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations
             WHERE local_user = ?1 AND partner = ?2 AND device_id = ?3",
            params![local_user, partner, device_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn load_conversation(
        &self,
        local_user: &str,
        partner: &str,
        device_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let conn = self.conn.lock();
        let blob: Option<String> = conn
            .query_row(
                "SELECT data FROM conversations
                 WHERE local_user = ?1 AND partner = ?2 AND device_id = ?3",
                params![local_user, partner, device_id],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|data| Conversation::deserialize(&data).map_err(StoreError::from))
            .transpose()
    }

    pub fn store_conversation(&self, conv: &Conversation) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        store_conversation_on(&conn, conv)
    }

    pub fn delete_conversation(
        &self,
        local_user: &str,
        partner: &str,
        device_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM conversations
             WHERE local_user = ?1 AND partner = ?2 AND device_id = ?3",
            params![local_user, partner, device_id],
        )?;
        Ok(())
    }

    /// Device ids of all known conversations with a partner.
    pub fn conversation_devices(
        &self,
        local_user: &str,
        partner: &str,
    ) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT device_id FROM conversations
             WHERE local_user = ?1 AND partner = ?2 AND device_id != ''",
        )?;
        let rows = stmt.query_map(params![local_user, partner], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    // ── Staged message keys ──────────────────────────────────────────────

    pub fn insert_staged_mk(
        &self,
        local_user: &str,
        partner: &str,
        device_id: &str,
        key_material: &[u8],
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        insert_staged_on(&conn, local_user, partner, device_id, key_material)
    }

    pub fn load_staged_mks(
        &self,
        local_user: &str,
        partner: &str,
        device_id: &str,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key_material FROM staged_mks
             WHERE local_user = ?1 AND partner = ?2 AND device_id = ?3
             ORDER BY inserted_at",
        )?;
        let rows = stmt.query_map(params![local_user, partner, device_id], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<Vec<u8>>, _>>()?)
    }

    pub fn delete_staged_mk(
        &self,
        local_user: &str,
        partner: &str,
        device_id: &str,
        key_material: &[u8],
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM staged_mks
             WHERE local_user = ?1 AND partner = ?2 AND device_id = ?3 AND key_material = ?4",
            params![local_user, partner, device_id, key_material],
        )?;
        Ok(())
    }

    /// Drop staged keys and message hashes past the retention horizon.
    pub fn cleanup_expired(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now().timestamp() - RETENTION_SECONDS;
        let conn = self.conn.lock();
        let staged = conn.execute("DELETE FROM staged_mks WHERE inserted_at < ?1", [cutoff])?;
        let hashes = conn.execute("DELETE FROM msg_hashes WHERE inserted_at < ?1", [cutoff])?;
        if staged > 0 || hashes > 0 {
            debug!(staged, hashes, "expired retention records removed");
        }
        Ok(())
    }

    // ── Pre-keys ─────────────────────────────────────────────────────────

    pub fn contains_prekey(&self, id: u32) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM prekeys WHERE id = ?1",
            [id as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn prekey_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM prekeys", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn load_prekey(&self, id: u32) -> Result<Option<PreKey>, StoreError> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row("SELECT data FROM prekeys WHERE id = ?1", [id as i64], |row| {
                row.get(0)
            })
            .optional()?;
        data.map(|json| PreKey::from_json(id, &json).map_err(StoreError::from))
            .transpose()
    }

    /// Generate a batch of pre-keys with collision-free random ids and
    /// persist them in one transaction.
    pub fn generate_prekeys(&self, count: usize) -> Result<Vec<PreKey>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let id = random_prekey_id(|candidate| {
                tx.query_row(
                    "SELECT COUNT(*) FROM prekeys WHERE id = ?1",
                    [candidate as i64],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n > 0)
                .unwrap_or(true)
            });
            let prekey = PreKey::generate(id);
            tx.execute(
                "INSERT INTO prekeys (id, data) VALUES (?1, ?2)",
                params![id as i64, prekey.to_json()?],
            )?;
            out.push(prekey);
        }
        tx.commit()?;
        debug!(count, "pre-key batch generated");
        Ok(out)
    }

    // ── Message hashes ───────────────────────────────────────────────────

    pub fn has_msg_hash(&self, hash: &[u8]) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM msg_hashes WHERE hash = ?1",
            [hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ── Received-raw queue ───────────────────────────────────────────────

    pub fn insert_received_raw(
        &self,
        data: &str,
        sender: &str,
        display_name: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO received_raw (data, sender, display_name, inserted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![data, sender, display_name, Utc::now().timestamp()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn load_received_raw(&self) -> Result<Vec<RawRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sequence, data, sender, display_name FROM received_raw ORDER BY sequence",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RawRecord {
                sequence: row.get(0)?,
                data: row.get(1)?,
                sender: row.get(2)?,
                display_name: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_received_raw(&self, sequence: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM received_raw WHERE sequence = ?1", [sequence])?;
        Ok(())
    }

    // ── Temp plaintext queue ─────────────────────────────────────────────

    pub fn load_temp_plaintext(&self) -> Result<Vec<TempRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sequence, descriptor, supplement, msg_type
             FROM temp_plaintext ORDER BY sequence",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TempRecord {
                sequence: row.get(0)?,
                descriptor: row.get(1)?,
                supplement: row.get(2)?,
                msg_type: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_temp_plaintext(&self, sequence: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM temp_plaintext WHERE sequence = ?1", [sequence])?;
        Ok(())
    }

    // ── Receive commit ───────────────────────────────────────────────────

    /// The single transaction closing out one successfully decrypted frame:
    /// duplicate hash, staged keys in and out, conversation state, optional
    /// pre-key retirement, optional plaintext temp record, raw-queue delete.
    /// Returns the temp-record sequence when one was inserted.
    pub fn commit_receive(&self, commit: ReceiveCommit<'_>) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT OR IGNORE INTO msg_hashes (hash, inserted_at) VALUES (?1, ?2)",
            params![commit.msg_hash, Utc::now().timestamp()],
        )?;

        let conv = commit.conversation;
        for blob in commit.staged {
            insert_staged_on(&tx, conv.local_user(), conv.partner(), conv.device_id(), blob)?;
        }
        if let Some(used) = commit.consumed_staged {
            tx.execute(
                "DELETE FROM staged_mks
                 WHERE local_user = ?1 AND partner = ?2 AND device_id = ?3 AND key_material = ?4",
                params![conv.local_user(), conv.partner(), conv.device_id(), used],
            )?;
        }
        if let Some(prekey_id) = commit.consumed_prekey {
            let removed = tx.execute("DELETE FROM prekeys WHERE id = ?1", [prekey_id as i64])?;
            if removed == 0 {
                warn!(prekey_id, "consumed pre-key was already gone");
            }
        }

        store_conversation_on(&tx, conv)?;

        let temp_sequence = match commit.temp {
            Some(temp) => {
                tx.execute(
                    "INSERT INTO temp_plaintext (descriptor, supplement, msg_type, inserted_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![temp.descriptor, temp.supplement, temp.msg_type, Utc::now().timestamp()],
                )?;
                Some(tx.last_insert_rowid())
            }
            None => None,
        };

        tx.execute(
            "DELETE FROM received_raw WHERE sequence = ?1",
            [commit.raw_sequence],
        )?;

        tx.commit()?;
        Ok(temp_sequence)
    }
}

fn store_conversation_on(conn: &Connection, conv: &Conversation) -> Result<(), StoreError> {
    let peer_identity = conv.peer_identity().map(|key| hex::encode(key.serialize()));
    conn.execute(
        "INSERT INTO conversations (local_user, partner, device_id, data, peer_identity, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (local_user, partner, device_id)
         DO UPDATE SET data = ?4, peer_identity = ?5, updated_at = ?6",
        params![
            conv.local_user(),
            conv.partner(),
            conv.device_id(),
            conv.serialize()?,
            peer_identity,
            Utc::now().timestamp()
        ],
    )?;
    Ok(())
}

fn insert_staged_on(
    conn: &Connection,
    local_user: &str,
    partner: &str,
    device_id: &str,
    key_material: &[u8],
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO staged_mks
         (local_user, partner, device_id, key_material, inserted_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![local_user, partner, device_id, key_material, Utc::now().timestamp()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pl_crypto::curve::generate_key_pair;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn conversation(local: &str, partner: &str, device: &str) -> Conversation {
        let mut conv = Conversation::new(local, partner, device);
        conv.set_identity_pair(Some(generate_key_pair()));
        conv.set_peer_identity(Some(generate_key_pair().public().clone()));
        conv.set_root_key(Some([1; 32]));
        conv.set_send_chain(Some([2; 32]));
        conv
    }

    #[test]
    fn conversation_roundtrip_and_update() {
        let store = store();
        let mut conv = conversation("alice", "bob", "dev-1");
        store.store_conversation(&conv).unwrap();
        assert!(store.has_conversation("alice", "bob", "dev-1").unwrap());

        let loaded = store.load_conversation("alice", "bob", "dev-1").unwrap().unwrap();
        assert_eq!(loaded.root_key(), conv.root_key());

        conv.set_send_n(9);
        store.store_conversation(&conv).unwrap();
        let loaded = store.load_conversation("alice", "bob", "dev-1").unwrap().unwrap();
        assert_eq!(loaded.send_n(), 9);
    }

    #[test]
    fn missing_conversation_is_none() {
        let store = store();
        assert!(store.load_conversation("a", "b", "c").unwrap().is_none());
        assert!(!store.has_conversation("a", "b", "c").unwrap());
    }

    #[test]
    fn conversation_devices_excludes_local_record() {
        let store = store();
        store.store_conversation(&conversation("alice", "bob", "dev-1")).unwrap();
        store.store_conversation(&conversation("alice", "bob", "dev-2")).unwrap();
        store.store_conversation(&Conversation::local("alice")).unwrap();

        let mut devices = store.conversation_devices("alice", "bob").unwrap();
        devices.sort();
        assert_eq!(devices, vec!["dev-1", "dev-2"]);
        assert!(store.conversation_devices("alice", "alice").unwrap().is_empty());
    }

    #[test]
    fn prekey_batch_has_unique_ids_and_parses_back() {
        let store = store();
        let batch = store.generate_prekeys(20).unwrap();
        assert_eq!(batch.len(), 20);
        assert_eq!(store.prekey_count().unwrap(), 20);

        let mut ids: Vec<u32> = batch.iter().map(|pk| pk.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 20, "pre-key ids must be unique");

        let first = &batch[0];
        let loaded = store.load_prekey(first.id).unwrap().unwrap();
        assert_eq!(loaded.pair.public(), first.pair.public());
    }

    #[test]
    fn msg_hash_duplicate_detection() {
        let store = store();
        let hash = [7u8; 32];
        assert!(!store.has_msg_hash(&hash).unwrap());

        let conv = conversation("alice", "bob", "dev-1");
        let seq = store.insert_received_raw("payload", "bob", "Bob").unwrap();
        store
            .commit_receive(ReceiveCommit {
                msg_hash: &hash,
                conversation: &conv,
                staged: &[],
                consumed_staged: None,
                consumed_prekey: None,
                temp: None,
                raw_sequence: seq,
            })
            .unwrap();
        assert!(store.has_msg_hash(&hash).unwrap());
    }

    #[test]
    fn raw_queue_is_ordered_and_deletable() {
        let store = store();
        let s1 = store.insert_received_raw("one", "bob", "Bob").unwrap();
        let s2 = store.insert_received_raw("two", "bob", "Bob").unwrap();
        assert!(s2 > s1);

        let records = store.load_received_raw().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, "one");
        assert_eq!(records[1].data, "two");

        store.delete_received_raw(s1).unwrap();
        let records = store.load_received_raw().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, s2);
    }

    #[test]
    fn commit_receive_is_one_atomic_step() {
        let store = store();
        let conv = conversation("alice", "bob", "dev-1");
        let raw_seq = store.insert_received_raw("frame", "bob", "Bob").unwrap();
        let staged = vec![vec![1u8; 80], vec![2u8; 80]];

        let temp_seq = store
            .commit_receive(ReceiveCommit {
                msg_hash: &[9u8; 32],
                conversation: &conv,
                staged: &staged,
                consumed_staged: None,
                consumed_prekey: None,
                temp: Some(TempInsert {
                    descriptor: "{\"msgId\":\"m1\"}",
                    supplement: "",
                    msg_type: 0,
                }),
                raw_sequence: raw_seq,
            })
            .unwrap()
            .unwrap();

        // Everything landed, the raw record is gone.
        assert!(store.has_msg_hash(&[9u8; 32]).unwrap());
        assert!(store.has_conversation("alice", "bob", "dev-1").unwrap());
        assert_eq!(store.load_staged_mks("alice", "bob", "dev-1").unwrap().len(), 2);
        assert!(store.load_received_raw().unwrap().is_empty());

        let temps = store.load_temp_plaintext().unwrap();
        assert_eq!(temps.len(), 1);
        assert_eq!(temps[0].sequence, temp_seq);
        assert_eq!(temps[0].descriptor, "{\"msgId\":\"m1\"}");

        store.delete_temp_plaintext(temp_seq).unwrap();
        assert!(store.load_temp_plaintext().unwrap().is_empty());
    }

    #[test]
    fn commit_receive_consumes_staged_key_and_prekey() {
        let store = store();
        let conv = conversation("alice", "bob", "dev-1");
        store.insert_staged_mk("alice", "bob", "dev-1", &[5u8; 80]).unwrap();
        let prekeys = store.generate_prekeys(1).unwrap();
        let raw_seq = store.insert_received_raw("frame", "bob", "Bob").unwrap();

        store
            .commit_receive(ReceiveCommit {
                msg_hash: &[3u8; 32],
                conversation: &conv,
                staged: &[],
                consumed_staged: Some(&[5u8; 80]),
                consumed_prekey: Some(prekeys[0].id),
                temp: None,
                raw_sequence: raw_seq,
            })
            .unwrap();

        assert!(store.load_staged_mks("alice", "bob", "dev-1").unwrap().is_empty());
        assert!(!store.contains_prekey(prekeys[0].id).unwrap());
        assert!(store.load_prekey(prekeys[0].id).unwrap().is_none());
    }

    #[test]
    fn expired_records_are_cleaned_up() {
        let store = store();
        // Insert a staged key and a hash with a timestamp past the horizon.
        {
            let conn = store.conn.lock();
            let old = Utc::now().timestamp() - RETENTION_SECONDS - 10;
            conn.execute(
                "INSERT INTO staged_mks (local_user, partner, device_id, key_material, inserted_at)
                 VALUES ('a', 'b', 'd', ?1, ?2)",
                params![vec![1u8; 80], old],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO msg_hashes (hash, inserted_at) VALUES (?1, ?2)",
                params![vec![1u8; 32], old],
            )
            .unwrap();
        }
        store.insert_staged_mk("a", "b", "d", &[2u8; 80]).unwrap();

        store.cleanup_expired().unwrap();
        let remaining = store.load_staged_mks("a", "b", "d").unwrap();
        assert_eq!(remaining, vec![vec![2u8; 80]]);
        assert!(!store.has_msg_hash(&[1u8; 32]).unwrap());
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.db");
        {
            let store = Store::open(&path).unwrap();
            store.store_conversation(&conversation("alice", "bob", "dev-1")).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert!(store.has_conversation("alice", "bob", "dev-1").unwrap());
    }
}
