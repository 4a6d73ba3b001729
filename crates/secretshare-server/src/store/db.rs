use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use super::crypto::Codec;
use super::model::SecretRecord;
use super::{OwnerDirectory, SecretStore, StoreError};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
const OWNERS: TableDefinition<&str, &str> = TableDefinition::new("owners");

/// Leading byte of every encoded record, bumped whenever the layout changes.
const RECORD_FORMAT: u8 = 0x01;

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(OWNERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Run a synchronous redb operation on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&RedbStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        let result = tokio::task::spawn_blocking(move || f(&store))
            .await
            .context("store task panicked")?;
        Ok(result?)
    }

    fn insert_sync(&self, record: &SecretRecord) -> Result<bool> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(SECRETS)?;
            if table.get(record.id.as_str())?.is_some() {
                false
            } else {
                table.insert(record.id.as_str(), bytes.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    fn find_sync(&self, id: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        raw_bytes.map(|bytes| decode(&bytes)).transpose()
    }

    fn find_by_owner_sync(&self, owner_id: &str) -> Result<Vec<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            let record = decode(v.value())?;
            if record.owner_id == owner_id {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn mark_viewed_sync(&self, id: &str) -> Result<bool> {
        // redb allows one write transaction at a time, so the read and the
        // flip below cannot interleave with another mark_viewed.
        let write_txn = self.db.begin_write()?;
        let flipped = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Clone the bytes so the AccessGuard (which borrows `table`) is
            // dropped before any mutation.
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => false,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;
                    if record.is_viewed {
                        false
                    } else {
                        record.is_viewed = true;
                        let updated = encode(&record)?;
                        table.insert(id, updated.as_slice())?;
                        true
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(flipped)
    }

    fn delete_sync(&self, id: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let existed = table.remove(id)?.is_some();
            existed
        };
        write_txn.commit()?;
        if existed {
            debug!(id = %id, "removed secret");
        }
        Ok(())
    }

    fn prune_sync(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        // Collect expired ids in a read pass first.
        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SECRETS)?;
            let mut ids = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let record = decode(v.value())?;
                if matches!(record.expires_at, Some(exp) if exp <= cutoff) {
                    ids.push(k.value().to_owned());
                }
            }
            ids
        };

        if expired.is_empty() {
            return Ok(vec![]);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            for id in &expired {
                table.remove(id.as_str())?;
            }
        }
        write_txn.commit()?;

        info!(removed = expired.len(), "pruned expired secrets");
        Ok(expired)
    }

    /// Re-encrypt every live record that is not sealed under `codec`'s
    /// primary key. Returns the number of records rewritten.
    pub fn rotate(&self, codec: &Codec) -> Result<usize> {
        let now = Utc::now();

        let entries: Vec<(String, Vec<u8>)> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SECRETS)?;
            let mut out = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                out.push((k.value().to_owned(), v.value().to_vec()));
            }
            out
        };

        let write_txn = self.db.begin_write()?;
        let mut count = 0usize;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            for (id, raw_bytes) in &entries {
                let mut record = decode(raw_bytes)?;

                // Expired records are left for the sweep.
                if record.is_expired(now) || !codec.needs_reseal(&record.ciphertext) {
                    continue;
                }

                record.ciphertext = codec
                    .reseal(&record.ciphertext)
                    .with_context(|| format!("reseal secret {id}"))?;
                let bytes = encode(&record)?;
                table.insert(id.as_str(), bytes.as_slice())?;
                count += 1;
            }
        }
        write_txn.commit()?;

        info!(
            rotated = count,
            key_version = codec.primary_version(),
            "key rotation complete"
        );
        Ok(count)
    }
}

#[async_trait]
impl SecretStore for RedbStore {
    async fn insert(&self, record: SecretRecord) -> Result<SecretRecord, StoreError> {
        let (inserted, record) = self
            .blocking(move |s| s.insert_sync(&record).map(|ok| (ok, record)))
            .await?;
        if inserted {
            debug!(id = %record.id, "stored secret");
            Ok(record)
        } else {
            Err(StoreError::Duplicate(record.id))
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        let id = id.to_owned();
        self.blocking(move |s| s.find_sync(&id)).await
    }

    async fn find_all_by_owner(&self, owner_id: &str) -> Result<Vec<SecretRecord>, StoreError> {
        let owner_id = owner_id.to_owned();
        self.blocking(move |s| s.find_by_owner_sync(&owner_id)).await
    }

    async fn mark_viewed(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_owned();
        self.blocking(move |s| s.mark_viewed_sync(&id)).await
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        self.blocking(move |s| s.delete_sync(&id)).await
    }

    async fn prune_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        self.blocking(move |s| s.prune_sync(cutoff)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.blocking(|s| {
            let read_txn = s.db.begin_read()?;
            read_txn.open_table(SECRETS)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl OwnerDirectory for RedbStore {
    async fn email_for(&self, owner_id: &str) -> Result<Option<String>, StoreError> {
        let owner_id = owner_id.to_owned();
        self.blocking(move |s| {
            let read_txn = s.db.begin_read()?;
            let table = read_txn.open_table(OWNERS)?;
            let email = table.get(owner_id.as_str())?.map(|g| g.value().to_owned());
            Ok(email)
        })
        .await
    }

    async fn remember(&self, owner_id: &str, email: &str) -> Result<(), StoreError> {
        let (owner_id, email) = (owner_id.to_owned(), email.to_owned());
        self.blocking(move |s| {
            let write_txn = s.db.begin_write()?;
            {
                let mut table = write_txn.open_table(OWNERS)?;
                table.insert(owner_id.as_str(), email.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }
}

/// Encode a record as `[RECORD_FORMAT] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_FORMAT);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_FORMAT, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format {marker:#04x}"),
        None => anyhow::bail!("empty record"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::crypto::{EncryptionKey, Keyring};
    use chrono::Duration;
    use tempfile::tempdir;

    fn make_store() -> (RedbStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn record(id: &str, owner: &str) -> SecretRecord {
        SecretRecord {
            id: id.into(),
            ciphertext: "legacy text".into(),
            password_hash: None,
            expires_at: None,
            one_time_access: true,
            is_viewed: false,
            owner_id: owner.into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_find_delete() {
        let (s, _dir) = make_store();
        s.insert(record("A", "alice")).await.unwrap();
        let found = s.find_by_id("A").await.unwrap().unwrap();
        assert_eq!(found.owner_id, "alice");
        assert!(!found.is_viewed);

        s.delete_by_id("A").await.unwrap();
        assert!(s.find_by_id("A").await.unwrap().is_none());
        // Deleting again is fine.
        s.delete_by_id("A").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let (s, _dir) = make_store();
        s.insert(record("DUP", "alice")).await.unwrap();
        let err = s.insert(record("DUP", "bob")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == "DUP"));
        // The original record is untouched.
        assert_eq!(s.find_by_id("DUP").await.unwrap().unwrap().owner_id, "alice");
    }

    #[tokio::test]
    async fn mark_viewed_flips_once() {
        let (s, _dir) = make_store();
        s.insert(record("V", "alice")).await.unwrap();
        assert!(s.mark_viewed("V").await.unwrap());
        assert!(!s.mark_viewed("V").await.unwrap());
        assert!(s.find_by_id("V").await.unwrap().unwrap().is_viewed);
        assert!(!s.mark_viewed("missing").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mark_viewed_has_one_winner() {
        let (s, _dir) = make_store();
        s.insert(record("RACE", "alice")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = s.clone();
            handles.push(tokio::spawn(async move { s.mark_viewed("RACE").await.unwrap() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn find_all_by_owner_filters() {
        let (s, _dir) = make_store();
        s.insert(record("A1", "alice")).await.unwrap();
        s.insert(record("A2", "alice")).await.unwrap();
        s.insert(record("B1", "bob")).await.unwrap();
        let mut ids: Vec<_> = s
            .find_all_by_owner("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["A1", "A2"]);
    }

    #[tokio::test]
    async fn prune_removes_only_expired() {
        let (s, _dir) = make_store();
        let now = Utc::now();
        let mut dead = record("DEAD", "alice");
        dead.expires_at = Some(now - Duration::seconds(10));
        let mut live = record("LIVE", "alice");
        live.expires_at = Some(now + Duration::hours(1));
        s.insert(dead).await.unwrap();
        s.insert(live).await.unwrap();
        s.insert(record("FOREVER", "alice")).await.unwrap();

        assert_eq!(s.prune_expired(now).await.unwrap(), vec!["DEAD".to_string()]);
        assert!(s.find_by_id("LIVE").await.unwrap().is_some());
        assert!(s.find_by_id("FOREVER").await.unwrap().is_some());
        assert!(s.prune_expired(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn owner_directory_round_trip() {
        let (s, _dir) = make_store();
        assert_eq!(s.email_for("alice").await.unwrap(), None);
        s.remember("alice", "alice@example.com").await.unwrap();
        s.remember("alice", "alice@example.org").await.unwrap();
        assert_eq!(
            s.email_for("alice").await.unwrap().as_deref(),
            Some("alice@example.org")
        );
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        {
            let s = RedbStore::open(&path).unwrap();
            s.insert(record("KEEP", "alice")).await.unwrap();
        }
        let s = RedbStore::open(&path).unwrap();
        assert!(s.find_by_id("KEEP").await.unwrap().is_some());
        s.ping().await.unwrap();
    }

    #[tokio::test]
    async fn rotate_reseals_old_records() {
        let (s, _dir) = make_store();
        let old_key = EncryptionKey::generate();
        let old_hex = old_key.to_hex();
        let old = Codec::new(Keyring::new(1, old_key));

        let mut sealed = record("OLD", "alice");
        sealed.ciphertext = old.encrypt("rotate me").unwrap();
        s.insert(sealed).await.unwrap();
        // Legacy plaintext is sealed on rotation too.
        s.insert(record("LEGACY", "alice")).await.unwrap();

        let ring = Keyring::new(2, EncryptionKey::generate())
            .with_retired(1, EncryptionKey::parse(&old_hex).unwrap())
            .unwrap();
        let current = Codec::new(ring);

        assert_eq!(s.rotate(&current).unwrap(), 2);
        assert_eq!(s.rotate(&current).unwrap(), 0);

        let rotated = s.find_by_id("OLD").await.unwrap().unwrap();
        assert!(!current.needs_reseal(&rotated.ciphertext));
        assert_eq!(current.decrypt(&rotated.ciphertext).unwrap(), "rotate me");
    }

    #[test]
    fn decode_rejects_unknown_format() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x7f, 1, 2, 3]).is_err());
    }
}
