use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::model::SecretRecord;
use super::{OwnerDirectory, SecretStore, StoreError};

/// Process-local store. Contents vanish on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    secrets: Mutex<HashMap<String, SecretRecord>>,
    owners: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn secrets(&self) -> MutexGuard<'_, HashMap<String, SecretRecord>> {
        self.secrets.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.owners.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn insert(&self, record: SecretRecord) -> Result<SecretRecord, StoreError> {
        let mut secrets = self.secrets();
        if secrets.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        secrets.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.secrets().get(id).cloned())
    }

    async fn find_all_by_owner(&self, owner_id: &str) -> Result<Vec<SecretRecord>, StoreError> {
        Ok(self
            .secrets()
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn mark_viewed(&self, id: &str) -> Result<bool, StoreError> {
        let mut secrets = self.secrets();
        match secrets.get_mut(id) {
            Some(record) if !record.is_viewed => {
                record.is_viewed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        self.secrets().remove(id);
        Ok(())
    }

    async fn prune_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut secrets = self.secrets();
        let expired: Vec<String> = secrets
            .values()
            .filter(|r| matches!(r.expires_at, Some(exp) if exp <= cutoff))
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            secrets.remove(id);
        }
        Ok(expired)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl OwnerDirectory for MemoryStore {
    async fn email_for(&self, owner_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.owners().get(owner_id).cloned())
    }

    async fn remember(&self, owner_id: &str, email: &str) -> Result<(), StoreError> {
        self.owners().insert(owner_id.to_owned(), email.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(id: &str) -> SecretRecord {
        SecretRecord {
            id: id.into(),
            ciphertext: String::new(),
            password_hash: None,
            expires_at: None,
            one_time_access: true,
            is_viewed: false,
            owner_id: "alice".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let s = MemoryStore::new();
        s.insert(record("X")).await.unwrap();
        assert!(matches!(
            s.insert(record("X")).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mark_viewed_has_one_winner() {
        let s = Arc::new(MemoryStore::new());
        s.insert(record("RACE")).await.unwrap();
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let s = Arc::clone(&s);
                tokio::spawn(async move { s.mark_viewed("RACE").await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            winners += h.await.unwrap() as usize;
        }
        assert_eq!(winners, 1);
    }
}
