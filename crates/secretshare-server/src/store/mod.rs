//! Persistence for secret records.
//!
//! The lifecycle engine only talks to the [`SecretStore`] and
//! [`OwnerDirectory`] traits. Every implementation owns its own concurrency
//! control: in particular [`SecretStore::mark_viewed`] must be a single
//! conditional update so that two concurrent reads of a one-time secret can
//! never both succeed.

pub mod crypto;
pub mod db;
pub mod memory;
pub mod model;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use crypto::{Codec, EncryptionKey, Keyring};
pub use db::RedbStore;
pub use memory::MemoryStore;
pub use model::{SecretRecord, SecretStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("secret id already exists: {0}")]
    Duplicate(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::Duplicate`] if the id is taken.
    async fn insert(&self, record: SecretRecord) -> Result<SecretRecord, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<SecretRecord>, StoreError>;

    /// All records owned by `owner_id`, in no particular order.
    async fn find_all_by_owner(&self, owner_id: &str) -> Result<Vec<SecretRecord>, StoreError>;

    /// Atomically set `is_viewed` if it is still false. Returns whether this
    /// call performed the transition.
    async fn mark_viewed(&self, id: &str) -> Result<bool, StoreError>;

    /// Remove a record. Removing a missing id is not an error.
    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError>;

    /// Remove every record whose expiry is at or before `cutoff`. Returns the removed ids.
    async fn prune_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    /// Cheap liveness probe for health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Resolves where burn notifications for an owner should go.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn email_for(&self, owner_id: &str) -> Result<Option<String>, StoreError>;

    async fn remember(&self, owner_id: &str, email: &str) -> Result<(), StoreError>;
}
