//! Secret lifecycle: create, reveal, inspect, list, search, delete.
//!
//! A record moves from active to viewed (one-time secrets only), expired
//! (derived from the clock) or deleted. Every read path that finds a record
//! missing, expired, burned or owned by someone else answers with the same
//! [`SecretError::NotFound`].

use std::fmt;
use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::SecretError;
use crate::notify::{BurnNotice, BurnNotifier};
use crate::store::{Codec, OwnerDirectory, SecretRecord, SecretStatus, SecretStore, StoreError};

pub const ID_LEN: usize = 16;
pub const MAX_SECRET_BYTES: usize = 1024 * 1024;
const MAX_ID_ATTEMPTS: usize = 5;
const LIST_PREVIEW_CHARS: usize = 50;
const BURN_PREVIEW_CHARS: usize = 20;
const DECRYPTION_ERROR_PREVIEW: &str = "[Decryption Error]";

/// Authenticated caller as established by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub owner_id: String,
    /// Where burn notifications for this owner go.
    pub email: Option<String>,
}

impl Identity {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[derive(Clone, Deserialize)]
pub struct NewSecret {
    pub text: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_one_time")]
    pub one_time_access: bool,
}

fn default_one_time() -> bool {
    true
}

impl NewSecret {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            password: None,
            expires_at: None,
            one_time_access: true,
        }
    }
}

impl fmt::Debug for NewSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSecret")
            .field("text", &"[REDACTED]")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("one_time_access", &self.one_time_access)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Revealed {
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub one_time_access: bool,
}

impl fmt::Debug for Revealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Revealed")
            .field("text", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("one_time_access", &self.one_time_access)
            .finish()
    }
}

/// Metadata only. Readable without the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub one_time_access: bool,
    pub has_password: bool,
    pub is_viewed: bool,
}

/// One row of an owner's dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSummary {
    pub id: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_viewed: bool,
    pub one_time_access: bool,
    pub has_password: bool,
    pub status: SecretStatus,
}

impl SecretSummary {
    fn new(record: &SecretRecord, preview: String, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id.clone(),
            preview,
            created_at: record.created_at,
            expires_at: record.expires_at,
            is_viewed: record.is_viewed,
            one_time_access: record.one_time_access,
            has_password: record.has_password(),
            status: record.status(now),
        }
    }
}

pub struct SecretService {
    store: Arc<dyn SecretStore>,
    owners: Arc<dyn OwnerDirectory>,
    codec: Arc<Codec>,
    notifier: Arc<dyn BurnNotifier>,
    clock: Arc<dyn Clock>,
}

impl SecretService {
    pub fn new(
        store: Arc<dyn SecretStore>,
        owners: Arc<dyn OwnerDirectory>,
        codec: Arc<Codec>,
        notifier: Arc<dyn BurnNotifier>,
    ) -> Self {
        Self {
            store,
            owners,
            codec,
            notifier,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn create(
        &self,
        identity: Option<&Identity>,
        new: NewSecret,
    ) -> Result<Created, SecretError> {
        let identity = identity.ok_or(SecretError::Unauthorized)?;
        let now = self.clock.now();

        if new.text.trim().is_empty() {
            return Err(SecretError::validation("secret text is required"));
        }
        if new.text.len() > MAX_SECRET_BYTES {
            return Err(SecretError::validation(format!(
                "secret text exceeds {MAX_SECRET_BYTES} bytes"
            )));
        }
        if matches!(new.expires_at, Some(exp) if exp <= now) {
            return Err(SecretError::validation("expiration must be in the future"));
        }
        let password_hash = match new.password {
            Some(p) if p.is_empty() => {
                return Err(SecretError::validation("password must not be empty"))
            }
            Some(p) => Some(hash_password(p).await?),
            None => None,
        };

        let ciphertext = self.codec.encrypt(&new.text)?;

        if let Some(email) = &identity.email {
            if let Err(e) = self.owners.remember(&identity.owner_id, email).await {
                warn!(owner = %identity.owner_id, error = %e, "failed to record owner email");
            }
        }

        let mut record = SecretRecord {
            id: generate_id(),
            ciphertext,
            password_hash,
            expires_at: new.expires_at,
            one_time_access: new.one_time_access,
            is_viewed: false,
            owner_id: identity.owner_id.clone(),
            created_at: now,
        };

        for attempt in 1..=MAX_ID_ATTEMPTS {
            match self.store.insert(record.clone()).await {
                Ok(stored) => {
                    info!(
                        id = %stored.id,
                        one_time = stored.one_time_access,
                        password = stored.has_password(),
                        "secret created"
                    );
                    return Ok(Created {
                        id: stored.id,
                        created_at: stored.created_at,
                    });
                }
                Err(StoreError::Duplicate(id)) => {
                    debug!(%id, attempt, "secret id collision, regenerating");
                    record.id = generate_id();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SecretError::Internal(anyhow::anyhow!(
            "could not allocate a unique secret id after {MAX_ID_ATTEMPTS} attempts"
        )))
    }

    /// Reveal the plaintext. A one-time secret burns on the first successful call.
    pub async fn get(
        &self,
        id: &str,
        password: Option<&str>,
        viewer_ip: Option<&str>,
    ) -> Result<Revealed, SecretError> {
        let record = self.load_live(id).await?;

        if let Some(hash) = &record.password_hash {
            let Some(password) = password.filter(|p| !p.is_empty()) else {
                return Err(SecretError::PasswordRequired);
            };
            if !verify_password(password.to_owned(), hash.clone()).await? {
                debug!(%id, "wrong password");
                return Err(SecretError::InvalidPassword);
            }
        }

        let text = self.codec.decrypt(&record.ciphertext).map_err(|e| {
            warn!(%id, error = %e, "stored secret could not be decrypted");
            SecretError::Decryption
        })?;

        if record.one_time_access {
            if !self.store.mark_viewed(&record.id).await? {
                debug!(%id, "lost burn race");
                return Err(SecretError::NotFound);
            }
            info!(%id, "one-time secret burned");
            self.dispatch_burn(&record, &text, viewer_ip);
        }

        Ok(Revealed {
            text,
            created_at: record.created_at,
            one_time_access: record.one_time_access,
        })
    }

    pub async fn get_info(&self, id: &str) -> Result<SecretInfo, SecretError> {
        let record = self.load_live(id).await?;
        Ok(SecretInfo {
            has_password: record.has_password(),
            id: record.id,
            created_at: record.created_at,
            expires_at: record.expires_at,
            one_time_access: record.one_time_access,
            is_viewed: record.is_viewed,
        })
    }

    /// Every secret the caller owns, newest first.
    pub async fn list(&self, identity: Option<&Identity>) -> Result<Vec<SecretSummary>, SecretError> {
        let identity = identity.ok_or(SecretError::Unauthorized)?;
        let records = self.owned_newest_first(identity).await?;
        let now = self.clock.now();
        Ok(records
            .iter()
            .map(|r| {
                let preview = match self.codec.decrypt(&r.ciphertext) {
                    Ok(text) => truncate_preview(&text, LIST_PREVIEW_CHARS),
                    Err(e) => {
                        warn!(id = %r.id, error = %e, "failed to decrypt secret for listing");
                        DECRYPTION_ERROR_PREVIEW.to_owned()
                    }
                };
                SecretSummary::new(r, preview, now)
            })
            .collect())
    }

    /// Owned secrets whose text or id contains `query`, ignoring case.
    /// Records that fail to decrypt are left out.
    pub async fn search(
        &self,
        identity: Option<&Identity>,
        query: &str,
    ) -> Result<Vec<SecretSummary>, SecretError> {
        let identity = identity.ok_or(SecretError::Unauthorized)?;
        let needle = query.to_lowercase();
        let records = self.owned_newest_first(identity).await?;
        let now = self.clock.now();
        Ok(records
            .iter()
            .filter_map(|r| {
                let text = self.codec.decrypt(&r.ciphertext).ok()?;
                let hit = text.to_lowercase().contains(&needle)
                    || r.id.to_lowercase().contains(&needle);
                hit.then(|| SecretSummary::new(r, truncate_preview(&text, LIST_PREVIEW_CHARS), now))
            })
            .collect())
    }

    pub async fn delete(&self, identity: Option<&Identity>, id: &str) -> Result<(), SecretError> {
        let identity = identity.ok_or(SecretError::Unauthorized)?;
        match self.store.find_by_id(id).await? {
            Some(record) if record.owner_id == identity.owner_id => {
                self.store.delete_by_id(id).await?;
                info!(%id, "secret deleted");
                Ok(())
            }
            _ => Err(SecretError::NotFound),
        }
    }

    /// Remove records that expired more than `grace` ago. Returns how many went.
    pub async fn sweep_expired(&self, grace: chrono::Duration) -> Result<usize, SecretError> {
        let cutoff = self.clock.now() - grace;
        let removed = self.store.prune_expired(cutoff).await?;
        if !removed.is_empty() {
            info!(count = removed.len(), "swept expired secrets");
        }
        Ok(removed.len())
    }

    /// Run [`Self::sweep_expired`] every `interval` in the background.
    pub fn spawn_sweep(self: Arc<Self>, interval: std::time::Duration, grace: chrono::Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_expired(grace).await {
                    warn!(error = %e, "background sweep error");
                }
            }
        });
    }

    pub async fn health(&self) -> Result<(), SecretError> {
        self.store.ping().await?;
        Ok(())
    }

    /// The record behind `id` if it can still be read. Expired records are
    /// deleted on the way out.
    async fn load_live(&self, id: &str) -> Result<SecretRecord, SecretError> {
        let Some(record) = self.store.find_by_id(id).await? else {
            return Err(SecretError::NotFound);
        };
        if record.is_expired(self.clock.now()) {
            match self.store.delete_by_id(id).await {
                Ok(()) => debug!(%id, "removed expired secret on access"),
                Err(e) => warn!(%id, error = %e, "failed to remove expired secret"),
            }
            return Err(SecretError::NotFound);
        }
        if record.is_burned() {
            return Err(SecretError::NotFound);
        }
        Ok(record)
    }

    async fn owned_newest_first(&self, identity: &Identity) -> Result<Vec<SecretRecord>, SecretError> {
        let mut records = self.store.find_all_by_owner(&identity.owner_id).await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    fn dispatch_burn(&self, record: &SecretRecord, text: &str, viewer_ip: Option<&str>) {
        let owners = Arc::clone(&self.owners);
        let notifier = Arc::clone(&self.notifier);
        let owner_id = record.owner_id.clone();
        let mut notice = BurnNotice {
            secret_id: record.id.clone(),
            owner_email: String::new(),
            viewed_at: self.clock.now(),
            viewer_ip: viewer_ip.map(str::to_owned),
            preview: Some(text.chars().take(BURN_PREVIEW_CHARS).collect()),
        };

        tokio::spawn(async move {
            notice.owner_email = match owners.email_for(&owner_id).await {
                Ok(Some(email)) => email,
                Ok(None) => {
                    debug!(secret_id = %notice.secret_id, "owner has no notification address");
                    return;
                }
                Err(e) => {
                    warn!(secret_id = %notice.secret_id, error = %e, "owner lookup failed");
                    return;
                }
            };
            let delivered = notifier.notify_burn(&notice).await;
            debug!(secret_id = %notice.secret_id, delivered, "burn notification dispatched");
        });
    }
}

fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

fn truncate_preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_owned(),
    }
}

async fn hash_password(password: String) -> Result<String, SecretError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| SecretError::Internal(anyhow::anyhow!("hash password: {e}")))
    })
    .await
    .map_err(|e| SecretError::Internal(anyhow::anyhow!("hash task failed: {e}")))?
}

async fn verify_password(password: String, hash: String) -> Result<bool, SecretError> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| SecretError::Internal(anyhow::anyhow!("stored password hash: {e}")))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|e| SecretError::Internal(anyhow::anyhow!("verify task failed: {e}")))?
}
