use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use tracing::{info, warn};

use crate::notify::{BurnNotifier, LogNotifier, SmtpConfig, SmtpNotifier, WebhookNotifier};
use crate::ratelimit::{Policies, Policy};
use crate::store::{Codec, EncryptionKey, Keyring};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    Redb,
    Memory,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown store kind {other:?} (expected redb or memory)"),
        }
    }
}

/// Where the primary encryption key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Inline(String),
    File(PathBuf),
    /// Nothing configured: generate a throwaway key.
    Ephemeral,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub store: StoreKind,
    pub key_source: KeySource,
    pub key_version: u8,
    /// `version:key` pairs, comma separated. Decrypt only.
    pub retired_keys: Option<String>,
    /// Bearer token required on owner routes when set.
    pub api_key: Option<String>,
    pub cors_origins: Option<String>,
    pub sweep_interval: Duration,
    /// How long expired records stay visible before the sweep removes them.
    pub expired_grace: Duration,
    pub rate_limit_cleanup: Duration,
    pub policies: Policies,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub smtp: Option<SmtpSettings>,
}

/// SMTP settings as read from the environment; `from_address` is checked when
/// the notifier is built.
#[derive(Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: Option<String>,
    pub use_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }
}

impl ServerConfig {
    /// Build a config from `SECRETSHARE_*` variables resolved through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("SECRETSHARE_{name}")).filter(|v| !v.is_empty());
        let parsed = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());

        let key_source = match (var("ENCRYPTION_KEY_FILE"), var("ENCRYPTION_KEY")) {
            (Some(path), inline) => {
                if inline.is_some() {
                    warn!("both SECRETSHARE_ENCRYPTION_KEY and SECRETSHARE_ENCRYPTION_KEY_FILE are set; using file");
                }
                KeySource::File(PathBuf::from(path))
            }
            (None, Some(key)) => KeySource::Inline(key),
            (None, None) => KeySource::Ephemeral,
        };

        let store = match var("STORE").map(|s| s.parse::<StoreKind>()) {
            Some(Ok(kind)) => kind,
            Some(Err(e)) => {
                warn!(error = %e, "ignoring SECRETSHARE_STORE");
                StoreKind::default()
            }
            None => StoreKind::default(),
        };

        let defaults = Policies::default();
        let policy = |class: &str, fallback: Policy| {
            let max = var(&format!("RATE_{class}_MAX")).and_then(|v| v.trim().parse().ok());
            let window = parsed(&format!("RATE_{class}_WINDOW_SECS"));
            override_policy(&format!("RATE_{class}"), fallback, max, window)
        };
        let policies = Policies {
            create_secret: policy("CREATE", defaults.create_secret),
            access_secret: policy("ACCESS", defaults.access_secret),
            auth: policy("AUTH", defaults.auth),
            api: policy("API", defaults.api),
            user: override_policy(
                "USER_RATE",
                defaults.user,
                var("USER_RATE_MAX").and_then(|v| v.trim().parse().ok()),
                parsed("USER_RATE_WINDOW_SECS"),
            ),
        };

        let smtp = var("SMTP_HOST").map(|host| SmtpSettings {
            host,
            port: var("SMTP_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(587),
            username: var("SMTP_USERNAME"),
            password: var("SMTP_PASSWORD"),
            from_address: var("SMTP_FROM"),
            use_tls: var("SMTP_USE_TLS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        });

        Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: var("PORT").and_then(|p| p.parse().ok()).unwrap_or(8080),
            data_dir: var("DATA_DIR").map(PathBuf::from),
            store,
            key_source,
            key_version: var("KEY_VERSION")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(1),
            retired_keys: var("RETIRED_KEYS"),
            api_key: var("API_KEY"),
            cors_origins: var("CORS_ORIGINS"),
            sweep_interval: Duration::from_secs(parsed("SWEEP_INTERVAL_SECS").unwrap_or(300)),
            expired_grace: Duration::from_secs(parsed("EXPIRED_GRACE_SECS").unwrap_or(86_400)),
            rate_limit_cleanup: Duration::from_secs(60),
            policies,
            webhook_url: var("NOTIFY_WEBHOOK_URL"),
            webhook_secret: var("NOTIFY_WEBHOOK_SECRET"),
            smtp,
        }
    }
}

/// Longest rate limit window accepted from the environment (30 days).
pub const MAX_POLICY_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

fn override_policy(
    name: &str,
    base: Policy,
    max: Option<u32>,
    window_secs: Option<u64>,
) -> Policy {
    let window = match window_secs {
        None => base.window,
        Some(secs) => {
            if secs > MAX_POLICY_WINDOW_SECS {
                warn!(
                    setting = %format!("SECRETSHARE_{name}_WINDOW_SECS"),
                    requested = secs,
                    max = MAX_POLICY_WINDOW_SECS,
                    "rate limit window too large; capping"
                );
            }
            i64::try_from(secs.min(MAX_POLICY_WINDOW_SECS))
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(base.window)
        }
    };
    Policy {
        max_requests: max.unwrap_or(base.max_requests),
        window,
    }
}

/// Read a key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Parse `"2:<key>,3:<key>"` into versioned keys.
pub fn parse_retired_keys(spec: &str) -> Result<Vec<(u8, EncryptionKey)>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (version, key) = entry
                .split_once(':')
                .with_context(|| format!("retired key entry must be version:key, got {entry:?}"))?;
            let version: u8 = version
                .trim()
                .parse()
                .with_context(|| format!("invalid retired key version {version:?}"))?;
            let key = EncryptionKey::parse(key)
                .with_context(|| format!("invalid retired key for version {version}"))?;
            Ok((version, key))
        })
        .collect()
}

/// The configured keyring, or `None` when no key is configured.
pub fn load_keyring(cfg: &ServerConfig) -> Result<Option<Keyring>> {
    let primary = match &cfg.key_source {
        KeySource::Inline(key) => key.clone(),
        KeySource::File(path) => read_key_file(path)?,
        KeySource::Ephemeral => {
            if cfg.retired_keys.is_some() {
                anyhow::bail!("SECRETSHARE_RETIRED_KEYS is set but no primary encryption key is");
            }
            return Ok(None);
        }
    };
    let key = EncryptionKey::parse(&primary).context("invalid primary encryption key")?;
    let mut ring = Keyring::new(cfg.key_version, key);
    if let Some(spec) = &cfg.retired_keys {
        for (version, key) in parse_retired_keys(spec)? {
            ring = ring.with_retired(version, key)?;
        }
    }
    Ok(Some(ring))
}

pub fn build_codec(cfg: &ServerConfig) -> Result<Codec> {
    Ok(match load_keyring(cfg)? {
        Some(ring) => Codec::new(ring),
        None => Codec::ephemeral(),
    })
}

/// Webhook if configured, else SMTP, else log only.
pub fn build_notifier(cfg: &ServerConfig) -> Result<Arc<dyn BurnNotifier>> {
    if let Some(url) = &cfg.webhook_url {
        let secret = cfg
            .webhook_secret
            .clone()
            .context("SECRETSHARE_NOTIFY_WEBHOOK_SECRET is required with SECRETSHARE_NOTIFY_WEBHOOK_URL")?;
        info!(%url, "burn notifications via webhook");
        return Ok(Arc::new(WebhookNotifier::new(url.clone(), secret)?));
    }
    if let Some(smtp) = &cfg.smtp {
        let from_address = smtp
            .from_address
            .clone()
            .or_else(|| smtp.username.clone())
            .context("SECRETSHARE_SMTP_FROM is required with SECRETSHARE_SMTP_HOST")?;
        info!(host = %smtp.host, "burn notifications via SMTP");
        return Ok(Arc::new(SmtpNotifier::new(SmtpConfig {
            host: smtp.host.clone(),
            port: smtp.port,
            username: smtp.username.clone(),
            password: smtp.password.clone(),
            from_address,
            use_tls: smtp.use_tls,
        })?));
    }
    info!("no notification channel configured; burns are only logged");
    Ok(Arc::new(LogNotifier))
}

/// The configured data directory, or the platform one
/// (`~/.local/share/secretshare/` and friends). Created if missing.
pub fn resolve_data_dir(data_dir: Option<&Path>) -> Result<PathBuf> {
    let path = match data_dir {
        Some(d) => d.to_owned(),
        None => ProjectDirs::from("", "", "secretshare")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("SECRETSHARE_{k}"), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn oversized_rate_window_is_capped() {
        let cfg = config(&[
            ("RATE_CREATE_WINDOW_SECS", "10000000000000000"),
            ("USER_RATE_WINDOW_SECS", "18446744073709551615"),
        ]);
        let cap = chrono::Duration::seconds(MAX_POLICY_WINDOW_SECS as i64);
        assert_eq!(cfg.policies.create_secret.window, cap);
        assert_eq!(cfg.policies.user.window, cap);
        assert_eq!(
            cfg.policies.create_secret.max_requests,
            Policies::default().create_secret.max_requests
        );
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.store, StoreKind::Redb);
        assert_eq!(cfg.key_source, KeySource::Ephemeral);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(300));
        assert_eq!(cfg.expired_grace, Duration::from_secs(86_400));
        assert_eq!(cfg.policies, Policies::default());
        assert!(cfg.smtp.is_none());
    }

    #[test]
    fn rate_limit_overrides() {
        let cfg = config(&[
            ("RATE_CREATE_MAX", "2"),
            ("RATE_ACCESS_WINDOW_SECS", "10"),
            ("USER_RATE_MAX", "7"),
        ]);
        assert_eq!(cfg.policies.create_secret.max_requests, 2);
        assert_eq!(
            cfg.policies.create_secret.window,
            Policies::default().create_secret.window
        );
        assert_eq!(cfg.policies.access_secret.window, chrono::Duration::seconds(10));
        assert_eq!(cfg.policies.user.max_requests, 7);
    }

    #[test]
    fn key_file_wins_over_inline_key() {
        let cfg = config(&[("ENCRYPTION_KEY", "abc"), ("ENCRYPTION_KEY_FILE", "/k")]);
        assert_eq!(cfg.key_source, KeySource::File(PathBuf::from("/k")));
        let cfg = config(&[("ENCRYPTION_KEY", "abc")]);
        assert_eq!(cfg.key_source, KeySource::Inline("abc".into()));
    }

    #[test]
    fn unknown_store_kind_falls_back() {
        assert_eq!(config(&[("STORE", "memory")]).store, StoreKind::Memory);
        assert_eq!(config(&[("STORE", "postgres")]).store, StoreKind::Redb);
    }

    #[test]
    fn keyring_with_retired_keys() {
        let old = EncryptionKey::generate();
        let primary = EncryptionKey::generate();
        let retired = format!("1:{}", old.to_hex());
        let cfg = config(&[
            ("ENCRYPTION_KEY", &primary.to_hex()),
            ("KEY_VERSION", "2"),
            ("RETIRED_KEYS", &retired),
        ]);

        let old_codec = Codec::new(Keyring::new(1, EncryptionKey::parse(&old.to_hex()).unwrap()));
        let sealed = old_codec.encrypt("rotated").unwrap();

        let codec = build_codec(&cfg).unwrap();
        assert_eq!(codec.primary_version(), 2);
        assert_eq!(codec.decrypt(&sealed).unwrap(), "rotated");
    }

    #[test]
    fn duplicate_key_version_rejected() {
        let key = EncryptionKey::generate().to_hex();
        let retired = format!("1:{key}");
        let cfg = config(&[("ENCRYPTION_KEY", &key), ("RETIRED_KEYS", &retired)]);
        assert!(load_keyring(&cfg).is_err());
    }

    #[test]
    fn retired_keys_without_primary_rejected() {
        let retired = format!("1:{}", EncryptionKey::generate().to_hex());
        let cfg = config(&[("RETIRED_KEYS", &retired)]);
        assert!(load_keyring(&cfg).is_err());
    }

    #[test]
    fn malformed_retired_entry_rejected() {
        assert!(parse_retired_keys("nocolon").is_err());
        assert!(parse_retired_keys("x:abcd").is_err());
        assert!(parse_retired_keys("").unwrap().is_empty());
    }

    #[test]
    fn key_file_is_trimmed_and_must_not_be_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, "  abc \n").unwrap();
        assert_eq!(read_key_file(&path).unwrap(), "abc");
        std::fs::write(&path, "\n").unwrap();
        assert!(read_key_file(&path).is_err());
    }

    #[test]
    fn explicit_data_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        assert_eq!(resolve_data_dir(Some(nested.as_path())).unwrap(), nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn webhook_requires_secret() {
        let cfg = config(&[("NOTIFY_WEBHOOK_URL", "http://localhost/hook")]);
        assert!(build_notifier(&cfg).is_err());
        let cfg = config(&[
            ("NOTIFY_WEBHOOK_URL", "http://localhost/hook"),
            ("NOTIFY_WEBHOOK_SECRET", "s"),
        ]);
        assert!(build_notifier(&cfg).is_ok());
    }

    #[test]
    fn smtp_settings_parsed() {
        let cfg = config(&[
            ("SMTP_HOST", "mail.example.com"),
            ("SMTP_USE_TLS", "false"),
            ("SMTP_FROM", "noreply@example.com"),
        ]);
        let smtp = cfg.smtp.as_ref().unwrap();
        assert_eq!(smtp.port, 587);
        assert!(!smtp.use_tls);
        assert!(build_notifier(&cfg).is_ok());
    }
}
