//! Burn notifications: tell an owner that their one-time secret was read.
//!
//! Delivery is best effort. A notifier reports success as a `bool` and never
//! surfaces an error to the request that triggered it.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-SecretShare-Signature";
const BURN_SUBJECT: &str = "Your secret has been viewed - SecretShare";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BurnNotice {
    pub secret_id: String,
    pub owner_email: String,
    pub viewed_at: DateTime<Utc>,
    pub viewer_ip: Option<String>,
    /// First characters of the plaintext, for the owner's eyes only.
    pub preview: Option<String>,
}

#[async_trait]
pub trait BurnNotifier: Send + Sync {
    /// Returns whether the notice was handed off for delivery.
    async fn notify_burn(&self, notice: &BurnNotice) -> bool;
}

/// Used when no delivery channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl BurnNotifier for LogNotifier {
    async fn notify_burn(&self, notice: &BurnNotice) -> bool {
        info!(
            secret_id = %notice.secret_id,
            viewed_at = %notice.viewed_at,
            viewer_ip = notice.viewer_ip.as_deref().unwrap_or("unknown"),
            "secret burned (notifications not configured)"
        );
        false
    }
}

// ── Webhook ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    #[serde(flatten)]
    notice: &'a BurnNotice,
}

/// POSTs a signed JSON event for every burn.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    signing_key: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, signing_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build webhook http client")?;
        Ok(Self {
            client,
            url: url.into(),
            signing_key: signing_key.into(),
        })
    }
}

#[async_trait]
impl BurnNotifier for WebhookNotifier {
    async fn notify_burn(&self, notice: &BurnNotice) -> bool {
        let payload = WebhookPayload {
            event: "secret.burned",
            notice,
        };
        let body = match serde_json::to_string(&payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to serialize burn event");
                return false;
            }
        };

        let signature = compute_signature(&self.signing_key, &body);
        let result = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, format!("sha256={signature}"))
            .body(body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %self.url, status = %resp.status(), "burn webhook delivered");
                true
            }
            Ok(resp) => {
                warn!(url = %self.url, status = %resp.status(), "burn webhook rejected");
                false
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "burn webhook delivery failed");
                false
            }
        }
    }
}

/// HMAC-SHA256 of `body` keyed by `secret`, hex encoded.
pub fn compute_signature(secret: &str, body: &str) -> String {
    // HMAC accepts keys of any length.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// ── SMTP ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
    /// STARTTLS when true; plaintext relay otherwise.
    pub use_tls: bool,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("from_address", &self.from_address)
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Emails the owner a plain text and HTML notice.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self> {
        let from: Mailbox = format!("SecretShare <{}>", config.from_address)
            .parse()
            .context("invalid SMTP from address")?;

        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .context("build SMTP transport")?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port);
        if let (Some(user), Some(pass)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        debug!(host = %config.host, port = config.port, "SMTP notifier initialized");
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    async fn send(&self, notice: &BurnNotice) -> Result<()> {
        let to: Mailbox = notice
            .owner_email
            .parse()
            .context("invalid owner email address")?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(BURN_SUBJECT)
            .multipart(MultiPart::alternative_plain_html(
                render_text(notice),
                render_html(notice),
            ))
            .context("build burn notification email")?;
        self.transport
            .send(message)
            .await
            .context("send burn notification email")?;
        Ok(())
    }
}

#[async_trait]
impl BurnNotifier for SmtpNotifier {
    async fn notify_burn(&self, notice: &BurnNotice) -> bool {
        match self.send(notice).await {
            Ok(()) => {
                info!(secret_id = %notice.secret_id, "burn notification sent");
                true
            }
            Err(e) => {
                warn!(secret_id = %notice.secret_id, error = %format!("{e:#}"), "burn notification failed");
                false
            }
        }
    }
}

fn render_text(notice: &BurnNotice) -> String {
    let mut details = format!(
        "- Secret ID: {}\n- Viewed At: {}\n",
        notice.secret_id,
        notice.viewed_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(ip) = &notice.viewer_ip {
        details.push_str(&format!("- Viewer IP: {ip}\n"));
    }
    if let Some(preview) = &notice.preview {
        details.push_str(&format!("- Secret Preview: {preview}...\n"));
    }
    format!(
        "SECRET VIEWED & DESTROYED - SecretShare\n\n\
         Your secret has been accessed and can no longer be opened.\n\n\
         View Details:\n{details}\n\
         Your secret was configured for one-time access and has been viewed by \
         someone with the link.\n\n\
         If you did not expect this, only share secret links with intended \
         recipients and consider adding a password.\n\n\
         ---\nSecretShare - Secure Ephemeral Secret Sharing\n\
         This is an automated message."
    )
}

fn render_html(notice: &BurnNotice) -> String {
    let mut details = format!(
        "<p><strong>Secret ID:</strong> {}</p>\n<p><strong>Viewed At:</strong> {}</p>\n",
        escape_html(&notice.secret_id),
        notice.viewed_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(ip) = &notice.viewer_ip {
        details.push_str(&format!(
            "<p><strong>Viewer IP:</strong> {}</p>\n",
            escape_html(ip)
        ));
    }
    if let Some(preview) = &notice.preview {
        details.push_str(&format!(
            "<p><strong>Secret Preview:</strong> {}...</p>\n",
            escape_html(preview)
        ));
    }
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Secret Viewed - SecretShare</title></head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
<div style="max-width: 600px; margin: 0 auto; padding: 20px;">
<h1>Secret Viewed &amp; Destroyed</h1>
<p>One of your secrets has been viewed and can no longer be opened.</p>
<h3>View Details</h3>
{details}<h3>What Happened?</h3>
<p>Your secret was configured for one-time access and has been viewed by someone with the link.</p>
<h3>Security Notice</h3>
<p>If you did not expect this, only share secret links with intended recipients and consider adding a password.</p>
<p style="color: #666; font-size: 14px;">SecretShare - Secure Ephemeral Secret Sharing. This is an automated message.</p>
</div>
</body>
</html>"#
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice() -> BurnNotice {
        BurnNotice {
            secret_id: "abc123".into(),
            owner_email: "owner@example.com".into(),
            viewed_at: Utc::now(),
            viewer_ip: Some("1.2.3.4".into()),
            preview: Some("<script>alert".into()),
        }
    }

    #[test]
    fn hmac_signature_is_deterministic() {
        let sig1 = compute_signature("my-secret", r#"{"event":"test"}"#);
        let sig2 = compute_signature("my-secret", r#"{"event":"test"}"#);
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
    }

    #[test]
    fn different_keys_produce_different_signatures() {
        assert_ne!(
            compute_signature("secret-a", "body"),
            compute_signature("secret-b", "body")
        );
    }

    #[test]
    fn webhook_payload_flattens_notice() {
        let n = notice();
        let json = serde_json::to_value(WebhookPayload {
            event: "secret.burned",
            notice: &n,
        })
        .unwrap();
        assert_eq!(json["event"], "secret.burned");
        assert_eq!(json["secret_id"], "abc123");
        assert_eq!(json["viewer_ip"], "1.2.3.4");
    }

    #[test]
    fn html_body_escapes_preview() {
        let html = render_html(&notice());
        assert!(html.contains("&lt;script&gt;alert..."));
        assert!(!html.contains("<script>"));
        assert!(html.contains("abc123"));
    }

    #[test]
    fn text_body_omits_missing_fields() {
        let mut n = notice();
        n.viewer_ip = None;
        n.preview = None;
        let text = render_text(&n);
        assert!(text.contains("Secret ID: abc123"));
        assert!(!text.contains("Viewer IP"));
        assert!(!text.contains("Secret Preview"));
    }

    #[test]
    fn smtp_config_debug_redacts_password() {
        let cfg = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: Some("user".into()),
            password: Some("hunter2".into()),
            from_address: "noreply@example.com".into(),
            use_tls: true,
        };
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn log_notifier_reports_not_delivered() {
        assert!(!LogNotifier.notify_burn(&notice()).await);
    }

    #[tokio::test]
    async fn webhook_to_unreachable_host_reports_failure() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/hook", "key").unwrap();
        assert!(!notifier.notify_burn(&notice()).await);
    }
}
