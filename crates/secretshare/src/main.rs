use std::io::Read;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use secretshare_server::{
    auth::{OWNER_EMAIL_HEADER, OWNER_ID_HEADER},
    config::{build_codec, resolve_data_dir},
    engine::{Revealed, SecretInfo, SecretSummary},
    handlers::CreateResponse,
    server::DB_FILE,
    store::{EncryptionKey, RedbStore, SecretStatus},
    ServerConfig,
};

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "secretshare", about = "SecretShare: one-time encrypted secrets", version)]
struct Cli {
    /// Server URL
    #[arg(long, env = "SECRETSHARE_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// API key for owner routes
    #[arg(long, env = "SECRETSHARE_TOKEN")]
    token: Option<String>,

    /// Owner id sent as the identity header
    #[arg(long, env = "SECRETSHARE_OWNER")]
    owner: Option<String>,

    /// Address for burn notifications
    #[arg(long, env = "SECRETSHARE_OWNER_EMAIL")]
    email: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(long, env = "SECRETSHARE_PORT", default_value = "8080")]
        port: u16,
        #[arg(long, env = "SECRETSHARE_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Print a fresh 32-byte encryption key (hex)
    Keygen,
    /// Re-encrypt stored secrets under the primary key
    Rotate,
    /// Create a secret. Pass `-` to read the text from stdin
    Create {
        text: String,
        #[arg(long)]
        password: Option<String>,
        /// Lifetime e.g. 1h, 30m, 7d
        #[arg(long)]
        ttl: Option<String>,
        /// Allow more than one view
        #[arg(long)]
        reusable: bool,
    },
    /// Reveal a secret (burns one-time secrets)
    Reveal {
        id: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Show metadata without revealing
    Info { id: String },
    /// List your secrets
    List,
    /// Search your secrets by text or id
    Search { query: String },
    /// Delete one of your secrets
    Delete { id: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SECRETSHARE_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let api = Api::new(&cli);
    match cli.command {
        Commands::Serve { port, host } => {
            let cfg = ServerConfig {
                host,
                port,
                ..Default::default()
            };
            secretshare_server::run(cfg).await
        }
        Commands::Keygen => {
            println!("{}", EncryptionKey::generate().to_hex());
            Ok(())
        }
        Commands::Rotate => cmd_rotate(),
        Commands::Create {
            text,
            password,
            ttl,
            reusable,
        } => cmd_create(&api, text, password, ttl.as_deref(), reusable).await,
        Commands::Reveal { id, password } => cmd_reveal(&api, &id, password).await,
        Commands::Info { id } => cmd_info(&api, &id).await,
        Commands::List => {
            let secrets: Vec<SecretSummary> = api.secrets(api.request(Method::GET, "/secrets")).await?;
            print_summaries(&secrets);
            Ok(())
        }
        Commands::Search { query } => {
            let req = api
                .request(Method::GET, "/secrets/search")
                .query(&[("q", query.as_str())]);
            let secrets: Vec<SecretSummary> = api.secrets(req).await?;
            print_summaries(&secrets);
            Ok(())
        }
        Commands::Delete { id } => {
            api.send::<Value>(api.request(Method::DELETE, &format!("/secrets/{id}")))
                .await?;
            println!("✓ deleted {id}");
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

fn cmd_rotate() -> Result<()> {
    let cfg = ServerConfig::default();
    let codec = build_codec(&cfg)?;
    let data_dir = resolve_data_dir(cfg.data_dir.as_deref())?;
    let store = RedbStore::open(&data_dir.join(DB_FILE)).context("open store")?;
    let count = store.rotate(&codec)?;
    println!(
        "re-encrypted {count} secret(s) under key version {}",
        codec.primary_version()
    );
    Ok(())
}

async fn cmd_create(
    api: &Api,
    text: String,
    password: Option<String>,
    ttl: Option<&str>,
    reusable: bool,
) -> Result<()> {
    let text = if text == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read secret from stdin")?;
        buf.trim_end_matches(['\r', '\n']).to_owned()
    } else {
        text
    };
    let expires_in_secs = ttl.map(parse_duration).transpose()?;

    let body = json!({
        "text": text,
        "password": password,
        "expires_in_secs": expires_in_secs,
        "one_time_access": !reusable,
    });
    let created: CreateResponse = api
        .send(api.request(Method::POST, "/secrets").json(&body))
        .await?;
    println!("{}", created.id);
    println!("{}{}", api.base(), created.url);
    Ok(())
}

async fn cmd_reveal(api: &Api, id: &str, password: Option<String>) -> Result<()> {
    let req = api
        .request(Method::POST, &format!("/secrets/{id}/reveal"))
        .json(&json!({ "password": password }));
    let revealed: Revealed = api.send(req).await?;
    println!("{}", revealed.text);
    if revealed.one_time_access {
        eprintln!("(one-time secret: it can no longer be viewed)");
    }
    Ok(())
}

async fn cmd_info(api: &Api, id: &str) -> Result<()> {
    let info: SecretInfo = api
        .send(api.request(Method::GET, &format!("/secrets/{id}/info")))
        .await?;
    println!("id:        {}", info.id);
    println!("created:   {}", info.created_at.to_rfc3339());
    println!("expires:   {}", expiry_label(info.expires_at));
    println!("one-time:  {}", info.one_time_access);
    println!("password:  {}", info.has_password);
    println!("viewed:    {}", info.is_viewed);
    Ok(())
}

fn print_summaries(secrets: &[SecretSummary]) {
    if secrets.is_empty() {
        println!("(no secrets)");
        return;
    }
    for s in secrets {
        let status = match s.status {
            SecretStatus::Active => "active",
            SecretStatus::Viewed => "viewed",
            SecretStatus::Expired => "expired",
        };
        let lock = if s.has_password { " [password]" } else { "" };
        println!(
            "  {}  {status:<7}  {}{lock}  {}",
            s.id,
            expiry_label(s.expires_at),
            s.preview
        );
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Api {
    client: Client,
    server: String,
    token: Option<String>,
    owner: Option<String>,
    email: Option<String>,
}

impl Api {
    fn new(cli: &Cli) -> Self {
        Self {
            client: Client::new(),
            server: cli.server.trim_end_matches('/').to_owned(),
            token: cli.token.clone(),
            owner: cli.owner.clone(),
            email: cli.email.clone(),
        }
    }

    fn base(&self) -> &str {
        &self.server
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self.client.request(method, format!("{}{path}", self.server));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(owner) = &self.owner {
            req = req.header(OWNER_ID_HEADER, owner);
        }
        if let Some(email) = &self.email {
            req = req.header(OWNER_EMAIL_HEADER, email);
        }
        req
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await.context("HTTP request failed")?;
        decode(resp).await
    }

    async fn secrets(&self, req: RequestBuilder) -> Result<Vec<SecretSummary>> {
        let json: Value = self.send(req).await?;
        serde_json::from_value(json["secrets"].clone()).context("parse secrets list")
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    if !status.is_success() {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server returned {status}: {error}");
    }
    serde_json::from_value(json).context("parse response")
}

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

fn expiry_label(expires_at: Option<chrono::DateTime<Utc>>) -> String {
    match expires_at {
        Some(exp) => {
            let secs_left = (exp - Utc::now()).num_seconds();
            if secs_left > 0 {
                format!("expires in {}", format_duration(secs_left as u64))
            } else {
                "expired".to_string()
            }
        }
        None => "no expiry".to_string(),
    }
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_durations() {
        assert_eq!(parse_duration("90s").unwrap(), 90);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn formats_largest_unit() {
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(3600), "1h");
        assert_eq!(format_duration(2 * 86400 + 5), "2d");
    }

    #[test]
    fn expiry_labels() {
        assert_eq!(expiry_label(None), "no expiry");
        assert_eq!(
            expiry_label(Some(Utc::now() - chrono::Duration::seconds(5))),
            "expired"
        );
        assert!(expiry_label(Some(Utc::now() + chrono::Duration::hours(2))).starts_with("expires in"));
    }

    #[test]
    fn cli_parses_create_flags() {
        let cli = Cli::try_parse_from([
            "secretshare",
            "--owner",
            "alice",
            "create",
            "hello",
            "--ttl",
            "1h",
            "--reusable",
        ])
        .unwrap();
        match cli.command {
            Commands::Create {
                text,
                ttl,
                reusable,
                ..
            } => {
                assert_eq!(text, "hello");
                assert_eq!(ttl.as_deref(), Some("1h"));
                assert!(reusable);
            }
            _ => panic!("expected create"),
        }
        assert_eq!(cli.owner.as_deref(), Some("alice"));
    }
}
