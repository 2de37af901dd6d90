use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "hush", about = "hush: self-destructing secret exchange", version)]
struct Cli {
    /// hush server URL (default: http://localhost:8080 or $HUSH_SERVER)
    #[arg(long, env = "HUSH_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hush HTTP server
    Serve {
        /// Port to listen on (default: $HUSH_PORT or 8080)
        #[arg(long, env = "HUSH_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $HUSH_HOST or 0.0.0.0)
        #[arg(long, env = "HUSH_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Store a secret and print its one-time address
    Create {
        /// The secret text
        value: String,
        /// How many times the secret can be viewed
        #[arg(long, default_value_t = 1)]
        views: u32,
        /// Lifetime e.g. 30m, 1h, 7d (rounded up to whole minutes)
        #[arg(long)]
        ttl: Option<String>,
    },
    /// Reveal a secret, spending one of its views
    Get {
        /// Address returned by `create`
        hash: String,
    },
    /// Print the retrieval URL for an address
    Share {
        /// Address returned by `create`
        hash: String,
    },
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
            EnvFilter::try_from_env("HUSH_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Create { value, views, ttl } => {
            cmd_create(&cli.server, &value, views, ttl.as_deref()).await
        }

        Commands::Get { hash } => cmd_get(&cli.server, &hash).await,

        Commands::Share { hash } => {
            println!("{}", secret_url(&cli.server, &hash));
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let mut cfg = hush_server::ServerConfig::from_env()?;
    cfg.host = host;
    cfg.port = port;

    hush_server::run(cfg).await
}

async fn cmd_create(server: &str, value: &str, views: u32, ttl: Option<&str>) -> Result<()> {
    let ttl_minutes = ttl.map(parse_ttl_minutes).transpose()?.unwrap_or(0);

    let client = Client::new();
    let form = [
        ("secret", value.to_owned()),
        ("expireAfterViews", views.to_string()),
        ("expireAfter", ttl_minutes.to_string()),
    ];

    let resp = client
        .post(format!("{}/v1/secret", server.trim_end_matches('/')))
        .form(&form)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server returned {status}: {error}");
    }

    let hash = json["hash"].as_str().context("response has no hash")?;
    println!("{hash}");
    println!("{}", secret_url(server, hash));
    if let Some(exp) = json["expiresAt"].as_str() {
        println!("expires at {exp}, {views} view(s)");
    } else {
        println!("no expiry, {views} view(s)");
    }
    Ok(())
}

async fn cmd_get(server: &str, hash: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .get(secret_url(server, hash))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;

    if status.is_success() {
        let value = json["secretText"].as_str().unwrap_or("");
        println!("{value}");
        if let Some(left) = json["remainingViews"].as_u64() {
            eprintln!("({left} view(s) left)");
        }
    } else {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("{error}");
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn secret_url(server: &str, hash: &str) -> String {
    format!("{}/v1/secret/{}", server.trim_end_matches('/'), hash)
}

/// Parse human duration strings like "1h", "30m", "90s" into whole minutes,
/// rounding partial minutes up.
fn parse_ttl_minutes(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs().div_ceil(60))
}
