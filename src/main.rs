//! Driveferry — chunked transfers into a cloud drive.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use driveferry::engine::ProgressFn;
use driveferry::{
    CredentialManager, GraphClient, HttpSource, Source, SqliteCredentialStore, TransferEngine,
    TransferJob,
};

/// Command-line arguments for driveferry.
#[derive(Parser, Debug)]
#[command(
    name = "driveferry",
    version,
    about = "Chunked transfers into a cloud drive"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "driveferry.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transfer content from an HTTP URL into the drive.
    Transfer {
        /// Source URL (must support ranged GETs).
        url: String,

        /// Destination file name; defaults to the last URL path segment.
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Authorize an account, or print the authorization URL.
    Login {
        /// Authorization code from the redirect; omit to print the URL
        /// to visit.
        code: Option<String>,
    },

    /// List authorized accounts.
    Accounts,

    /// Make an account the current one.
    Switch { username: String },

    /// Remove an account (defaults to the current one).
    Logout { username: Option<String> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = driveferry::config::load_config(&cli.config)?;

    // Initialize tracing / logging.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Ensure the parent directory exists for the SQLite file.
    if let Some(parent) = std::path::Path::new(&config.credentials.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteCredentialStore::new(&config.credentials.path)?);
    let oauth =
        driveferry::remote::auth::OAuthClient::new(&config.oauth, config.transfer.request_timeout)?;
    let manager = CredentialManager::new(Arc::clone(&store), oauth.clone());

    match cli.command {
        Command::Transfer { url, name } => {
            let name = name.unwrap_or_else(|| {
                url.rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .unwrap_or("download.bin")
                    .to_string()
            });
            let remote_path = format!(
                "{}/{}",
                config.transfer.remote_root.trim_end_matches('/'),
                name
            );

            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.transfer.request_timeout))
                .build()?;
            let source = Arc::new(HttpSource::new(client, &url));
            let total_length = source.size().await?;

            let remote = Arc::new(GraphClient::new(
                store,
                oauth,
                config.transfer.request_timeout,
            )?);
            let engine = TransferEngine::new(remote);

            let job = TransferJob {
                remote_path,
                total_length,
                chunk_size: config.transfer.chunk_size,
                concurrency: config.transfer.concurrency as u64,
            };

            let on_progress: ProgressFn = Box::new(|done, total| {
                Box::pin(async move {
                    info!("progress: {}/{} bytes", done, total);
                })
            });

            // Ctrl+C requests cancellation; the engine honors it at the
            // next chunk boundary.
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, cancelling after current chunk");
                    token.cancel();
                }
            });

            let item_name = engine.start(source, &job, on_progress, cancel).await?;
            println!("transferred as {item_name}");
        }

        Command::Login { code } => match code {
            Some(code) => {
                let username = manager.login(&code).await?;
                println!("logged in as {username}");
            }
            None => {
                println!("visit this URL to authorize:\n{}", manager.authorize_url());
            }
        },

        Command::Accounts => {
            let current = manager.current_username()?;
            for username in manager.list_accounts()? {
                if Some(&username) == current.as_ref() {
                    println!("* {username}");
                } else {
                    println!("  {username}");
                }
            }
        }

        Command::Switch { username } => {
            manager.switch_account(&username)?;
            println!("current account is now {username}");
        }

        Command::Logout { username } => {
            let remains = manager.logout(username.as_deref())?;
            if remains {
                if let Some(current) = manager.current_username()? {
                    println!("logged out; current account is now {current}");
                }
            } else {
                println!("logged out; no accounts remain");
            }
        }
    }

    Ok(())
}
