//! Courier Server - real-time message delivery and state synchronization
//!
//! Identity is issued elsewhere; the admin subcommands below only seed users,
//! contacts and bearer tokens into the local database.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_server::config::Config;
use courier_server::crypto;
use courier_server::storage::Storage;
use courier_server::AppState;

/// Courier Server CLI
#[derive(Parser)]
#[command(name = "courier-server")]
#[command(about = "Real-time message delivery server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a user
    CreateUser {
        /// Admin master key for authorization
        #[arg(long)]
        admin_key: String,

        #[arg(long)]
        user_id: String,

        #[arg(long)]
        display_name: Option<String>,
    },

    /// Issue a bearer token for an existing user
    IssueToken {
        /// Admin master key for authorization
        #[arg(long)]
        admin_key: String,

        #[arg(long)]
        user_id: String,
    },

    /// Record that `owner` has `contact` in their contact list
    AddContact {
        /// Admin master key for authorization
        #[arg(long)]
        admin_key: String,

        #[arg(long)]
        owner: String,

        #[arg(long)]
        contact: String,
    },

    /// Run the server
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "courier_server=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CreateUser {
            admin_key,
            user_id,
            display_name,
        } => {
            let storage = admin_storage(&config, &admin_key).await?;
            storage.create_user(&user_id, display_name.as_deref()).await?;
            println!("User {} created", user_id);
        }
        Commands::IssueToken { admin_key, user_id } => {
            issue_token(&config, &admin_key, &user_id).await?;
        }
        Commands::AddContact {
            admin_key,
            owner,
            contact,
        } => {
            let storage = admin_storage(&config, &admin_key).await?;
            storage.add_contact(&owner, &contact).await?;
            println!("{} added to the contacts of {}", contact, owner);
        }
        Commands::Run => {
            tracing::info!("Starting Courier Server v{}", env!("CARGO_PKG_VERSION"));
            let state = AppState::open(config).await?;
            courier_server::serve(state).await?;
        }
    }

    Ok(())
}

async fn admin_storage(config: &Config, admin_key: &str) -> anyhow::Result<Storage> {
    if !crypto::secrets_match(admin_key, &config.admin.master_key) {
        anyhow::bail!("Invalid admin key");
    }

    Storage::new(&config.storage.database_path).await
}

async fn issue_token(config: &Config, admin_key: &str, user_id: &str) -> anyhow::Result<()> {
    let storage = admin_storage(config, admin_key).await?;

    if storage.get_user(user_id).await?.is_none() {
        anyhow::bail!("Unknown user {}", user_id);
    }

    let token = crypto::generate_session_token()?;
    let expires_at = storage
        .create_session(user_id, &token, config.storage.session_ttl_hours)
        .await?;

    println!("=== New Session Token ===");
    println!("User ID: {}", user_id);
    println!("Token: {}", token);
    println!("Expires: {}", expires_at);
    println!("=========================");
    println!("The token will NOT be shown again!");

    Ok(())
}
