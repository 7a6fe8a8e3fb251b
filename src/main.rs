use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use convo_config::ServiceConfig;
use convo_core::{ConversationMetadata, ConversationTurn, PersistenceGateway, TurnRole};
use convo_service::{ConversationService, FixedEntitlementProvider};
use convo_storage::FileGateway;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "convo")]
#[command(about = "Inspect and manage persisted conversations", long_about = None)]
struct Cli {
    /// Defaults to ~/.convo/config.yaml when present
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List persisted conversations, most recent first
    List,

    /// Print a conversation and its history
    Show { uuid: String },

    /// Start a conversation with a first message
    New {
        #[arg(short, long)]
        title: Option<String>,

        /// Model key recorded on the conversation
        #[arg(short, long)]
        model: Option<String>,

        message: String,
    },

    /// Change a conversation's title
    Rename { uuid: String, title: String },

    /// Delete one conversation
    Delete { uuid: String },

    /// Delete conversations last updated in a time range (RFC 3339)
    Purge {
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Check whether a conversation exists
    Exists { uuid: String },

    /// Show the premium status
    Premium,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);
    info!("Conversation data directory: {:?}", config.storage.data_dir);

    let gateway: Arc<dyn PersistenceGateway> =
        Arc::new(FileGateway::new(config.storage.data_dir.clone()));
    let provider = Arc::new(FixedEntitlementProvider::new(config.entitlement.status));
    let service = ConversationService::new(&config, Some(gateway), provider);

    let outcome = run_command(&service, cli.command).await;
    service.shutdown().await?;
    outcome
}

async fn run_command(service: &ConversationService, command: Commands) -> Result<()> {
    match command {
        Commands::List => list_conversations(service).await,
        Commands::Show { uuid } => show_conversation(service, &uuid).await,
        Commands::New {
            title,
            model,
            message,
        } => {
            let handle = service.create_conversation(model).await?;
            if let Some(title) = title {
                handle.set_title(title)?;
            }
            handle.add_entry(ConversationTurn::human(message))?;
            println!("{}", handle.uuid());
            Ok(())
        }
        Commands::Rename { uuid, title } => {
            service.rename_conversation(&uuid, title).await?;
            println!("Renamed {}", uuid);
            Ok(())
        }
        Commands::Delete { uuid } => {
            if !service.conversation_exists(&uuid).await? {
                bail!("Conversation {} not found", uuid);
            }
            service.delete_conversation(&uuid).await?;
            println!("Deleted {}", uuid);
            Ok(())
        }
        Commands::Purge { since, until } => {
            let removed = service.delete_conversations(since, until).await?;
            println!("Deleted {} conversations", removed);
            Ok(())
        }
        Commands::Exists { uuid } => {
            println!("{}", service.conversation_exists(&uuid).await?);
            Ok(())
        }
        Commands::Premium => {
            let status = service.premium_status().await?;
            let (_, info) = service.cached_premium_status().await?;
            println!("Status: {:?}", status);
            if let Some(info) = info {
                println!("Remaining credentials: {}", info.remaining_credential_count);
                if let Some(at) = info.next_active_at {
                    println!("Next active at: {}", at.to_rfc3339());
                }
            }
            Ok(())
        }
    }
}

async fn list_conversations(service: &ConversationService) -> Result<()> {
    let conversations = service.get_conversations().await?;
    if conversations.is_empty() {
        println!("No conversations");
        return Ok(());
    }
    for meta in &conversations {
        println!(
            "{}  {}  {}",
            meta.uuid,
            meta.updated_at.format("%Y-%m-%d %H:%M"),
            display_title(meta)
        );
    }
    Ok(())
}

async fn show_conversation(service: &ConversationService, uuid: &str) -> Result<()> {
    let Some(handle) = service.get_conversation(uuid).await? else {
        bail!("Conversation {} not found", uuid);
    };
    let meta = handle.metadata();

    println!("{}", display_title(&meta));
    println!("═══════════════════════════════════════");
    println!("UUID: {}", meta.uuid);
    if let Some(model) = &meta.model_key {
        println!("Model: {}", model);
    }
    println!("Created: {}", meta.created_at.to_rfc3339());
    println!("Updated: {}", meta.updated_at.to_rfc3339());
    println!(
        "Tokens: {} ({} trimmed)",
        meta.token_usage.total, meta.token_usage.trimmed
    );

    for turn in handle.history() {
        let role = match turn.role {
            TurnRole::Human => "You",
            TurnRole::Assistant => "Assistant",
        };
        println!("\n[{}] {}", role, turn.text);
        if let Some(page) = &turn.page_context {
            println!("  on {} ({})", page.title, page.url);
        }
    }
    Ok(())
}

fn display_title(meta: &ConversationMetadata) -> &str {
    if meta.title.is_empty() {
        "(untitled)"
    } else {
        &meta.title
    }
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    if let Some(path) = path {
        if !path.exists() {
            bail!("Configuration file {:?} does not exist", path);
        }
        return Ok(ServiceConfig::from_yaml(path)?);
    }
    let default_path = ServiceConfig::default_config_path();
    if default_path.exists() {
        Ok(ServiceConfig::from_yaml(&default_path)?)
    } else {
        Ok(ServiceConfig::from_yaml_str("")?)
    }
}

fn init_logging(config: &ServiceConfig, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
