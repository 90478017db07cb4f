use anyhow::Context;
use clap::{Parser, Subcommand};
use lib::channels::{InboundEvent, TelegramClient};
use lib::config::{self, Config};
use lib::history::{HistorySink, NullHistorySink, SqliteHistorySink};
use lib::mapping::MappingStore;
use lib::relay::{RelayEngine, RelayOutcome, RelayTransport};
use lib::resolver::{TopicProvider, TopicResolver};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

const GREETING: &str = "Hello! How can we help you?";
const UNAVAILABLE: &str = "Sorry, support is temporarily unavailable. Please try again later.";

#[derive(Parser)]
#[command(name = "support-relay")]
#[command(about = "Telegram support relay: mirrors user chats into operator forum topics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a default config file
    Init {
        /// Config file path (default: SUPPORT_RELAY_CONFIG_PATH or ~/.support-relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the relay (getUpdates long-poll loop)
    Run {
        /// Config file path (default: SUPPORT_RELAY_CONFIG_PATH or ~/.support-relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("support-relay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config }) => {
            if let Err(e) = run(config).await {
                log::error!("relay failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(config::default_config_path);
    if path.exists() {
        anyhow::bail!("config already exists: {}", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let config = Config::default();
    std::fs::write(&path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn run(path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, config_path) = config::load_config(path)?;
    log::info!("config: {}", config_path.display());

    let token = config::resolve_bot_token(&config)
        .context("telegram bot token not configured (telegram.botToken or TELEGRAM_BOT_TOKEN)")?;
    let group_id = config::resolve_operator_group_id(&config)
        .context("operator group id not configured (relay.operatorGroupId or OPERATOR_GROUP_ID)")?;

    let db_path = config::resolve_db_path(&config);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(
        MappingStore::open(&db_path)
            .await
            .with_context(|| format!("opening mapping store at {}", db_path.display()))?,
    );

    let history: Arc<dyn HistorySink> = if config.history.enabled {
        Arc::new(
            SqliteHistorySink::new(store.pool().clone())
                .await
                .context("opening history sink")?,
        )
    } else {
        log::info!("message history disabled");
        Arc::new(NullHistorySink)
    };

    let telegram = Arc::new(TelegramClient::new(token, group_id));
    match telegram.get_me().await {
        Ok(me) => log::info!(
            "started as @{} (id={})",
            me.username.as_deref().unwrap_or("?"),
            me.id
        ),
        Err(e) => log::warn!("getMe failed: {}", e),
    }

    let request_timeout = config::request_timeout(&config);
    let resolver = Arc::new(TopicResolver::new(
        Arc::clone(&store),
        telegram.clone() as Arc<dyn TopicProvider>,
        request_timeout,
    ));
    let engine = Arc::new(RelayEngine::new(
        store,
        resolver,
        telegram.clone() as Arc<dyn RelayTransport>,
        history,
        request_timeout,
    ));

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundEvent>(64);
    let poll_handle = telegram.clone().start_inbound(inbound_tx);

    let dispatch_handle = {
        let engine = Arc::clone(&engine);
        let telegram = Arc::clone(&telegram);
        tokio::spawn(async move {
            // One task per event: flows for different users never wait on
            // each other, and the resolver is safe under same-user races.
            while let Some(event) = inbound_rx.recv().await {
                let engine = Arc::clone(&engine);
                let telegram = Arc::clone(&telegram);
                tokio::spawn(async move {
                    dispatch_event(engine, telegram, event).await;
                });
            }
        })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    log::info!("shutting down");
    telegram.stop();
    poll_handle.abort();
    dispatch_handle.abort();
    Ok(())
}

async fn dispatch_event(
    engine: Arc<RelayEngine>,
    telegram: Arc<TelegramClient>,
    event: InboundEvent,
) {
    let user_chat = match &event {
        InboundEvent::FromUser(m) => Some(m.chat_id),
        InboundEvent::FromTopic(_) => None,
    };
    let is_start = matches!(
        &event,
        InboundEvent::FromUser(m)
            if m.text.as_deref().map(|t| t == "/start" || t.starts_with("/start ")).unwrap_or(false)
    );

    match engine.handle(event).await {
        Ok(RelayOutcome::Delivered { .. }) => {
            if is_start {
                if let Some(chat_id) = user_chat {
                    if let Err(e) = telegram.send_message(chat_id, None, GREETING).await {
                        log::warn!("greeting failed: {}", e);
                    }
                }
            }
        }
        Ok(RelayOutcome::Ignored) => {}
        Err(e) => {
            log::error!("relay failed: {}", e);
            // Errors on the user side should not be silent (the operator
            // never saw the message).
            if let Some(chat_id) = user_chat {
                if let Err(send) = telegram.send_message(chat_id, None, UNAVAILABLE).await {
                    log::warn!("failure notice to chat {} failed: {}", chat_id, send);
                }
            }
        }
    }
}
