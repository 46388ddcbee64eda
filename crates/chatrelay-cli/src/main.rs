//! ChatRelay - streaming chat in the terminal
//!
//! Sends messages to a chat backend and prints the reply as it streams.
//! Tool-auth and confirmation interrupts are answered inline.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use chatrelay_core::auth::{
    AuthStatusPoller, HttpToolAuthBroker, SessionToken, ToolAuthBroker, TokenStore,
};
use chatrelay_core::persistence::{ChatBackend, PersistenceBridge, SqliteChatBackend};
use chatrelay_core::transport::{PostTransport, SocketTransport, SseTransport};
use chatrelay_core::{
    constants, paths, Backing, BackendClient, ConversationStore, MessageRelay, RelayConfig,
    SendOptions, StreamTransport, TransportKind,
};

mod repl;

use repl::Session;

/// ChatRelay - streaming chat client
#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Streaming chat with tool-auth interrupts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to ~/.chatrelay/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transport override: sse, socket or post
    #[arg(short, long)]
    transport: Option<TransportKind>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat session
    Chat {
        #[command(flatten)]
        target: Target,

        /// Tools the assistant may use
        #[arg(long = "tool")]
        tools: Vec<String>,

        /// Offer no tools at all
        #[arg(long)]
        no_tools: bool,
    },

    /// Send a single message and print the reply
    Send {
        #[command(flatten)]
        target: Target,

        #[arg(long = "tool")]
        tools: Vec<String>,

        text: String,
    },

    /// Print a stored conversation
    History {
        /// Conversation id
        conversation: String,
    },

    /// Store the backend session token
    Login {
        #[arg(long)]
        token: String,

        /// Unix timestamp after which the token is no longer sent
        #[arg(long)]
        expires_at: Option<u64>,
    },

    /// Forget the backend session token
    Logout,
}

#[derive(clap::Args)]
struct Target {
    /// Continue a stored conversation
    #[arg(long)]
    conversation: Option<String>,

    /// Keep the conversation in memory only
    #[arg(long, conflicts_with = "conversation")]
    ephemeral: bool,
}

fn init_logging() {
    let log_dir = paths::logs_dir();
    std::fs::create_dir_all(&log_dir).ok();

    // Logs go to a file so they never interleave with the streamed reply
    let Ok(log_file) = std::fs::File::create(log_dir.join(constants::ui::LOG_FILE_NAME)) else {
        return;
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .init();
}

/// Everything a session needs, wired from config
struct Services {
    store: Arc<ConversationStore>,
    relay: Arc<MessageRelay>,
    broker: Arc<dyn ToolAuthBroker>,
    poller: AuthStatusPoller,
    backend: Option<Arc<SqliteChatBackend>>,
}

impl Services {
    fn build(config: &RelayConfig, ephemeral: bool) -> Result<Self> {
        let tokens = Arc::new(TokenStore::open_default()?);
        let client = Arc::new(BackendClient::new(&config.base_url, tokens)?);

        let transport: Arc<dyn StreamTransport> = match config.transport {
            TransportKind::Sse => Arc::new(SseTransport::new(Arc::clone(&client))),
            TransportKind::Socket => Arc::new(SocketTransport::new(Arc::clone(&client))),
            TransportKind::Post => Arc::new(PostTransport::new(Arc::clone(&client))),
        };
        tracing::info!("Using {} transport against {}", config.transport, config.base_url);

        let backend = if ephemeral {
            None
        } else {
            match SqliteChatBackend::open(&config.database_path()) {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    tracing::warn!("Chat database unavailable, keeping chats in memory: {}", e);
                    eprintln!("Chat history is unavailable ({e}); this session will not be saved.");
                    None
                }
            }
        };
        let bridge = match &backend {
            Some(backend) => PersistenceBridge::new(Arc::clone(backend) as Arc<dyn ChatBackend>),
            None => PersistenceBridge::in_memory(),
        };

        let store = Arc::new(ConversationStore::new());
        let relay = Arc::new(MessageRelay::new(
            Arc::clone(&store),
            transport,
            Arc::new(bridge),
            config.relay_settings(),
        ));
        let broker: Arc<dyn ToolAuthBroker> = Arc::new(HttpToolAuthBroker::new(client));
        let poller = AuthStatusPoller::new(
            Arc::clone(&broker),
            Arc::clone(&store),
            config.auth_poll_interval(),
        );

        Ok(Self {
            store,
            relay,
            broker,
            poller,
            backend,
        })
    }

    /// Register the target conversation in the store and return its id
    async fn open_conversation(&self, target: &Target) -> Result<String> {
        let backend = match (&self.backend, target.ephemeral) {
            (Some(backend), false) => backend,
            _ => {
                if target.conversation.is_some() {
                    bail!("Stored conversations need the chat database");
                }
                let conversation = self
                    .store
                    .create_conversation(constants::conversation::DEFAULT_TITLE, Backing::Ephemeral);
                return Ok(conversation.id);
            }
        };

        let record = match &target.conversation {
            Some(id) => backend
                .get_chat_by_id(id)
                .await?
                .with_context(|| format!("No conversation with id {id}"))?,
            None => {
                backend
                    .create_chat(constants::conversation::DEFAULT_TITLE)
                    .await?
            }
        };
        let id = record.id.clone();
        self.store.insert(record.into_conversation());
        Ok(id)
    }
}

fn send_options(tools: Vec<String>, use_tools: bool) -> SendOptions {
    SendOptions {
        enabled_tools: tools,
        use_tools,
        ..SendOptions::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let mut config = RelayConfig::load(cli.config.as_deref())?;
    if let Some(kind) = cli.transport {
        config.transport = kind;
    }

    match cli.command {
        Some(Commands::Login { token, expires_at }) => {
            let store = TokenStore::open_default()?;
            store.set(SessionToken {
                access_token: token,
                expires_at,
            })?;
            println!("Session token saved to {:?}", TokenStore::default_path());
        }
        Some(Commands::Logout) => {
            TokenStore::open_default()?.clear()?;
            println!("Session token removed");
        }
        Some(Commands::History { conversation }) => {
            let backend = SqliteChatBackend::open(&config.database_path())?;
            let record = backend
                .get_chat_by_id(&conversation)
                .await?
                .with_context(|| format!("No conversation with id {conversation}"))?;
            println!("{} ({})", record.title, record.id);
            println!();
            for message in &record.messages {
                repl::print_message(message);
            }
        }
        Some(Commands::Send {
            target,
            tools,
            text,
        }) => {
            let services = Services::build(&config, target.ephemeral)?;
            let conversation_id = services.open_conversation(&target).await?;
            let mut session = Session::new(services, conversation_id, send_options(tools, true));
            session.exchange(&text).await?;
        }
        Some(Commands::Chat {
            target,
            tools,
            no_tools,
        }) => {
            let services = Services::build(&config, target.ephemeral)?;
            let conversation_id = services.open_conversation(&target).await?;
            let mut session =
                Session::new(services, conversation_id, send_options(tools, !no_tools));
            session.run().await?;
        }
        None => {
            let target = Target {
                conversation: None,
                ephemeral: false,
            };
            let services = Services::build(&config, false)?;
            let conversation_id = services.open_conversation(&target).await?;
            let mut session =
                Session::new(services, conversation_id, send_options(Vec::new(), true));
            session.run().await?;
        }
    }

    Ok(())
}
