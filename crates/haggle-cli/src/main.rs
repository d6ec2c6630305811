//! Haggle headless client binary.
//!
//! # Usage
//!
//! ```bash
//! haggle --api-url https://api.example.com \
//!     --realtime-url wss://rt.example.com/socket \
//!     --user-id u1 --name Ada --token "$TOKEN"
//! ```
//!
//! Then type `/send <conversation> <text>`, `/read <conversation>`,
//! `/open <peer-id>`, `/retry <conversation> <message>` or `/quit`.

use std::time::Duration;

use clap::Parser;
use haggle_app::{Command, DriverInput, Runtime};
use haggle_cli::{NetConfig, NetDriver, SystemEnv, commands};
use haggle_client::{ChatList, ChatSession, ConnectionState, Observer, SessionConfig, SessionIdentity};
use haggle_proto::{PeerId, PeerProfile};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Haggle chat client
#[derive(Parser, Debug)]
#[command(name = "haggle")]
#[command(about = "Headless marketplace chat client")]
#[command(version)]
struct Args {
    /// REST base URL
    #[arg(long, default_value = "http://localhost:8080")]
    api_url: String,

    /// Realtime WebSocket URL
    #[arg(long, default_value = "ws://localhost:8080/realtime")]
    realtime_url: String,

    /// Bearer token for REST and the realtime handshake
    #[arg(long)]
    token: Option<String>,

    /// Id of the signed-in user. Without it the session stays idle
    #[arg(long)]
    user_id: Option<String>,

    /// Display name of the signed-in user
    #[arg(long)]
    name: Option<String>,

    /// Avatar URL of the signed-in user
    #[arg(long)]
    avatar: Option<String>,

    /// Tick interval in milliseconds
    #[arg(long, default_value = "250")]
    tick_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let driver = NetDriver::new(NetConfig {
        api_url: args.api_url,
        realtime_url: args.realtime_url,
        token: args.token.clone(),
        tick: Duration::from_millis(args.tick_ms),
    });
    let inputs = driver.inputs();
    let mut session = ChatSession::new(SystemEnv::new(), SessionConfig::default());

    if let Observer::Chats(chats) = session.observe(None) {
        tokio::spawn(log_chats(chats));
    }
    tokio::spawn(log_connection(session.observe_connection()));

    let identity = args.user_id.map(|id| {
        let mut profile = PeerProfile::placeholder(PeerId::new(id));
        if let Some(name) = args.name {
            profile.name = name;
        }
        profile.avatar = args.avatar;
        let identity = SessionIdentity::new(profile);
        match args.token {
            Some(token) => identity.with_token(token),
            None => identity,
        }
    });

    match identity {
        Some(identity) => {
            let _ = inputs.send(DriverInput::Command(Command::Start(identity)));
        },
        None => {
            if let Err(error) = session.start(None) {
                tracing::warn!(%error, "pass --user-id to sign in");
            }
        },
    }
    tokio::spawn(commands::read_stdin(inputs));

    tracing::info!("haggle client running");
    Runtime::new(driver, session).run().await?;
    Ok(())
}

async fn log_chats(mut chats: watch::Receiver<ChatList>) {
    while chats.changed().await.is_ok() {
        let list = chats.borrow_and_update().clone();
        tracing::info!(chats = list.chats.len(), unread = list.total_unread, "chat list updated");
        for chat in &list.chats {
            tracing::debug!(
                conversation = %chat.id,
                peer = %chat.peer.name,
                unread = chat.unread_count,
                last = ?chat.last_message.as_ref().map(|m| m.text.as_str()),
                "active chat"
            );
        }
    }
}

async fn log_connection(mut state: watch::Receiver<ConnectionState>) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        tracing::info!(state = ?current, "connection");
    }
}
