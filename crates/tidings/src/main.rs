//! Tidings: command-line client for the real-time sync engine
//!
//! Subcommands:
//! - `watch`: Follow channels and workspaces, logging every cache change
//! - `send`: Send one message through the optimistic mutation path

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tidings_sync::{
    Credential, DEFAULT_API_URL, DEFAULT_APP_ID, DEFAULT_WS_URL, HttpChatApi, Session, SyncConfig,
    SyncEngine, WsTransport,
};

mod send;
mod watch;

#[derive(Parser)]
#[command(name = "tidings")]
#[command(about = "Real-time chat cache sync client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where to connect and as whom.
#[derive(Args)]
struct ConnectionArgs {
    /// Application id (topic namespace)
    #[arg(long, env = "TIDINGS_APP_ID", default_value = DEFAULT_APP_ID)]
    app_id: String,

    /// WebSocket endpoint
    #[arg(long, env = "TIDINGS_WS_URL", default_value = DEFAULT_WS_URL)]
    ws_url: String,

    /// REST API base URL
    #[arg(long, env = "TIDINGS_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Bearer token
    #[arg(long, env = "TIDINGS_TOKEN")]
    token: String,

    /// Id of the signed-in user
    #[arg(long, env = "TIDINGS_USER_ID")]
    user_id: String,
}

impl ConnectionArgs {
    /// Build an engine over the WebSocket transport and HTTP API.
    fn engine(&self) -> Result<SyncEngine> {
        let config = SyncConfig::new(&self.app_id)
            .with_ws_url(&self.ws_url)
            .with_api_url(&self.api_url);
        let transport = Arc::new(WsTransport::new(&config.ws_url));
        let api = HttpChatApi::new(&config.api_url, Credential::new(&self.token))
            .map_err(|e| miette::miette!("failed to create API client: {}", e))?;

        SyncEngine::new(config, transport, Arc::new(api)).map_err(|e| miette::miette!("{}", e))
    }

    fn session(&self) -> Session {
        Session::new(&self.user_id, &self.token)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Follow channels and workspaces and log cache changes until Ctrl-C
    Watch {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Channel ids to follow
        #[arg(long = "channel")]
        channels: Vec<String>,

        /// Workspace ids to follow
        #[arg(long = "workspace")]
        workspaces: Vec<String>,

        /// Skip loading recent history for followed channels
        #[arg(long)]
        no_history: bool,
    },

    /// Send a message to a channel
    Send {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Channel id
        #[arg(long)]
        channel: String,

        /// Message text
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tidings=info,tidings_sync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            connection,
            channels,
            workspaces,
            no_history,
        } => {
            let engine = connection.engine()?;
            watch::run(
                &engine,
                connection.session(),
                &channels,
                &workspaces,
                !no_history,
            )
            .await
        }

        Commands::Send {
            connection,
            channel,
            text,
        } => {
            let engine = connection.engine()?;
            send::run(&engine, connection.session(), &channel, &text).await
        }
    }
}
