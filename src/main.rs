//! RustRead binary entry point

use clap::{Parser, Subcommand};
use rustread::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rustread")]
#[command(about = "A small ActivityPub federation node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Provision a local actor
    CreateUser {
        #[arg(long)]
        user: String,

        #[arg(long)]
        pass: String,

        /// Display name (defaults to the username)
        #[arg(long)]
        name: Option<String>,
    },
    /// Send a Follow from a local actor to a remote handle
    Follow {
        /// Local username
        #[arg(long = "as")]
        as_user: String,

        /// Remote handle, e.g. bob@remote.example
        handle: String,
    },
}

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Initialize AppState
/// 5. Run the selected command
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!("rustread={},tower_http=debug", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 3. Initialize metrics
    rustread::metrics::init_metrics();

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Run command
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(state, &config).await?,
        Commands::CreateUser { user, pass, name } => {
            let actor = state
                .directory
                .provision_local(&user, &pass, name.as_deref())
                .await?;
            println!("Created {} ({})", actor.handle(), actor.id);
        }
        Commands::Follow { as_user, handle } => {
            let outcome = state.follower.follow(&as_user, &handle).await?;
            println!(
                "Sent Follow {} to {}; the edge is recorded when they accept",
                outcome.activity_id, outcome.target.id
            );
        }
    }

    Ok(())
}

async fn serve(
    state: AppState,
    config: &config::AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if state.db.count_local_actors().await? == 0 {
        tracing::error!("No local actors exist");
        eprintln!("No local actors exist. Create one first: rustread create-user --user <name> --pass <password>");
        return Err("no local actors".into());
    }

    let app = rustread::build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}
