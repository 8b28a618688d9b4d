use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiosk_core::Command;
use kiosk_core::coordinator::{Collaborators, CoordinatorSettings, SessionCoordinator};
use kiosk_core::identity::IdentityStore;
use kiosk_core::intent::IntentClient;
use kiosk_core::session_state::SessionSettings;
use kiosk_service::config::Config;
use kiosk_service::face_adapter::HttpFaceDetector;
use kiosk_service::prompt_loader::PromptSet;
use kiosk_service::speech_adapter::{MicrophoneRecognizer, TranscriptionClient};
use kiosk_service::sqlite_store::{self, SqliteIdentityStore};
use kiosk_service::transport::{self, AppState};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Face-aware kiosk session server")]
struct Cli {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the WebSocket server (default)
    Serve,
    /// Create the database tables
    InitDb,
    /// Print a user's recent conversation, oldest first
    History {
        user_id: i64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List audio input devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    // --- 3. Dispatch ---
    match cli.command.unwrap_or(CliCommand::Serve) {
        CliCommand::Serve => serve(config).await,
        CliCommand::InitDb => init_db(&config),
        CliCommand::History { user_id, limit } => print_history(&config, user_id, limit),
        CliCommand::Devices => {
            println!("{}", kiosk_native_utils::device::get_available_inputs()?);
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    config
        .require_transcription_key()
        .context("Incomplete configuration for the server")?;
    tracing::info!("Configuration loaded successfully. Starting kiosk service...");

    let prompts = PromptSet::load(&config.prompts_dir).context("Failed to load LLM prompts")?;

    let store = Arc::new(
        SqliteIdentityStore::open(&config.database_path, config.match_tolerance)
            .context("Failed to open identity store")?,
    );
    let intent = Arc::new(IntentClient::with_prompt(
        config.ollama_url.clone(),
        config.chat_model.clone(),
        prompts.intent,
        config.request_timeout,
    )?);
    let speech = Arc::new(MicrophoneRecognizer::new(
        config.audio_input_device.clone(),
        TranscriptionClient::new(
            config.stt_api_url.clone(),
            config.stt_model.clone(),
            config.stt_api_key.clone(),
            config.request_timeout,
        )?,
    ));
    let detector = Arc::new(HttpFaceDetector::new(
        config.face_service_url.clone(),
        config.request_timeout,
    )?);

    // A listen may calibrate, record a full utterance and then upload it.
    let capture = speech.capture_settings();
    let speech_allowance = capture
        .calibration
        .saturating_add(capture.max_utterance)
        .saturating_add(config.request_timeout)
        .saturating_add(Duration::from_secs(1));

    let settings = CoordinatorSettings {
        session: SessionSettings {
            registration_hold: config.registration_hold,
            same_face_threshold: config.same_face_threshold,
            ..SessionSettings::default()
        },
        listen_timeout: config.listen_timeout,
        speech_allowance,
        classify_timeout: config.request_timeout.saturating_add(Duration::from_secs(5)),
        history_limit: config.history_limit,
        ..CoordinatorSettings::default()
    };

    // Decisions leave the core as commands; the transport broadcasts them.
    let (command_tx, command_rx) = mpsc::channel::<Command>(32);
    let (coordinator, handle) = SessionCoordinator::new(
        settings,
        Collaborators {
            store,
            speech,
            intent,
        },
        command_tx,
    );
    let (outbound_tx, _) = broadcast::channel(64);

    tokio::spawn(coordinator.run());
    tokio::spawn(transport::forward_commands(command_rx, outbound_tx.clone()));

    let app = transport::router(AppState {
        detector,
        coordinator: handle,
        outbound: outbound_tx,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!("Starting WebSocket server, listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

fn init_db(config: &Config) -> Result<()> {
    let conn = rusqlite::Connection::open(&config.database_path)
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
    sqlite_store::init_schema(&conn).context("Failed to create tables")?;
    tracing::info!("Database initialized at {}", config.database_path.display());
    Ok(())
}

fn print_history(config: &Config, user_id: i64, limit: usize) -> Result<()> {
    let store = SqliteIdentityStore::open(&config.database_path, config.match_tolerance)?;
    for entry in store.history(user_id, limit)? {
        println!("{}  {}", entry.timestamp, entry.text);
    }
    Ok(())
}
