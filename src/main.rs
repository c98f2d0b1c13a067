use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voice_session::audio::{AudioDeviceFactory, CaptureSource, PlaybackTarget};
use voice_session::session::TranscriptStatus;
use voice_session::{
    Config, HttpProvisioner, Provisioner, SessionConfig, SessionController, SessionUpdate,
    StaticProvisioner, UserCommand, WsConnector,
};

/// Run one voice call from the terminal.
///
/// Typed lines are sent as text; `/end` hangs up, `/start` calls again, `/quit` exits.
#[derive(Debug, Parser)]
#[command(name = "voice-session", version)]
struct Args {
    /// Config file (without extension)
    #[arg(long, default_value = "config/voice-session")]
    config: String,

    /// WAV file to use as the microphone (16kHz mono); silence if omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// WAV file to record the agent's audio into; discarded if omitted
    #[arg(long)]
    output: Option<PathBuf>,

    /// Overrides provisioning.security_key
    #[arg(long)]
    security_key: Option<String>,

    /// Overrides provisioning.tts_provider
    #[arg(long)]
    tts_provider: Option<String>,

    /// Connect straight to this call URL instead of provisioning one
    #[arg(long)]
    connect_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(&args.config)?;
    if let Some(key) = args.security_key {
        cfg.provisioning.security_key = key;
    }
    if let Some(provider) = args.tts_provider {
        cfg.provisioning.tts_provider = provider;
    }

    info!("voice-session v{}", env!("CARGO_PKG_VERSION"));
    info!("Transcript feed base: {}", cfg.transcript.base_url);

    let provisioner: Arc<dyn Provisioner> = match args.connect_url {
        Some(url) => Arc::new(StaticProvisioner::new(url)),
        None => Arc::new(HttpProvisioner::new(cfg.provisioning.clone())),
    };

    let device = AudioDeviceFactory::capture(match args.input {
        Some(path) => CaptureSource::WavFile(path),
        None => CaptureSource::Silence,
    });
    let sink = AudioDeviceFactory::sink(
        match args.output {
            Some(path) => PlaybackTarget::WavFile(path),
            None => PlaybackTarget::Discard,
        },
        cfg.audio.sample_rate,
    )
    .context("Failed to open audio output")?;

    let controller = SessionController::new(
        SessionConfig::from(&cfg),
        provisioner,
        Arc::new(WsConnector::new()),
        device,
        Arc::from(sink),
    );

    let updates = controller.subscribe();
    tokio::spawn(print_updates(updates));

    let (commands, command_rx) = mpsc::channel(16);
    commands.send(UserCommand::Start).await?;
    tokio::spawn(read_commands(commands));

    let stats = controller.run(command_rx).await;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

async fn read_commands(commands: mpsc::Sender<UserCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let command = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "" => continue,
                    "/end" => UserCommand::End,
                    "/start" => UserCommand::Start,
                    "/quit" => UserCommand::Shutdown,
                    text => UserCommand::SendText(text.to_string()),
                },
                Ok(None) => UserCommand::Shutdown,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    UserCommand::Shutdown
                }
            },
            _ = tokio::signal::ctrl_c() => UserCommand::Shutdown,
        };

        let shutdown = command == UserCommand::Shutdown;
        if commands.send(command).await.is_err() || shutdown {
            return;
        }
    }
}

async fn print_updates(mut updates: broadcast::Receiver<SessionUpdate>) {
    loop {
        match updates.recv().await {
            Ok(SessionUpdate::Interim { entry }) => {
                print!("\r[{}] {}", entry.speaker.as_str(), entry.text);
                std::io::stdout().flush().ok();
            }
            Ok(SessionUpdate::Transcript { entry }) => {
                println!("\n[{}] {}", entry.speaker.as_str(), entry.text);
            }
            Ok(SessionUpdate::StateChanged { state, session_id }) => {
                info!("Call {:?} (session {:?})", state, session_id);
            }
            Ok(SessionUpdate::TranscriptStatus {
                status: TranscriptStatus::Error,
            }) => {
                warn!("Live transcript unavailable");
            }
            Ok(SessionUpdate::Failure { message, retryable }) => {
                warn!("Call failed: {} (type /start to retry: {})", message, retryable);
            }
            Ok(update) => info!("{:?}", update),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Skipped {} updates", n),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
