use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use waav_realtime::config::ClientConfig;
use waav_realtime::core::realtime::{
    ConversationState, RealtimeSession, ToolDefinition, TranscriptRole,
};

/// WaaV Realtime - conversational session client
#[derive(Parser, Debug)]
#[command(name = "waav-realtime")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one text message and print the reply as it streams in
    Chat {
        /// Message text
        text: String,

        /// Give up waiting for the reply after this many seconds
        #[arg(short = 't', long = "timeout", default_value_t = 60)]
        timeout_seconds: u64,
    },

    /// Print the resolved configuration with secrets redacted
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Must happen before any TLS connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        ClientConfig::from_file(&config_path)?
    } else {
        ClientConfig::from_env()?
    };

    match cli.command {
        Commands::Info => {
            println!("{config:#?}");
            Ok(())
        }
        Commands::Chat {
            text,
            timeout_seconds,
        } => chat(&config, text, Duration::from_secs(timeout_seconds)).await,
    }
}

async fn chat(config: &ClientConfig, text: String, wait: Duration) -> anyhow::Result<()> {
    let session = RealtimeSession::new(config.realtime_config());

    session
        .register_tool_with_definition(
            ToolDefinition::function(
                "current_time",
                "Current UNIX time in seconds",
                json!({ "type": "object", "properties": {} }),
            ),
            |_| async {
                let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
                anyhow::Ok(json!({ "unix_seconds": now.as_secs() }))
            },
        )
        .await?;

    let mut transcripts = session.subscribe_transcripts();
    let mut states = session.subscribe_state_changes();
    session.start().await?;
    session.send_text(text).await?;

    // Tool calls end a response without a reply; wait for the one that speaks.
    let finished = tokio::time::timeout(wait, async {
        let mut replied = false;
        loop {
            tokio::select! {
                Some(transcript) = transcripts.recv() => {
                    if transcript.role != TranscriptRole::Assistant {
                        continue;
                    }
                    if transcript.is_final {
                        println!();
                        replied = true;
                        // audio.done may have settled the turn already
                        if session.state().await == ConversationState::Ready {
                            return Ok(());
                        }
                    } else {
                        print!("{}", transcript.text);
                        let _ = std::io::stdout().flush();
                    }
                }
                change = states.recv() => match change {
                    Some(change) if change.to == ConversationState::Error => {
                        return Err(anyhow!("session failed"));
                    }
                    Some(change)
                        if replied
                            && change.to == ConversationState::Ready
                            && change.from.is_responding() =>
                    {
                        return Ok(());
                    }
                    Some(_) => {}
                    None => return Err(anyhow!("session ended unexpectedly")),
                },
            }
        }
    })
    .await;

    session.end().await;

    match finished {
        Ok(result) => result,
        Err(_) => Err(anyhow!("no reply within {}s", wait.as_secs())),
    }
}
