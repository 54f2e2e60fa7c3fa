use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use waav_live::{
    LiveConfig, MicrophoneProvider, OutputDeviceProvider, SessionNotice, SessionState,
    VoiceSession,
    core::devices::{WavFileMicrophone, WavFileOutputProvider},
};

/// WaaV Live - Real-time duplex voice session with Gemini Live
#[derive(Parser, Debug)]
#[command(name = "waav-live")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Read microphone audio from a WAV file instead of the system input
    #[arg(long = "input", value_name = "FILE.wav")]
    input: Option<PathBuf>,

    /// Write agent audio to a WAV file instead of the system output
    #[arg(long = "output", value_name = "FILE.wav")]
    output: Option<PathBuf>,

    /// Stop after this many seconds (runs until Ctrl-C otherwise)
    #[arg(long = "seconds", value_name = "N")]
    seconds: Option<u64>,

    /// End the session when the WAV input ends instead of padding with silence
    #[arg(long = "no-pad")]
    no_pad: bool,

    /// Subcommand to run
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List system audio devices
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    if let Some(Commands::Devices) = cli.command {
        return list_audio_devices();
    }

    let config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from {}", config_path.display());
        LiveConfig::from_file(config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        LiveConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    let transports = config
        .transport_factory()
        .map_err(|e| anyhow!("Failed to create Gemini Live transport: {}", e))?;
    let microphone = microphone_for(&cli)?;
    let output = output_for(&cli)?;

    info!(
        "Starting session (model {}, voice {})",
        config.model, config.voice
    );
    let session = VoiceSession::new(config.to_session_config(), transports, microphone, output);
    run_session(&session, cli.seconds).await
}

async fn run_session(session: &VoiceSession, seconds: Option<u64>) -> anyhow::Result<()> {
    let mut state_rx = session.watch_state();
    let mut transcript_rx = session.watch_transcript();
    let mut notices = session.notices();

    session
        .start()
        .await
        .map_err(|e| anyhow!("Failed to start session: {}", e))?;
    info!("Session active, press Ctrl-C to stop");

    let deadline = async {
        match seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping session");
                break;
            }

            _ = &mut deadline => {
                info!("Time limit reached, stopping session");
                break;
            }

            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow_and_update() == SessionState::Idle {
                    info!("Session ended");
                    break;
                }
            }

            changed = transcript_rx.changed() => {
                if changed.is_ok() {
                    let snapshot = transcript_rx.borrow_and_update().clone();
                    if !snapshot.is_empty() {
                        info!(user = %snapshot.user, agent = %snapshot.agent, "Transcript");
                    }
                }
            }

            notice = notices.recv() => match notice {
                Ok(SessionNotice::Warning(message)) => warn!("{}", message),
                Ok(SessionNotice::Fatal(e)) => error!("Session failed: {}", e),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} session notices", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.stop().await;

    let stats = session.capture_stats();
    info!(
        "Captured {} frames ({} dropped, {} codec errors)",
        stats.frames_sent(),
        stats.frames_dropped(),
        stats.codec_errors()
    );
    Ok(())
}

fn microphone_for(cli: &Cli) -> anyhow::Result<Arc<dyn MicrophoneProvider>> {
    if let Some(path) = &cli.input {
        info!("Reading microphone audio from {}", path.display());
        return Ok(Arc::new(
            WavFileMicrophone::new(path).pad_with_silence(!cli.no_pad),
        ));
    }

    #[cfg(feature = "native-audio")]
    {
        Ok(Arc::new(waav_live::core::devices::NativeMicrophone::new(None)))
    }

    #[cfg(not(feature = "native-audio"))]
    {
        Err(anyhow!(
            "No --input file given and the system microphone requires the 'native-audio' feature. \
             Rebuild with: cargo build --features native-audio"
        ))
    }
}

fn output_for(cli: &Cli) -> anyhow::Result<Arc<dyn OutputDeviceProvider>> {
    if let Some(path) = &cli.output {
        info!("Writing agent audio to {}", path.display());
        return Ok(Arc::new(WavFileOutputProvider::new(path)));
    }

    #[cfg(feature = "native-audio")]
    {
        Ok(Arc::new(waav_live::core::devices::NativeOutputProvider))
    }

    #[cfg(not(feature = "native-audio"))]
    {
        Err(anyhow!(
            "No --output file given and system playback requires the 'native-audio' feature. \
             Rebuild with: cargo build --features native-audio"
        ))
    }
}

#[cfg(feature = "native-audio")]
fn list_audio_devices() -> anyhow::Result<()> {
    let devices = waav_live::core::devices::list_devices()
        .map_err(|e| anyhow!("Failed to enumerate audio devices: {}", e))?;
    for device in devices {
        println!("{device}");
    }
    Ok(())
}

#[cfg(not(feature = "native-audio"))]
fn list_audio_devices() -> anyhow::Result<()> {
    Err(anyhow!(
        "Device listing requires the 'native-audio' feature. \
         Rebuild with: cargo build --features native-audio"
    ))
}
