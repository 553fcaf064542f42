use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cap_webrtc::config::{AppConfig, ConfigStore};
use cap_webrtc::engine::memory::MemoryEngine;
use cap_webrtc::engine::rtc::WebRtcEngine;
use cap_webrtc::engine::RtcEngine;
use cap_webrtc::events::SessionEvent;
use cap_webrtc::platform::Platform;
use cap_webrtc::webrtc::{
    CreateDataChannelRequest, IceCandidate, SendDataRequest, SessionController,
};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Peer connection engine to run the loopback on
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum EngineKind {
    /// In-process engine, no network
    #[default]
    Memory,
    /// webrtc-rs over the local network stack
    Webrtc,
}

/// cap-webrtc command line arguments
#[derive(Parser, Debug)]
#[command(name = "cap-webrtc")]
#[command(version, about = "Loopback self-test for the WebRTC session controller", long_about = None)]
struct CliArgs {
    /// Config file (written with defaults when missing)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "cap-webrtc.toml")]
    config: PathBuf,

    /// Engine used by both loopback sessions
    #[arg(short = 'e', long, value_enum, default_value = "memory")]
    engine: EngineKind,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting cap-webrtc v{}", env!("CARGO_PKG_VERSION"));

    let store = ConfigStore::open(&args.config)
        .await
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let config = store.get().clone();

    let engine: Arc<dyn RtcEngine> = match args.engine {
        EngineKind::Memory => Arc::new(MemoryEngine::new()),
        EngineKind::Webrtc => Arc::new(WebRtcEngine::new()),
    };
    tracing::info!("Using {} engine", engine.name());

    run_loopback(engine, &config).await
}

/// Connect two sessions to each other and exchange the configured messages
async fn run_loopback(engine: Arc<dyn RtcEngine>, config: &AppConfig) -> anyhow::Result<()> {
    let loopback = &config.loopback;
    let label = loopback.channel_label.clone();

    let offerer = SessionController::new(engine.clone(), Platform::default());
    let answerer = SessionController::new(engine, Platform::default());
    let mut offer_rx = offerer.subscribe();
    let mut answer_rx = answerer.subscribe();

    offerer.start(config.session.clone()).await?;
    answerer.start(config.session.clone()).await?;

    offerer
        .create_data_channel(CreateDataChannelRequest::new(label.clone()))
        .await?;

    let offer = offerer.create_offer().await?;
    answerer.set_remote_description(offer).await?;
    let answer = answerer.create_answer().await?;
    offerer.set_remote_description(answer).await?;

    let deadline = tokio::time::sleep(Duration::from_secs(loopback.open_timeout_secs));
    tokio::pin!(deadline);

    let mut sent = false;
    let mut received = 0usize;
    let result = loop {
        if sent && received >= loopback.messages.len() {
            break Ok(());
        }

        tokio::select! {
            _ = &mut deadline => {
                break Err(anyhow::anyhow!(
                    "loopback did not complete within {}s (sent: {}, received: {})",
                    loopback.open_timeout_secs,
                    sent,
                    received
                ));
            }
            event = next_event(&mut offer_rx) => {
                let Some(event) = event else { break Err(anyhow::anyhow!("offerer event bus closed")) };
                print_event("offerer", &event)?;
                match event {
                    SessionEvent::IceCandidate { candidate, sdp_mid, sdp_mline_index } => {
                        answerer
                            .add_ice_candidate(IceCandidate { candidate, sdp_mid, sdp_mline_index })
                            .await?;
                    }
                    SessionEvent::DataChannelState { channel_id, state }
                        if channel_id == label && state == "open" && !sent =>
                    {
                        for message in &loopback.messages {
                            offerer
                                .send_data(SendDataRequest::text(label.clone(), message))
                                .await?;
                        }
                        sent = true;
                    }
                    _ => {}
                }
            }
            event = next_event(&mut answer_rx) => {
                let Some(event) = event else { break Err(anyhow::anyhow!("answerer event bus closed")) };
                print_event("answerer", &event)?;
                match event {
                    SessionEvent::IceCandidate { candidate, sdp_mid, sdp_mline_index } => {
                        offerer
                            .add_ice_candidate(IceCandidate { candidate, sdp_mid, sdp_mline_index })
                            .await?;
                    }
                    SessionEvent::DataChannelMessage { channel_id, .. } if channel_id == label => {
                        received += 1;
                    }
                    _ => {}
                }
            }
        }
    };

    offerer.stop().await?;
    answerer.stop().await?;

    if result.is_ok() {
        tracing::info!(
            "Loopback complete: {} message(s) delivered on {}",
            received,
            label
        );
    }
    result
}

/// Next event, skipping over lag gaps
async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> Option<SessionEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event receiver lagged, {} event(s) skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn print_event(side: &str, event: &SessionEvent) -> anyhow::Result<()> {
    println!("{} {}", side, serde_json::to_string(event)?);
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "cap_webrtc=error,webrtc=error",
        LogLevel::Warn => "cap_webrtc=warn,webrtc=warn",
        LogLevel::Info => "cap_webrtc=info,webrtc=warn",
        LogLevel::Verbose => "cap_webrtc=debug,webrtc=warn",
        LogLevel::Debug => "cap_webrtc=debug,webrtc=info",
        LogLevel::Trace => "cap_webrtc=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
