//! Cadence Console (headless conversation runner)
//!
//! Connects to the configured voice agent and keeps a conversation going
//! with the synthetic level meter, an in-memory microphone and a silent
//! output. Lines typed on stdin are sent as text messages. A status line is
//! logged every `CADENCE_STATUS_SECS` seconds.

use cadence_voice::{
    ConversationEvent, ConversationHandle, ConversationOrchestrator, EngineConfig, EngineParts,
    MemoryCaptureDevice, NullOutput, SyntheticMeter, WavFormat,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default status rate
const DEFAULT_STATUS_SECS: u64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[cadence-console] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::load()?;
    let status_secs = std::env::var("CADENCE_STATUS_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_STATUS_SECS)
        .max(1);

    tracing::info!(
        url = %config.transport.url,
        character = %config.transport.character,
        status_secs,
        "Cadence console started"
    );

    let format = WavFormat::pcm16(config.capture.sample_rate, config.capture.channels);
    let device = MemoryCaptureDevice::new(format);
    spawn_microphone(device.clone(), format);

    let parts = EngineParts::new(
        Box::new(device),
        Box::new(SyntheticMeter::default()),
        Box::new(NullOutput::new()),
    );
    let (handle, task) = ConversationOrchestrator::spawn(config, parts)?;
    let mut events = handle.subscribe();

    if let Err(e) = handle.start(None).await {
        tracing::warn!(error = %e, "initial connect failed; automatic recovery will retry");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status = tokio::time::interval(Duration::from_secs(status_secs));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ConversationEvent::Failed { reason }) => {
                    tracing::error!(%reason, "conversation failed; exiting");
                    break;
                }
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = handle.send_text(line.trim()).await {
                        tracing::warn!(error = %e, "text message not sent");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    tracing::debug!("stdin closed; text input disabled");
                    stdin_open = false;
                }
            },
            _ = status.tick() => log_status(&handle).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down console");
                break;
            }
        }
    }

    handle.stop().await?;
    handle.shutdown();
    task.await?;
    Ok(())
}

/// Feed low-level noise into the microphone; ignored while not recording
fn spawn_microphone(device: MemoryCaptureDevice, format: WavFormat) {
    let bytes_per_tick = format.byte_rate() as usize / 10;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        let mut phase = 0u8;
        loop {
            interval.tick().await;
            let pcm: Vec<u8> = (0..bytes_per_tick)
                .map(|i| phase.wrapping_add(i as u8) & 0x0F)
                .collect();
            device.push_pcm(&pcm);
            phase = phase.wrapping_add(1);
        }
    });
}

fn log_event(event: &ConversationEvent) {
    match event {
        ConversationEvent::VolumeChanged { .. } => {}
        ConversationEvent::StateChanged(change) => tracing::info!(
            from = %change.from,
            to = %change.to,
            trigger = %change.trigger,
            "state changed"
        ),
        ConversationEvent::Transcription { text, is_final } => {
            tracing::info!(%text, is_final, "transcription")
        }
        ConversationEvent::Error {
            message,
            error_count,
        } => tracing::warn!(%message, error_count, "conversation error"),
        other => tracing::debug!(event = ?other, "conversation event"),
    }
}

async fn log_status(handle: &ConversationHandle) {
    match handle.snapshot().await {
        Ok(snapshot) => tracing::info!(
            state = %snapshot.state.current,
            link = ?snapshot.link,
            errors = snapshot.state.error_count,
            queue = snapshot.queue_length,
            bytes_streamed = snapshot.bytes_streamed,
            "status"
        ),
        Err(e) => tracing::warn!(error = %e, "status unavailable"),
    }
}
