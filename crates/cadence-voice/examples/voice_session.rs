//! Voice Session Demo - a full conversation against a scripted agent.
//!
//! Runs the orchestrator with the synthetic level meter, an in-memory
//! microphone and a silent output. The "agent" lives in-process behind a
//! `MemoryDialer`: it answers every utterance with a short streamed response.
//!
//! ```text
//! cargo run -p cadence-voice --example voice_session
//! ```
//!
//! Press Ctrl+C to stop.

use cadence_voice::protocol::encode_audio;
use cadence_voice::transport::MemoryPeer;
use cadence_voice::{
    ConversationEvent, ConversationOrchestrator, EngineConfig, EngineParts, MemoryCaptureDevice,
    MemoryDialer, NullOutput, SyntheticMeter, TokioClock, WavDecoder, WavFormat, WireMessage,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🎙️ Voice Session Demo: synthetic speech every 8s, scripted agent replies");
    info!("Press Ctrl+C to stop.\n");

    let config = EngineConfig::load()?;
    let format = WavFormat::pcm16(config.capture.sample_rate, config.capture.channels);

    let dialer = MemoryDialer::new();
    let device = MemoryCaptureDevice::new(format);
    let parts = EngineParts {
        dialer: Arc::new(dialer.clone()),
        capture: Box::new(device.clone()),
        meter: Box::new(SyntheticMeter::new(8_000, 2_000)),
        decoder: Box::new(WavDecoder::new(format)),
        output: Box::new(NullOutput::new()),
        clock: Arc::new(TokioClock::new()),
    };

    // Microphone: 100ms of low-level noise per tick while recording
    let mic = device.clone();
    let bytes_per_tick = format.byte_rate() as usize / 10;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        let mut phase = 0u8;
        loop {
            interval.tick().await;
            let pcm: Vec<u8> = (0..bytes_per_tick)
                .map(|i| phase.wrapping_add(i as u8) & 0x0F)
                .collect();
            mic.push_pcm(&pcm);
            phase = phase.wrapping_add(1);
        }
    });

    tokio::spawn(async move {
        while let Some(peer) = dialer.accept().await {
            tokio::spawn(scripted_agent(peer, format));
        }
    });

    let (handle, task) = ConversationOrchestrator::spawn(config, parts)?;
    let mut events = handle.subscribe();
    handle.start(None).await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ConversationEvent::VolumeChanged { .. }) => {}
                Ok(ConversationEvent::StateChanged(change)) => {
                    info!("🔄 {} → {} ({})", change.from, change.to, change.trigger);
                }
                Ok(ConversationEvent::Failed { reason }) => {
                    warn!("❌ Conversation failed: {}", reason);
                    break;
                }
                Ok(event) => info!("📣 {:?}", event),
                Err(RecvError::Lagged(skipped)) => warn!("⚠️ Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    handle.stop().await?;
    if let Ok(snapshot) = handle.snapshot().await {
        info!("📊 Final snapshot:\n{}", serde_json::to_string_pretty(&snapshot)?);
    }
    handle.shutdown();
    task.await?;
    Ok(())
}

/// Answers each utterance once its audio stops arriving
async fn scripted_agent(mut peer: MemoryPeer, format: WavFormat) {
    let mut turn = 0u32;
    let mut heard_audio = false;

    loop {
        let frame = tokio::time::timeout(Duration::from_millis(600), peer.from_client.recv()).await;
        match frame {
            Ok(Some(WireMessage::Text(text))) => {
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                match value["type"].as_str() {
                    Some("initialize") => {
                        info!("🤖 Agent: initialized as {}", value["character"]);
                        let _ = peer.to_client.send(WireMessage::Text("connected".into())).await;
                    }
                    Some("audio") => heard_audio = true,
                    Some("message") => info!("🤖 Agent: got text {}", value["content"]),
                    _ => {}
                }
            }
            Ok(Some(WireMessage::Binary(_))) => {}
            Ok(None) => return,
            Err(_) if heard_audio => {
                heard_audio = false;
                turn += 1;
                if respond(&peer, turn, format).await.is_err() {
                    return;
                }
            }
            Err(_) => {}
        }
    }
}

async fn respond(peer: &MemoryPeer, turn: u32, format: WavFormat) -> Result<(), ()> {
    let turn_label = turn.to_string();
    let words = ["Hello", "there,", "turn", turn_label.as_str()];
    let send = |frame: Value| {
        let to_client = peer.to_client.clone();
        async move {
            to_client
                .send(WireMessage::Text(frame.to_string()))
                .await
                .map_err(|_| ())
        }
    };

    send(json!({"type": "transcription_complete", "text": format!("utterance {}", turn), "confidence": 0.92})).await?;
    send(json!({"type": "response_start", "total_chunks": words.len(), "full_text": words.join(" ")})).await?;
    for (i, word) in words.iter().enumerate() {
        // 400ms of silence per word
        let pcm = vec![0u8; format.byte_rate() as usize * 2 / 5];
        send(json!({
            "type": "audio_chunk",
            "chunk_id": i + 1,
            "audio": encode_audio(&format.encode(&pcm)),
            "text": word,
        }))
        .await?;
    }
    send(json!({"type": "response_complete"})).await?;
    send(json!({"type": "listening_ready", "character": "adina"})).await
}
