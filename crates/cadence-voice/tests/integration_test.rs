//! Integration tests for the voice conversation engine
//!
//! These run against an in-process WebSocket agent and an axum health
//! endpoint on loopback, in real time.

use axum::{routing::get, Json, Router};
use cadence_voice::{
    ConversationEvent, ConversationOrchestrator, ConversationState, EngineConfig, EngineParts,
    HealthConfig, HealthProbe, ManualClock, ManualMeter, MemoryCaptureDevice, NullOutput,
    StreamingTransport, TransportConfig, TransportEvent, VoiceError, WavFormat, WebSocketDialer,
    WireMessage,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Test-side view of the fake agent
struct AgentPeer {
    /// Text frames the client sent
    inbox: mpsc::Receiver<String>,
    /// Text frames to push to the client
    outbox: mpsc::Sender<String>,
}

impl AgentPeer {
    async fn next_frame(&mut self) -> Option<Value> {
        let text = timeout(Duration::from_secs(5), self.inbox.recv()).await.ok()??;
        serde_json::from_str(&text).ok()
    }

    async fn send(&self, frame: Value) {
        self.outbox.send(frame.to_string()).await.unwrap();
    }
}

/// Accept one WebSocket client and bridge it to channels
async fn spawn_agent() -> (String, AgentPeer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (inbox_tx, inbox_rx) = mpsc::channel(256);
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(256);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws.split();
        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if inbox_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
                outgoing = outbox_rx.recv() => match outgoing {
                    Some(text) => {
                        if write.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    (
        format!("ws://{}/ws/voice", addr),
        AgentPeer {
            inbox: inbox_rx,
            outbox: outbox_tx,
        },
    )
}

/// Serve `GET /health` with the given status
async fn spawn_health(status: &'static str) -> String {
    let app = Router::new().route(
        "/health",
        get(move || async move { Json(json!({ "status": status })) }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast_config(url: String) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.transport.url = url;
    config.transport.extraction_interval_ms = 50;
    config.vad.sample_interval_ms = 20;
    config.vad.min_speech_duration_ms = 60;
    config.vad.max_silence_duration_ms = 200;
    config.recovery.settle_delay_ms = 100;
    config
}

async fn wait_for_state(
    events: &mut broadcast::Receiver<ConversationEvent>,
    state: ConversationState,
) {
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(ConversationEvent::StateChanged(change)) if change.to == state => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {}", e),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", state));
}

#[tokio::test]
async fn test_transport_over_websocket() {
    init_tracing();
    let (url, mut agent) = spawn_agent().await;

    let config = TransportConfig {
        url,
        ..Default::default()
    };
    let mut transport = StreamingTransport::new(
        config,
        Arc::new(WebSocketDialer),
        Arc::new(ManualClock::new(0)),
    );
    transport.connect("adina").await.unwrap();
    assert!(transport.is_connected());

    let init = agent.next_frame().await.unwrap();
    assert_eq!(init, json!({"type": "initialize", "character": "adina"}));

    transport.send_text("typed hello").await.unwrap();
    assert_eq!(
        agent.next_frame().await.unwrap(),
        json!({"type": "message", "content": "typed hello"})
    );

    agent
        .send(json!({"type": "transcription_complete", "text": "hello", "confidence": 0.9}))
        .await;
    let message = timeout(Duration::from_secs(5), transport.next_inbound())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(message, WireMessage::Text(_)));
    assert_eq!(
        transport.handle_inbound(message),
        vec![TransportEvent::Transcription {
            text: "hello".to_string(),
            confidence: 0.9,
            is_final: true,
        }]
    );

    transport.close();
    assert!(!transport.is_connected());
    assert!(agent.next_frame().await.is_none());
}

#[tokio::test]
async fn test_unreachable_agent_is_connection_error() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut transport = StreamingTransport::new(
        TransportConfig {
            url: format!("ws://{}/ws/voice", addr),
            ..Default::default()
        },
        Arc::new(WebSocketDialer),
        Arc::new(ManualClock::new(0)),
    );
    assert!(matches!(
        transport.connect("adina").await,
        Err(VoiceError::Connection(_))
    ));
}

#[tokio::test]
async fn test_conversation_turn_over_websocket() {
    init_tracing();
    let (url, mut agent) = spawn_agent().await;

    let meter = ManualMeter::new(-80.0);
    let device = MemoryCaptureDevice::new(WavFormat::pcm16(16_000, 1));
    let parts = EngineParts::new(
        Box::new(device.clone()),
        Box::new(meter.clone()),
        Box::new(NullOutput::new()),
    );
    let (handle, task) = ConversationOrchestrator::spawn(fast_config(url), parts).unwrap();
    let mut events = handle.subscribe();

    handle.start(Some("morgan")).await.unwrap();
    assert_eq!(
        agent.next_frame().await.unwrap(),
        json!({"type": "initialize", "character": "morgan"})
    );
    wait_for_state(&mut events, ConversationState::Listening).await;

    meter.set_level(-15.0);
    wait_for_state(&mut events, ConversationState::Recording).await;
    device.push_pcm(&[9u8; 1_600]);

    let audio = agent.next_frame().await.unwrap();
    assert_eq!(audio["type"], "audio");

    meter.set_level(-75.0);
    wait_for_state(&mut events, ConversationState::Processing).await;

    let chunk = WavFormat::pcm16(16_000, 1).encode(&vec![0u8; 1_600]);
    let chunk = base64_encode(&chunk);
    agent
        .send(json!({"type": "response_start", "total_chunks": 2, "full_text": "Hi there"}))
        .await;
    agent
        .send(json!({"type": "audio_chunk", "chunk_id": 1, "audio": chunk, "text": "Hi"}))
        .await;
    agent
        .send(json!({"type": "audio_stream", "chunk_id": 2, "audio_data": chunk, "text": "there"}))
        .await;
    agent.send(json!({"type": "response_complete"})).await;

    wait_for_state(&mut events, ConversationState::Playing).await;
    wait_for_state(&mut events, ConversationState::Listening).await;

    handle.stop().await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state.current, ConversationState::Disconnected);

    handle.shutdown();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_health_probe_against_http_endpoint() {
    init_tracing();
    let healthy = spawn_health("healthy").await;
    let degraded = spawn_health("degraded").await;

    let probe = HealthProbe::new(healthy, HealthConfig::default()).unwrap();
    probe.check().await.unwrap();
    probe.wait_for_healthy().await.unwrap();

    let probe = HealthProbe::new(
        degraded,
        HealthConfig {
            max_wait_ms: 300,
            poll_interval_ms: 100,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(matches!(probe.check().await, Err(VoiceError::Health(_))));
    assert!(matches!(
        probe.wait_for_healthy().await,
        Err(VoiceError::Timeout(_))
    ));
}

#[tokio::test]
async fn test_conversation_waits_for_health_before_connecting() {
    init_tracing();
    let (url, mut agent) = spawn_agent().await;
    let health = spawn_health("healthy").await;

    let mut config = fast_config(url);
    config.health.base_url = Some(health);
    let parts = EngineParts::new(
        Box::new(MemoryCaptureDevice::new(WavFormat::pcm16(16_000, 1))),
        Box::new(ManualMeter::new(-80.0)),
        Box::new(NullOutput::new()),
    );
    let (handle, _task) = ConversationOrchestrator::spawn(config, parts).unwrap();

    handle.start(None).await.unwrap();
    assert_eq!(agent.next_frame().await.unwrap()["type"], "initialize");
    assert_eq!(
        handle.snapshot().await.unwrap().state.current,
        ConversationState::Listening
    );
    handle.shutdown();
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
