//! Streaming transport to the remote voice agent
//!
//! Owns the bidirectional link. While an utterance is live, a periodic
//! extraction tick reads the capture buffer, sends only the bytes beyond
//! `last_sent_offset` as an `audio` frame, and advances the offset. Inbound
//! frames are classified and turned into [`TransportEvent`]s.
//!
//! ```text
//!   CaptureManager ──current_pcm()──▶ DeltaTracker ──audio{base64}──▶ link
//!   link ──WireMessage──▶ parse_inbound ──▶ TransportEvent ──▶ orchestrator
//! ```

use crate::capture::{CaptureManager, Utterance};
use crate::clock::Clock;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::EncodedAudio;
use crate::protocol::{parse_inbound, Inbound, InboundFrame, OutboundFrame, WireMessage};
use crate::wav::HeaderStrip;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

/// Frames buffered in each direction of a link
const LINK_BUFFER: usize = 256;

/// Transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket endpoint of the voice agent
    pub url: String,

    /// Persona sent in the `initialize` frame (default: "adina")
    pub character: String,

    /// Bound on opening the channel (default: 5000ms)
    pub connect_timeout_ms: u64,

    /// Period of the PCM delta extraction tick (default: 250ms)
    pub extraction_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws/voice".to_string(),
            character: "adina".to_string(),
            connect_timeout_ms: 5_000,
            extraction_interval_ms: 250,
        }
    }
}

/// An open bidirectional link. Dropping `outbound` closes it.
#[derive(Debug)]
pub struct WireLink {
    pub outbound: mpsc::Sender<WireMessage>,
    pub inbound: mpsc::Receiver<WireMessage>,
}

/// Opens links to the voice agent
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> VoiceResult<WireLink>;
}

/// Dialer over tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, url: &str) -> VoiceResult<WireLink> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<WireMessage>(LINK_BUFFER);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let frame = match message {
                    WireMessage::Text(text) => WsMessage::Text(text),
                    WireMessage::Binary(bytes) => WsMessage::Binary(bytes),
                };
                if let Err(e) = ws_write.send(frame).await {
                    warn!("⚠️ WebSocket write failed: {}", e);
                    return;
                }
            }
            debug!("🔌 Outbound closed, sending close frame");
            let _ = ws_write.send(WsMessage::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let message = match frame {
                    Ok(WsMessage::Text(text)) => WireMessage::Text(text),
                    Ok(WsMessage::Binary(bytes)) => WireMessage::Binary(bytes),
                    Ok(WsMessage::Close(reason)) => {
                        info!("❌ WebSocket closed by agent: {:?}", reason);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("⚠️ WebSocket read failed: {}", e);
                        break;
                    }
                };
                if in_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        Ok(WireLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Far end of a [`MemoryDialer`] link
#[derive(Debug)]
pub struct MemoryPeer {
    /// Frames the client sent
    pub from_client: mpsc::Receiver<WireMessage>,
    /// Frames delivered to the client
    pub to_client: mpsc::Sender<WireMessage>,
}

/// In-process dialer. Each successful dial hands the far end to
/// [`MemoryDialer::accept`].
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: Arc<Mutex<mpsc::UnboundedReceiver<MemoryPeer>>>,
    refusals: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

impl MemoryDialer {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            peers_tx,
            peers_rx: Arc::new(Mutex::new(peers_rx)),
            refusals: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Refuse the next `count` dials
    pub fn refuse_next(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Dials made so far, refused ones included
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next client to connect
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

impl Default for MemoryDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, url: &str) -> VoiceResult<WireLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(VoiceError::Connection(format!("connection refused: {}", url)));
        }

        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
        self.peers_tx
            .send(MemoryPeer {
                from_client: out_rx,
                to_client: in_tx,
            })
            .map_err(|_| VoiceError::Connection("memory listener dropped".to_string()))?;
        Ok(WireLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Guarantees only bytes not yet sent leave a growing buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaTracker {
    last_sent_offset: usize,
}

impl DeltaTracker {
    pub fn last_sent_offset(&self) -> usize {
        self.last_sent_offset
    }

    /// Bytes of `buffer` beyond the last sent offset, advancing the offset.
    /// A buffer shorter than the offset yields nothing and keeps the offset.
    pub fn next_delta<'a>(&mut self, buffer: &'a [u8]) -> Option<&'a [u8]> {
        if buffer.len() < self.last_sent_offset {
            warn!(
                "⚠️ Capture buffer shrank ({} < {}), skipping extraction",
                buffer.len(),
                self.last_sent_offset
            );
            return None;
        }
        if buffer.len() == self.last_sent_offset {
            return None;
        }
        let delta = &buffer[self.last_sent_offset..];
        self.last_sent_offset = buffer.len();
        Some(delta)
    }

    pub fn reset(&mut self) {
        self.last_sent_offset = 0;
    }
}

/// Per-utterance streaming record
#[derive(Debug, Default)]
pub struct StreamingSession {
    pub is_recording: bool,
    pub tracker: DeltaTracker,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// Strip path seen on the latest extraction
    pub header_strip: Option<HeaderStrip>,
    extraction: Option<Interval>,
}

impl StreamingSession {
    fn arm(&mut self, period: Duration) {
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.extraction = Some(interval);
        self.is_recording = true;
        self.tracker.reset();
        self.frames_sent = 0;
        self.bytes_sent = 0;
        self.header_strip = None;
    }

    fn disarm(&mut self) {
        self.extraction = None;
        self.is_recording = false;
        self.tracker.reset();
    }

    pub fn is_armed(&self) -> bool {
        self.extraction.is_some()
    }
}

/// Progress of the agent's current streamed response
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamingProgress {
    pub is_streaming: bool,
    pub current_chunk: u64,
    pub total_chunks: u32,
    pub full_text: String,
}

impl StreamingProgress {
    /// Fraction of advertised chunks received, 0 when none are advertised
    pub fn fraction(&self) -> f32 {
        if self.total_chunks == 0 {
            0.0
        } else {
            (self.current_chunk as f32 / self.total_chunks as f32).min(1.0)
        }
    }
}

/// What woke the transport up
#[derive(Debug)]
pub enum TransportActivity {
    /// The extraction tick fired
    ExtractionDue,
    /// A frame arrived; `None` once the link has dropped
    Inbound(Option<WireMessage>),
}

/// Link status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Closed,
    Open,
}

/// Domain events raised by inbound frames
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Bare `connected` notice
    BackendConnected,
    RemoteSpeechDetected {
        confidence: f64,
        timestamp_ms: u64,
    },
    RemoteSpeechEnded {
        duration: f64,
        timestamp_ms: u64,
    },
    Transcription {
        text: String,
        confidence: f64,
        is_final: bool,
    },
    ProcessingStarted {
        character: String,
        input_text: String,
    },
    AgentThinking {
        progress: f64,
        stage: String,
    },
    StreamingStarted(StreamingProgress),
    AudioChunk {
        chunk_id: u64,
        payload: EncodedAudio,
        text: String,
        progress: StreamingProgress,
    },
    StreamingComplete,
    ListeningReady {
        character: String,
        conversation_id: Option<Value>,
    },
    ConversationStateUpdate {
        state: String,
        turn: String,
        participants: Vec<Value>,
    },
    TurnTaking {
        current_speaker: String,
        next_speaker: String,
        can_interrupt: bool,
    },
    CharacterSwitched {
        from_character: String,
        to_character: String,
        voice_changed: bool,
    },
    RemoteError {
        error_type: String,
        message: String,
        recoverable: bool,
    },
    /// Delivery acknowledgment
    AudioReceived,
    /// Raw audio outside the control protocol
    LegacyAudio(Vec<u8>),
}

/// A finished utterance and how much of it reached the agent
#[derive(Debug, Clone, PartialEq)]
pub struct StoppedStream {
    pub utterance: Utterance,
    /// Tail bytes the agent never received
    pub unsent_bytes: u64,
    /// Why the final flush failed, if it did
    pub flush_error: Option<String>,
}

/// Connection owner for one conversation
pub struct StreamingTransport {
    config: TransportConfig,
    dialer: Arc<dyn Dialer>,
    clock: Arc<dyn Clock>,
    link: Option<WireLink>,
    session: StreamingSession,
    progress: StreamingProgress,
}

impl StreamingTransport {
    pub fn new(config: TransportConfig, dialer: Arc<dyn Dialer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            dialer,
            clock,
            link: None,
            session: StreamingSession::default(),
            progress: StreamingProgress::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .map(|link| !link.outbound.is_closed())
            .unwrap_or(false)
    }

    pub fn connection_state(&self) -> LinkState {
        if self.is_connected() {
            LinkState::Open
        } else {
            LinkState::Closed
        }
    }

    pub fn session(&self) -> &StreamingSession {
        &self.session
    }

    pub fn streaming_progress(&self) -> &StreamingProgress {
        &self.progress
    }

    /// Open the channel and send `initialize` for `character`
    pub async fn connect(&mut self, character: &str) -> VoiceResult<()> {
        if self.is_connected() {
            debug!("🔗 Already connected");
            return Ok(());
        }
        self.link = None;

        info!("🔗 Connecting to voice agent at {}", self.config.url);
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let link = match tokio::time::timeout(timeout, self.dialer.dial(&self.config.url)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                error!("❌ Connection failed: {}", e);
                return Err(match e {
                    VoiceError::Connection(_) => e,
                    other => VoiceError::Connection(other.to_string()),
                });
            }
            Err(_) => {
                error!("❌ Connection timed out after {}ms", self.config.connect_timeout_ms);
                return Err(VoiceError::Connection(format!(
                    "connect timed out after {}ms",
                    self.config.connect_timeout_ms
                )));
            }
        };
        self.link = Some(link);
        info!("✅ Connected to voice agent");

        self.send_frame(&OutboundFrame::Initialize {
            character: character.to_string(),
        })
        .await?;
        info!("🎭 Sent initialization for {}", character);
        Ok(())
    }

    /// Begin capture and arm the extraction tick
    pub async fn start_streaming(&mut self, capture: &mut CaptureManager) -> VoiceResult<u64> {
        if !self.is_connected() {
            return Err(VoiceError::NotConnected);
        }
        let started_at = capture.start_recording().await?;
        self.session
            .arm(Duration::from_millis(self.config.extraction_interval_ms.max(1)));
        info!("🎙️ PCM streaming started");
        Ok(started_at)
    }

    /// Resolves on the next extraction tick; pending forever while disarmed
    pub async fn extraction_tick(&mut self) {
        tick(&mut self.session).await
    }

    /// Whichever comes first: an extraction tick or an inbound frame.
    /// Pending forever while disarmed and disconnected.
    pub async fn next_activity(&mut self) -> TransportActivity {
        let session = &mut self.session;
        let link = &mut self.link;
        tokio::select! {
            _ = tick(session) => TransportActivity::ExtractionDue,
            message = recv(link) => TransportActivity::Inbound(message),
        }
    }

    /// Send whatever the capture gained since the last send. Returns the
    /// delta length.
    pub async fn extract_and_send(&mut self, capture: &CaptureManager) -> VoiceResult<usize> {
        if !self.session.is_recording {
            return Ok(0);
        }
        let live = capture.current_pcm().await?;
        self.session.header_strip = Some(live.header_strip);

        let Some(delta) = self.session.tracker.next_delta(&live.pcm) else {
            return Ok(0);
        };
        let len = delta.len();
        self.send_frame(&OutboundFrame::audio(delta)).await?;
        self.session.frames_sent += 1;
        self.session.bytes_sent += len as u64;
        debug!(
            "📤 Sent PCM delta: {} bytes (offset {})",
            len,
            self.session.tracker.last_sent_offset()
        );
        Ok(len)
    }

    /// Flush the tail, disarm, stop capture and reset the offset
    pub async fn stop_streaming(
        &mut self,
        capture: &mut CaptureManager,
    ) -> VoiceResult<Option<StoppedStream>> {
        if !self.session.is_recording {
            debug!("🎙️ Streaming already stopped");
            return Ok(None);
        }

        let flush_error = match self.extract_and_send(capture).await {
            Ok(_) => None,
            Err(e) => {
                warn!("⚠️ Final extraction failed: {}", e);
                Some(e.to_string())
            }
        };
        let frames = self.session.frames_sent;
        let sent_offset = self.session.tracker.last_sent_offset();
        self.session.disarm();
        let utterance = capture.stop_recording().await?;
        let unsent_bytes = utterance.samples.len().saturating_sub(sent_offset) as u64;
        if unsent_bytes > 0 {
            warn!(
                "⚠️ Utterance #{} ended with {} bytes never sent",
                utterance.id, unsent_bytes
            );
        }
        info!(
            "✅ PCM streaming stopped ({} frames, {} bytes)",
            frames, self.session.bytes_sent
        );
        Ok(Some(StoppedStream {
            utterance,
            unsent_bytes,
            flush_error,
        }))
    }

    /// Disarm and abandon the capture without a final flush
    pub async fn cancel_streaming(&mut self, capture: &mut CaptureManager) {
        self.session.disarm();
        if !capture.is_recording() {
            return;
        }
        if let Err(e) = capture.cancel_recording().await {
            warn!("⚠️ Capture teardown failed: {}", e);
        }
    }

    /// Free-form text to the agent
    pub async fn send_text(&mut self, content: &str) -> VoiceResult<()> {
        self.send_frame(&OutboundFrame::Message {
            content: content.to_string(),
        })
        .await
    }

    /// Next frame from the agent. `None` once the link has dropped; pending
    /// forever while disconnected.
    pub async fn next_inbound(&mut self) -> Option<WireMessage> {
        recv(&mut self.link).await
    }

    /// Classify a frame and update streaming progress
    pub fn handle_inbound(&mut self, message: WireMessage) -> Vec<TransportEvent> {
        match parse_inbound(message) {
            Inbound::Control(frame) => self.handle_frame(frame),
            Inbound::Simple(text) => {
                debug!("📨 Simple message: {}", text);
                vec![TransportEvent::BackendConnected]
            }
            Inbound::LegacyAudio(bytes) => {
                info!("🔊 Received legacy audio ({} bytes)", bytes.len());
                vec![TransportEvent::LegacyAudio(bytes)]
            }
            Inbound::Malformed { .. } => Vec::new(),
        }
    }

    fn handle_frame(&mut self, frame: InboundFrame) -> Vec<TransportEvent> {
        let event = match frame {
            InboundFrame::SpeechDetected {
                confidence,
                timestamp,
            } => TransportEvent::RemoteSpeechDetected {
                confidence,
                timestamp_ms: timestamp.unwrap_or_else(|| self.clock.now_millis()),
            },
            InboundFrame::SpeechEndDetected {
                duration,
                timestamp,
            } => TransportEvent::RemoteSpeechEnded {
                duration,
                timestamp_ms: timestamp.unwrap_or_else(|| self.clock.now_millis()),
            },
            InboundFrame::TranscriptionPartial { text, confidence } => {
                TransportEvent::Transcription {
                    text,
                    confidence,
                    is_final: false,
                }
            }
            InboundFrame::TranscriptionComplete { text, confidence } => {
                info!("📝 Transcription: {}", text);
                TransportEvent::Transcription {
                    text,
                    confidence,
                    is_final: true,
                }
            }
            InboundFrame::ProcessingStarted {
                character,
                input_text,
            } => TransportEvent::ProcessingStarted {
                character,
                input_text,
            },
            InboundFrame::LlmThinking { progress, stage } => {
                TransportEvent::AgentThinking { progress, stage }
            }
            InboundFrame::ResponseStart {
                total_chunks,
                full_text,
            } => {
                info!("🎬 Response streaming started ({} chunks)", total_chunks);
                self.progress = StreamingProgress {
                    is_streaming: true,
                    current_chunk: 0,
                    total_chunks,
                    full_text,
                };
                TransportEvent::StreamingStarted(self.progress.clone())
            }
            InboundFrame::AudioChunk {
                chunk_id,
                audio,
                text,
            } => {
                debug!("🎵 Audio chunk {}/{}", chunk_id, self.progress.total_chunks);
                self.progress.current_chunk = chunk_id;
                TransportEvent::AudioChunk {
                    chunk_id,
                    payload: EncodedAudio::Base64(audio),
                    text,
                    progress: self.progress.clone(),
                }
            }
            InboundFrame::ResponseComplete {} => {
                info!("✅ Response streaming complete");
                self.progress.is_streaming = false;
                TransportEvent::StreamingComplete
            }
            InboundFrame::ListeningReady {
                character,
                conversation_id,
            } => TransportEvent::ListeningReady {
                character,
                conversation_id,
            },
            InboundFrame::ConversationState {
                state,
                turn,
                participants,
            } => TransportEvent::ConversationStateUpdate {
                state,
                turn,
                participants,
            },
            InboundFrame::TurnTaking {
                current_speaker,
                next_speaker,
                can_interrupt,
            } => TransportEvent::TurnTaking {
                current_speaker,
                next_speaker,
                can_interrupt,
            },
            InboundFrame::CharacterSwitched {
                from_character,
                to_character,
                voice_changed,
            } => {
                info!("🎭 Character switched: {} → {}", from_character, to_character);
                TransportEvent::CharacterSwitched {
                    from_character,
                    to_character,
                    voice_changed,
                }
            }
            InboundFrame::Error {
                error_type,
                message,
                recoverable,
            } => {
                error!("❌ Agent error [{}]: {}", error_type, message);
                TransportEvent::RemoteError {
                    error_type,
                    message,
                    recoverable,
                }
            }
            InboundFrame::AudioReceived {} => TransportEvent::AudioReceived,
            InboundFrame::Unknown => return Vec::new(),
        };
        vec![event]
    }

    /// Close the channel and forget streaming progress
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            info!("🔌 Voice agent link closed");
        }
        self.progress = StreamingProgress::default();
    }

    /// Stop streaming, then close
    pub async fn disconnect(&mut self, capture: &mut CaptureManager) -> VoiceResult<()> {
        info!("🔌 Disconnecting from voice agent");
        let stopped = self.stop_streaming(capture).await;
        self.close();
        stopped.map(|_| ())
    }

    async fn send_frame(&mut self, frame: &OutboundFrame) -> VoiceResult<()> {
        let link = self.link.as_ref().ok_or(VoiceError::NotConnected)?;
        let wire = frame.to_wire()?;
        link.outbound
            .send(wire)
            .await
            .map_err(|_| VoiceError::Connection("link closed while sending".to_string()))
    }
}

async fn tick(session: &mut StreamingSession) {
    match session.extraction.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn recv(link: &mut Option<WireLink>) -> Option<WireMessage> {
    match link.as_mut() {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureConfig, MemoryCaptureDevice};
    use crate::clock::ManualClock;
    use crate::protocol::decode_audio;
    use crate::wav::WavFormat;

    fn transport(dialer: &MemoryDialer) -> StreamingTransport {
        StreamingTransport::new(
            TransportConfig::default(),
            Arc::new(dialer.clone()),
            Arc::new(ManualClock::new(42)),
        )
    }

    fn capture() -> (CaptureManager, MemoryCaptureDevice) {
        let device = MemoryCaptureDevice::new(WavFormat::pcm16(16_000, 1));
        let manager = CaptureManager::new(
            Box::new(device.clone()),
            Arc::new(ManualClock::new(0)),
            CaptureConfig::default(),
        );
        (manager, device)
    }

    fn audio_payload(message: WireMessage) -> Vec<u8> {
        let WireMessage::Text(text) = message else {
            panic!("expected text frame");
        };
        match serde_json::from_str::<OutboundFrame>(&text).unwrap() {
            OutboundFrame::Audio { audio } => decode_audio(&audio).unwrap(),
            other => panic!("expected audio frame, got {:?}", other),
        }
    }

    #[test]
    fn test_delta_tracker_round_trip() {
        let mut tracker = DeltaTracker::default();
        let mut buffer = Vec::new();
        let mut sent = Vec::new();

        for chunk in [vec![1u8, 2], vec![], vec![3, 4, 5], vec![6]] {
            buffer.extend_from_slice(&chunk);
            if let Some(delta) = tracker.next_delta(&buffer) {
                sent.push(delta.to_vec());
            }
        }
        assert_eq!(sent, vec![vec![1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(tracker.last_sent_offset(), 6);

        assert!(tracker.next_delta(&buffer[..3]).is_none());
        assert_eq!(tracker.last_sent_offset(), 6);

        tracker.reset();
        tracker.reset();
        assert_eq!(tracker.last_sent_offset(), 0);
    }

    #[tokio::test]
    async fn test_connect_sends_initialize() {
        let dialer = MemoryDialer::new();
        let mut transport = transport(&dialer);
        transport.connect("morgan").await.unwrap();
        assert_eq!(transport.connection_state(), LinkState::Open);

        let mut peer = dialer.accept().await.unwrap();
        assert_eq!(
            peer.from_client.recv().await,
            Some(WireMessage::Text(r#"{"type":"initialize","character":"morgan"}"#.to_string()))
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let dialer = MemoryDialer::new();
        dialer.refuse_next(1);
        let mut transport = transport(&dialer);
        assert!(matches!(
            transport.connect("adina").await,
            Err(VoiceError::Connection(_))
        ));
        assert!(!transport.is_connected());
        transport.connect("adina").await.unwrap();
    }

    #[tokio::test]
    async fn test_streaming_requires_connection() {
        let dialer = MemoryDialer::new();
        let mut transport = transport(&dialer);
        let (mut capture, device) = capture();
        assert!(matches!(
            transport.start_streaming(&mut capture).await,
            Err(VoiceError::NotConnected)
        ));
        assert!(!device.is_recording());
    }

    #[tokio::test]
    async fn test_deltas_are_sent_without_repeats() {
        let dialer = MemoryDialer::new();
        let mut transport = transport(&dialer);
        let (mut capture, device) = capture();
        transport.connect("adina").await.unwrap();
        let mut peer = dialer.accept().await.unwrap();
        peer.from_client.recv().await.unwrap();

        transport.start_streaming(&mut capture).await.unwrap();
        device.push_pcm(&[1, 2, 3]);
        assert_eq!(transport.extract_and_send(&capture).await.unwrap(), 3);
        assert_eq!(transport.extract_and_send(&capture).await.unwrap(), 0);
        device.push_pcm(&[4, 5]);
        assert_eq!(transport.extract_and_send(&capture).await.unwrap(), 2);
        device.push_pcm(&[6]);

        let stopped = transport.stop_streaming(&mut capture).await.unwrap().unwrap();
        assert_eq!(stopped.utterance.samples, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(stopped.unsent_bytes, 0);
        assert!(stopped.flush_error.is_none());
        assert_eq!(transport.session().tracker.last_sent_offset(), 0);
        assert!(!transport.session().is_armed());

        let sent: Vec<Vec<u8>> = vec![
            audio_payload(peer.from_client.recv().await.unwrap()),
            audio_payload(peer.from_client.recv().await.unwrap()),
            audio_payload(peer.from_client.recv().await.unwrap()),
        ];
        assert_eq!(sent, vec![vec![1, 2, 3], vec![4, 5], vec![6]]);
        assert!(peer.from_client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_final_flush_reports_unsent_tail() {
        let dialer = MemoryDialer::new();
        let mut transport = transport(&dialer);
        let (mut capture, device) = capture();
        transport.connect("adina").await.unwrap();
        let MemoryPeer {
            mut from_client,
            to_client,
        } = dialer.accept().await.unwrap();
        from_client.recv().await.unwrap();

        transport.start_streaming(&mut capture).await.unwrap();
        device.push_pcm(&[1, 2, 3]);
        assert_eq!(transport.extract_and_send(&capture).await.unwrap(), 3);

        drop(from_client);
        device.push_pcm(&[4, 5]);
        let stopped = transport.stop_streaming(&mut capture).await.unwrap().unwrap();
        assert_eq!(stopped.utterance.samples, vec![1, 2, 3, 4, 5]);
        assert_eq!(stopped.unsent_bytes, 2);
        assert!(stopped.flush_error.is_some());
        assert!(!device.is_recording());
        drop(to_client);
    }

    #[tokio::test]
    async fn test_inbound_progress_tracking() {
        let dialer = MemoryDialer::new();
        let mut transport = transport(&dialer);

        let events = transport.handle_inbound(WireMessage::Text(
            r#"{"type":"response_start","total_chunks":2,"full_text":"Hello there"}"#.to_string(),
        ));
        assert!(matches!(&events[..], [TransportEvent::StreamingStarted(p)] if p.total_chunks == 2));

        let events = transport.handle_inbound(WireMessage::Text(
            r#"{"type":"audio_stream","chunk_id":1,"audio_data":"UklGRg=="}"#.to_string(),
        ));
        match &events[..] {
            [TransportEvent::AudioChunk { chunk_id, progress, .. }] => {
                assert_eq!(*chunk_id, 1);
                assert!((progress.fraction() - 0.5).abs() < f32::EPSILON);
            }
            other => panic!("unexpected events: {:?}", other),
        }

        transport.handle_inbound(WireMessage::Text(r#"{"type":"response_complete"}"#.to_string()));
        assert!(!transport.streaming_progress().is_streaming);
    }

    #[tokio::test]
    async fn test_inbound_defaults_and_legacy() {
        let dialer = MemoryDialer::new();
        let mut transport = transport(&dialer);

        assert_eq!(
            transport.handle_inbound(WireMessage::Text(r#"{"type":"speech_detected"}"#.to_string())),
            vec![TransportEvent::RemoteSpeechDetected {
                confidence: 0.0,
                timestamp_ms: 42,
            }]
        );
        assert_eq!(
            transport.handle_inbound(WireMessage::Text("connected".to_string())),
            vec![TransportEvent::BackendConnected]
        );
        assert_eq!(
            transport.handle_inbound(WireMessage::Binary(vec![0xFF])),
            vec![TransportEvent::LegacyAudio(vec![0xFF])]
        );
        assert!(transport
            .handle_inbound(WireMessage::Text(r#"{"type":"brand_new"}"#.to_string()))
            .is_empty());
    }

    #[tokio::test]
    async fn test_close_drops_link() {
        let dialer = MemoryDialer::new();
        let mut transport = transport(&dialer);
        let (mut capture, _device) = capture();
        transport.connect("adina").await.unwrap();
        let mut peer = dialer.accept().await.unwrap();

        transport.disconnect(&mut capture).await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send_text("hello").await,
            Err(VoiceError::NotConnected)
        ));

        // initialize, then the channel closes
        assert!(peer.from_client.recv().await.is_some());
        assert!(peer.from_client.recv().await.is_none());
    }
}
