//! Conversation Orchestrator - The main coordination layer
//!
//! One tokio task owns the state machine, VAD, capture manager, transport and
//! playback queue. Level sampling, delta extraction, inbound frames, playback
//! completions and the settle/re-arm/reconnect deadlines are branches of a
//! single `select!` loop, so nothing else ever touches the live state.
//! Callers drive it through a cloneable [`ConversationHandle`] and observe it
//! through [`ConversationEvent`]s.

use crate::capture::{CaptureDevice, CaptureManager};
use crate::clock::{Clock, TokioClock};
use crate::config::EngineConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::health::HealthProbe;
use crate::playback::{AudioDecoder, AudioOutput, EncodedAudio, PlaybackEvent, PlaybackQueue, WavDecoder};
use crate::protocol::WireMessage;
use crate::state::{
    ConversationState, ConversationStateMachine, StateChange, StateEvent, StateInfo,
    TransitionRecord,
};
use crate::transport::{
    Dialer, LinkState, StreamingProgress, StreamingTransport, TransportActivity, TransportEvent,
    WebSocketDialer,
};
use crate::vad::{LevelMeter, VadEvent, VoiceActivityDetector};
use crate::wav::HeaderStrip;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 1024;

use ConversationState as S;

/// Collaborators one conversation runs on
pub struct EngineParts {
    pub dialer: Arc<dyn Dialer>,
    pub capture: Box<dyn CaptureDevice>,
    pub meter: Box<dyn LevelMeter>,
    pub decoder: Box<dyn AudioDecoder>,
    pub output: Box<dyn AudioOutput>,
    pub clock: Arc<dyn Clock>,
}

impl EngineParts {
    /// WebSocket dialer, WAV decoder and tokio clock around the given devices
    pub fn new(
        capture: Box<dyn CaptureDevice>,
        meter: Box<dyn LevelMeter>,
        output: Box<dyn AudioOutput>,
    ) -> Self {
        Self {
            dialer: Arc::new(WebSocketDialer),
            capture,
            meter,
            decoder: Box::new(WavDecoder::default()),
            output,
            clock: Arc::new(TokioClock::new()),
        }
    }
}

/// Everything a UI shell can observe
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    StateChanged(StateChange),
    /// Advisory, once per level sample while listening
    VolumeChanged { level_db: f32, normalized: f32 },
    SpeechStarted { timestamp_ms: u64 },
    SpeechEnded { timestamp_ms: u64 },
    /// User speech cut the agent off
    Interrupted,
    UtteranceSent {
        utterance_id: u64,
        duration_ms: u64,
        bytes_streamed: u64,
        header_strip: HeaderStrip,
    },
    /// The end of an utterance never reached the agent
    UtteranceTruncated {
        utterance_id: u64,
        unsent_bytes: u64,
        reason: String,
    },
    Transcription { text: String, is_final: bool },
    StreamingStarted { total_chunks: u32, full_text: String },
    StreamingProgress {
        chunk_id: u64,
        total_chunks: u32,
        fraction: f32,
        text: String,
    },
    StreamingComplete,
    ChunkPlaying { chunk_id: u64 },
    ChunkDropped { chunk_id: u64, reason: String },
    PlaybackComplete,
    /// Informational frames from the agent, passed through as-is
    Agent(TransportEvent),
    Error { message: String, error_count: u32 },
    /// Terminal: recovery gave up. Emitted once per conversation.
    Failed { reason: String },
    Disconnected,
}

/// Point-in-time view of a conversation
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSnapshot {
    pub state: StateInfo,
    pub character: String,
    pub link: LinkState,
    pub is_recording: bool,
    pub bytes_streamed: u64,
    pub is_playing: bool,
    pub queue_length: usize,
    pub current_chunk: Option<u64>,
    pub total_expected_chunks: u32,
    pub streaming: StreamingProgress,
    pub history: Vec<TransitionRecord>,
}

enum Command {
    Start {
        character: Option<String>,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SendText {
        content: String,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    ForceState {
        state: ConversationState,
        reason: String,
        reply: oneshot::Sender<StateChange>,
    },
    Snapshot {
        reply: oneshot::Sender<ConversationSnapshot>,
    },
}

/// Cloneable handle to a running conversation
#[derive(Clone)]
pub struct ConversationHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ConversationEvent>,
    cancel: CancellationToken,
}

impl ConversationHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Connect and begin listening. `None` keeps the configured character.
    pub async fn start(&self, character: Option<&str>) -> VoiceResult<()> {
        let character = character.map(str::to_string);
        self.request(|reply| Command::Start { character, reply })
            .await?
    }

    /// Stop streaming, playback and the link
    pub async fn stop(&self) -> VoiceResult<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Typed chat fallback
    pub async fn send_text(&self, content: impl Into<String>) -> VoiceResult<()> {
        let content = content.into();
        self.request(|reply| Command::SendText { content, reply })
            .await?
    }

    /// Operator override of the conversation state
    pub async fn force_state(
        &self,
        state: ConversationState,
        reason: impl Into<String>,
    ) -> VoiceResult<StateChange> {
        let reason = reason.into();
        self.request(|reply| Command::ForceState {
            state,
            reason,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> VoiceResult<ConversationSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Tear the conversation down and end its task
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> VoiceResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| VoiceError::ChannelClosed("conversation task has exited".to_string()))?;
        reply_rx
            .await
            .map_err(|_| VoiceError::ChannelClosed("conversation task dropped the request".to_string()))
    }
}

#[derive(Debug, Default)]
struct TurnState {
    /// Chunks are discarded until the next `response_start`
    interrupted: bool,
    /// Between `response_start` and `response_complete`
    response_open: bool,
    /// `Failed` already emitted
    failed: bool,
}

#[derive(Debug, Default)]
struct Deadlines {
    settle: Option<Instant>,
    rearm: Option<Instant>,
    reconnect: Option<Instant>,
}

/// Single-writer conversation actor
pub struct ConversationOrchestrator {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    machine: ConversationStateMachine,
    vad: VoiceActivityDetector,
    meter: Box<dyn LevelMeter>,
    capture: CaptureManager,
    transport: StreamingTransport,
    queue: PlaybackQueue,
    health: Option<HealthProbe>,
    events: broadcast::Sender<ConversationEvent>,
    character: String,
    turn: TurnState,
    deadlines: Deadlines,
}

impl ConversationOrchestrator {
    /// Validate the config, build the components and start the actor task
    pub fn spawn(
        config: EngineConfig,
        parts: EngineParts,
    ) -> VoiceResult<(ConversationHandle, JoinHandle<()>)> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let orchestrator = Self::new(config, parts, events.clone())?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(orchestrator.run(commands_rx, cancel.clone()));

        Ok((
            ConversationHandle {
                commands: commands_tx,
                events,
                cancel,
            },
            task,
        ))
    }

    fn new(
        config: EngineConfig,
        parts: EngineParts,
        events: broadcast::Sender<ConversationEvent>,
    ) -> VoiceResult<Self> {
        let vad = VoiceActivityDetector::new(config.vad.clone())?;
        let health = HealthProbe::from_config(&config.health)?;
        let capture = CaptureManager::new(parts.capture, parts.clock.clone(), config.capture.clone());
        let transport =
            StreamingTransport::new(config.transport.clone(), parts.dialer, parts.clock.clone());
        let queue = PlaybackQueue::new(parts.decoder, parts.output);

        Ok(Self {
            character: config.transport.character.clone(),
            machine: ConversationStateMachine::new(parts.clock.clone()),
            clock: parts.clock,
            meter: parts.meter,
            config,
            vad,
            capture,
            transport,
            queue,
            health,
            events,
            turn: TurnState::default(),
            deadlines: Deadlines::default(),
        })
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        info!("🎙️ Conversation orchestrator started");
        let mut level_timer =
            tokio::time::interval(Duration::from_millis(self.vad.config().sample_interval_ms));
        level_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("🛑 Conversation shutdown requested");
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, &cancel).await,
                    None => {
                        debug!("📪 All conversation handles dropped");
                        break;
                    }
                },
                _ = level_timer.tick() => self.sample_level().await,
                activity = self.transport.next_activity() => match activity {
                    TransportActivity::ExtractionDue => self.extract().await,
                    TransportActivity::Inbound(Some(message)) => self.on_inbound(message).await,
                    TransportActivity::Inbound(None) => self.on_link_lost().await,
                },
                chunk_id = self.queue.wait_current() => {
                    debug!("🔊 Chunk {} completed", chunk_id);
                    let events = self.queue.on_current_finished().await;
                    self.on_playback_events(events);
                }
                _ = sleep_until(self.deadlines.settle) => {
                    self.deadlines.settle = None;
                    self.on_settled();
                }
                _ = sleep_until(self.deadlines.rearm) => {
                    self.deadlines.rearm = None;
                    self.on_listening_ready();
                }
                _ = sleep_until(self.deadlines.reconnect) => {
                    self.deadlines.reconnect = None;
                    if self.machine.current_state() == S::Error
                        && !self.reconnect(&mut commands, &cancel).await
                    {
                        debug!("📪 All conversation handles dropped");
                        break;
                    }
                }
            }
        }

        self.end_session("shutdown").await;
        info!("👋 Conversation orchestrator stopped");
    }

    /// Automatic reconnect that stays responsive: `Stop` abandons the
    /// attempt, other commands run once it settles. Returns false when every
    /// handle is gone.
    async fn reconnect(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        cancel: &CancellationToken,
    ) -> bool {
        info!("🔄 Attempting automatic reconnect");
        let mut deferred = Vec::new();
        let mut stop = None;
        let mut open = true;
        {
            let attempt = self.connect();
            tokio::pin!(attempt);
            loop {
                tokio::select! {
                    _ = &mut attempt => break,
                    _ = cancel.cancelled() => break,
                    command = commands.recv() => match command {
                        Some(Command::Stop { reply }) => {
                            stop = Some(reply);
                            break;
                        }
                        Some(command) => deferred.push(command),
                        None => {
                            open = false;
                            break;
                        }
                    },
                }
            }
        }

        if let Some(reply) = stop {
            info!("🛑 Reconnect abandoned");
            self.end_session("stop requested").await;
            let _ = reply.send(());
        }
        for command in deferred {
            self.handle_command(command, cancel).await;
        }
        open
    }

    async fn handle_command(&mut self, command: Command, cancel: &CancellationToken) {
        match command {
            Command::Start { character, reply } => {
                let result = tokio::select! {
                    result = self.begin(character) => result,
                    _ = cancel.cancelled() => Err(VoiceError::ChannelClosed(
                        "conversation shut down while connecting".to_string(),
                    )),
                };
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.end_session("stop requested").await;
                let _ = reply.send(());
            }
            Command::SendText { content, reply } => {
                info!("💬 Sending text message ({} chars)", content.len());
                let _ = reply.send(self.transport.send_text(&content).await);
            }
            Command::ForceState {
                state,
                reason,
                reply,
            } => {
                let change = self.machine.force_state(state, &reason);
                self.on_state_change(change.clone());
                let _ = reply.send(change);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn begin(&mut self, character: Option<String>) -> VoiceResult<()> {
        let state = self.machine.current_state();
        if !matches!(state, S::Disconnected | S::Error) {
            warn!("⚠️ Conversation already active ({})", state);
            return Ok(());
        }
        if let Some(character) = character {
            self.character = character;
        }
        self.turn = TurnState::default();
        self.deadlines.reconnect = None;
        self.connect().await
    }

    /// Connect-requested through session-started. Failures go through
    /// [`Self::on_error`] before being returned.
    async fn connect(&mut self) -> VoiceResult<()> {
        self.apply(StateEvent::ConnectRequested, None);

        if let Err(e) = self.open_link().await {
            self.on_error(&e).await;
            return Err(e);
        }

        self.apply(StateEvent::ConnectionEstablished, None);
        self.apply(StateEvent::SessionStarted, None);
        info!("✅ Conversation started with {}", self.character);
        Ok(())
    }

    async fn open_link(&mut self) -> VoiceResult<()> {
        if let Some(probe) = &self.health {
            probe.wait_for_healthy().await?;
        }
        let character = self.character.clone();
        self.transport.connect(&character).await
    }

    async fn sample_level(&mut self) {
        if !matches!(
            self.machine.current_state(),
            S::Listening | S::Recording | S::Playing
        ) {
            return;
        }

        let now = self.clock.now_millis();
        let level = self.meter.read_level(now);
        for event in self.vad.process_level(level, now) {
            match event {
                VadEvent::VolumeChanged {
                    level_db,
                    normalized,
                } => self.emit(ConversationEvent::VolumeChanged {
                    level_db,
                    normalized,
                }),
                VadEvent::SpeechStarted { timestamp_ms, .. } => {
                    self.on_speech_started(timestamp_ms).await
                }
                VadEvent::SpeechEnded { timestamp_ms, .. } => {
                    if self.machine.current_state() == S::Recording {
                        self.end_utterance(timestamp_ms).await;
                    }
                }
            }
        }
    }

    async fn on_speech_started(&mut self, timestamp_ms: u64) {
        match self.machine.current_state() {
            S::Listening => self.begin_utterance(timestamp_ms).await,
            S::Playing => {
                info!("✋ User interrupted playback");
                self.queue.stop().await;
                self.turn.interrupted = true;
                self.deadlines.settle = None;
                self.emit(ConversationEvent::Interrupted);
                self.begin_utterance(timestamp_ms).await;
            }
            state => debug!("🗣️ Speech ignored in {}", state),
        }
    }

    async fn begin_utterance(&mut self, timestamp_ms: u64) {
        self.emit(ConversationEvent::SpeechStarted { timestamp_ms });
        match self.transport.start_streaming(&mut self.capture).await {
            Ok(_) => {
                self.apply(
                    StateEvent::SpeechDetected,
                    Some(json!({ "timestamp": timestamp_ms })),
                );
            }
            Err(e) => self.on_error(&e).await,
        }
    }

    async fn end_utterance(&mut self, timestamp_ms: u64) {
        self.emit(ConversationEvent::SpeechEnded { timestamp_ms });
        self.vad.reset();

        match self.transport.stop_streaming(&mut self.capture).await {
            Ok(stopped) => {
                self.apply(StateEvent::SpeechEnded, None);
                if let Some(stopped) = stopped {
                    let utterance = stopped.utterance;
                    if stopped.unsent_bytes > 0 {
                        self.emit(ConversationEvent::UtteranceTruncated {
                            utterance_id: utterance.id,
                            unsent_bytes: stopped.unsent_bytes,
                            reason: stopped
                                .flush_error
                                .unwrap_or_else(|| "final flush skipped".to_string()),
                        });
                    }
                    let bytes_streamed = self.transport.session().bytes_sent;
                    self.apply(
                        StateEvent::AudioSent,
                        Some(json!({ "utterance_id": utterance.id, "bytes": bytes_streamed })),
                    );
                    self.emit(ConversationEvent::UtteranceSent {
                        utterance_id: utterance.id,
                        duration_ms: utterance.duration_ms,
                        bytes_streamed,
                        header_strip: utterance.header_strip,
                    });
                }
            }
            Err(e) => self.on_error(&e).await,
        }
    }

    async fn extract(&mut self) {
        if let Err(e) = self.transport.extract_and_send(&self.capture).await {
            self.on_error(&e).await;
        }
    }

    async fn on_inbound(&mut self, message: WireMessage) {
        for event in self.transport.handle_inbound(message) {
            self.on_transport_event(event).await;
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::BackendConnected => debug!("🔗 Voice agent acknowledged connection"),
            TransportEvent::RemoteSpeechEnded { timestamp_ms, .. } => {
                if self.machine.current_state() == S::Recording {
                    info!("🤐 Agent detected end of speech");
                    self.end_utterance(timestamp_ms).await;
                }
            }
            TransportEvent::Transcription { text, is_final, .. } => {
                self.emit(ConversationEvent::Transcription { text, is_final });
            }
            TransportEvent::StreamingStarted(progress) => {
                self.queue.prime(progress.total_chunks);
                self.turn.interrupted = false;
                self.turn.response_open = true;
                self.deadlines.settle = None;
                self.emit(ConversationEvent::StreamingStarted {
                    total_chunks: progress.total_chunks,
                    full_text: progress.full_text,
                });
            }
            TransportEvent::AudioChunk {
                chunk_id,
                payload,
                text,
                progress,
            } => {
                if self.turn.interrupted {
                    debug!("🗑️ Dropping chunk {} of interrupted response", chunk_id);
                    return;
                }
                self.emit(ConversationEvent::StreamingProgress {
                    chunk_id,
                    total_chunks: progress.total_chunks,
                    fraction: progress.fraction(),
                    text,
                });
                self.play_chunk(chunk_id, payload).await;
            }
            TransportEvent::LegacyAudio(bytes) => {
                if self.turn.interrupted {
                    debug!("🗑️ Dropping legacy audio of interrupted response");
                    return;
                }
                self.play_chunk(0, EncodedAudio::Raw(bytes)).await;
            }
            TransportEvent::StreamingComplete => {
                self.turn.response_open = false;
                if self.turn.interrupted {
                    debug!("🗑️ Interrupted response completed");
                    return;
                }
                self.emit(ConversationEvent::StreamingComplete);
                self.deadlines.settle = Some(
                    Instant::now() + Duration::from_millis(self.config.recovery.settle_delay_ms),
                );
            }
            TransportEvent::ListeningReady { .. } => {
                if self.machine.current_state() != S::Recording {
                    self.deadlines.rearm = Some(
                        Instant::now()
                            + Duration::from_millis(self.config.recovery.listening_ready_delay_ms),
                    );
                }
                self.emit(ConversationEvent::Agent(event));
            }
            TransportEvent::RemoteError {
                error_type,
                message,
                recoverable,
            } => {
                if recoverable {
                    warn!("⚠️ Recoverable agent error [{}]: {}", error_type, message);
                    self.emit(ConversationEvent::Agent(TransportEvent::RemoteError {
                        error_type,
                        message,
                        recoverable,
                    }));
                } else {
                    self.on_error(&VoiceError::Remote {
                        error_type,
                        message,
                        recoverable,
                    })
                    .await;
                }
            }
            other => self.emit(ConversationEvent::Agent(other)),
        }
    }

    async fn play_chunk(&mut self, chunk_id: u64, payload: EncodedAudio) {
        match self.machine.current_state() {
            S::Processing => {
                self.apply(StateEvent::ResponseReceived, None);
            }
            S::Listening => {
                self.transition(S::Playing, "audio_chunk");
            }
            S::Playing => {}
            state => {
                warn!("⚠️ Dropping chunk {} received in {}", chunk_id, state);
                return;
            }
        }
        let events = self.queue.enqueue(chunk_id, payload).await;
        self.on_playback_events(events);
    }

    fn on_playback_events(&mut self, events: Vec<PlaybackEvent>) {
        for event in events {
            match event {
                PlaybackEvent::ChunkStarted { chunk_id } => {
                    self.apply(StateEvent::AudioPlaying, Some(json!({ "chunk_id": chunk_id })));
                    self.emit(ConversationEvent::ChunkPlaying { chunk_id });
                }
                PlaybackEvent::DecodeFailed { chunk_id, reason }
                | PlaybackEvent::OutputFailed { chunk_id, reason } => {
                    self.emit(ConversationEvent::ChunkDropped { chunk_id, reason });
                }
                PlaybackEvent::QueueComplete => self.emit(ConversationEvent::PlaybackComplete),
            }
        }
        self.maybe_finish_turn();
    }

    /// Back to listening once the response is closed, settled and drained
    fn maybe_finish_turn(&mut self) {
        if self.machine.current_state() == S::Playing
            && !self.turn.response_open
            && self.deadlines.settle.is_none()
            && !self.queue.is_playing()
            && self.queue.queue_length() == 0
        {
            self.apply(StateEvent::AudioFinished, None);
        }
    }

    fn on_settled(&mut self) {
        match self.machine.current_state() {
            S::Playing => self.maybe_finish_turn(),
            S::Processing => {
                debug!("🔇 Response carried no audio");
                self.transition(S::Listening, "response_complete");
            }
            _ => {}
        }
    }

    fn on_listening_ready(&mut self) {
        match self.machine.current_state() {
            S::Listening => self.vad.reset(),
            S::Playing if self.queue.is_playing() || self.queue.queue_length() > 0 => {
                debug!("👂 Listening ready deferred until playback drains");
            }
            S::Processing | S::Playing => {
                self.transition(S::Listening, "listening_ready");
            }
            state => debug!("👂 Listening ready ignored in {}", state),
        }
    }

    async fn on_link_lost(&mut self) {
        warn!("⚠️ Voice agent link lost");
        self.transport.close();
        self.on_error(&VoiceError::Connection("link to voice agent lost".to_string()))
            .await;
    }

    /// Tear down, enter `Error`, then schedule a reconnect or give up
    async fn on_error(&mut self, err: &VoiceError) {
        if err.is_precondition() {
            warn!("⚠️ Ignoring precondition failure: {}", err);
            return;
        }
        error!("❌ Conversation error: {}", err);

        self.teardown().await;
        let message = err.to_string();
        let error_count = match self.apply(
            StateEvent::ErrorOccurred,
            Some(json!({ "error": message.clone() })),
        ) {
            Some(change) => change.error_count,
            None => self.machine.error_count(),
        };
        self.emit(ConversationEvent::Error {
            message: message.clone(),
            error_count,
        });

        let recovery = &self.config.recovery;
        if error_count < recovery.max_errors {
            info!(
                "🔄 Reconnecting in {}ms ({} of {} errors)",
                recovery.reconnect_backoff_ms, error_count, recovery.max_errors
            );
            self.deadlines.reconnect =
                Some(Instant::now() + Duration::from_millis(recovery.reconnect_backoff_ms));
        } else {
            error!("❌ Giving up after {} consecutive errors", error_count);
            self.apply(
                StateEvent::Disconnected,
                Some(json!({ "reason": "too many errors" })),
            );
            if !self.turn.failed {
                self.turn.failed = true;
                self.emit(ConversationEvent::Failed { reason: message });
            }
        }
    }

    /// Extraction timer, capture device, playback queue, link; in that order
    async fn teardown(&mut self) {
        self.deadlines.settle = None;
        self.deadlines.rearm = None;
        self.transport.cancel_streaming(&mut self.capture).await;
        self.queue.stop().await;
        self.transport.close();
        self.vad.reset();
        self.turn.interrupted = false;
        self.turn.response_open = false;
    }

    async fn end_session(&mut self, reason: &str) {
        self.deadlines = Deadlines::default();
        if self.machine.current_state() == S::Disconnected {
            self.teardown().await;
            return;
        }

        info!("🛑 Stopping conversation ({})", reason);
        self.teardown().await;

        if matches!(
            self.machine.current_state(),
            S::Recording | S::Processing | S::Playing
        ) {
            self.transition(S::Listening, "conversation_stopped");
        }
        match self.machine.current_state() {
            S::Connected | S::Listening => {
                self.apply(StateEvent::DisconnectRequested, Some(json!({ "reason": reason })));
                self.apply(StateEvent::Disconnected, None);
            }
            S::Disconnecting | S::Error | S::Connecting => {
                self.apply(StateEvent::Disconnected, None);
            }
            S::Disconnected => {}
            state => {
                let change = self.machine.force_state(S::Disconnected, reason);
                warn!("⚠️ Forced disconnect from {}", state);
                self.on_state_change(change);
            }
        }
        self.emit(ConversationEvent::Disconnected);
    }

    fn snapshot(&self) -> ConversationSnapshot {
        let session = self.transport.session();
        ConversationSnapshot {
            state: self.machine.state_info(),
            character: self.character.clone(),
            link: self.transport.connection_state(),
            is_recording: self.capture.is_recording(),
            bytes_streamed: session.bytes_sent,
            is_playing: self.queue.is_playing(),
            queue_length: self.queue.queue_length(),
            current_chunk: self.queue.current_chunk(),
            total_expected_chunks: self.queue.total_expected_chunks(),
            streaming: self.transport.streaming_progress().clone(),
            history: self.machine.history().to_vec(),
        }
    }

    fn apply(&mut self, event: StateEvent, metadata: Option<serde_json::Value>) -> Option<StateChange> {
        let change = self.machine.handle_event(event, metadata)?;
        self.on_state_change(change.clone());
        Some(change)
    }

    fn transition(&mut self, to: ConversationState, trigger: &str) -> Option<StateChange> {
        match self.machine.try_transition(to, trigger, None) {
            Ok(change) => {
                self.on_state_change(change.clone());
                Some(change)
            }
            Err(e) => {
                warn!("⚠️ {}", e);
                None
            }
        }
    }

    fn on_state_change(&mut self, change: StateChange) {
        if change.to == S::Listening {
            self.vad.reset();
        }
        self.emit(ConversationEvent::StateChanged(change));
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
