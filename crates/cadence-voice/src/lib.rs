//! # Cadence Voice - Real-time Voice Conversation Engine
//!
//! Turns a microphone into a continuous, turn-taking dialogue with a remote
//! voice agent over a WebSocket, and the agent's synthesized speech back
//! into ordered, gapless playback.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Conversation Orchestrator                     │
//! │                 (one task, one select! loop)                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────────┐  │
//! │  │ Level Meter  │→ │     VAD      │→ │   Capture Manager     │  │
//! │  │  (100ms)     │  │ (hysteresis) │  │  (RIFF header strip)  │  │
//! │  └──────────────┘  └──────────────┘  └───────────────────────┘  │
//! │                                                ↓ PCM deltas      │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────────┐  │
//! │  │ Audio Output │← │Playback Queue│← │  Streaming Transport  │⇄ agent
//! │  │              │  │ (sequential) │  │  (WebSocket + JSON)   │  │
//! │  └──────────────┘  └──────────────┘  └───────────────────────┘  │
//! │                 ↑ every transition validated by ↑                │
//! │              ┌──────────────────────────────────┐                │
//! │              │   Conversation State Machine     │                │
//! │              └──────────────────────────────────┘                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod playback;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod vad;
pub mod wav;

pub use capture::{CaptureConfig, CaptureDevice, CaptureManager, MemoryCaptureDevice, Utterance};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{EngineConfig, RecoveryConfig};
pub use error::{VoiceError, VoiceResult};
pub use health::{HealthConfig, HealthProbe};
pub use orchestrator::{
    ConversationEvent, ConversationHandle, ConversationOrchestrator, ConversationSnapshot,
    EngineParts,
};
pub use playback::{
    AudioDecoder, AudioOutput, DecodedAudio, EncodedAudio, NullOutput, PlaybackEvent,
    PlaybackQueue, WavDecoder,
};
pub use protocol::{InboundFrame, OutboundFrame, WireMessage};
pub use state::{ConversationState, ConversationStateMachine, StateChange, StateEvent, StateInfo};
pub use transport::{
    DeltaTracker, Dialer, MemoryDialer, StoppedStream, StreamingProgress, StreamingTransport,
    TransportConfig, TransportEvent, WebSocketDialer, WireLink,
};
pub use vad::{LevelMeter, ManualMeter, SyntheticMeter, VadConfig, VadEvent, VoiceActivityDetector};
pub use wav::{HeaderStrip, WavFormat};
