//! Wire protocol spoken with the voice agent
//!
//! JSON control frames tagged by `type`, plus two legacy shapes: bare text
//! notices such as `connected`, and raw audio blobs (binary frames or
//! non-JSON text) that go straight to playback.

use crate::error::VoiceResult;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Text frames that are notices rather than JSON
pub const SIMPLE_CONNECTED: &str = "connected";

/// A frame as it travels over the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Frames sent to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Sent once, immediately after the channel opens
    Initialize { character: String },
    /// Base64 PCM delta
    Audio { audio: String },
    /// Free-form text, e.g. typed chat fallback
    Message { content: String },
}

impl OutboundFrame {
    pub fn audio(pcm: &[u8]) -> Self {
        OutboundFrame::Audio {
            audio: encode_audio(pcm),
        }
    }

    pub fn to_wire(&self) -> VoiceResult<WireMessage> {
        Ok(WireMessage::Text(serde_json::to_string(self)?))
    }
}

fn unknown() -> String {
    "unknown".to_string()
}

fn user() -> String {
    "user".to_string()
}

fn ai() -> String {
    "ai".to_string()
}

fn processing() -> String {
    "processing".to_string()
}

fn unknown_error() -> String {
    "Unknown error".to_string()
}

/// Control frames received from the agent. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    SpeechDetected {
        #[serde(default)]
        confidence: f64,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    SpeechEndDetected {
        #[serde(default)]
        duration: f64,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    TranscriptionPartial {
        #[serde(default)]
        text: String,
        #[serde(default)]
        confidence: f64,
    },
    TranscriptionComplete {
        #[serde(default)]
        text: String,
        #[serde(default)]
        confidence: f64,
    },
    ProcessingStarted {
        #[serde(default = "unknown")]
        character: String,
        #[serde(default)]
        input_text: String,
    },
    LlmThinking {
        #[serde(default)]
        progress: f64,
        #[serde(default = "processing")]
        stage: String,
    },
    ResponseStart {
        #[serde(default)]
        total_chunks: u32,
        #[serde(default)]
        full_text: String,
    },
    #[serde(alias = "audio_stream", alias = "streaming_audio_chunk")]
    AudioChunk {
        #[serde(default)]
        chunk_id: u64,
        #[serde(default, alias = "audio_data")]
        audio: String,
        #[serde(default)]
        text: String,
    },
    ResponseComplete {},
    ListeningReady {
        #[serde(default = "unknown")]
        character: String,
        #[serde(default)]
        conversation_id: Option<Value>,
    },
    ConversationState {
        #[serde(default = "unknown")]
        state: String,
        #[serde(default = "user")]
        turn: String,
        #[serde(default)]
        participants: Vec<Value>,
    },
    TurnTaking {
        #[serde(default = "user")]
        current_speaker: String,
        #[serde(default = "ai")]
        next_speaker: String,
        #[serde(default)]
        can_interrupt: bool,
    },
    CharacterSwitched {
        #[serde(default = "unknown")]
        from_character: String,
        #[serde(default = "unknown")]
        to_character: String,
        #[serde(default)]
        voice_changed: bool,
    },
    Error {
        #[serde(default = "unknown")]
        error_type: String,
        #[serde(default = "unknown_error")]
        message: String,
        #[serde(default)]
        recoverable: bool,
    },
    AudioReceived {},
    #[serde(other)]
    Unknown,
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(InboundFrame),
    /// Bare text notice such as `connected`
    Simple(String),
    /// Raw audio to hand to playback as-is
    LegacyAudio(Vec<u8>),
    /// JSON that is not a well-formed control frame
    Malformed { raw: String, reason: String },
}

/// Classify one frame from the link
pub fn parse_inbound(message: WireMessage) -> Inbound {
    match message {
        WireMessage::Binary(bytes) => {
            debug!("🔊 Binary frame ({} bytes) treated as legacy audio", bytes.len());
            Inbound::LegacyAudio(bytes)
        }
        WireMessage::Text(text) => {
            let value: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(_) => {
                    let trimmed = text.trim();
                    if trimmed == SIMPLE_CONNECTED {
                        return Inbound::Simple(trimmed.to_string());
                    }
                    debug!("🔊 Non-JSON text frame ({} bytes) treated as legacy audio", text.len());
                    return Inbound::LegacyAudio(text.into_bytes());
                }
            };

            match InboundFrame::deserialize(value) {
                Ok(InboundFrame::Unknown) => {
                    warn!("⚠️ Unhandled message type in: {}", truncate(&text, 120));
                    Inbound::Control(InboundFrame::Unknown)
                }
                Ok(frame) => Inbound::Control(frame),
                Err(e) => {
                    warn!("⚠️ Malformed control frame: {}", e);
                    Inbound::Malformed {
                        raw: text,
                        reason: e.to_string(),
                    }
                }
            }
        }
    }
}

pub fn encode_audio(pcm: &[u8]) -> String {
    STANDARD.encode(pcm)
}

/// Decode a base64 payload, tolerating a `data:<mime>;base64,` prefix and
/// embedded whitespace
pub fn decode_audio(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let body = match payload.find(";base64,") {
        Some(idx) if payload.starts_with("data:") => &payload[idx + ";base64,".len()..],
        _ => payload,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(compact)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
