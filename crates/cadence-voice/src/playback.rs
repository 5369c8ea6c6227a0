//! Ordered playback of agent audio
//!
//! [`PlaybackQueue`] renders at most one chunk at a time, strictly in enqueue
//! order. Chunks are decoded when they reach the head of the queue; a chunk
//! that fails to decode or start is skipped and reported, and the next one is
//! tried.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::decode_audio;
use crate::wav::{self, HeaderStrip, WavFormat};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Chunk payload as received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedAudio {
    /// Base64 text from a control frame
    Base64(String),
    /// Raw bytes from a legacy frame
    Raw(Vec<u8>),
}

/// Audio ready for an output device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAudio {
    pub pcm: Vec<u8>,
    pub format: WavFormat,
    pub duration_ms: u64,
}

/// Turns a received payload into playable audio
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    async fn decode(&self, chunk_id: u64, payload: &EncodedAudio) -> VoiceResult<DecodedAudio>;
}

/// Platform speaker capability
#[async_trait]
pub trait AudioOutput: Send {
    /// Start rendering `audio`. The receiver resolves when it finishes
    /// naturally.
    async fn play(&mut self, audio: DecodedAudio) -> VoiceResult<oneshot::Receiver<()>>;

    /// Halt whatever is rendering
    async fn stop(&mut self) -> VoiceResult<()>;
}

/// Decoder for PCM WAV payloads
#[derive(Debug, Clone)]
pub struct WavDecoder {
    fallback_header_len: usize,
    default_format: WavFormat,
}

impl WavDecoder {
    pub fn new(default_format: WavFormat) -> Self {
        Self {
            fallback_header_len: wav::CANONICAL_HEADER_LEN,
            default_format,
        }
    }
}

impl Default for WavDecoder {
    fn default() -> Self {
        Self::new(WavFormat::pcm16(16_000, 1))
    }
}

#[async_trait]
impl AudioDecoder for WavDecoder {
    async fn decode(&self, chunk_id: u64, payload: &EncodedAudio) -> VoiceResult<DecodedAudio> {
        let decode_err = |reason: String| VoiceError::Decode { chunk_id, reason };

        let bytes = match payload {
            EncodedAudio::Base64(text) => {
                decode_audio(text).map_err(|e| decode_err(format!("invalid base64: {}", e)))?
            }
            EncodedAudio::Raw(bytes) => bytes.clone(),
        };
        if bytes.is_empty() {
            return Err(decode_err("empty payload".to_string()));
        }
        if !bytes.starts_with(b"RIFF") {
            return Err(decode_err("not a RIFF/WAVE container".to_string()));
        }

        let stripped = wav::strip_header(&bytes, self.fallback_header_len);
        if stripped.strip == HeaderStrip::Fallback {
            warn!("⚠️ Chunk {} has no data chunk, using fallback header strip", chunk_id);
        }
        let format = stripped.format.unwrap_or(self.default_format);
        if format.audio_format != 1 {
            return Err(decode_err(format!(
                "unsupported audio format tag {}",
                format.audio_format
            )));
        }

        Ok(DecodedAudio {
            duration_ms: format.duration_ms(stripped.pcm.len()),
            pcm: stripped.pcm.to_vec(),
            format,
        })
    }
}

/// Output that renders nothing and finishes after the audio's duration.
///
/// Used when no speaker is attached, e.g. headless runs.
#[derive(Debug, Default)]
pub struct NullOutput {
    timer: Option<JoinHandle<()>>,
}

impl NullOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AudioOutput for NullOutput {
    async fn play(&mut self, audio: DecodedAudio) -> VoiceResult<oneshot::Receiver<()>> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let (done_tx, done_rx) = oneshot::channel();
        let duration = Duration::from_millis(audio.duration_ms);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = done_tx.send(());
        }));
        Ok(done_rx)
    }

    async fn stop(&mut self) -> VoiceResult<()> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        Ok(())
    }
}

/// Notifications raised by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    ChunkStarted { chunk_id: u64 },
    DecodeFailed { chunk_id: u64, reason: String },
    OutputFailed { chunk_id: u64, reason: String },
    /// The last chunk finished and nothing is pending
    QueueComplete,
}

#[derive(Debug)]
struct QueueEntry {
    chunk_id: u64,
    payload: EncodedAudio,
}

#[derive(Debug)]
struct CurrentChunk {
    chunk_id: u64,
    /// Taken once it resolves
    done: Option<oneshot::Receiver<()>>,
}

/// Strictly sequential playback queue
pub struct PlaybackQueue {
    decoder: Box<dyn AudioDecoder>,
    output: Box<dyn AudioOutput>,
    pending: VecDeque<QueueEntry>,
    current: Option<CurrentChunk>,
    total_expected_chunks: u32,
}

impl PlaybackQueue {
    pub fn new(decoder: Box<dyn AudioDecoder>, output: Box<dyn AudioOutput>) -> Self {
        Self {
            decoder,
            output,
            pending: VecDeque::new(),
            current: None,
            total_expected_chunks: 0,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    /// Entries waiting behind the current chunk
    pub fn queue_length(&self) -> usize {
        self.pending.len()
    }

    pub fn current_chunk(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.chunk_id)
    }

    pub fn total_expected_chunks(&self) -> u32 {
        self.total_expected_chunks
    }

    /// Record the chunk count advertised for the upcoming response
    pub fn prime(&mut self, total_chunks: u32) {
        debug!("🎵 Playback primed for {} chunks", total_chunks);
        self.total_expected_chunks = total_chunks;
    }

    /// Play now if idle, otherwise append
    pub async fn enqueue(&mut self, chunk_id: u64, payload: EncodedAudio) -> Vec<PlaybackEvent> {
        self.pending.push_back(QueueEntry { chunk_id, payload });
        if self.current.is_some() {
            debug!("🎵 Chunk {} queued ({} waiting)", chunk_id, self.pending.len());
            return Vec::new();
        }
        let mut events = Vec::new();
        self.start_next(&mut events).await;
        events
    }

    /// Resolves when the current chunk finishes; pending forever when idle
    pub async fn wait_current(&mut self) -> u64 {
        match self.current.as_mut() {
            Some(current) => {
                if let Some(done) = current.done.as_mut() {
                    // A dropped sender means the output gave up on the chunk
                    let _ = done.await;
                    current.done = None;
                }
                current.chunk_id
            }
            None => std::future::pending().await,
        }
    }

    /// Advance after the current chunk finished naturally
    pub async fn on_current_finished(&mut self) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        if let Some(finished) = self.current.take() {
            debug!("✅ Chunk {} finished", finished.chunk_id);
        }
        if !self.start_next(&mut events).await {
            info!("🏁 Playback queue complete");
            self.total_expected_chunks = 0;
            events.push(PlaybackEvent::QueueComplete);
        }
        events
    }

    /// Halt playback and discard everything pending. Idempotent.
    pub async fn stop(&mut self) {
        let dropped = self.pending.len();
        self.pending.clear();
        self.total_expected_chunks = 0;
        if let Some(current) = self.current.take() {
            info!("🛑 Playback stopped at chunk {} ({} discarded)", current.chunk_id, dropped);
            if let Err(e) = self.output.stop().await {
                warn!("⚠️ Output stop failed: {}", e);
            }
        }
    }

    /// Start the first pending chunk that decodes and plays. Returns whether
    /// something is now playing.
    async fn start_next(&mut self, events: &mut Vec<PlaybackEvent>) -> bool {
        while let Some(entry) = self.pending.pop_front() {
            let audio = match self.decoder.decode(entry.chunk_id, &entry.payload).await {
                Ok(audio) => audio,
                Err(e) => {
                    error!("❌ Skipping chunk {}: {}", entry.chunk_id, e);
                    events.push(PlaybackEvent::DecodeFailed {
                        chunk_id: entry.chunk_id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match self.output.play(audio).await {
                Ok(done) => {
                    info!("🔊 Playing chunk {}", entry.chunk_id);
                    self.current = Some(CurrentChunk {
                        chunk_id: entry.chunk_id,
                        done: Some(done),
                    });
                    events.push(PlaybackEvent::ChunkStarted {
                        chunk_id: entry.chunk_id,
                    });
                    return true;
                }
                Err(e) => {
                    error!("❌ Output refused chunk {}: {}", entry.chunk_id, e);
                    events.push(PlaybackEvent::OutputFailed {
                        chunk_id: entry.chunk_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        false
    }
}
