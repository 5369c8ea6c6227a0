//! Utterance capture
//!
//! [`CaptureManager`] owns exactly one recording session per utterance on top
//! of a platform [`CaptureDevice`]. Stopping a session strips the container
//! header, deletes the device's temporary artifact and yields an
//! [`Utterance`].

use crate::clock::Clock;
use crate::error::{VoiceError, VoiceResult};
use crate::wav::{self, HeaderStrip, WavFormat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Assumed when the container carries no `fmt ` chunk (default: 16000 Hz)
    pub sample_rate: u32,

    /// Assumed when the container carries no `fmt ` chunk (default: 1)
    pub channels: u16,

    /// Header bytes skipped when no `data` chunk is found (default: 44)
    pub fallback_header_len: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            fallback_header_len: wav::CANONICAL_HEADER_LEN,
        }
    }
}

/// Platform microphone capability
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire the microphone and begin buffering
    async fn begin(&mut self) -> VoiceResult<()>;

    /// Stop buffering and release the microphone
    async fn end(&mut self) -> VoiceResult<()>;

    /// Everything buffered so far, container header included
    async fn buffered_bytes(&self) -> VoiceResult<Vec<u8>>;

    /// Location of the on-device artifact, if any
    fn uri(&self) -> Option<String>;

    /// Remove the on-device artifact. Must be idempotent.
    async fn delete_artifact(&mut self) -> VoiceResult<()>;
}

/// A finished user utterance
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Sequence number within the manager's lifetime
    pub id: u64,
    pub started_at_ms: u64,
    pub duration_ms: u64,
    /// Raw PCM with the container header removed
    pub samples: Vec<u8>,
    pub sample_rate_hz: u32,
    pub channel_count: u16,
    pub bits_per_sample: u16,
    pub header_strip: HeaderStrip,
}

/// Header-stripped view of the live capture
#[derive(Debug, Clone, PartialEq)]
pub struct LivePcm {
    pub pcm: Vec<u8>,
    pub header_strip: HeaderStrip,
}

/// Snapshot of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureState {
    pub is_recording: bool,
    pub started_at_ms: Option<u64>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveCapture {
    id: u64,
    started_at_ms: u64,
}

/// Single-session recording manager
pub struct CaptureManager {
    device: Box<dyn CaptureDevice>,
    clock: Arc<dyn Clock>,
    config: CaptureConfig,
    active: Option<ActiveCapture>,
    next_id: u64,
}

impl CaptureManager {
    pub fn new(device: Box<dyn CaptureDevice>, clock: Arc<dyn Clock>, config: CaptureConfig) -> Self {
        Self {
            device,
            clock,
            config,
            active: None,
            next_id: 1,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn state(&self) -> CaptureState {
        let now = self.clock.now_millis();
        CaptureState {
            is_recording: self.active.is_some(),
            started_at_ms: self.active.map(|a| a.started_at_ms),
            elapsed_ms: self
                .active
                .map(|a| now.saturating_sub(a.started_at_ms))
                .unwrap_or(0),
        }
    }

    /// Begin a new utterance and return its start timestamp
    pub async fn start_recording(&mut self) -> VoiceResult<u64> {
        if self.active.is_some() {
            warn!("⚠️ Recording already in progress");
            return Err(VoiceError::AlreadyRecording);
        }

        self.device.begin().await?;

        let started_at_ms = self.clock.now_millis();
        let id = self.next_id;
        self.next_id += 1;
        self.active = Some(ActiveCapture { id, started_at_ms });

        info!("🎙️ Recording started (utterance #{})", id);
        Ok(started_at_ms)
    }

    /// Finish the current utterance
    pub async fn stop_recording(&mut self) -> VoiceResult<Utterance> {
        let Some(active) = self.active.take() else {
            warn!("⚠️ No recording in progress");
            return Err(VoiceError::NotRecording);
        };

        let ended = self.device.end().await;
        let bytes = match ended {
            Ok(()) => self.device.buffered_bytes().await,
            Err(e) => Err(e),
        };
        self.discard_artifact().await;
        let bytes = bytes?;

        let duration_ms = self.clock.now_millis().saturating_sub(active.started_at_ms);
        let stripped = wav::strip_header(&bytes, self.config.fallback_header_len);
        let format = stripped
            .format
            .unwrap_or_else(|| WavFormat::pcm16(self.config.sample_rate, self.config.channels));

        info!(
            "✅ Recording stopped (utterance #{}): {}ms, {} PCM bytes",
            active.id,
            duration_ms,
            stripped.pcm.len()
        );

        Ok(Utterance {
            id: active.id,
            started_at_ms: active.started_at_ms,
            duration_ms,
            samples: stripped.pcm.to_vec(),
            sample_rate_hz: format.sample_rate,
            channel_count: format.channels,
            bits_per_sample: format.bits_per_sample,
            header_strip: stripped.strip,
        })
    }

    /// Abandon the current utterance. No-op with a warning when idle.
    pub async fn cancel_recording(&mut self) -> VoiceResult<()> {
        let Some(active) = self.active.take() else {
            warn!("⚠️ Cancel requested with no recording in progress");
            return Ok(());
        };

        info!("🗑️ Recording cancelled (utterance #{})", active.id);
        let ended = self.device.end().await;
        self.discard_artifact().await;
        ended
    }

    /// Header-stripped PCM buffered so far in the live utterance
    pub async fn current_pcm(&self) -> VoiceResult<LivePcm> {
        if self.active.is_none() {
            return Err(VoiceError::NotRecording);
        }
        let bytes = self.device.buffered_bytes().await?;
        let stripped = wav::strip_header(&bytes, self.config.fallback_header_len);
        Ok(LivePcm {
            pcm: stripped.pcm.to_vec(),
            header_strip: stripped.strip,
        })
    }

    async fn discard_artifact(&mut self) {
        let uri = self.device.uri();
        match self.device.delete_artifact().await {
            Ok(()) => debug!("🧹 Deleted capture artifact {:?}", uri),
            Err(e) => warn!("⚠️ Failed to delete capture artifact {:?}: {}", uri, e),
        }
    }
}

#[derive(Debug)]
struct MemoryCaptureInner {
    recording: bool,
    wav: Vec<u8>,
    artifact: Option<String>,
    sessions: u64,
    fail_begin: bool,
}

/// In-memory microphone.
///
/// Writes a WAV container with an unpatched `data` size while recording and
/// patches the sizes on `end`, like a platform recorder writing to a file.
/// PCM is pushed through a cloned handle.
#[derive(Debug, Clone)]
pub struct MemoryCaptureDevice {
    format: WavFormat,
    inner: Arc<Mutex<MemoryCaptureInner>>,
}

static MEMORY_DEVICE_IDS: AtomicU64 = AtomicU64::new(1);

impl MemoryCaptureDevice {
    pub fn new(format: WavFormat) -> Self {
        Self {
            format,
            inner: Arc::new(Mutex::new(MemoryCaptureInner {
                recording: false,
                wav: Vec::new(),
                artifact: None,
                sessions: 0,
                fail_begin: false,
            })),
        }
    }

    /// Append PCM to the live recording. Ignored while idle.
    pub fn push_pcm(&self, pcm: &[u8]) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if !inner.recording {
            return false;
        }
        inner.wav.extend_from_slice(pcm);
        true
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().map(|i| i.recording).unwrap_or(false)
    }

    pub fn artifact_exists(&self) -> bool {
        self.inner.lock().map(|i| i.artifact.is_some()).unwrap_or(false)
    }

    /// Number of `begin` calls that succeeded
    pub fn sessions(&self) -> u64 {
        self.inner.lock().map(|i| i.sessions).unwrap_or(0)
    }

    /// Make subsequent `begin` calls fail, as a denied microphone would
    pub fn set_fail_begin(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_begin = fail;
        }
    }

    fn lock(&self) -> VoiceResult<std::sync::MutexGuard<'_, MemoryCaptureInner>> {
        self.inner
            .lock()
            .map_err(|e| VoiceError::Capture(format!("capture buffer poisoned: {}", e)))
    }
}

#[async_trait]
impl CaptureDevice for MemoryCaptureDevice {
    async fn begin(&mut self) -> VoiceResult<()> {
        let mut inner = self.lock()?;
        if inner.fail_begin {
            return Err(VoiceError::Capture("microphone unavailable".to_string()));
        }
        inner.recording = true;
        inner.sessions += 1;
        inner.wav = self.format.header(0);
        inner.artifact = Some(format!(
            "memory://capture/{}",
            MEMORY_DEVICE_IDS.fetch_add(1, Ordering::Relaxed)
        ));
        Ok(())
    }

    async fn end(&mut self) -> VoiceResult<()> {
        let mut inner = self.lock()?;
        inner.recording = false;
        if inner.wav.len() >= wav::CANONICAL_HEADER_LEN {
            let data_len = (inner.wav.len() - wav::CANONICAL_HEADER_LEN) as u32;
            let header = self.format.header(data_len);
            inner.wav[..wav::CANONICAL_HEADER_LEN].copy_from_slice(&header);
        }
        Ok(())
    }

    async fn buffered_bytes(&self) -> VoiceResult<Vec<u8>> {
        Ok(self.lock()?.wav.clone())
    }

    fn uri(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|i| i.artifact.clone())
    }

    async fn delete_artifact(&mut self) -> VoiceResult<()> {
        let mut inner = self.lock()?;
        inner.artifact = None;
        inner.wav.clear();
        Ok(())
    }
}
