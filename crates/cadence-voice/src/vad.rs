//! Voice Activity Detection over audio-level samples
//!
//! Turns a stream of metering readings into discrete speech start/end
//! events. Two thresholds form a hysteresis band so a level hovering near a
//! single cut-off cannot make the detector chatter.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Lowest level reported by meters, in dB
pub const LEVEL_FLOOR_DB: f32 = -100.0;

/// How incoming level samples are expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelScale {
    /// dBFS, typically -100..0
    Decibel,
    /// Linear amplitude 0.0..=1.0
    Linear,
}

/// Configuration for voice activity detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Level above which a sample counts as speech, in dB (default: -30)
    pub speech_threshold_db: f32,

    /// Level below which a sample counts as silence, in dB (default: -50)
    pub silence_threshold_db: f32,

    /// Sustained speech required before `SpeechStarted` (default: 300ms)
    pub min_speech_duration_ms: u64,

    /// Sustained silence required before `SpeechEnded` (default: 1500ms)
    pub max_silence_duration_ms: u64,

    /// Scale of incoming samples
    pub scale: LevelScale,

    /// Metering period (default: 100ms)
    pub sample_interval_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold_db: -30.0,
            silence_threshold_db: -50.0,
            min_speech_duration_ms: 300,
            max_silence_duration_ms: 1500,
            scale: LevelScale::Decibel,
            sample_interval_ms: 100,
        }
    }
}

/// Events emitted by the detector
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    SpeechStarted {
        timestamp_ms: u64,
        level_db: f32,
    },
    SpeechEnded {
        timestamp_ms: u64,
        /// Time since the last speech-level sample
        silence_ms: u64,
    },
    /// Advisory, emitted for every sample
    VolumeChanged { level_db: f32, normalized: f32 },
}

/// Timing state for the current speech/silence run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceActivityWindow {
    pub speech_started_at_ms: Option<u64>,
    pub last_speech_at_ms: Option<u64>,
    pub silence_started_at_ms: Option<u64>,
}

/// Debounced speech detector
#[derive(Debug)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    window: VoiceActivityWindow,
    recording: bool,
    current_level_db: f32,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        info!(
            "🎙️ Initializing VAD (speech: {}dB, silence: {}dB)",
            config.speech_threshold_db, config.silence_threshold_db
        );

        if config.speech_threshold_db <= config.silence_threshold_db {
            return Err(VoiceError::Config(format!(
                "speech threshold ({}dB) must be above silence threshold ({}dB)",
                config.speech_threshold_db, config.silence_threshold_db
            )));
        }
        if config.sample_interval_ms == 0 {
            return Err(VoiceError::Config(
                "VAD sample interval must be non-zero".to_string(),
            ));
        }

        Ok(Self {
            config,
            window: VoiceActivityWindow::default(),
            recording: false,
            current_level_db: LEVEL_FLOOR_DB,
        })
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Whether the detector believes the user is mid-utterance
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn window(&self) -> VoiceActivityWindow {
        self.window
    }

    pub fn current_level_db(&self) -> f32 {
        self.current_level_db
    }

    /// Feed one level sample taken at `now_ms`
    pub fn process_level(&mut self, level: f32, now_ms: u64) -> Vec<VadEvent> {
        let level_db = self.to_db(level);
        self.current_level_db = level_db;

        let mut events = vec![VadEvent::VolumeChanged {
            level_db,
            normalized: normalize_db(level_db),
        }];

        let is_speech = level_db > self.config.speech_threshold_db;
        let is_silence = level_db < self.config.silence_threshold_db;

        if is_speech {
            self.window.last_speech_at_ms = Some(now_ms);
            self.window.silence_started_at_ms = None;

            if !self.recording {
                match self.window.speech_started_at_ms {
                    None => self.window.speech_started_at_ms = Some(now_ms),
                    Some(started) => {
                        if now_ms.saturating_sub(started) >= self.config.min_speech_duration_ms {
                            info!("🗣️ Speech detected");
                            self.recording = true;
                            self.window.speech_started_at_ms = None;
                            events.push(VadEvent::SpeechStarted {
                                timestamp_ms: now_ms,
                                level_db,
                            });
                        }
                    }
                }
            }
        } else if is_silence {
            if self.recording {
                match self.window.silence_started_at_ms {
                    None => self.window.silence_started_at_ms = Some(now_ms),
                    Some(started) => {
                        if now_ms.saturating_sub(started) >= self.config.max_silence_duration_ms {
                            info!("🤐 Speech ended");
                            let silence_ms = self
                                .window
                                .last_speech_at_ms
                                .map(|last| now_ms.saturating_sub(last))
                                .unwrap_or(0);
                            self.recording = false;
                            self.window = VoiceActivityWindow::default();
                            events.push(VadEvent::SpeechEnded {
                                timestamp_ms: now_ms,
                                silence_ms,
                            });
                        }
                    }
                }
            } else {
                self.window.speech_started_at_ms = None;
            }
        } else {
            // Inside the hysteresis band
            self.window.last_speech_at_ms = Some(now_ms);
            if !self.recording {
                self.window.speech_started_at_ms = None;
            }
        }

        events
    }

    /// Forget the current window and any in-progress utterance
    pub fn reset(&mut self) {
        debug!("🔄 VAD window reset");
        self.window = VoiceActivityWindow::default();
        self.recording = false;
    }

    fn to_db(&self, level: f32) -> f32 {
        match self.config.scale {
            LevelScale::Decibel => level.max(LEVEL_FLOOR_DB),
            LevelScale::Linear => {
                if level <= 0.0 {
                    LEVEL_FLOOR_DB
                } else {
                    (20.0 * level.min(1.0).log10()).max(LEVEL_FLOOR_DB)
                }
            }
        }
    }
}

fn normalize_db(level_db: f32) -> f32 {
    ((level_db - LEVEL_FLOOR_DB) / -LEVEL_FLOOR_DB).clamp(0.0, 1.0)
}

/// Source of instantaneous audio level readings
pub trait LevelMeter: Send {
    /// Current level on the configured scale
    fn read_level(&mut self, now_ms: u64) -> f32;
}

/// Level meter fed from outside, e.g. by a platform metering callback
#[derive(Debug, Clone)]
pub struct ManualMeter {
    level: Arc<Mutex<f32>>,
}

impl ManualMeter {
    pub fn new(initial: f32) -> Self {
        Self {
            level: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn set_level(&self, level: f32) {
        if let Ok(mut guard) = self.level.lock() {
            *guard = level;
        }
    }
}

impl LevelMeter for ManualMeter {
    fn read_level(&mut self, _now_ms: u64) -> f32 {
        self.level.lock().map(|guard| *guard).unwrap_or(LEVEL_FLOOR_DB)
    }
}

/// Stand-in meter for environments without metering access.
///
/// Reports a speech-level burst of `burst_ms` at the start of every
/// `period_ms`, silence otherwise. Phase is anchored at the first reading.
#[derive(Debug, Clone)]
pub struct SyntheticMeter {
    period_ms: u64,
    burst_ms: u64,
    speech_level_db: f32,
    silence_level_db: f32,
    anchor_ms: Option<u64>,
}

impl SyntheticMeter {
    pub fn new(period_ms: u64, burst_ms: u64) -> Self {
        Self {
            period_ms: period_ms.max(1),
            burst_ms: burst_ms.min(period_ms),
            speech_level_db: -20.0,
            silence_level_db: -60.0,
            anchor_ms: None,
        }
    }
}

impl Default for SyntheticMeter {
    fn default() -> Self {
        Self::new(20_000, 3_000)
    }
}

impl LevelMeter for SyntheticMeter {
    fn read_level(&mut self, now_ms: u64) -> f32 {
        let anchor = *self.anchor_ms.get_or_insert(now_ms);
        let phase = now_ms.saturating_sub(anchor) % self.period_ms;
        if phase < self.burst_ms {
            self.speech_level_db
        } else {
            self.silence_level_db
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> VoiceActivityDetector {
        VoiceActivityDetector::new(VadConfig::default()).unwrap()
    }

    fn feed(vad: &mut VoiceActivityDetector, level: f32, from: u64, to: u64) -> Vec<VadEvent> {
        let mut out = Vec::new();
        let mut t = from;
        while t <= to {
            out.extend(
                vad.process_level(level, t)
                    .into_iter()
                    .filter(|e| !matches!(e, VadEvent::VolumeChanged { .. })),
            );
            t += 100;
        }
        out
    }

    #[test]
    fn test_vad_initialization() {
        let vad = detector();
        assert!(!vad.is_recording());
        assert_eq!(vad.window(), VoiceActivityWindow::default());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let config = VadConfig {
            speech_threshold_db: -60.0,
            ..Default::default()
        };
        assert!(matches!(
            VoiceActivityDetector::new(config),
            Err(VoiceError::Config(_))
        ));
    }

    #[test]
    fn test_speech_needs_min_duration() {
        let mut vad = detector();
        assert!(feed(&mut vad, -20.0, 0, 200).is_empty());

        let events = feed(&mut vad, -20.0, 300, 300);
        assert!(matches!(events[..], [VadEvent::SpeechStarted { timestamp_ms: 300, .. }]));
        assert!(vad.is_recording());
    }

    #[test]
    fn test_short_burst_is_ignored() {
        let mut vad = detector();
        feed(&mut vad, -20.0, 0, 200);
        feed(&mut vad, -70.0, 300, 300);
        // Speech run restarted, so 300ms more is needed
        assert!(feed(&mut vad, -20.0, 400, 600).is_empty());
        assert!(!vad.is_recording());
    }

    #[test]
    fn test_speech_ends_after_sustained_silence() {
        let mut vad = detector();
        feed(&mut vad, -20.0, 0, 300);
        assert!(vad.is_recording());

        assert!(feed(&mut vad, -70.0, 400, 1800).is_empty());
        let events = feed(&mut vad, -70.0, 1900, 1900);
        match &events[..] {
            [VadEvent::SpeechEnded { silence_ms, .. }] => assert_eq!(*silence_ms, 1600),
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(!vad.is_recording());
    }

    #[test]
    fn test_band_samples_are_inert() {
        let mut vad = detector();
        feed(&mut vad, -20.0, 0, 300);

        // -40dB sits between the thresholds
        assert!(feed(&mut vad, -40.0, 400, 5000).is_empty());
        assert!(vad.is_recording());
        assert_eq!(vad.window().last_speech_at_ms, Some(5000));
        assert_eq!(vad.window().silence_started_at_ms, None);
    }

    #[test]
    fn test_volume_changed_every_sample() {
        let mut vad = detector();
        let events = vad.process_level(-50.0, 0);
        match &events[..] {
            [VadEvent::VolumeChanged { level_db, normalized }] => {
                assert_eq!(*level_db, -50.0);
                assert!((normalized - 0.5).abs() < f32::EPSILON);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_linear_scale_converts_to_db() {
        let config = VadConfig {
            scale: LevelScale::Linear,
            ..Default::default()
        };
        let mut vad = VoiceActivityDetector::new(config).unwrap();
        vad.process_level(0.1, 0);
        assert!((vad.current_level_db() - -20.0).abs() < 0.01);
        vad.process_level(0.0, 100);
        assert_eq!(vad.current_level_db(), LEVEL_FLOOR_DB);
    }

    #[test]
    fn test_reset_clears_recording() {
        let mut vad = detector();
        feed(&mut vad, -20.0, 0, 300);
        vad.reset();
        assert!(!vad.is_recording());
        assert_eq!(vad.window(), VoiceActivityWindow::default());
    }

    #[test]
    fn test_synthetic_meter_bursts() {
        let mut meter = SyntheticMeter::new(1_000, 200);
        assert_eq!(meter.read_level(5_000), -20.0);
        assert_eq!(meter.read_level(5_150), -20.0);
        assert_eq!(meter.read_level(5_300), -60.0);
        assert_eq!(meter.read_level(6_100), -20.0);
    }

    #[test]
    fn test_manual_meter_shares_level() {
        let meter = ManualMeter::new(-80.0);
        let mut reader = meter.clone();
        meter.set_level(-10.0);
        assert_eq!(reader.read_level(0), -10.0);
    }
}
