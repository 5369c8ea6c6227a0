//! Engine configuration
//!
//! Precedence: `CADENCE__*` environment variables > TOML file (`CADENCE_CONFIG`
//! path, else `config/voice.toml`) > defaults.

use crate::capture::CaptureConfig;
use crate::error::VoiceResult;
use crate::health::HealthConfig;
use crate::transport::TransportConfig;
use crate::vad::VadConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Error recovery and turn-taking delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Errors without an intervening success before giving up (default: 3)
    pub max_errors: u32,

    /// Wait before an automatic reconnect (default: 2000ms)
    pub reconnect_backoff_ms: u64,

    /// Settle time after `response_complete` before listening again (default: 500ms)
    pub settle_delay_ms: u64,

    /// Delay before honouring `listening_ready` (default: 500ms)
    pub listening_ready_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_errors: 3,
            reconnect_backoff_ms: 2_000,
            settle_delay_ms: 500,
            listening_ready_delay_ms: 500,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    pub vad: VadConfig,
    pub capture: CaptureConfig,
    pub recovery: RecoveryConfig,
    pub health: HealthConfig,
}

impl EngineConfig {
    /// Load config from file and environment
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("CADENCE_CONFIG").unwrap_or_else(|_| "config/voice".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load with `path` as the file layer. A missing file is skipped.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() || path.with_extension("toml").exists() {
            info!("📄 Loading voice config from {}", path.display());
            builder.add_source(config::File::from(path.to_path_buf()).required(false))
        } else {
            debug!("📄 No voice config at {}, using defaults", path.display());
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("CADENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::LevelScale;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.transport.character, "adina");
        assert_eq!(config.transport.extraction_interval_ms, 250);
        assert_eq!(config.transport.connect_timeout_ms, 5_000);
        assert_eq!(config.vad.speech_threshold_db, -30.0);
        assert_eq!(config.vad.max_silence_duration_ms, 1_500);
        assert_eq!(config.capture.fallback_header_len, 44);
        assert_eq!(config.recovery.max_errors, 3);
        assert!(config.health.base_url.is_none());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = EngineConfig::load_from(Path::new("does/not/exist/voice.toml")).unwrap();
        assert_eq!(config.transport, TransportConfig::default());
        assert_eq!(config.recovery, RecoveryConfig::default());
    }

    #[test]
    fn test_file_overrides_sections() {
        let path = std::env::temp_dir().join(format!("cadence-voice-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[transport]
url = "ws://agent.local:9000/ws"
character = "morgan"

[vad]
scale = "linear"
min_speech_duration_ms = 200

[health]
base_url = "http://agent.local:9000"
"#,
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.transport.url, "ws://agent.local:9000/ws");
        assert_eq!(config.transport.character, "morgan");
        assert_eq!(config.transport.extraction_interval_ms, 250);
        assert_eq!(config.vad.scale, LevelScale::Linear);
        assert_eq!(config.vad.min_speech_duration_ms, 200);
        assert_eq!(config.vad.speech_threshold_db, -30.0);
        assert_eq!(config.health.base_url.as_deref(), Some("http://agent.local:9000"));
    }
}
