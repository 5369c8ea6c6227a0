//! Health probe for the voice agent's HTTP endpoint

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Health probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Base URL of the agent's HTTP side; probing is skipped when unset
    pub base_url: Option<String>,

    /// Bound on a single probe (default: 5000ms)
    pub probe_timeout_ms: u64,

    /// Bound on waiting for an unhealthy agent to recover (default: 30000ms)
    pub max_wait_ms: u64,

    /// Delay between probes while waiting (default: 2000ms)
    pub poll_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            probe_timeout_ms: 5_000,
            max_wait_ms: 30_000,
            poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: String,
}

/// Probes `GET {base_url}/health` for `{"status":"healthy"}`
#[derive(Debug, Clone)]
pub struct HealthProbe {
    url: String,
    config: HealthConfig,
    client: reqwest::Client,
}

impl HealthProbe {
    pub fn new(base_url: impl Into<String>, config: HealthConfig) -> VoiceResult<Self> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.probe_timeout_ms))
            .build()
            .map_err(|e| VoiceError::Health(e.to_string()))?;
        Ok(Self {
            url: format!("{}/health", base_url.trim_end_matches('/')),
            config,
            client,
        })
    }

    /// Build from config; `None` when no base URL is configured
    pub fn from_config(config: &HealthConfig) -> VoiceResult<Option<Self>> {
        match &config.base_url {
            Some(base) if !base.trim().is_empty() => Self::new(base.clone(), config.clone()).map(Some),
            _ => Ok(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One bounded probe
    pub async fn check(&self) -> VoiceResult<()> {
        self.check_within(Duration::from_millis(self.config.probe_timeout_ms))
            .await
    }

    async fn check_within(&self, bound: Duration) -> VoiceResult<()> {
        debug!("🏥 Performing health check: {}", self.url);
        let probe = async {
            let res = self.client.get(&self.url).send().await?;
            if !res.status().is_success() {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                return Err(VoiceError::Health(format!("{} {}", status, body)));
            }
            let body: HealthBody = res.json().await?;
            if body.status == "healthy" {
                Ok::<(), VoiceError>(())
            } else {
                Err(VoiceError::Health(format!("service not healthy: {}", body.status)))
            }
        };

        match tokio::time::timeout(bound, probe).await {
            Ok(result) => result,
            Err(_) => Err(VoiceError::Timeout(format!(
                "health check exceeded {}ms",
                bound.as_millis()
            ))),
        }
    }

    /// Poll until healthy. Probes and pauses are clipped so the whole wait
    /// never exceeds `max_wait_ms`.
    pub async fn wait_for_healthy(&self) -> VoiceResult<()> {
        info!("⏳ Waiting for voice agent to be healthy (max {}ms)", self.config.max_wait_ms);
        let deadline = Instant::now() + Duration::from_millis(self.config.max_wait_ms);
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.check_within(probe_timeout.min(remaining)).await {
                Ok(()) => {
                    info!("✅ Voice agent is healthy");
                    return Ok(());
                }
                Err(e) => debug!("⏳ Voice agent not ready yet: {}", e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(poll.min(remaining)).await;
        }

        warn!("❌ Voice agent did not become healthy within {}ms", self.config.max_wait_ms);
        Err(VoiceError::Timeout(format!(
            "voice agent did not become healthy within {}ms",
            self.config.max_wait_ms
        )))
    }
}
