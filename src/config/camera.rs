//! Camera configuration
//!
//! Camera records are owned by an external collaborator; this module only
//! reads them.

use super::settings::RecorderSettings;
use crate::recorder::state::MotionTiming;
use crate::utils::error::RecorderResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// One camera as supplied by the configuration source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    pub id: String,
    #[serde(alias = "url", alias = "rtspUrl")]
    pub stream_address: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub min_motion_seconds: Option<f64>,
    #[serde(default)]
    pub cooldown_seconds: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl CameraConfig {
    pub fn new(id: impl Into<String>, stream_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_address: stream_address.into(),
            enabled: true,
            min_motion_seconds: None,
            cooldown_seconds: None,
        }
    }

    /// State machine thresholds, falling back to the recorder defaults
    pub fn motion_timing(&self, settings: &RecorderSettings) -> MotionTiming {
        MotionTiming::from_secs(
            self.min_motion_seconds
                .filter(|s| s.is_finite() && *s >= 0.0)
                .unwrap_or(settings.min_motion_seconds),
            settings.post_seconds,
            self.cooldown_seconds
                .filter(|s| s.is_finite() && *s >= 0.0)
                .unwrap_or(settings.cooldown_seconds),
        )
    }

    /// Ids end up as directory names, so path separators are not allowed
    fn is_usable(&self) -> bool {
        let id = self.id.as_str();
        !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && !self.stream_address.is_empty()
    }
}

/// Trim ids and addresses, then drop unusable records and duplicate ids,
/// keeping the first occurrence
pub fn sanitize_configs(configs: Vec<CameraConfig>) -> Vec<CameraConfig> {
    let mut seen = HashSet::new();
    let mut result = Vec::with_capacity(configs.len());

    for mut config in configs {
        config.id = config.id.trim().to_string();
        config.stream_address = config.stream_address.trim().to_string();
        if !config.is_usable() {
            tracing::warn!("Skipping unusable camera config: {:?}", config.id);
            continue;
        }
        if !seen.insert(config.id.clone()) {
            tracing::warn!("Skipping duplicate camera id: {}", config.id);
            continue;
        }
        result.push(config);
    }

    result
}

/// Supplies the current camera configuration collection
#[async_trait]
pub trait CameraConfigSource: Send + Sync {
    /// Read the full, ordered collection
    async fn load(&self) -> RecorderResult<Vec<CameraConfig>>;
}

/// Reads a JSON array of camera records from a file on every load
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CameraConfigSource for JsonFileSource {
    async fn load(&self) -> RecorderResult<Vec<CameraConfig>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let configs: Vec<CameraConfig> = serde_json::from_str(&content)?;

        tracing::debug!("Read {} camera config(s) from {:?}", configs.len(), self.path);
        Ok(sanitize_configs(configs))
    }
}

/// Fixed in-memory collection, replaceable at runtime
#[derive(Default)]
pub struct StaticSource {
    configs: parking_lot::RwLock<Vec<CameraConfig>>,
}

impl StaticSource {
    pub fn new(configs: Vec<CameraConfig>) -> Self {
        Self {
            configs: parking_lot::RwLock::new(configs),
        }
    }

    pub fn replace(&self, configs: Vec<CameraConfig>) {
        *self.configs.write() = configs;
    }
}

#[async_trait]
impl CameraConfigSource for StaticSource {
    async fn load(&self) -> RecorderResult<Vec<CameraConfig>> {
        Ok(sanitize_configs(self.configs.read().clone()))
    }
}
