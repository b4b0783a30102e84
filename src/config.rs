use std::sync::LazyLock;

use infer_bus::params::ParamSet;
use serde::Deserialize;

/// Path of an optional JSON config file.
pub const CONFIG_ENV: &str = "LITE_INFER_CONFIG";

fn default_streams() -> Vec<String> {
    vec!["cam0".to_string(), "cam1".to_string()]
}

fn default_frames() -> u64 {
    30
}

fn default_width() -> u32 {
    64
}

fn default_height() -> u32 {
    36
}

fn default_latency() -> (u64, u64) {
    (0, 50)
}

fn default_device_count() -> i32 {
    1
}

fn default_params() -> ParamSet {
    [
        ("name", "detector"),
        ("infer_interval", "3"),
        ("threshold", "0.5"),
        ("postproc_name", "detection"),
    ]
    .into_iter()
    .collect()
}

#[derive(Debug, Deserialize)]
pub struct InferConfig {
    #[serde(default = "default_streams")]
    streams: Vec<String>,
    #[serde(default = "default_frames")]
    frames: u64,
    #[serde(default = "default_width")]
    width: u32,
    #[serde(default = "default_height")]
    height: u32,
    #[serde(default = "default_latency")]
    latency_ms: (u64, u64),
    #[serde(default = "default_device_count")]
    device_count: i32,
    #[serde(default = "default_params")]
    params: ParamSet,
}

impl Default for InferConfig {
    fn default() -> Self {
        Self {
            streams: default_streams(),
            frames: default_frames(),
            width: default_width(),
            height: default_height(),
            latency_ms: default_latency(),
            device_count: default_device_count(),
            params: default_params(),
        }
    }
}

impl InferConfig {
    fn load() -> anyhow::Result<Self> {
        let Ok(path) = std::env::var(CONFIG_ENV) else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path, e))?;
        serde_json::from_str(&text).map_err(|e| anyhow::anyhow!("parse config {}: {}", path, e))
    }

    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn latency_ms(&self) -> (u64, u64) {
        self.latency_ms
    }

    pub fn device_count(&self) -> i32 {
        self.device_count
    }

    pub fn params(&self) -> &ParamSet {
        &self.params
    }
}

pub fn config() -> &'static InferConfig {
    static CONFIG: LazyLock<InferConfig> = LazyLock::new(|| {
        InferConfig::load().unwrap_or_else(|e| {
            log::warn!("{:#}, using defaults", e);
            InferConfig::default()
        })
    });
    &CONFIG
}
