use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Gemini API key. The GEMINI_API_KEY environment variable overrides
    /// whatever the file says.
    pub api_key: String,

    pub text_model: String,
    pub image_model: String,

    /// Page illustration aspect ratio. The product format is a 16:9
    /// horizontal page; 4:3 remains a valid setting.
    pub aspect_ratio: String,

    /// Pause between scene generations in the generate-all loop. Exists to
    /// respect the per-minute image quota, not for correctness.
    pub scene_delay_ms: u64,

    /// Use the printed page text instead of the illustrator description as
    /// the primary scene prompt.
    pub use_story_text: bool,

    pub output_folder: String,

    pub text_retry: RetryConfig,
    pub image_retry: RetryConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_seconds: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_secs(self.delay_seconds))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            delay_seconds: default_retry_delay(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            text_model: default_text_model(),
            image_model: default_image_model(),
            aspect_ratio: default_aspect_ratio(),
            scene_delay_ms: default_scene_delay_ms(),
            use_story_text: false,
            output_folder: default_output(),
            text_retry: RetryConfig::default(),
            image_retry: RetryConfig::default(),
        }
    }
}

fn default_text_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}
fn default_aspect_ratio() -> String {
    "16:9".to_string()
}
fn default_scene_delay_ms() -> u64 {
    4500
}
fn default_output() -> String {
    "output".to_string()
}
fn default_retries() -> u32 {
    4
}
fn default_retry_delay() -> u64 {
    5
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).context("Failed to read config.yml")?;
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?
        } else {
            Config::default()
        };

        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.is_empty() {
                config.api_key = key;
            }
        }

        if config.api_key.is_empty() {
            anyhow::bail!("No API key. Set GEMINI_API_KEY or put api_key in config.yml.");
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }

    pub fn scene_delay(&self) -> Duration {
        Duration::from_millis(self.scene_delay_ms)
    }
}
