//! Layered configuration: defaults, optional TOML file, then environment.

use crate::audio::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::live_ws::AgentConfig;
use crate::narration::NarrationConfig;
use crate::session::SessionConfig;
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration for the voice pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub agent: AgentConfig,
    pub narration: NarrationConfig,
}

impl ParleyConfig {
    /// Load config from file and environment. Precedence: env `PARLEY__*` >
    /// file at `PARLEY_CONFIG` (default `config/parley`) > defaults.
    ///
    /// Nested keys use `__`, e.g. `PARLEY__AUDIO__CAPTURE_SAMPLE_RATE=16000`.
    /// `PARLEY_API_KEY` fills any API key left empty.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| "config/parley".to_string());
        Self::load_from(&config_path)
    }

    /// Load with an explicit file path (extension optional).
    pub fn load_from(config_path: &str) -> VoiceResult<Self> {
        let builder = config::Config::builder()
            .set_default("agent.model", "live-audio")?
            .set_default("session.turn_reset_delay_ms", 3000_i64)?;

        let path = Path::new(config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder.add_source(config::File::with_name(config_path).required(false))
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut parsed: ParleyConfig = built.try_deserialize()?;

        if let Ok(key) = std::env::var("PARLEY_API_KEY") {
            if parsed.agent.api_key.as_deref().map_or(true, str::is_empty) {
                parsed.agent.api_key = Some(key.clone());
            }
            if parsed.narration.api_key.as_deref().map_or(true, str::is_empty) {
                parsed.narration.api_key = Some(key);
            }
        }

        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.audio.capture_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(VoiceError::Config("sample rates must be non-zero".to_string()));
        }
        if self.audio.capture_block_size == 0 {
            return Err(VoiceError::Config("capture_block_size must be non-zero".to_string()));
        }
        if self.audio.output_channels == 0 {
            return Err(VoiceError::Config("output_channels must be non-zero".to_string()));
        }
        if self.narration.sample_rate == 0 {
            return Err(VoiceError::Config("narration sample_rate must be non-zero".to_string()));
        }
        if self.session.reap_interval_ms == 0 {
            return Err(VoiceError::Config("reap_interval_ms must be non-zero".to_string()));
        }
        if self.agent.url.trim().is_empty() {
            return Err(VoiceError::Config("agent url is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = ParleyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.turn_reset_delay_ms, 3000);
    }

    #[test]
    fn zero_rate_is_rejected() {
        let mut config = ParleyConfig::default();
        config.audio.capture_sample_rate = 0;
        assert!(matches!(config.validate(), Err(VoiceError::Config(_))));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("parley-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("parley.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[audio]\ncapture_block_size = 512\n\n[agent]\nurl = \"ws://agent.test/live\"\n"
        )
        .unwrap();

        let config = ParleyConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.audio.capture_block_size, 512);
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.agent.url, "ws://agent.test/live");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ParleyConfig::load_from("definitely/not/here/parley").unwrap();
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.agent.model, "live-audio");
    }
}
