//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crib_pipeline::{DEFAULT_MODEL, PromptOverrides, Tone};

/// Configuration for crib
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gemini API key (environment variables are recommended instead)
    pub api_key: Option<String>,
    /// Default model to use
    pub model: Option<String>,
    /// Default sampling temperature in [0, 1]
    pub temperature: Option<f32>,
    /// Explanation tone (casual, formal)
    pub tone: Option<Tone>,
    /// Per-stage prompt overrides
    #[serde(default)]
    pub prompts: PromptOverrides,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("crib")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        // Check for CRIB_CONFIG_PATH env var first
        if let Ok(path) = std::env::var("CRIB_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            api_key: None,
            model: Some(DEFAULT_MODEL.to_string()),
            temperature: None,
            tone: None,
            prompts: PromptOverrides::default(),
        };

        default_config.save()?;
        Ok(path)
    }

    /// Get the API key, checking config then env
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.clone().filter(|k| !k.trim().is_empty()) {
            return Some(key);
        }
        std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# crib configuration file
# Place at ~/.config/crib/config.toml (Linux/Mac) or %APPDATA%\crib\config.toml (Windows)

# Gemini API key (optional)
# It's recommended to use the GEMINI_API_KEY environment variable instead
# api_key = "..."

# Default model to use
model = "gemini-2.5-flash"

# Sampling temperature in [0, 1] (optional)
# temperature = 0.4

# Explanation tone (casual, formal)
# tone = "casual"

# Per-stage prompt overrides (optional)
# [prompts]
# clean = "..."
# answer = "..."
# explain = "..."
"#
}
