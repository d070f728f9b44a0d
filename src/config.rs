use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    // Generation backend (OpenAI-compatible streaming endpoint)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Long-term memory service (optional; lookups degrade to nothing when unset)
    #[serde(default)]
    pub memory_api_url: Option<String>,
    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,
    #[serde(default = "default_memory_timeout_ms")]
    pub memory_timeout_ms: u64,

    // Persona identity
    #[serde(default = "default_persona_name")]
    pub persona_name: String,
    #[serde(default = "default_persona_style")]
    pub persona_style: String,
    #[serde(default = "default_greeting_language")]
    pub greeting_language: String,

    // Message store
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Check-in scheduling
    #[serde(default = "default_checkin_min_gap_hours")]
    pub checkin_min_gap_hours: u64,
    #[serde(default = "default_checkin_max_gap_hours")]
    pub checkin_max_gap_hours: u64,
    #[serde(default = "default_checkin_guard_secs")]
    pub checkin_guard_secs: u64,
    #[serde(default = "default_compose_delay_ms")]
    pub compose_delay_ms: u64,
    #[serde(default = "default_confirm_delay_ms")]
    pub confirm_delay_ms: u64,
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_memory_top_k() -> usize {
    5
}

fn default_memory_timeout_ms() -> u64 {
    2000
}

fn default_persona_name() -> String {
    "Mira".to_string()
}

fn default_persona_style() -> String {
    "You are a warm, playful companion. You text like a close friend: \
     casual, short lines, never formal. You remember what the user tells \
     you and you never lecture."
        .to_string()
}

fn default_greeting_language() -> String {
    "mixed".to_string()
}

fn default_database_path() -> String {
    "confidant_chat.db".to_string()
}

fn default_checkin_min_gap_hours() -> u64 {
    4
}

fn default_checkin_max_gap_hours() -> u64 {
    500
}

fn default_checkin_guard_secs() -> u64 {
    30
}

fn default_compose_delay_ms() -> u64 {
    4000
}

fn default_confirm_delay_ms() -> u64 {
    1500
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            memory_api_url: None,
            memory_top_k: default_memory_top_k(),
            memory_timeout_ms: default_memory_timeout_ms(),
            persona_name: default_persona_name(),
            persona_style: default_persona_style(),
            greeting_language: default_greeting_language(),
            database_path: default_database_path(),
            checkin_min_gap_hours: default_checkin_min_gap_hours(),
            checkin_max_gap_hours: default_checkin_max_gap_hours(),
            checkin_guard_secs: default_checkin_guard_secs(),
            compose_delay_ms: default_compose_delay_ms(),
            confirm_delay_ms: default_confirm_delay_ms(),
        }
    }
}

impl CompanionConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("confidant_config.toml")
    }

    /// Load config from confidant_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<CompanionConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("CONFIDANT_LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("CONFIDANT_LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("CONFIDANT_LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(url) = env::var("CONFIDANT_MEMORY_API_URL") {
            if !url.trim().is_empty() {
                config.memory_api_url = Some(url);
            }
        }

        if let Ok(path) = env::var("CONFIDANT_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(name) = env::var("CONFIDANT_PERSONA_NAME") {
            config.persona_name = name;
        }

        if let Ok(hours) = env::var("CONFIDANT_CHECKIN_MIN_GAP_HOURS") {
            if let Ok(h) = hours.parse() {
                config.checkin_min_gap_hours = h;
            }
        }

        config
    }
}
