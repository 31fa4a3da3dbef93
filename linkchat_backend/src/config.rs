use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::links::LinkSyntax;

pub const MIN_MAX_DEPTH: usize = 1;
pub const MAX_MAX_DEPTH: usize = 20;

/// Settings that steer link resolution. Threaded by reference through every
/// resolver call; nothing in the engine reads global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// When off, links are replaced by the raw content of their target only.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_true")]
    pub enable_caching: bool,
    #[serde(default)]
    pub write_intermediate_results: bool,
    #[serde(default)]
    pub link_syntax: LinkSyntax,
}

impl ResolutionConfig {
    pub fn effective_max_depth(&self) -> usize {
        self.max_depth.clamp(MIN_MAX_DEPTH, MAX_MAX_DEPTH)
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: default_max_depth(),
            enable_caching: true,
            write_intermediate_results: false,
            link_syntax: LinkSyntax::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_vault_root")]
    pub vault_root: String,

    #[serde(default)]
    pub resolution: ResolutionConfig,
}

fn default_true() -> bool {
    true
}

fn default_max_depth() -> usize {
    5
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_vault_root() -> String {
    ".".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            vault_root: default_vault_root(),
            resolution: ResolutionConfig::default(),
        }
    }
}

impl AppConfig {
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

    /// Path of the config file: `LINKCHAT_CONFIG`, else `linkchat.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("LINKCHAT_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join("linkchat.toml"),
        }
    }

    /// Load config from the default location, falling back to defaults + env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if path.exists() {
            match Self::load_from(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to load {:?}: {:#}", path, e);
                }
            }
        }

        tracing::warn!("No usable config file, using defaults + env vars");
        Self::from_env()
    }

    /// Strict load: any read or parse failure is returned to the caller.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config.with_env_overrides())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }

        if let Ok(root) = env::var("LINKCHAT_VAULT") {
            if !root.trim().is_empty() {
                self.vault_root = root;
            }
        }

        if let Some(enabled) = env_flag("LINKCHAT_RESOLVE_LINKS") {
            self.resolution.enabled = enabled;
        }

        if let Ok(depth) = env::var("LINKCHAT_MAX_DEPTH") {
            if let Ok(depth) = depth.parse() {
                self.resolution.max_depth = depth;
            }
        }

        if let Some(enabled) = env_flag("LINKCHAT_ENABLE_CACHING") {
            self.resolution.enable_caching = enabled;
        }

        if let Some(enabled) = env_flag("LINKCHAT_WRITE_INTERMEDIATE") {
            self.resolution.write_intermediate_results = enabled;
        }

        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name).ok().map(|value| parse_flag(&value))
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}
