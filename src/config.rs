use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_PROXY_ENDPOINT: &str = "https://med-protocols-ai-main.azurewebsites.net/ai";

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_models() -> Vec<String> {
    vec!["gpt-3.5-turbo".to_string(), "gpt-4".to_string()]
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_endpoint() -> String {
    DEFAULT_PROXY_ENDPOINT.to_string()
}

fn default_user_id() -> u64 {
    1
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub window: WindowConfig,
}

/// Which service answers the questions.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// OpenAI-compatible chat completion API, full transcript forwarded.
    Completion {
        #[serde(default = "default_base_url")]
        base_url: String,
        #[serde(default = "default_models")]
        models: Vec<String>,
        #[serde(default = "default_api_key_env")]
        api_key_env: String,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default = "default_temperature")]
        temperature: f32,
    },
    /// Remote query endpoint, only the latest user text is sent.
    Proxy {
        #[serde(default = "default_endpoint")]
        endpoint: String,
        #[serde(default = "default_user_id")]
        user_id: u64,
        #[serde(default)]
        send_system_summary: bool,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Completion {
            base_url: default_base_url(),
            models: default_models(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RequestConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UiConfig {
    pub title: String,
    pub subtitle: String,
    pub user_name: String,
    pub bot_name: String,
    pub welcome_message: Option<String>,
    pub logo_path: Option<PathBuf>,
    pub hard_line_breaks: bool,
    pub placeholder: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        UiConfig {
            title: "Medical AI Bot".to_string(),
            subtitle: "Your AI-powered medical information assistant".to_string(),
            user_name: "You".to_string(),
            bot_name: "Assistant".to_string(),
            welcome_message: None,
            logo_path: Some(PathBuf::from("logo.png")),
            hard_line_breaks: true,
            placeholder: "Ask me about medical topics, symptoms, or health concerns...".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub min_width: u32,
    pub min_height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            width: 1000,
            height: 720,
            min_width: 600,
            min_height: 400,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            match Self::from_file(&config_path) {
                Ok(config) => {
                    info!(path = %config_path.display(), "loaded config");
                    return config;
                }
                Err(e) => warn!("{:#}. Using defaults.", e),
            }
        } else if let Some(parent) = config_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        Config::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Error reading {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Error parsing {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn get_config_path() -> PathBuf {
        if let Some(path) = std::env::var_os("MEDBOT_CONFIG") {
            return PathBuf::from(path);
        }
        Self::get_config_dir().join("config.toml")
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/medbot")
        } else {
            PathBuf::from(".")
        }
    }

    /// Relative logo paths are resolved against the config directory.
    pub fn logo_path(&self) -> Option<PathBuf> {
        self.ui.logo_path.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                Self::get_config_dir().join(p)
            }
        })
    }

    /// Looks up the API key the backend needs, if any.
    ///
    /// `Ok(None)` means the backend needs no key. `Err` carries the diagnostic
    /// shown to the user instead of the chat.
    pub fn resolve_api_key(&self) -> Result<Option<String>, String> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    pub fn resolve_api_key_with<F>(&self, lookup: F) -> Result<Option<String>, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        match &self.backend {
            BackendConfig::Completion { api_key_env, .. } => match lookup(api_key_env) {
                Some(key) if !key.trim().is_empty() => Ok(Some(key.trim().to_string())),
                _ => Err(format!(
                    "API key not found. Please set {} in your environment variables.",
                    api_key_env
                )),
            },
            BackendConfig::Proxy { .. } => Ok(None),
        }
    }

    pub fn api_key_hint(&self) -> Option<String> {
        match &self.backend {
            BackendConfig::Completion { api_key_env, .. } => Some(format!(
                "Create a .env file with your API key: {}=your_key_here",
                api_key_env
            )),
            BackendConfig::Proxy { .. } => None,
        }
    }
}
