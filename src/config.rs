//! Configuration management with environment variable support.
//!
//! Centralized configuration for Phone Pilot:
//! - Environment variables for all configurable values
//! - Sensible defaults matching the hosted AutoGLM phone endpoint
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `PHONE_PILOT_ENDPOINT` | Chat-completions endpoint URL | hosted AutoGLM endpoint |
//! | `PHONE_PILOT_MODEL` | Model name | `autoglm-phone` |
//! | `PHONE_PILOT_API_KEY` | API key for the remote backend | (empty) |
//! | `PHONE_PILOT_LOCAL_PORT` | Port of the locally served model | `8000` |
//! | `PHONE_PILOT_MAX_TOKENS` | Max tokens per model response | `1024` |
//! | `PHONE_PILOT_CONNECT_TIMEOUT` | Connection timeout (seconds) | `10` |
//! | `PHONE_PILOT_REQUEST_TIMEOUT` | Whole-request timeout (seconds) | `120` |
//! | `PHONE_PILOT_ADB_PATH` | Path to the adb binary | `adb` |
//! | `PHONE_PILOT_DEVICE_TIMEOUT` | Per-device-command timeout (seconds) | `10` |
//! | `PHONE_PILOT_SESSION_DIR` | Base directory for run sessions | `/tmp/phone-pilot` |
//! | `PHONE_PILOT_MAX_STEPS` | Step budget per run | `100` |
//! | `PHONE_PILOT_LANG` | Prompt language, `cn` or `en` | `cn` |
//! | `PHONE_PILOT_HISTORY_WINDOW` | Trailing steps shown to the planner | `8` |

use std::env;
use std::sync::OnceLock;

// ============================================================================
// Default Values
// ============================================================================

/// Default remote chat-completions endpoint
pub const DEFAULT_ENDPOINT: &str = "https://open.bigmodel.cn/api/paas/v4/chat/completions";

/// Default model name
pub const DEFAULT_MODEL: &str = "autoglm-phone";

/// Default port for the locally served model
pub const DEFAULT_LOCAL_PORT: u16 = 8000;

/// Default max tokens per model response
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Default connection timeout (seconds)
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

/// Default whole-request timeout (seconds)
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 120;

/// Default adb binary
pub const DEFAULT_ADB_PATH: &str = "adb";

/// Default per-device-command timeout (seconds)
pub const DEFAULT_DEVICE_TIMEOUT: u64 = 10;

/// Default session base directory
pub const DEFAULT_SESSION_DIR: &str = "/tmp/phone-pilot";

/// Default step budget per run
pub const DEFAULT_MAX_STEPS: usize = 100;

/// Default prompt language
pub const DEFAULT_LANG: Lang = Lang::Cn;

/// Default trailing history window shown to the planner
pub const DEFAULT_HISTORY_WINDOW: usize = 8;

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_ENDPOINT: &str = "PHONE_PILOT_ENDPOINT";
pub const ENV_MODEL: &str = "PHONE_PILOT_MODEL";
pub const ENV_API_KEY: &str = "PHONE_PILOT_API_KEY";
pub const ENV_LOCAL_PORT: &str = "PHONE_PILOT_LOCAL_PORT";
pub const ENV_MAX_TOKENS: &str = "PHONE_PILOT_MAX_TOKENS";
pub const ENV_CONNECT_TIMEOUT: &str = "PHONE_PILOT_CONNECT_TIMEOUT";
pub const ENV_REQUEST_TIMEOUT: &str = "PHONE_PILOT_REQUEST_TIMEOUT";
pub const ENV_ADB_PATH: &str = "PHONE_PILOT_ADB_PATH";
pub const ENV_DEVICE_TIMEOUT: &str = "PHONE_PILOT_DEVICE_TIMEOUT";
pub const ENV_SESSION_DIR: &str = "PHONE_PILOT_SESSION_DIR";
pub const ENV_MAX_STEPS: &str = "PHONE_PILOT_MAX_STEPS";
pub const ENV_LANG: &str = "PHONE_PILOT_LANG";
pub const ENV_HISTORY_WINDOW: &str = "PHONE_PILOT_HISTORY_WINDOW";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Prompt language for the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    Cn,
    En,
}

impl Lang {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cn" | "zh" => Some(Lang::Cn),
            "en" => Some(Lang::En),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lang::Cn => "cn",
            Lang::En => "en",
        }
    }
}

/// Centralized configuration for Phone Pilot
#[derive(Debug, Clone)]
pub struct Config {
    /// Model backend configuration
    pub model: ModelSettings,
    /// Device transport configuration
    pub device: DeviceSettings,
    /// Session storage configuration
    pub session: SessionSettings,
    /// Agent loop defaults
    pub agent: AgentSettings,
}

/// Model backend settings
#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Remote chat-completions endpoint URL
    pub endpoint: String,
    /// Model name
    pub model: String,
    /// API key for the remote backend (empty when unset)
    pub api_key: String,
    /// Port of the locally served model
    pub local_port: u16,
    /// Maximum tokens per response
    pub max_tokens: u32,
    /// Connection timeout (seconds)
    pub connect_timeout: u64,
    /// Whole-request timeout (seconds)
    pub request_timeout: u64,
}

/// Device transport settings
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// adb binary to invoke
    pub adb_path: String,
    /// Per-command deadline (seconds)
    pub command_timeout: u64,
}

/// Session storage settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base directory for run session storage
    pub base_dir: String,
}

/// Agent loop defaults
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Step budget per run
    pub max_steps: usize,
    /// Prompt language
    pub lang: Lang,
    /// Trailing history window shown to the planner
    pub history_window: usize,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            model: ModelSettings::from_env(),
            device: DeviceSettings::from_env(),
            session: SessionSettings::from_env(),
            agent: AgentSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            model: ModelSettings::defaults(),
            device: DeviceSettings::defaults(),
            session: SessionSettings::defaults(),
            agent: AgentSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ModelSettings {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var(ENV_ENDPOINT).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string()),
            model: env::var(ENV_MODEL).unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_key: env::var(ENV_API_KEY).unwrap_or_default(),
            local_port: env_parse(ENV_LOCAL_PORT, DEFAULT_LOCAL_PORT),
            max_tokens: env_parse(ENV_MAX_TOKENS, DEFAULT_MAX_TOKENS),
            connect_timeout: env_parse(ENV_CONNECT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT),
            request_timeout: env_parse(ENV_REQUEST_TIMEOUT, DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn defaults() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: String::new(),
            local_port: DEFAULT_LOCAL_PORT,
            max_tokens: DEFAULT_MAX_TOKENS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl DeviceSettings {
    pub fn from_env() -> Self {
        Self {
            adb_path: env::var(ENV_ADB_PATH).unwrap_or_else(|_| DEFAULT_ADB_PATH.to_string()),
            command_timeout: env_parse(ENV_DEVICE_TIMEOUT, DEFAULT_DEVICE_TIMEOUT),
        }
    }

    pub fn defaults() -> Self {
        Self {
            adb_path: DEFAULT_ADB_PATH.to_string(),
            command_timeout: DEFAULT_DEVICE_TIMEOUT,
        }
    }
}

impl SessionSettings {
    pub fn from_env() -> Self {
        Self {
            base_dir: env::var(ENV_SESSION_DIR).unwrap_or_else(|_| DEFAULT_SESSION_DIR.to_string()),
        }
    }

    pub fn defaults() -> Self {
        Self {
            base_dir: DEFAULT_SESSION_DIR.to_string(),
        }
    }
}

impl AgentSettings {
    pub fn from_env() -> Self {
        Self {
            max_steps: env_parse(ENV_MAX_STEPS, DEFAULT_MAX_STEPS),
            lang: env::var(ENV_LANG)
                .ok()
                .and_then(|s| Lang::from_str(&s))
                .unwrap_or(DEFAULT_LANG),
            history_window: env_parse(ENV_HISTORY_WINDOW, DEFAULT_HISTORY_WINDOW),
        }
    }

    pub fn defaults() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            lang: DEFAULT_LANG,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}
