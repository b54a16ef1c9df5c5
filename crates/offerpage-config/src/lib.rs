use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub target: Target,
    #[serde(default)]
    pub page: Page,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
    #[serde(default = "default_template_path")]
    pub template_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub client: String,
    pub organization_id: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Overrides `https://{client}.tt.omtrdc.net`.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Mbox names requested on the page. The first call resolves `shared_mbox`,
/// the second resolves `shared_mbox` and `extra_mbox`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    #[serde(default = "default_shared_mbox")]
    pub shared_mbox: String,
    #[serde(default = "default_extra_mbox")]
    pub extra_mbox: String,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            shared_mbox: default_shared_mbox(),
            extra_mbox: default_extra_mbox(),
        }
    }
}

fn default_static_dir() -> String {
    "./public".to_string()
}

fn default_template_path() -> String {
    "./templates/index.tpl".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_shared_mbox() -> String {
    "a1-serverside-ab".to_string()
}

fn default_extra_mbox() -> String {
    "a1-serverside-xt".to_string()
}

const CONFIG_SCHEMA: &str = include_str!("../../../config/config.schema.json");

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(format!("{path}: {e}")))?;
    parse_and_validate(&config_text)
}

/// YAML text -> schema check -> typed config -> runtime checks.
pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let instance = serde_json::to_value(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
    check_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn check_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value = serde_json::from_str(CONFIG_SCHEMA)
        .map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    validator
        .validate(instance)
        .map_err(|first| ConfigError::SchemaValidation(first.to_string()))
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.target.client.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "target.client must not be empty".to_string(),
        ));
    }
    if cfg.target.organization_id.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "target.organization_id must not be empty".to_string(),
        ));
    }
    if cfg.target.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "target.timeout_ms must be >= 1".to_string(),
        ));
    }
    if let Some(endpoint) = &cfg.target.endpoint {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::UnsupportedConfig(format!(
                "target.endpoint={endpoint} must be an http(s) URL"
            )));
        }
    }
    if cfg.page.shared_mbox.trim().is_empty() || cfg.page.extra_mbox.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "page.shared_mbox and page.extra_mbox must not be empty".to_string(),
        ));
    }
    if cfg.page.shared_mbox == cfg.page.extra_mbox {
        return Err(ConfigError::UnsupportedConfig(format!(
            "page.extra_mbox must differ from page.shared_mbox ({})",
            cfg.page.shared_mbox
        )));
    }
    Ok(())
}
