use std::env;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ApmError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub app_name: String,
    /// Deduct HTTP client segments from their parent's exclusive time even
    /// when they complete on another thread.
    pub force_synchronous_timing_http_client: bool,
    pub distributed_tracing_enabled: bool,
    pub cross_application_tracing_enabled: bool,
    pub trusted_account_key: Option<String>,
    pub attribute_value_max_bytes: usize,
    pub error_stack_trace_max_frames: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app_name: "My Application".to_string(),
            force_synchronous_timing_http_client: false,
            distributed_tracing_enabled: true,
            cross_application_tracing_enabled: false,
            trusted_account_key: None,
            attribute_value_max_bytes: 255,
            error_stack_trace_max_frames: 300,
        }
    }
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut cfg = Self::default();
        let parsed: ConfigOverrides = toml::from_str(raw)
            .map_err(|e| ApmError::Config(format!("failed parsing config: {e}")))?;
        apply_overrides(&mut cfg, parsed, "config string")?;
        Ok(cfg)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    app_name: Option<String>,
    force_synchronous_timing_http_client: Option<bool>,
    distributed_tracing_enabled: Option<bool>,
    cross_application_tracing_enabled: Option<bool>,
    trusted_account_key: Option<String>,
    attribute_value_max_bytes: Option<usize>,
    error_stack_trace_max_frames: Option<usize>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("APMTX_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("apmtx/config.toml")
}

fn load_file_overrides(path: &PathBuf) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| ApmError::Config(format!("failed reading {}: {e}", path.display())))?;
    let parsed: ConfigOverrides = toml::from_str(&raw)
        .map_err(|e| ApmError::Config(format!("failed parsing {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    Ok(ConfigOverrides {
        app_name: env::var("APMTX_APP_NAME").ok(),
        force_synchronous_timing_http_client: env_bool("APMTX_FORCE_SYNC_TIMING_HTTP_CLIENT")?,
        distributed_tracing_enabled: env_bool("APMTX_DISTRIBUTED_TRACING")?,
        cross_application_tracing_enabled: env_bool("APMTX_CROSS_APPLICATION_TRACING")?,
        trusted_account_key: env::var("APMTX_TRUSTED_ACCOUNT_KEY").ok(),
        attribute_value_max_bytes: env_usize("APMTX_ATTRIBUTE_VALUE_MAX_BYTES")?,
        error_stack_trace_max_frames: env_usize("APMTX_ERROR_STACK_TRACE_MAX_FRAMES")?,
    })
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Ok(v) => parse_bool(&v)
            .map(Some)
            .map_err(|e| ApmError::Config(format!("bad {name} in environment: {e}"))),
        Err(_) => Ok(None),
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(v) => Ok(Some(v.parse::<usize>().map_err(|e| {
            ApmError::Config(format!("bad {name} in environment: {e}"))
        })?)),
        Err(_) => Ok(None),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ApmError::Parse(format!("expected boolean, got {other}"))),
    }
}

fn apply_overrides(cfg: &mut AgentConfig, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.app_name {
        if v.trim().is_empty() {
            return Err(ApmError::Config(format!("app_name in {source} cannot be empty")));
        }
        cfg.app_name = v;
    }
    if let Some(v) = overrides.force_synchronous_timing_http_client {
        cfg.force_synchronous_timing_http_client = v;
    }
    if let Some(v) = overrides.distributed_tracing_enabled {
        cfg.distributed_tracing_enabled = v;
    }
    if let Some(v) = overrides.cross_application_tracing_enabled {
        cfg.cross_application_tracing_enabled = v;
    }
    if let Some(v) = overrides.trusted_account_key {
        cfg.trusted_account_key = Some(v);
    }
    if let Some(v) = overrides.attribute_value_max_bytes {
        if v == 0 {
            return Err(ApmError::Config(format!(
                "attribute_value_max_bytes in {source} must be positive"
            )));
        }
        cfg.attribute_value_max_bytes = v;
    }
    if let Some(v) = overrides.error_stack_trace_max_frames {
        cfg.error_stack_trace_max_frames = v;
    }
    Ok(())
}
