//! Run configuration.
//!
//! Loaded once at startup from a JSON file, validated, then treated as
//! read-only for the rest of the run.
use crate::error::OffboardError;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

const CONFIG_ENV: &str = "OFFBOARD_CONFIG";
const API_USERNAME_ENV: &str = "OFFBOARD_API_USERNAME";
const API_PASSWORD_ENV: &str = "OFFBOARD_API_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OffboardConfig {
    pub schema_version: u32,
    pub company_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub unbind_from_directory: bool,
    #[serde(default = "default_true")]
    pub convert_accounts: bool,
    #[serde(default)]
    pub set_admin_rights: bool,
    #[serde(default = "default_true")]
    pub offboard_management: bool,
    pub minimum_os_major: u32,
    pub enrollment_app: PathBuf,
    #[serde(default)]
    pub documentation_url: Option<String>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_min_local_uid")]
    pub min_local_uid: u32,
    #[serde(default)]
    pub notifier: NotifierKind,
    #[serde(default)]
    pub confirm_start: bool,
    #[serde(default = "default_agent_binary")]
    pub agent_binary: PathBuf,
    #[serde(default = "default_self_service_process")]
    pub self_service_process: String,
    #[serde(default)]
    pub management_api: Option<ManagementApiConfig>,
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    /// AppleScript dialogs shown to the console user.
    #[default]
    Dialog,
    /// Log-only; every prompt is treated as cancelled.
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagementApiConfig {
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_api_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvergenceConfig {
    #[serde(default = "default_convergence_attempts")]
    pub attempts: u32,
    #[serde(default = "default_convergence_delay")]
    pub delay_seconds: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            attempts: default_convergence_attempts(),
            delay_seconds: default_convergence_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionConfig {
    #[serde(default = "default_encryption_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub action: EncryptionAction,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_encryption_attempts(),
            action: EncryptionAction::default(),
        }
    }
}

/// FileVault operations the workflow can drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionAction {
    Enable,
    #[default]
    Disable,
    ReissueKey,
}

impl std::fmt::Display for EncryptionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enable => write!(f, "enable"),
            Self::Disable => write!(f, "disable"),
            Self::ReissueKey => write!(f, "reissue_key"),
        }
    }
}

/// Basic-auth credentials for the management API.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Management API settings with credentials resolved.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub credentials: ApiCredentials,
    pub timeout: Duration,
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/Library/Logs")
}

fn default_min_local_uid() -> u32 {
    500
}

fn default_agent_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/jamf")
}

fn default_self_service_process() -> String {
    "Self Service".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_convergence_attempts() -> u32 {
    4
}

fn default_convergence_delay() -> u64 {
    15
}

fn default_encryption_attempts() -> u32 {
    3
}

impl OffboardConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.company_name)
    }

    pub fn convergence_delay(&self) -> Duration {
        Duration::from_secs(self.convergence.delay_seconds)
    }

    /// API settings when both a base URL and credentials are available.
    ///
    /// Environment credentials take precedence over the file. `None` means
    /// management removal falls back to the local agent.
    pub fn api_settings(&self) -> Option<ApiSettings> {
        self.api_settings_with(|key| env::var(key).ok())
    }

    fn api_settings_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<ApiSettings> {
        let api = self.management_api.as_ref()?;
        let username = lookup(API_USERNAME_ENV)
            .or_else(|| api.username.clone())
            .filter(|value| !value.trim().is_empty())?;
        let password = lookup(API_PASSWORD_ENV)
            .or_else(|| api.password.clone())
            .filter(|value| !value.is_empty())?;
        Some(ApiSettings {
            base_url: api.base_url.trim_end_matches('/').to_string(),
            credentials: ApiCredentials { username, password },
            timeout: Duration::from_secs(api.timeout_seconds),
        })
    }

    /// Copy safe to print: credentials replaced by a marker.
    pub fn redacted(&self) -> OffboardConfig {
        let mut copy = self.clone();
        if let Some(api) = copy.management_api.as_mut() {
            if api.password.is_some() {
                api.password = Some("<redacted>".to_string());
            }
        }
        copy
    }
}

/// Resolve the config path: explicit flag, then `$OFFBOARD_CONFIG`, then the
/// per-user config directory.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let config_dir =
        dirs::config_dir().ok_or_else(|| anyhow!("cannot determine config directory"))?;
    Ok(config_dir.join("offboard").join("config.json"))
}

pub fn load_config(path: &Path) -> Result<OffboardConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: OffboardConfig =
        serde_json::from_slice(&bytes).context("parse offboard config JSON")?;
    Ok(config)
}

/// Load and validate in one step, mapping every failure to `InvalidConfig`.
pub fn load_validated(path: &Path) -> Result<OffboardConfig, OffboardError> {
    let config = load_config(path).map_err(|err| OffboardError::InvalidConfig(format!("{err:#}")))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &OffboardConfig) -> Result<(), OffboardError> {
    let invalid = |msg: String| Err(OffboardError::InvalidConfig(msg));
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return invalid(format!(
            "unsupported schema_version {}",
            config.schema_version
        ));
    }
    if config.company_name.trim().is_empty() {
        return invalid("company_name must be non-empty".to_string());
    }
    if config.company_name.contains('/') {
        return invalid("company_name must not contain '/'".to_string());
    }
    if config.minimum_os_major == 0 {
        return invalid("minimum_os_major must be positive".to_string());
    }
    if !config.enrollment_app.is_absolute() {
        return invalid(format!(
            "enrollment_app must be an absolute path (got {})",
            config.enrollment_app.display()
        ));
    }
    if config.convergence.attempts == 0 {
        return invalid("convergence.attempts must be at least 1".to_string());
    }
    if config.encryption.max_attempts == 0 {
        return invalid("encryption.max_attempts must be at least 1".to_string());
    }
    if let Some(api) = &config.management_api {
        let url = api.base_url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return invalid(format!("management_api.base_url must be http(s) (got {url:?})"));
        }
        if api.timeout_seconds == 0 {
            return invalid("management_api.timeout_seconds must be positive".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
