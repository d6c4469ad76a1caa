//! Configuration loading via `ortho-config` plus the subscriptions file.
//!
//! Polling cadence and endpoints come from [`MonitorConfig`], layered from
//! defaults, `azpower.toml` and `AZPOWER_*` environment variables.
//! Credentials live in a separate JSON file ([`SubscriptionsFile`]) keyed by
//! subscription id.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default location of the subscriptions file.
pub const DEFAULT_SUBSCRIPTIONS_FILE: &str = "~/.loupedeck/azure/azure.json";

/// Default root below which each subscription gets its own `az` profile.
pub const DEFAULT_AZ_CONFIG_ROOT: &str = "~/.azpower/az";

/// Default Azure Resource Manager endpoint.
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

/// Monitor settings derived from environment variables and configuration
/// files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "AZPOWER",
    discovery(
        app_name = "azpower",
        env_var = "AZPOWER_CONFIG_PATH",
        config_file_name = "azpower.toml",
        dotfile_name = ".azpower.toml",
        project_file_name = "azpower.toml"
    )
)]
pub struct MonitorConfig {
    /// Path to the JSON file holding per-subscription credentials. Supports
    /// tilde expansion.
    #[ortho_config(default = DEFAULT_SUBSCRIPTIONS_FILE.to_owned())]
    pub subscriptions_file: String,
    /// Seconds between reconciliations while nothing is transitioning.
    #[ortho_config(default = 1200)]
    pub normal_interval_secs: u64,
    /// Seconds until the next reconciliation while a machine is changing.
    #[ortho_config(default = 20)]
    pub fast_interval_secs: u64,
    /// Seconds until the confirming reconciliation after a start/stop command.
    #[ortho_config(default = 2)]
    pub command_delay_secs: u64,
    /// Seconds between activation and the first scheduled reconciliation.
    #[ortho_config(default = 2)]
    pub initial_delay_secs: u64,
    /// Upper bound, in seconds, on any single provider call.
    #[ortho_config(default = 30)]
    pub call_timeout_secs: u64,
    /// Path to the Azure CLI used to obtain access tokens.
    #[ortho_config(default = "az".to_owned())]
    pub az_bin: String,
    /// Directory holding one isolated `az` profile per subscription. Supports
    /// tilde expansion.
    #[ortho_config(default = DEFAULT_AZ_CONFIG_ROOT.to_owned())]
    pub az_config_root: String,
    /// Base URL of the Azure Resource Manager API.
    #[ortho_config(default = DEFAULT_MANAGEMENT_ENDPOINT.to_owned())]
    pub management_endpoint: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to azpower.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl MonitorConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("azpower")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a string is blank or an
    /// interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let strings = [
            (
                &self.subscriptions_file,
                FieldMetadata::new(
                    "subscriptions file",
                    "AZPOWER_SUBSCRIPTIONS_FILE",
                    "subscriptions_file",
                ),
            ),
            (
                &self.az_bin,
                FieldMetadata::new("Azure CLI path", "AZPOWER_AZ_BIN", "az_bin"),
            ),
            (
                &self.az_config_root,
                FieldMetadata::new(
                    "Azure CLI profile root",
                    "AZPOWER_AZ_CONFIG_ROOT",
                    "az_config_root",
                ),
            ),
            (
                &self.management_endpoint,
                FieldMetadata::new(
                    "management endpoint",
                    "AZPOWER_MANAGEMENT_ENDPOINT",
                    "management_endpoint",
                ),
            ),
        ];
        for (value, metadata) in strings {
            if value.trim().is_empty() {
                return Err(metadata.missing());
            }
        }

        let intervals = [
            (
                self.normal_interval_secs,
                FieldMetadata::new(
                    "normal polling interval",
                    "AZPOWER_NORMAL_INTERVAL_SECS",
                    "normal_interval_secs",
                ),
            ),
            (
                self.fast_interval_secs,
                FieldMetadata::new(
                    "fast polling interval",
                    "AZPOWER_FAST_INTERVAL_SECS",
                    "fast_interval_secs",
                ),
            ),
            (
                self.call_timeout_secs,
                FieldMetadata::new(
                    "provider call timeout",
                    "AZPOWER_CALL_TIMEOUT_SECS",
                    "call_timeout_secs",
                ),
            ),
        ];
        for (value, metadata) in intervals {
            if value == 0 {
                return Err(metadata.missing());
            }
        }
        Ok(())
    }

    /// Interval between reconciliations while nothing is transitioning.
    #[must_use]
    pub const fn normal_interval(&self) -> Duration {
        Duration::from_secs(self.normal_interval_secs)
    }

    /// Delay used while at least one machine is changing.
    #[must_use]
    pub const fn fast_interval(&self) -> Duration {
        Duration::from_secs(self.fast_interval_secs)
    }

    /// Delay before the reconciliation that confirms a command.
    #[must_use]
    pub const fn command_delay(&self) -> Duration {
        Duration::from_secs(self.command_delay_secs)
    }

    /// Delay before the first scheduled reconciliation.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    /// Deadline applied to each provider call.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Subscriptions file path with a leading `~/` expanded.
    #[must_use]
    pub fn subscriptions_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(self.subscriptions_file.trim()))
    }

    /// Root of the per-subscription `az` profiles with a leading `~/`
    /// expanded.
    #[must_use]
    pub fn az_config_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(self.az_config_root.trim()))
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is unset the input is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Service principal settings for one subscription.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionCredentials {
    /// Application (client) id of the service principal.
    #[serde(default)]
    pub client_id: String,
    /// Client secret of the service principal.
    #[serde(default)]
    pub client_secret: String,
    /// Directory (tenant) id the principal belongs to.
    #[serde(default)]
    pub tenant_id: String,
    /// Pre-issued bearer token; when present no login is performed.
    #[serde(default)]
    pub access_token: Option<String>,
}

impl SubscriptionCredentials {
    /// Returns the configured static token when it is not blank.
    #[must_use]
    pub fn static_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    fn validate(&self, subscription_id: &str) -> Result<(), ConfigError> {
        if self.static_token().is_some() {
            return Ok(());
        }
        let fields = [
            ("ClientId", &self.client_id),
            ("ClientSecret", &self.client_secret),
            ("TenantId", &self.tenant_id),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "subscription {subscription_id} is missing {name}: add it, or an AccessToken, \
                     to its AzureConfigs entry"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SubscriptionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Contents of the subscriptions file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SubscriptionsFile {
    /// Credentials keyed by subscription id.
    #[serde(rename = "AzureConfigs", default)]
    pub subscriptions: BTreeMap<String, SubscriptionCredentials>,
}

impl SubscriptionsFile {
    /// Parses and validates the JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid JSON and the errors of
    /// [`SubscriptionsFile::validate`].
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let file: Self =
            serde_json::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    /// Reads, parses and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, plus the
    /// errors of [`SubscriptionsFile::from_json`].
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = read_file(path)?;
        Self::from_json(&contents)
    }

    /// Ensures at least one subscription is configured and each has usable
    /// credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoSubscriptions`] for an empty mapping and
    /// [`ConfigError::MissingField`] for incomplete entries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriptions.is_empty() {
            return Err(ConfigError::NoSubscriptions);
        }
        for (subscription_id, credentials) in &self.subscriptions {
            if subscription_id.trim().is_empty() {
                return Err(ConfigError::MissingField(String::from(
                    "AzureConfigs contains an entry with a blank subscription id",
                )));
            }
            credentials.validate(subscription_id)?;
        }
        Ok(())
    }
}

fn read_file(path: &Utf8Path) -> Result<String, ConfigError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| ConfigError::Io {
        path: path.to_path_buf(),
        message: String::from("subscriptions file path is missing a filename"),
    })?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| ConfigError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;

    dir.read_to_string(file_name)
        .map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader or the JSON parser.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when the subscriptions file lists no subscriptions.
    #[error("no subscriptions configured: add entries under AzureConfigs")]
    NoSubscriptions,
    /// Raised when the subscriptions file cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
