//! Token acquisition through the Azure CLI.
//!
//! The service-principal login itself is left to `az`; this provider only
//! runs `az login --service-principal` followed by
//! `az account get-access-token` and reads the token from the JSON output.
//!
//! Every subscription gets its own `AZURE_CONFIG_DIR` below the configured
//! root, so the operator's own `az` profile is never touched and principals
//! never overwrite each other. `az login` only accepts the client secret as
//! an argument, so it is visible in the process table for the duration of
//! that call; use an `AccessToken` entry instead on shared hosts.

use std::ffi::OsString;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;

use crate::compute::Credential;
use crate::config::SubscriptionCredentials;
use crate::credentials::{CredentialError, LoginFuture, LoginProvider};
use crate::process::{CommandOutput, CommandRunner};

/// Environment variable `az` reads its profile directory from.
pub const AZURE_CONFIG_DIR: &str = "AZURE_CONFIG_DIR";

#[derive(Debug, Deserialize)]
struct AccessTokenOutput {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(default)]
    expires_on: Option<u64>,
}

/// Logs in with the Azure CLI for each subscription.
#[derive(Clone, Debug)]
pub struct AzCliLogin<R> {
    runner: R,
    az_bin: String,
    config_root: Utf8PathBuf,
}

impl<R: CommandRunner + Clone + 'static> AzCliLogin<R> {
    /// Creates a provider that invokes `az_bin` through `runner`, keeping one
    /// `az` profile per subscription below `config_root`.
    #[must_use]
    pub fn new(runner: R, az_bin: impl Into<String>, config_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            runner,
            az_bin: az_bin.into(),
            config_root: config_root.into(),
        }
    }

    /// Profile directory used for `subscription_id`.
    #[must_use]
    pub fn config_dir(&self, subscription_id: &str) -> Utf8PathBuf {
        self.config_root.join(subscription_id)
    }

    fn login_blocking(
        &self,
        subscription_id: &str,
        settings: &SubscriptionCredentials,
    ) -> Result<Credential, CredentialError> {
        let failure = |message: String| CredentialError::Login {
            subscription_id: subscription_id.to_owned(),
            message,
        };

        let config_dir = self.config_dir(subscription_id);
        create_profile_dir(&config_dir).map_err(failure)?;
        let env = [(AZURE_CONFIG_DIR, OsString::from(config_dir.as_str()))];

        let login_args: Vec<OsString> = [
            "login",
            "--service-principal",
            "--username",
            settings.client_id.as_str(),
            "--password",
            settings.client_secret.as_str(),
            "--tenant",
            settings.tenant_id.as_str(),
            "--allow-no-subscriptions",
            "--output",
            "none",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        let login = self
            .runner
            .run(&self.az_bin, &login_args, &env)
            .map_err(|err| failure(err.to_string()))?;
        ensure_success("az login", &login).map_err(failure)?;

        let token_args: Vec<OsString> = [
            "account",
            "get-access-token",
            "--subscription",
            subscription_id,
            "--output",
            "json",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        let token = self
            .runner
            .run(&self.az_bin, &token_args, &env)
            .map_err(|err| failure(err.to_string()))?;
        ensure_success("az account get-access-token", &token).map_err(failure)?;

        let parsed: AccessTokenOutput = serde_json::from_str(&token.stdout)
            .map_err(|err| failure(format!("unexpected token output: {err}")))?;
        if parsed.access_token.trim().is_empty() {
            return Err(failure(String::from("az returned an empty access token")));
        }
        let expires_at = parsed
            .expires_on
            .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
        Ok(Credential::new(parsed.access_token, expires_at))
    }
}

fn create_profile_dir(path: &Utf8Path) -> Result<(), String> {
    Dir::create_ambient_dir_all(path, ambient_authority())
        .map_err(|err| format!("failed to create az profile directory {path}: {err}"))
}

fn ensure_success(step: &str, output: &CommandOutput) -> Result<(), String> {
    if output.is_success() {
        return Ok(());
    }
    Err(format!(
        "{step} exited with status {}: {}",
        output.status_text(),
        output.stderr.trim()
    ))
}

impl<R: CommandRunner + Clone + 'static> LoginProvider for AzCliLogin<R> {
    fn login<'a>(
        &'a self,
        subscription_id: &'a str,
        settings: &'a SubscriptionCredentials,
    ) -> LoginFuture<'a> {
        let provider = self.clone();
        let subscription = subscription_id.to_owned();
        let principal = settings.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || provider.login_blocking(&subscription, &principal))
                .await
                .map_err(|err| CredentialError::Login {
                    subscription_id: subscription_id.to_owned(),
                    message: format!("login task failed: {err}"),
                })?
        })
    }
}
