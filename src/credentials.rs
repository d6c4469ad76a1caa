//! Per-subscription bearer credentials.
//!
//! [`CredentialCache`] owns the configured subscriptions and resolves each to
//! a [`Credential`]. Logins happen lazily through a [`LoginProvider`] and are
//! repeated once a cached token is about to expire. Each subscription has its
//! own slot, and every login is bounded by a timeout, so a stalled login only
//! holds up callers of that subscription.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::compute::Credential;
use crate::config::SubscriptionCredentials;

/// Tokens expiring within this margin are refreshed before use.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Upper bound on a single login unless overridden.
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors raised while resolving credentials.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// The subscription has no entry in the configuration.
    #[error("subscription {subscription_id} is not configured")]
    NotConfigured {
        /// Subscription that was requested.
        subscription_id: String,
    },
    /// Obtaining a token failed.
    #[error("login failed for subscription {subscription_id}: {message}")]
    Login {
        /// Subscription whose login failed.
        subscription_id: String,
        /// Description of the failure.
        message: String,
    },
}

/// Future returned by login providers.
pub type LoginFuture<'a> = Pin<Box<dyn Future<Output = Result<Credential, CredentialError>> + Send + 'a>>;

/// Obtains bearer tokens for service principals.
pub trait LoginProvider: Send + Sync {
    /// Logs in with `settings` and returns a token usable for
    /// `subscription_id`.
    fn login<'a>(
        &'a self,
        subscription_id: &'a str,
        settings: &'a SubscriptionCredentials,
    ) -> LoginFuture<'a>;
}

/// Resolves subscriptions to cached, refreshed credentials.
pub struct CredentialCache {
    configured: BTreeMap<String, SubscriptionCredentials>,
    provider: Arc<dyn LoginProvider>,
    slots: BTreeMap<String, Mutex<Option<Credential>>>,
    login_timeout: Duration,
}

impl CredentialCache {
    /// Creates a cache over the configured subscriptions.
    #[must_use]
    pub fn new(
        configured: BTreeMap<String, SubscriptionCredentials>,
        provider: Arc<dyn LoginProvider>,
    ) -> Self {
        let slots = configured
            .keys()
            .map(|subscription_id| (subscription_id.clone(), Mutex::new(None)))
            .collect();
        Self {
            configured,
            provider,
            slots,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
        }
    }

    /// Bounds every login by `login_timeout`.
    #[must_use]
    pub const fn with_login_timeout(mut self, login_timeout: Duration) -> Self {
        self.login_timeout = login_timeout;
        self
    }

    /// Configured subscription ids in a stable order.
    pub fn subscription_ids(&self) -> impl Iterator<Item = &str> {
        self.configured.keys().map(String::as_str)
    }

    /// Returns `true` when `subscription_id` has configured credentials.
    #[must_use]
    pub fn is_configured(&self, subscription_id: &str) -> bool {
        self.configured.contains_key(subscription_id)
    }

    /// Returns a usable credential for `subscription_id`, logging in when no
    /// token is cached or the cached one is about to expire.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NotConfigured`] for unknown subscriptions
    /// and [`CredentialError::Login`] when the provider fails or does not
    /// answer within the login timeout.
    pub async fn resolve(&self, subscription_id: &str) -> Result<Credential, CredentialError> {
        let not_configured = || CredentialError::NotConfigured {
            subscription_id: subscription_id.to_owned(),
        };
        let settings = self.configured.get(subscription_id).ok_or_else(not_configured)?;

        if let Some(token) = settings.static_token() {
            return Ok(Credential::new(token, None));
        }

        let slot = self.slots.get(subscription_id).ok_or_else(not_configured)?;
        let mut cached = slot.lock().await;
        if let Some(credential) = cached.as_ref()
            && !credential.expires_within(SystemTime::now(), REFRESH_MARGIN)
        {
            return Ok(credential.clone());
        }

        debug!(subscription_id, "logging in");
        let login = self.provider.login(subscription_id, settings);
        let credential = tokio::time::timeout(self.login_timeout, login)
            .await
            .map_err(|_| {
                warn!(subscription_id, timeout = ?self.login_timeout, "login timed out");
                CredentialError::Login {
                    subscription_id: subscription_id.to_owned(),
                    message: format!("login timed out after {}s", self.login_timeout.as_secs()),
                }
            })??;
        info!(subscription_id, "obtained access token");
        *cached = Some(credential.clone());
        Ok(credential)
    }

    /// Drops the cached token so the next [`CredentialCache::resolve`] logs in
    /// again. Used after the provider rejects a token.
    pub async fn invalidate(&self, subscription_id: &str) {
        if let Some(slot) = self.slots.get(subscription_id) {
            *slot.lock().await = None;
        }
    }
}
