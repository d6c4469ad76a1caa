//! Abstraction over the cloud provider's compute API.
//!
//! The monitor only needs four capabilities: list the machines of a
//! subscription, read a machine's instance statuses, and start or stop a
//! machine. [`crate::azure::AzureComputeClient`] implements them against the
//! Azure Resource Manager API; tests use scripted doubles.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::resource_id::ResourceIdError;
use crate::state::PowerState;

/// Future returned by compute client operations.
pub type ComputeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ComputeError>> + Send + 'a>>;

/// Opaque bearer credential for one subscription.
#[derive(Clone, Eq, PartialEq)]
pub struct Credential {
    token: String,
    expires_at: Option<SystemTime>,
}

impl Credential {
    /// Wraps a bearer token with an optional expiry instant.
    #[must_use]
    pub fn new(token: impl Into<String>, expires_at: Option<SystemTime>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Raw bearer token for the `Authorization` header.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Instant after which the provider rejects the token, when known.
    #[must_use]
    pub const fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Returns `true` when the token expires within `margin` of `now`.
    #[must_use]
    pub fn expires_within(&self, now: SystemTime, margin: Duration) -> bool {
        self.expires_at
            .is_some_and(|expiry| expiry <= now.checked_add(margin).unwrap_or(now))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Machine entry returned by a subscription listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmDescriptor {
    /// Provider resource id.
    pub id: String,
    /// Display name reported by the provider.
    pub name: String,
}

/// One status entry of a machine's instance view.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceStatus {
    /// Status code such as `PowerState/running`.
    pub code: String,
}

/// Errors raised by compute clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ComputeError {
    /// The provider rejected the credential.
    #[error("provider rejected credentials for {target} (HTTP {status})")]
    Unauthorized {
        /// Subscription or resource the call targeted.
        target: String,
        /// HTTP status returned by the provider.
        status: u16,
    },
    /// The provider answered with an unexpected status.
    #[error("provider returned HTTP {status} for {target}: {message}")]
    Http {
        /// Subscription or resource the call targeted.
        target: String,
        /// HTTP status returned by the provider.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },
    /// The request never produced a response.
    #[error("transport error contacting provider: {message}")]
    Transport {
        /// Underlying client error.
        message: String,
    },
    /// The call exceeded the configured deadline.
    #[error("timed out during {operation} for {target}")]
    Timeout {
        /// Operation that was in flight.
        operation: String,
        /// Subscription or resource the call targeted.
        target: String,
    },
    /// The response body could not be decoded.
    #[error("failed to decode provider response for {target}: {message}")]
    Decode {
        /// Subscription or resource the call targeted.
        target: String,
        /// Decoder error message.
        message: String,
    },
    /// The machine id could not be split into resource group and name.
    #[error(transparent)]
    MalformedResourceId(#[from] ResourceIdError),
}

impl From<reqwest::Error> for ComputeError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}

/// Minimal interface implemented by cloud compute clients.
pub trait ComputeClient: Send + Sync {
    /// Lists every machine visible in `subscription_id`.
    fn list<'a>(
        &'a self,
        subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, Vec<VmDescriptor>>;

    /// Fetches the instance view statuses of `vm_id`.
    fn instance_statuses<'a>(
        &'a self,
        vm_id: &'a str,
        subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, Vec<InstanceStatus>>;

    /// Requests that `vm_id` be started. Returns once the request is accepted.
    fn start<'a>(
        &'a self,
        vm_id: &'a str,
        subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, ()>;

    /// Requests that `vm_id` be stopped and deallocated. Returns once the
    /// request is accepted.
    fn stop<'a>(
        &'a self,
        vm_id: &'a str,
        subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, ()>;

    /// Resolves the power state of `vm_id` from its instance view.
    fn power_state<'a>(
        &'a self,
        vm_id: &'a str,
        subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, PowerState> {
        Box::pin(async move {
            let statuses = self
                .instance_statuses(vm_id, subscription_id, credential)
                .await?;
            Ok(PowerState::from_status_codes(
                statuses.iter().map(|status| status.code.as_str()),
            ))
        })
    }
}
