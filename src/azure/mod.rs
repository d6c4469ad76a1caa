//! Azure Resource Manager implementation of [`ComputeClient`].
//!
//! Only four endpoints are used: the subscription-wide machine listing, the
//! per-machine instance view, and the `start`/`deallocate` actions. Actions
//! return as soon as the provider accepts them; the long-running operation is
//! observed by later reconciliation ticks.

mod login;

pub use login::AzCliLogin;

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::compute::{
    ComputeClient, ComputeError, ComputeFuture, Credential, InstanceStatus, VmDescriptor,
};

/// API version sent with every Resource Manager request.
pub const API_VERSION: &str = "2024-07-01";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_LIST_PAGES: usize = 100;

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Debug, Deserialize)]
struct VmListPage {
    #[serde(default)]
    value: Vec<VmListEntry>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmListEntry {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct InstanceView {
    #[serde(default)]
    statuses: Vec<InstanceViewStatus>,
}

#[derive(Debug, Deserialize)]
struct InstanceViewStatus {
    #[serde(default)]
    code: Option<String>,
}

/// Talks to the Resource Manager REST API.
#[derive(Clone, Debug)]
pub struct AzureComputeClient {
    endpoint: String,
}

impl AzureComputeClient {
    /// Creates a client rooted at `endpoint`, usually
    /// [`crate::config::DEFAULT_MANAGEMENT_ENDPOINT`].
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        let root: String = endpoint.into();
        Self {
            endpoint: root.trim_end_matches('/').to_owned(),
        }
    }

    fn list_url(&self, subscription_id: &str) -> String {
        format!(
            "{}/subscriptions/{subscription_id}/providers/Microsoft.Compute/virtualMachines?api-version={API_VERSION}",
            self.endpoint
        )
    }

    fn vm_url(&self, vm_id: &str, suffix: &str) -> String {
        format!(
            "{}/{}/{suffix}?api-version={API_VERSION}",
            self.endpoint,
            vm_id.trim_matches('/')
        )
    }

    async fn send(
        request: reqwest::RequestBuilder,
        credential: &Credential,
        target: &str,
    ) -> Result<Vec<u8>, ComputeError> {
        let response = request.bearer_auth(credential.token()).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            return Ok(body.to_vec());
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(ComputeError::Unauthorized {
                target: target.to_owned(),
                status: status.as_u16(),
            });
        }
        Err(ComputeError::Http {
            target: target.to_owned(),
            status: status.as_u16(),
            message: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    fn decode<'de, T: Deserialize<'de>>(body: &'de [u8], target: &str) -> Result<T, ComputeError> {
        serde_json::from_slice(body).map_err(|err| ComputeError::Decode {
            target: target.to_owned(),
            message: err.to_string(),
        })
    }

    async fn action(
        &self,
        vm_id: &str,
        action: &str,
        credential: &Credential,
    ) -> Result<(), ComputeError> {
        let url = self.vm_url(vm_id, action);
        debug!(vm_id, action, "posting power action");
        Self::send(HTTP_CLIENT.post(&url), credential, vm_id).await?;
        Ok(())
    }
}

impl ComputeClient for AzureComputeClient {
    fn list<'a>(
        &'a self,
        subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, Vec<VmDescriptor>> {
        Box::pin(async move {
            let mut vms = Vec::new();
            let mut next = Some(self.list_url(subscription_id));
            let mut pages = 0;
            while let Some(url) = next {
                pages += 1;
                if pages > MAX_LIST_PAGES {
                    return Err(ComputeError::Decode {
                        target: subscription_id.to_owned(),
                        message: format!("listing exceeded {MAX_LIST_PAGES} pages"),
                    });
                }
                let body = Self::send(HTTP_CLIENT.get(&url), credential, subscription_id).await?;
                let page: VmListPage = Self::decode(&body, subscription_id)?;
                vms.extend(page.value.into_iter().map(|entry| VmDescriptor {
                    id: entry.id,
                    name: entry.name,
                }));
                next = page.next_link.filter(|link| !link.is_empty());
            }
            debug!(subscription_id, count = vms.len(), pages, "listed machines");
            Ok(vms)
        })
    }

    fn instance_statuses<'a>(
        &'a self,
        vm_id: &'a str,
        _subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, Vec<InstanceStatus>> {
        Box::pin(async move {
            let url = self.vm_url(vm_id, "instanceView");
            let body = Self::send(HTTP_CLIENT.get(&url), credential, vm_id).await?;
            let view: InstanceView = Self::decode(&body, vm_id)?;
            Ok(view
                .statuses
                .into_iter()
                .filter_map(|status| status.code)
                .map(|code| InstanceStatus { code })
                .collect())
        })
    }

    fn start<'a>(
        &'a self,
        vm_id: &'a str,
        _subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, ()> {
        Box::pin(self.action(vm_id, "start", credential))
    }

    fn stop<'a>(
        &'a self,
        vm_id: &'a str,
        _subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, ()> {
        Box::pin(self.action(vm_id, "deallocate", credential))
    }
}
