//! Parsing of Azure Resource Manager resource identifiers.
//!
//! Virtual machine ids follow the provider path convention
//! `/subscriptions/<sub>/resourceGroups/<group>/providers/Microsoft.Compute/virtualMachines/<name>`.
//! After dropping empty segments, segment 3 is the resource group and segment
//! 7 is the resource name. Anything shorter is rejected rather than defaulted.

use std::fmt;

use thiserror::Error;

const MIN_SEGMENTS: usize = 8;
const SUBSCRIPTION_SEGMENT: usize = 1;
const RESOURCE_GROUP_SEGMENT: usize = 3;
const NAME_SEGMENT: usize = 7;

/// Marker contained in the id of every Azure virtual machine.
pub const VIRTUAL_MACHINE_PROVIDER: &str = "providers/Microsoft.Compute/virtualMachines";

/// Errors raised while deriving names from a resource id.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResourceIdError {
    /// Raised when the id does not contain enough path segments.
    #[error("malformed resource id '{resource_id}': expected at least 8 path segments, found {segments}")]
    Malformed {
        /// Resource id as received from the provider.
        resource_id: String,
        /// Number of non-empty path segments found.
        segments: usize,
    },
}

/// Components extracted from a resource id.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ResourceId {
    raw: String,
    subscription_id: String,
    resource_group: String,
    name: String,
}

impl ResourceId {
    /// Parses `raw` into its subscription, resource group and name.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceIdError::Malformed`] when fewer than eight non-empty
    /// path segments are present.
    pub fn parse(raw: &str) -> Result<Self, ResourceIdError> {
        let segments: Vec<&str> = raw.split('/').filter(|part| !part.is_empty()).collect();
        let malformed = || ResourceIdError::Malformed {
            resource_id: raw.to_owned(),
            segments: segments.len(),
        };
        if segments.len() < MIN_SEGMENTS {
            return Err(malformed());
        }

        let subscription_id = segments.get(SUBSCRIPTION_SEGMENT).ok_or_else(malformed)?;
        let resource_group = segments.get(RESOURCE_GROUP_SEGMENT).ok_or_else(malformed)?;
        let name = segments.get(NAME_SEGMENT).ok_or_else(malformed)?;

        Ok(Self {
            raw: raw.to_owned(),
            subscription_id: (*subscription_id).to_owned(),
            resource_group: (*resource_group).to_owned(),
            name: (*name).to_owned(),
        })
    }

    /// Returns the id exactly as it was parsed.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Subscription segment of the id.
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Resource group segment of the id.
    #[must_use]
    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    /// Resource name segment of the id.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` when the id points at a virtual machine.
    #[must_use]
    pub fn is_virtual_machine(&self) -> bool {
        self.raw
            .to_ascii_lowercase()
            .contains(&VIRTUAL_MACHINE_PROVIDER.to_ascii_lowercase())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
