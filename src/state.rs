//! Virtual machine power states and the snapshots cached by the monitor.

use std::fmt;

use crate::resource_id::ResourceId;

const POWER_STATE_PREFIX: &str = "PowerState/";

/// Lifecycle stage of a virtual machine as understood by the monitor.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum PowerState {
    /// The state could not be resolved from the provider.
    #[default]
    NotFound,
    /// The machine is deallocated.
    Off,
    /// The machine is running.
    On,
    /// The machine is between stable states (starting, stopping, ...).
    Changing,
}

impl PowerState {
    /// Derives a power state from the status codes of an instance view.
    ///
    /// The first code carrying the `PowerState/` prefix decides the result:
    /// `running` maps to [`PowerState::On`], `deallocated` to
    /// [`PowerState::Off`] and anything else to [`PowerState::Changing`]. When
    /// no such code exists the state is [`PowerState::NotFound`].
    #[must_use]
    pub fn from_status_codes<'a, I>(codes: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let Some(status) = codes.into_iter().find_map(strip_power_prefix) else {
            return Self::NotFound;
        };

        if status.eq_ignore_ascii_case("running") {
            Self::On
        } else if status.eq_ignore_ascii_case("deallocated") {
            Self::Off
        } else {
            Self::Changing
        }
    }

    /// Short human readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::NotFound => "Not Found",
            Self::Off => "Off",
            Self::On => "On",
            Self::Changing => "Changing",
        }
    }

    /// Returns `true` while the machine is transitioning.
    #[must_use]
    pub const fn is_changing(self) -> bool {
        matches!(self, Self::Changing)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn strip_power_prefix(code: &str) -> Option<&str> {
    let prefix = code.get(..POWER_STATE_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(POWER_STATE_PREFIX) {
        return None;
    }
    code.get(POWER_STATE_PREFIX.len()..)
}

/// Immutable snapshot of one virtual machine.
///
/// Snapshots are replaced whole in the [`crate::store::StateStore`]; fields
/// are never patched in place.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct VmState {
    /// Provider resource id; the primary key.
    pub resource_id: String,
    /// Display name of the machine.
    pub vm_name: String,
    /// Subscription the machine was discovered through.
    pub subscription_id: String,
    /// Resource group derived from the resource id.
    pub resource_group_name: String,
    /// Last known power state.
    pub power_state: PowerState,
}

impl VmState {
    /// Builds a snapshot whose names are derived from `resource_id`.
    #[must_use]
    pub fn new(
        resource_id: &ResourceId,
        subscription_id: impl Into<String>,
        power_state: PowerState,
    ) -> Self {
        Self {
            resource_id: resource_id.as_str().to_owned(),
            vm_name: resource_id.name().to_owned(),
            subscription_id: subscription_id.into(),
            resource_group_name: resource_id.resource_group().to_owned(),
            power_state,
        }
    }

    /// Returns a copy of this snapshot carrying `power_state`.
    #[must_use]
    pub fn with_power_state(&self, power_state: PowerState) -> Self {
        Self {
            power_state,
            ..self.clone()
        }
    }
}
