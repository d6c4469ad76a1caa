//! Core library for the `azpower` virtual machine power monitor.
//!
//! The crate polls Azure Resource Manager for the power state of every
//! virtual machine in the configured subscriptions, caches the result in a
//! [`StateStore`], and notifies observers on every update. A reconciliation
//! tick runs on an [`AdaptiveScheduler`] that polls slowly while machines are
//! stable and quickly while any of them is starting or stopping. Start/stop
//! commands go through a [`CommandDispatcher`], which marks the machine as
//! changing before the provider confirms and asks for a prompt follow-up
//! tick.

pub mod azure;
pub mod compute;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod logging;
pub mod monitor;
pub mod process;
pub mod reconciler;
pub mod resource_id;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod test_support;

pub use azure::{AzCliLogin, AzureComputeClient};
pub use compute::{ComputeClient, ComputeError, Credential, InstanceStatus, VmDescriptor};
pub use config::{ConfigError, MonitorConfig, SubscriptionCredentials, SubscriptionsFile};
pub use credentials::{CredentialCache, CredentialError, LoginProvider};
pub use dispatcher::{CommandDispatcher, CommandError, CommandOutcome, DispatcherSettings};
pub use monitor::{Monitor, MonitorError};
pub use process::{CommandOutput, CommandRunner, ProcessCommandRunner, ProcessError};
pub use reconciler::{Reconciler, ReconcilerSettings, TickReport};
pub use resource_id::{ResourceId, ResourceIdError};
pub use scheduler::{AdaptiveScheduler, Reschedule, SchedulerError};
pub use state::{PowerState, VmState};
pub use store::{ObserverId, StateObserver, StateStore, Transition};
