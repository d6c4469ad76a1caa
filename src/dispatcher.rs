//! User-initiated start/stop commands.
//!
//! A command toggles a machine: running machines are stopped, deallocated
//! machines are started. The cached state is moved to
//! [`PowerState::Changing`] before the provider call so observers see the
//! transition immediately, and a short reschedule lets the next tick confirm
//! the real outcome. The cache is eventually consistent; the provider stays
//! the source of truth.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::compute::{ComputeClient, ComputeError};
use crate::credentials::{CredentialCache, CredentialError};
use crate::reconciler::bounded;
use crate::scheduler::Reschedule;
use crate::state::{PowerState, VmState};
use crate::store::{StateStore, Transition};

/// Result of a command that did not fail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandOutcome {
    /// A stop was requested; carries the optimistic record.
    Stopping(VmState),
    /// A start was requested; carries the optimistic record.
    Starting(VmState),
    /// The machine is already transitioning; nothing was sent.
    AlreadyChanging(VmState),
    /// The machine's state could not be resolved; nothing was sent.
    Unresolved(VmState),
}

impl CommandOutcome {
    /// Record the outcome refers to.
    #[must_use]
    pub const fn state(&self) -> &VmState {
        match self {
            Self::Stopping(state)
            | Self::Starting(state)
            | Self::AlreadyChanging(state)
            | Self::Unresolved(state) => state,
        }
    }

    /// Returns `true` when a provider call was issued.
    #[must_use]
    pub const fn issued_request(&self) -> bool {
        matches!(self, Self::Stopping(_) | Self::Starting(_))
    }
}

/// Errors surfaced to the caller of [`CommandDispatcher::run_command`].
#[derive(Debug, Error)]
pub enum CommandError {
    /// The resource id is not in the state store.
    #[error("virtual machine {resource_id} is not known")]
    UnknownVm {
        /// Requested resource id.
        resource_id: String,
    },
    /// The machine's subscription has no usable credentials.
    #[error("cannot act on {resource_id}: {source}")]
    Configuration {
        /// Requested resource id.
        resource_id: String,
        /// Credential failure.
        #[source]
        source: CredentialError,
    },
    /// The provider refused or failed the request.
    #[error("provider rejected command for {resource_id}: {source}")]
    Provider {
        /// Requested resource id.
        resource_id: String,
        /// Provider failure.
        #[source]
        source: ComputeError,
    },
}

/// Timing used by the dispatcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DispatcherSettings {
    /// Delay before the confirming reconciliation.
    pub command_delay: Duration,
    /// Upper bound on the provider call.
    pub call_timeout: Duration,
}

/// Applies start/stop commands to cached machines.
pub struct CommandDispatcher<C: ComputeClient> {
    compute: Arc<C>,
    credentials: Arc<CredentialCache>,
    store: Arc<StateStore>,
    rescheduler: Arc<dyn Reschedule>,
    settings: DispatcherSettings,
}

impl<C: ComputeClient> CommandDispatcher<C> {
    /// Builds a dispatcher over shared collaborators.
    #[must_use]
    pub fn new(
        compute: Arc<C>,
        credentials: Arc<CredentialCache>,
        store: Arc<StateStore>,
        rescheduler: Arc<dyn Reschedule>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            compute,
            credentials,
            store,
            rescheduler,
            settings,
        }
    }

    /// Toggles the machine identified by `resource_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnknownVm`] for ids absent from the store and
    /// [`CommandError::Configuration`] when no credential is available; no
    /// provider call is made in either case. Returns
    /// [`CommandError::Provider`] when the provider call fails, after the
    /// confirming reconciliation has been requested.
    pub async fn run_command(&self, resource_id: &str) -> Result<CommandOutcome, CommandError> {
        let Some(cached) = self.store.get(resource_id) else {
            warn!(resource_id, "command for unknown machine");
            return Err(CommandError::UnknownVm {
                resource_id: resource_id.to_owned(),
            });
        };
        if let Some(outcome) = Self::without_request(cached.clone()) {
            return Ok(outcome);
        }

        let credential = self
            .credentials
            .resolve(&cached.subscription_id)
            .await
            .map_err(|source| {
                warn!(resource_id, error = %source, "command rejected: no credentials");
                CommandError::Configuration {
                    resource_id: resource_id.to_owned(),
                    source,
                }
            })?;

        let (previous, current) = match self.store.transition(
            resource_id,
            PowerState::Changing,
            |state| matches!(state, PowerState::On | PowerState::Off),
        ) {
            Transition::Applied { previous, current } => (previous, current),
            Transition::Rejected(state) => {
                return Ok(Self::without_request(state.clone())
                    .unwrap_or(CommandOutcome::AlreadyChanging(state)));
            }
            Transition::Missing => {
                return Err(CommandError::UnknownVm {
                    resource_id: resource_id.to_owned(),
                });
            }
        };

        let subscription_id = current.subscription_id.as_str();
        let (operation, call, outcome) = if previous.power_state == PowerState::On {
            (
                "stop",
                self.compute.stop(resource_id, subscription_id, &credential),
                CommandOutcome::Stopping(current.clone()),
            )
        } else {
            (
                "start",
                self.compute.start(resource_id, subscription_id, &credential),
                CommandOutcome::Starting(current.clone()),
            )
        };
        info!(resource_id, vm_name = %current.vm_name, operation, "issuing power command");

        let result = bounded(self.settings.call_timeout, operation, resource_id, call).await;
        self.rescheduler.reschedule(self.settings.command_delay);

        match result {
            Ok(()) => Ok(outcome),
            Err(source) => {
                warn!(resource_id, operation, error = %source, "power command failed");
                if matches!(source, ComputeError::Unauthorized { .. }) {
                    self.credentials.invalidate(subscription_id).await;
                }
                Err(CommandError::Provider {
                    resource_id: resource_id.to_owned(),
                    source,
                })
            }
        }
    }

    fn without_request(state: VmState) -> Option<CommandOutcome> {
        match state.power_state {
            PowerState::Changing => {
                info!(resource_id = %state.resource_id, "machine already changing; command ignored");
                Some(CommandOutcome::AlreadyChanging(state))
            }
            PowerState::NotFound => {
                warn!(resource_id = %state.resource_id, "machine state unresolved; command ignored");
                Some(CommandOutcome::Unresolved(state))
            }
            PowerState::On | PowerState::Off => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::resource_id::ResourceId;
    use crate::test_support::{
        ComputeCall, RecordingRescheduler, ScriptedCompute, StaticLogin, principal, vm_id,
    };
    use rstest::{fixture, rstest};

    const DELAY: Duration = Duration::from_secs(2);

    struct Harness {
        compute: Arc<ScriptedCompute>,
        store: Arc<StateStore>,
        rescheduler: Arc<RecordingRescheduler>,
        dispatcher: CommandDispatcher<ScriptedCompute>,
    }

    #[fixture]
    fn harness() -> Harness {
        let compute = Arc::new(ScriptedCompute::new());
        let configured = BTreeMap::from([(String::from("S"), principal())]);
        let credentials = Arc::new(CredentialCache::new(
            configured,
            Arc::new(StaticLogin::new("token")),
        ));
        let store = Arc::new(StateStore::new());
        let rescheduler = Arc::new(RecordingRescheduler::default());
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&compute),
            credentials,
            Arc::clone(&store),
            rescheduler.clone(),
            DispatcherSettings {
                command_delay: DELAY,
                call_timeout: Duration::from_secs(30),
            },
        );
        Harness {
            compute,
            store,
            rescheduler,
            dispatcher,
        }
    }

    fn seed(store: &StateStore, subscription_id: &str, power_state: PowerState) -> String {
        let id = vm_id(subscription_id, "rg", "web");
        let parsed = ResourceId::parse(&id).expect("valid id");
        store.upsert(VmState::new(&parsed, subscription_id, power_state));
        id
    }

    #[rstest]
    #[case::running_is_stopped(PowerState::On, vec![ComputeCall::Stop(vm_id("S", "rg", "web"))])]
    #[case::deallocated_is_started(PowerState::Off, vec![ComputeCall::Start(vm_id("S", "rg", "web"))])]
    #[tokio::test]
    async fn stable_machines_toggle_and_accelerate(
        harness: Harness,
        #[case] initial: PowerState,
        #[case] expected_calls: Vec<ComputeCall>,
    ) {
        let id = seed(&harness.store, "S", initial);

        let outcome = harness.dispatcher.run_command(&id).await.expect("command");

        assert!(outcome.issued_request());
        assert_eq!(outcome.state().power_state, PowerState::Changing);
        assert_eq!(
            harness.store.get(&id).map(|state| state.power_state),
            Some(PowerState::Changing)
        );
        assert_eq!(harness.compute.calls(), expected_calls);
        assert_eq!(harness.rescheduler.delays(), vec![DELAY]);
    }

    #[rstest]
    #[case::changing(PowerState::Changing)]
    #[case::not_found(PowerState::NotFound)]
    #[tokio::test]
    async fn unstable_machines_are_left_alone(harness: Harness, #[case] initial: PowerState) {
        let id = seed(&harness.store, "S", initial);

        let outcome = harness.dispatcher.run_command(&id).await.expect("no-op");

        assert!(!outcome.issued_request());
        assert_eq!(outcome.state().power_state, initial);
        assert!(harness.compute.calls().is_empty());
        assert!(harness.rescheduler.delays().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_machine_is_reported(harness: Harness) {
        let err = harness
            .dispatcher
            .run_command(&vm_id("S", "rg", "ghost"))
            .await
            .expect_err("unknown vm");

        assert!(matches!(err, CommandError::UnknownVm { .. }));
        assert!(harness.compute.calls().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn unconfigured_subscription_is_a_configuration_error(harness: Harness) {
        let id = seed(&harness.store, "other", PowerState::On);

        let err = harness.dispatcher.run_command(&id).await.expect_err("no credentials");

        assert!(matches!(
            err,
            CommandError::Configuration {
                source: CredentialError::NotConfigured { .. },
                ..
            }
        ));
        assert!(harness.compute.calls().is_empty());
        assert_eq!(
            harness.store.get(&id).map(|state| state.power_state),
            Some(PowerState::On)
        );
    }

    #[rstest]
    #[tokio::test]
    async fn provider_failure_still_requests_confirmation(harness: Harness) {
        let id = seed(&harness.store, "S", PowerState::Off);
        harness.compute.fail_commands(ComputeError::Http {
            target: id.clone(),
            status: 409,
            message: String::from("conflict"),
        });

        let err = harness.dispatcher.run_command(&id).await.expect_err("rejected");

        assert!(matches!(err, CommandError::Provider { .. }));
        assert_eq!(harness.rescheduler.delays(), vec![DELAY]);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn concurrent_commands_issue_one_request(harness: Harness) {
        let id = seed(&harness.store, "S", PowerState::On);
        harness.compute.set_latency(Duration::from_secs(1));

        let (first, second) = tokio::join!(
            harness.dispatcher.run_command(&id),
            harness.dispatcher.run_command(&id)
        );

        let outcomes = [first.expect("first"), second.expect("second")];
        assert_eq!(
            outcomes.iter().filter(|outcome| outcome.issued_request()).count(),
            1
        );
        assert_eq!(harness.compute.stops(), vec![id]);
    }
}
