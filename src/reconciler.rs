//! Converges the state store with the provider on every tick.
//!
//! A tick walks every configured subscription in turn, lists its machines,
//! resolves each machine's power state and upserts the result. Failures are
//! isolated: a subscription that cannot be listed, or a machine whose id or
//! instance view is unusable, is logged and skipped while the rest of the
//! tick carries on. When any machine is still transitioning the tick asks the
//! scheduler for a fast follow-up.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compute::{ComputeClient, ComputeError, Credential, VmDescriptor};
use crate::credentials::{CredentialCache, CredentialError};
use crate::resource_id::ResourceId;
use crate::scheduler::Reschedule;
use crate::state::{PowerState, VmState};
use crate::store::StateStore;

/// Wraps a provider call in `timeout`, mapping expiry to
/// [`ComputeError::Timeout`].
pub(crate) async fn bounded<T>(
    timeout: Duration,
    operation: &str,
    target: &str,
    call: impl Future<Output = Result<T, ComputeError>>,
) -> Result<T, ComputeError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| {
            Err(ComputeError::Timeout {
                operation: operation.to_owned(),
                target: target.to_owned(),
            })
        })
}

/// Timing used by the reconciler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReconcilerSettings {
    /// Delay requested from the scheduler while a machine is changing.
    pub fast_interval: Duration,
    /// Upper bound on each provider call.
    pub call_timeout: Duration,
}

/// Summary of one reconciliation tick.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TickReport {
    /// Number of machines written to the store.
    pub upserted: usize,
    /// Number of machines that resolved to [`PowerState::Changing`].
    pub changing: usize,
    /// Stored machines re-marked [`PowerState::NotFound`] because their
    /// subscription no longer lists them.
    pub marked_missing: usize,
    /// Machine ids skipped because the id or instance view was unusable.
    pub skipped_vms: Vec<String>,
    /// Subscriptions whose credentials or listing failed.
    pub failed_subscriptions: Vec<String>,
    /// Whether a fast follow-up was requested.
    pub fast_reschedule: bool,
}

#[derive(Debug, Error)]
enum SubscriptionError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

/// Runs reconciliation ticks against a compute client.
pub struct Reconciler<C: ComputeClient> {
    compute: Arc<C>,
    credentials: Arc<CredentialCache>,
    store: Arc<StateStore>,
    rescheduler: Arc<dyn Reschedule>,
    settings: ReconcilerSettings,
}

impl<C: ComputeClient> Reconciler<C> {
    /// Builds a reconciler over shared collaborators.
    #[must_use]
    pub fn new(
        compute: Arc<C>,
        credentials: Arc<CredentialCache>,
        store: Arc<StateStore>,
        rescheduler: Arc<dyn Reschedule>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            compute,
            credentials,
            store,
            rescheduler,
            settings,
        }
    }

    /// Performs one full pass over every configured subscription.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        info!("reconciliation started");

        for subscription_id in self.credentials.subscription_ids() {
            if let Err(err) = self.reconcile_subscription(subscription_id, &mut report).await {
                warn!(subscription_id, error = %err, "subscription skipped for this tick");
                report.failed_subscriptions.push(subscription_id.to_owned());
            }
        }

        if report.changing > 0 {
            self.rescheduler.reschedule(self.settings.fast_interval);
            report.fast_reschedule = true;
        }

        info!(
            upserted = report.upserted,
            changing = report.changing,
            marked_missing = report.marked_missing,
            skipped = report.skipped_vms.len(),
            failed_subscriptions = report.failed_subscriptions.len(),
            "reconciliation finished"
        );
        report
    }

    async fn reconcile_subscription(
        &self,
        subscription_id: &str,
        report: &mut TickReport,
    ) -> Result<(), SubscriptionError> {
        let credential = self.credentials.resolve(subscription_id).await?;
        let listing = bounded(
            self.settings.call_timeout,
            "list",
            subscription_id,
            self.compute.list(subscription_id, &credential),
        )
        .await;
        let vms = match listing {
            Ok(vms) => vms,
            Err(err) => {
                self.forget_rejected_token(subscription_id, &err).await;
                return Err(err.into());
            }
        };

        let mut listed = HashSet::with_capacity(vms.len());
        for vm in vms {
            listed.insert(vm.id.clone());
            match self.resolve_vm(subscription_id, &credential, &vm).await {
                Ok(None) => {}
                Ok(Some(state)) => {
                    if state.power_state.is_changing() {
                        report.changing += 1;
                    }
                    self.store.upsert(state);
                    report.upserted += 1;
                }
                Err(err) => {
                    warn!(subscription_id, vm_id = %vm.id, error = %err, "machine skipped for this tick");
                    self.forget_rejected_token(subscription_id, &err).await;
                    report.skipped_vms.push(vm.id);
                }
            }
        }

        report.marked_missing += self.mark_vanished(subscription_id, &listed);
        Ok(())
    }

    async fn resolve_vm(
        &self,
        subscription_id: &str,
        credential: &Credential,
        vm: &VmDescriptor,
    ) -> Result<Option<VmState>, ComputeError> {
        let resource_id = ResourceId::parse(&vm.id)?;
        if !resource_id.is_virtual_machine() {
            debug!(vm_id = %vm.id, "listed resource is not a virtual machine; ignored");
            return Ok(None);
        }
        let power_state = bounded(
            self.settings.call_timeout,
            "instance view",
            &vm.id,
            self.compute.power_state(&vm.id, subscription_id, credential),
        )
        .await?;
        debug!(vm_id = %vm.id, vm_name = %vm.name, %power_state, "resolved power state");
        Ok(Some(VmState::new(&resource_id, subscription_id, power_state)))
    }

    fn mark_vanished(&self, subscription_id: &str, listed: &HashSet<String>) -> usize {
        let vanished: Vec<VmState> = self
            .store
            .snapshot()
            .into_values()
            .filter(|state| {
                state.subscription_id == subscription_id
                    && state.power_state != PowerState::NotFound
                    && !listed.contains(&state.resource_id)
            })
            .collect();

        for state in &vanished {
            info!(vm_id = %state.resource_id, "machine no longer listed; marking not found");
            self.store.upsert(state.with_power_state(PowerState::NotFound));
        }
        vanished.len()
    }

    async fn forget_rejected_token(&self, subscription_id: &str, err: &ComputeError) {
        if matches!(err, ComputeError::Unauthorized { .. }) {
            self.credentials.invalidate(subscription_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::test_support::{
        ComputeCall, RecordingRescheduler, ScriptedCompute, StaticLogin, principal, vm_id,
    };
    use rstest::{fixture, rstest};

    const FAST: Duration = Duration::from_secs(20);
    const TIMEOUT: Duration = Duration::from_secs(30);

    struct Harness {
        compute: Arc<ScriptedCompute>,
        login: StaticLogin,
        store: Arc<StateStore>,
        rescheduler: Arc<RecordingRescheduler>,
        reconciler: Reconciler<ScriptedCompute>,
    }

    fn harness_with(login: StaticLogin, subscriptions: &[&str]) -> Harness {
        let compute = Arc::new(ScriptedCompute::new());
        let configured = subscriptions
            .iter()
            .map(|id| ((*id).to_owned(), principal()))
            .collect::<BTreeMap<_, _>>();
        let credentials = Arc::new(CredentialCache::new(configured, Arc::new(login.clone())));
        let store = Arc::new(StateStore::new());
        let rescheduler = Arc::new(RecordingRescheduler::default());
        let reconciler = Reconciler::new(
            Arc::clone(&compute),
            credentials,
            Arc::clone(&store),
            rescheduler.clone(),
            ReconcilerSettings {
                fast_interval: FAST,
                call_timeout: TIMEOUT,
            },
        );
        Harness {
            compute,
            login,
            store,
            rescheduler,
            reconciler,
        }
    }

    #[fixture]
    fn harness() -> Harness {
        harness_with(StaticLogin::new("token"), &["A", "B"])
    }

    fn power(store: &StateStore, id: &str) -> Option<PowerState> {
        store.get(id).map(|state| state.power_state)
    }

    #[rstest]
    #[tokio::test]
    async fn stable_machines_are_stored_without_fast_reschedule(harness: Harness) {
        let (on, off) = (vm_id("A", "rg-a", "web"), vm_id("B", "rg-b", "db"));
        harness.compute.set_listing("A", &[(&on, "web")]);
        harness.compute.set_listing("B", &[(&off, "db")]);
        harness.compute.set_statuses(&on, &["ProvisioningState/succeeded", "PowerState/running"]);
        harness.compute.set_statuses(&off, &["PowerState/deallocated"]);

        let report = harness.reconciler.tick().await;

        assert_eq!(report.upserted, 2);
        assert!(!report.fast_reschedule);
        assert_eq!(power(&harness.store, &on), Some(PowerState::On));
        assert_eq!(power(&harness.store, &off), Some(PowerState::Off));
        assert_eq!(
            harness.store.get(&on).map(|state| state.resource_group_name),
            Some(String::from("rg-a"))
        );
        assert!(harness.rescheduler.delays().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn changing_machine_requests_fast_reschedule(harness: Harness) {
        let id = vm_id("A", "rg", "web");
        harness.compute.set_listing("A", &[(&id, "web")]);
        harness.compute.set_statuses(&id, &["PowerState/starting"]);

        let report = harness.reconciler.tick().await;

        assert_eq!(report.changing, 1);
        assert!(report.fast_reschedule);
        assert_eq!(harness.rescheduler.delays(), vec![FAST]);
    }

    #[rstest]
    #[tokio::test]
    async fn failing_subscription_does_not_block_others(harness: Harness) {
        let id = vm_id("B", "rg", "db");
        harness.compute.fail_listing(
            "A",
            ComputeError::Transport {
                message: String::from("connection reset"),
            },
        );
        harness.compute.set_listing("B", &[(&id, "db")]);
        harness.compute.set_statuses(&id, &["PowerState/running"]);

        let report = harness.reconciler.tick().await;

        assert_eq!(report.failed_subscriptions, vec![String::from("A")]);
        assert_eq!(power(&harness.store, &id), Some(PowerState::On));
    }

    #[rstest]
    #[tokio::test]
    async fn malformed_ids_are_skipped_not_fabricated(harness: Harness) {
        let good = vm_id("A", "rg", "web");
        harness
            .compute
            .set_listing("A", &[("/subscriptions/A/resourceGroups/rg", "broken"), (&good, "web")]);
        harness.compute.set_statuses(&good, &["PowerState/running"]);

        let report = harness.reconciler.tick().await;

        assert_eq!(
            report.skipped_vms,
            vec![String::from("/subscriptions/A/resourceGroups/rg")]
        );
        assert_eq!(harness.store.len(), 1);
        assert_eq!(power(&harness.store, &good), Some(PowerState::On));
    }

    #[rstest]
    #[tokio::test]
    async fn non_vm_resources_are_ignored(harness: Harness) {
        let vm = vm_id("A", "rg", "web");
        let disk = "/subscriptions/A/resourceGroups/rg/providers/Microsoft.Compute/disks/web-os";
        harness.compute.set_listing("A", &[(disk, "web-os"), (vm.as_str(), "web")]);
        harness.compute.set_statuses(&vm, &["PowerState/running"]);

        let report = harness.reconciler.tick().await;

        assert_eq!(harness.store.len(), 1);
        assert!(harness.store.get(disk).is_none());
        assert!(report.skipped_vms.is_empty());
        assert!(
            !harness
                .compute
                .calls()
                .contains(&ComputeCall::Statuses(String::from(disk)))
        );
    }

    #[rstest]
    #[tokio::test]
    async fn missing_power_status_is_not_found(harness: Harness) {
        let id = vm_id("A", "rg", "web");
        harness.compute.set_listing("A", &[(&id, "web")]);
        harness.compute.set_statuses(&id, &["ProvisioningState/succeeded"]);

        let report = harness.reconciler.tick().await;

        assert_eq!(power(&harness.store, &id), Some(PowerState::NotFound));
        assert!(!report.fast_reschedule);
    }

    #[rstest]
    #[tokio::test]
    async fn vanished_machines_are_marked_not_found_once(harness: Harness) {
        let (kept, gone) = (vm_id("A", "rg", "kept"), vm_id("A", "rg", "gone"));
        harness.compute.set_listing("A", &[(&kept, "kept"), (&gone, "gone")]);
        harness.compute.set_statuses(&kept, &["PowerState/running"]);
        harness.compute.set_statuses(&gone, &["PowerState/running"]);
        harness.reconciler.tick().await;

        harness.compute.set_listing("A", &[(&kept, "kept")]);
        let second = harness.reconciler.tick().await;
        let third = harness.reconciler.tick().await;

        assert_eq!(second.marked_missing, 1);
        assert_eq!(third.marked_missing, 0);
        assert_eq!(power(&harness.store, &gone), Some(PowerState::NotFound));
        assert_eq!(power(&harness.store, &kept), Some(PowerState::On));
    }

    #[rstest]
    #[tokio::test]
    async fn failed_listing_leaves_stored_machines_alone(harness: Harness) {
        let id = vm_id("A", "rg", "web");
        harness.compute.set_listing("A", &[(&id, "web")]);
        harness.compute.set_statuses(&id, &["PowerState/running"]);
        harness.reconciler.tick().await;

        harness.compute.fail_listing(
            "A",
            ComputeError::Http {
                target: String::from("A"),
                status: 500,
                message: String::from("boom"),
            },
        );
        let report = harness.reconciler.tick().await;

        assert_eq!(report.marked_missing, 0);
        assert_eq!(power(&harness.store, &id), Some(PowerState::On));
    }

    #[rstest]
    #[tokio::test]
    async fn unauthorized_listing_forces_fresh_login() {
        let harness = harness_with(StaticLogin::new("token"), &["A"]);
        harness.compute.fail_listing(
            "A",
            ComputeError::Unauthorized {
                target: String::from("A"),
                status: 401,
            },
        );

        harness.reconciler.tick().await;
        harness.reconciler.tick().await;

        assert_eq!(harness.login.calls(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn login_failure_is_isolated() {
        let harness = harness_with(StaticLogin::failing("bad secret"), &["A"]);

        let report = harness.reconciler.tick().await;

        assert_eq!(report.failed_subscriptions, vec![String::from("A")]);
        assert!(harness.compute.calls().is_empty());
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn stalled_login_does_not_wedge_the_tick() {
        let compute = Arc::new(ScriptedCompute::new());
        let id = vm_id("B", "rg", "db");
        compute.set_listing("B", &[(&id, "db")]);
        compute.set_statuses(&id, &["PowerState/running"]);
        let mut with_token = principal();
        with_token.access_token = Some(String::from("static"));
        let configured = BTreeMap::from([
            (String::from("A"), principal()),
            (String::from("B"), with_token),
        ]);
        let credentials = Arc::new(
            CredentialCache::new(configured, Arc::new(StaticLogin::stalled()))
                .with_login_timeout(TIMEOUT),
        );
        let store = Arc::new(StateStore::new());
        let reconciler = Reconciler::new(
            compute,
            credentials,
            Arc::clone(&store),
            Arc::new(RecordingRescheduler::default()),
            ReconcilerSettings {
                fast_interval: FAST,
                call_timeout: TIMEOUT,
            },
        );

        let report = tokio::time::timeout(Duration::from_secs(3_600), reconciler.tick())
            .await
            .expect("tick finishes despite a hung login");

        assert_eq!(report.failed_subscriptions, vec![String::from("A")]);
        assert_eq!(power(&store, &id), Some(PowerState::On));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn stalled_provider_calls_time_out(harness: Harness) {
        let id = vm_id("B", "rg", "db");
        harness.compute.set_listing("B", &[(&id, "db")]);
        harness.compute.set_latency(TIMEOUT + Duration::from_secs(1));

        let report = harness.reconciler.tick().await;

        assert_eq!(
            report.failed_subscriptions,
            vec![String::from("A"), String::from("B")]
        );
        assert!(harness.store.is_empty());
    }
}
