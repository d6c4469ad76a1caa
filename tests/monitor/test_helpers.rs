//! Shared fixtures for monitor BDD scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use azpower::test_support::{
    RecordingRescheduler, ScriptedCompute, StaticLogin, principal, vm_id,
};
use azpower::{
    CommandDispatcher, CommandOutcome, CredentialCache, DispatcherSettings, Reconciler,
    ReconcilerSettings, StateStore, TickReport,
};
use rstest::fixture;

pub const FAST_INTERVAL: Duration = Duration::from_secs(20);
pub const COMMAND_DELAY: Duration = Duration::from_secs(2);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const RESOURCE_GROUP: &str = "rg";

#[derive(Clone, Debug)]
pub enum CommandResult {
    Outcome(CommandOutcome),
    UnknownVm,
    Failure(String),
}

#[derive(Clone)]
pub struct MonitorContext {
    pub compute: Arc<ScriptedCompute>,
    pub subscriptions: Vec<String>,
    pub listings: BTreeMap<String, Vec<String>>,
    pub store: Arc<StateStore>,
    pub rescheduler: Arc<RecordingRescheduler>,
    pub report: Option<TickReport>,
    pub command: Option<CommandResult>,
}

#[fixture]
pub fn monitor_context() -> MonitorContext {
    MonitorContext {
        compute: Arc::new(ScriptedCompute::new()),
        subscriptions: Vec::new(),
        listings: BTreeMap::new(),
        store: Arc::new(StateStore::new()),
        rescheduler: Arc::new(RecordingRescheduler::default()),
        report: None,
        command: None,
    }
}

impl MonitorContext {
    pub fn configure(&mut self, subscription_id: &str) {
        if !self.subscriptions.iter().any(|id| id == subscription_id) {
            self.subscriptions.push(subscription_id.to_owned());
        }
    }

    pub fn list_machine(&mut self, subscription_id: &str, name: &str, status: &str) {
        self.configure(subscription_id);
        let id = machine_id(subscription_id, name);
        let ids = self.listings.entry(subscription_id.to_owned()).or_default();
        ids.push(id.clone());
        let entries: Vec<(&str, &str)> = ids
            .iter()
            .map(|listed| (listed.as_str(), listed.rsplit('/').next().unwrap_or_default()))
            .collect();
        self.compute.set_listing(subscription_id, &entries);
        self.compute.set_statuses(&id, &[status]);
    }

    fn credentials(&self) -> Arc<CredentialCache> {
        let configured = self
            .subscriptions
            .iter()
            .map(|id| (id.clone(), principal()))
            .collect::<BTreeMap<_, _>>();
        Arc::new(CredentialCache::new(
            configured,
            Arc::new(StaticLogin::new("token")),
        ))
    }

    pub fn reconciler(&self) -> Reconciler<ScriptedCompute> {
        Reconciler::new(
            Arc::clone(&self.compute),
            self.credentials(),
            Arc::clone(&self.store),
            self.rescheduler.clone(),
            ReconcilerSettings {
                fast_interval: FAST_INTERVAL,
                call_timeout: CALL_TIMEOUT,
            },
        )
    }

    pub fn dispatcher(&self) -> CommandDispatcher<ScriptedCompute> {
        CommandDispatcher::new(
            Arc::clone(&self.compute),
            self.credentials(),
            Arc::clone(&self.store),
            self.rescheduler.clone(),
            DispatcherSettings {
                command_delay: COMMAND_DELAY,
                call_timeout: CALL_TIMEOUT,
            },
        )
    }
}

pub fn machine_id(subscription_id: &str, name: &str) -> String {
    vm_id(subscription_id, RESOURCE_GROUP, name)
}
