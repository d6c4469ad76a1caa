//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::compute::{ComputeClient, ComputeError, ComputeFuture, Credential, InstanceStatus, VmDescriptor};
use crate::config::{DEFAULT_MANAGEMENT_ENDPOINT, MonitorConfig, SubscriptionCredentials};
use crate::credentials::{CredentialError, LoginFuture, LoginProvider};
use crate::process::{CommandOutput, CommandRunner, ProcessError};
use crate::scheduler::Reschedule;
use crate::state::VmState;
use crate::store::StateObserver;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables set for the program.
    pub env: Vec<(String, OsString)>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Value of the extra environment variable `key`, if one was set.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&OsStr> {
        self.env
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_os_str())
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_success(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(&str, OsString)],
    ) -> Result<CommandOutput, ProcessError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            env: env
                .iter()
                .map(|(key, value)| ((*key).to_owned(), value.clone()))
                .collect(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| ProcessError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Login provider that hands out a fixed token and counts logins.
#[derive(Clone, Debug)]
pub struct StaticLogin {
    token: String,
    expires_at: Option<SystemTime>,
    failure: Option<String>,
    stalls: bool,
    calls: Arc<AtomicUsize>,
}

impl StaticLogin {
    /// Succeeds with `token`, which never expires.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
            failure: None,
            stalls: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Never answers, like a hung `az` process.
    #[must_use]
    pub fn stalled() -> Self {
        Self {
            stalls: true,
            ..Self::new("")
        }
    }

    /// Fails every login with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new("")
        }
    }

    /// Stamps issued tokens with `expires_at`.
    #[must_use]
    pub fn expiring_at(self, expires_at: SystemTime) -> Self {
        Self {
            expires_at: Some(expires_at),
            ..self
        }
    }

    /// Number of logins attempted so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LoginProvider for StaticLogin {
    fn login<'a>(
        &'a self,
        subscription_id: &'a str,
        _settings: &'a SubscriptionCredentials,
    ) -> LoginFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stalls {
                std::future::pending::<()>().await;
            }
            match &self.failure {
                Some(message) => Err(CredentialError::Login {
                    subscription_id: subscription_id.to_owned(),
                    message: message.clone(),
                }),
                None => Ok(Credential::new(self.token.clone(), self.expires_at)),
            }
        })
    }
}

/// Observer that records every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    changed: Mutex<Vec<VmState>>,
    all_ready: Mutex<Vec<BTreeMap<String, VmState>>>,
}

impl RecordingObserver {
    /// States delivered through `on_state_changed`, in order.
    #[must_use]
    pub fn changed(&self) -> Vec<VmState> {
        lock(&self.changed).clone()
    }

    /// Snapshots delivered through `on_all_ready`, in order.
    #[must_use]
    pub fn all_ready(&self) -> Vec<BTreeMap<String, VmState>> {
        lock(&self.all_ready).clone()
    }
}

impl StateObserver for RecordingObserver {
    fn on_all_ready(&self, states: &BTreeMap<String, VmState>) {
        lock(&self.all_ready).push(states.clone());
    }

    fn on_state_changed(&self, state: &VmState) {
        lock(&self.changed).push(state.clone());
    }
}

/// Rescheduler that records requested delays instead of timing anything.
#[derive(Debug, Default)]
pub struct RecordingRescheduler {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingRescheduler {
    /// Delays requested so far, in order.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        lock(&self.delays).clone()
    }
}

impl Reschedule for RecordingRescheduler {
    fn reschedule(&self, delay: Duration) {
        lock(&self.delays).push(delay);
    }
}

/// Remote call observed by [`ScriptedCompute`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ComputeCall {
    /// `list` for a subscription.
    List(String),
    /// `instance_statuses` for a machine.
    Statuses(String),
    /// `start` for a machine.
    Start(String),
    /// `stop` for a machine.
    Stop(String),
}

#[derive(Debug, Default)]
struct ComputeScript {
    listings: HashMap<String, Result<Vec<VmDescriptor>, ComputeError>>,
    statuses: HashMap<String, Result<Vec<String>, ComputeError>>,
    command_failure: Option<ComputeError>,
    latency: Duration,
    calls: Vec<ComputeCall>,
    tokens: Vec<String>,
}

/// Compute client whose answers are scripted per subscription and machine.
///
/// Subscriptions without a listing return an empty list; machines without
/// statuses return an empty instance view.
#[derive(Clone, Debug, Default)]
pub struct ScriptedCompute {
    script: Arc<Mutex<ComputeScript>>,
}

impl ScriptedCompute {
    /// Creates a client with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists `vms` (id, name pairs) for `subscription_id`.
    pub fn set_listing(&self, subscription_id: &str, vms: &[(&str, &str)]) {
        let descriptors = vms
            .iter()
            .map(|(id, name)| VmDescriptor {
                id: (*id).to_owned(),
                name: (*name).to_owned(),
            })
            .collect();
        lock(&self.script)
            .listings
            .insert(subscription_id.to_owned(), Ok(descriptors));
    }

    /// Makes listing `subscription_id` fail with `error`.
    pub fn fail_listing(&self, subscription_id: &str, error: ComputeError) {
        lock(&self.script)
            .listings
            .insert(subscription_id.to_owned(), Err(error));
    }

    /// Reports `codes` as the instance view of `vm_id`.
    pub fn set_statuses(&self, vm_id: &str, codes: &[&str]) {
        let owned = codes.iter().map(|code| (*code).to_owned()).collect();
        lock(&self.script)
            .statuses
            .insert(vm_id.to_owned(), Ok(owned));
    }

    /// Makes the instance view of `vm_id` fail with `error`.
    pub fn fail_statuses(&self, vm_id: &str, error: ComputeError) {
        lock(&self.script)
            .statuses
            .insert(vm_id.to_owned(), Err(error));
    }

    /// Makes every start and stop request fail with `error`.
    pub fn fail_commands(&self, error: ComputeError) {
        lock(&self.script).command_failure = Some(error);
    }

    /// Delays every answer by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.script).latency = latency;
    }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ComputeCall> {
        lock(&self.script).calls.clone()
    }

    /// Machines passed to `start`.
    #[must_use]
    pub fn starts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ComputeCall::Start(vm_id) => Some(vm_id),
                _ => None,
            })
            .collect()
    }

    /// Machines passed to `stop`.
    #[must_use]
    pub fn stops(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ComputeCall::Stop(vm_id) => Some(vm_id),
                _ => None,
            })
            .collect()
    }

    /// Bearer tokens presented with each call.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        lock(&self.script).tokens.clone()
    }

    fn record(&self, call: ComputeCall, credential: &Credential) -> Duration {
        let mut script = lock(&self.script);
        script.calls.push(call);
        script.tokens.push(credential.token().to_owned());
        script.latency
    }

    async fn pause(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn command<'a>(&'a self, call: ComputeCall, credential: &'a Credential) -> ComputeFuture<'a, ()> {
        Box::pin(async move {
            let latency = self.record(call, credential);
            Self::pause(latency).await;
            let failure = lock(&self.script).command_failure.clone();
            failure.map_or(Ok(()), Err)
        })
    }
}

impl ComputeClient for ScriptedCompute {
    fn list<'a>(
        &'a self,
        subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, Vec<VmDescriptor>> {
        Box::pin(async move {
            let latency = self.record(ComputeCall::List(subscription_id.to_owned()), credential);
            Self::pause(latency).await;
            let listing = lock(&self.script).listings.get(subscription_id).cloned();
            listing.unwrap_or_else(|| Ok(Vec::new()))
        })
    }

    fn instance_statuses<'a>(
        &'a self,
        vm_id: &'a str,
        _subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, Vec<InstanceStatus>> {
        Box::pin(async move {
            let latency = self.record(ComputeCall::Statuses(vm_id.to_owned()), credential);
            Self::pause(latency).await;
            let codes = lock(&self.script)
                .statuses
                .get(vm_id)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))?;
            Ok(codes
                .into_iter()
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
        self.command(ComputeCall::Start(vm_id.to_owned()), credential)
    }

    fn stop<'a>(
        &'a self,
        vm_id: &'a str,
        _subscription_id: &'a str,
        credential: &'a Credential,
    ) -> ComputeFuture<'a, ()> {
        self.command(ComputeCall::Stop(vm_id.to_owned()), credential)
    }
}

/// Builds a virtual machine resource id.
#[must_use]
pub fn vm_id(subscription_id: &str, resource_group: &str, name: &str) -> String {
    format!(
        "/subscriptions/{subscription_id}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachines/{name}"
    )
}

/// Service principal settings without a static token.
#[must_use]
pub fn principal() -> SubscriptionCredentials {
    SubscriptionCredentials {
        client_id: String::from("client"),
        client_secret: String::from("secret"),
        tenant_id: String::from("tenant"),
        access_token: None,
    }
}

/// Monitor settings with short, test-friendly intervals.
#[must_use]
pub fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        subscriptions_file: String::from("azure.json"),
        normal_interval_secs: 1_200,
        fast_interval_secs: 20,
        command_delay_secs: 2,
        initial_delay_secs: 2,
        call_timeout_secs: 30,
        az_bin: String::from("az"),
        az_config_root: String::from("az-profiles"),
        management_endpoint: String::from(DEFAULT_MANAGEMENT_ENDPOINT),
    }
}
