//! Wires the store, reconciler, scheduler and dispatcher together.
//!
//! [`Monitor`] is the host-facing surface: activation runs the first
//! reconciliation, announces the populated roster to observers and starts the
//! adaptive timer; commands and shutdown go through the same value.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::azure::{AzCliLogin, AzureComputeClient};
use crate::compute::ComputeClient;
use crate::config::{ConfigError, MonitorConfig, SubscriptionsFile};
use crate::credentials::CredentialCache;
use crate::dispatcher::{CommandDispatcher, CommandError, CommandOutcome, DispatcherSettings};
use crate::process::ProcessCommandRunner;
use crate::reconciler::{Reconciler, ReconcilerSettings, TickReport};
use crate::scheduler::{AdaptiveScheduler, SchedulerError};
use crate::store::{ObserverId, StateObserver, StateStore};

/// Errors that prevent the monitor from starting.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Settings or credentials are missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The scheduler refused to start.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Power-state monitor for every configured subscription.
pub struct Monitor<C: ComputeClient> {
    store: Arc<StateStore>,
    scheduler: AdaptiveScheduler,
    reconciler: Arc<Reconciler<C>>,
    dispatcher: CommandDispatcher<C>,
    initial_delay: Duration,
    normal_interval: Duration,
    activated: AtomicBool,
}

impl Monitor<AzureComputeClient> {
    /// Builds a monitor backed by Resource Manager and the Azure CLI, loading
    /// credentials from the configured subscriptions file.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Config`] when the settings are invalid or the
    /// subscriptions file cannot be loaded.
    pub fn for_azure(config: &MonitorConfig) -> Result<Self, MonitorError> {
        config.validate()?;
        let path = config.subscriptions_path();
        let file = SubscriptionsFile::load(&path)?;
        info!(
            path = %path,
            subscriptions = file.subscriptions.len(),
            "loaded subscriptions"
        );
        let login = AzCliLogin::new(
            ProcessCommandRunner,
            config.az_bin.clone(),
            config.az_config_path(),
        );
        let credentials = Arc::new(
            CredentialCache::new(file.subscriptions, Arc::new(login))
                .with_login_timeout(config.call_timeout()),
        );
        let compute = Arc::new(AzureComputeClient::new(config.management_endpoint.clone()));
        Self::new(config, compute, credentials)
    }
}

impl<C: ComputeClient + 'static> Monitor<C> {
    /// Builds a monitor over an arbitrary compute client.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Config`] when `config` fails validation.
    pub fn new(
        config: &MonitorConfig,
        compute: Arc<C>,
        credentials: Arc<CredentialCache>,
    ) -> Result<Self, MonitorError> {
        config.validate()?;
        let store = Arc::new(StateStore::new());
        let scheduler = AdaptiveScheduler::new();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&compute),
            Arc::clone(&credentials),
            Arc::clone(&store),
            Arc::new(scheduler.clone()),
            ReconcilerSettings {
                fast_interval: config.fast_interval(),
                call_timeout: config.call_timeout(),
            },
        ));
        let dispatcher = CommandDispatcher::new(
            compute,
            credentials,
            Arc::clone(&store),
            Arc::new(scheduler.clone()),
            DispatcherSettings {
                command_delay: config.command_delay(),
                call_timeout: config.call_timeout(),
            },
        );
        Ok(Self {
            store,
            scheduler,
            reconciler,
            dispatcher,
            initial_delay: config.initial_delay(),
            normal_interval: config.normal_interval(),
            activated: AtomicBool::new(false),
        })
    }

    /// Shared state store.
    #[must_use]
    pub const fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Registers an observer for state notifications.
    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) -> ObserverId {
        self.store.subscribe(observer)
    }

    /// Runs one reconciliation tick outside the timer.
    pub async fn refresh(&self) -> TickReport {
        self.reconciler.tick().await
    }

    /// Performs the first reconciliation, notifies observers that all states
    /// are ready and starts the adaptive timer.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Scheduler`] when the monitor was already
    /// activated; no reconciliation runs in that case.
    pub async fn activate(&self) -> Result<TickReport, MonitorError> {
        if self.activated.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted.into());
        }
        let report = self.reconciler.tick().await;
        self.store.notify_all_ready();

        let reconciler = Arc::clone(&self.reconciler);
        self.scheduler
            .start(self.initial_delay, self.normal_interval, move || {
                let tick = Arc::clone(&reconciler);
                async move {
                    tick.tick().await;
                }
            })?;
        info!(machines = self.store.len(), "monitor activated");
        Ok(report)
    }

    /// Toggles the machine identified by `resource_id`.
    ///
    /// # Errors
    ///
    /// See [`CommandDispatcher::run_command`].
    pub async fn run_command(&self, resource_id: &str) -> Result<CommandOutcome, CommandError> {
        self.dispatcher.run_command(resource_id).await
    }

    /// Stops the timer, letting an in-flight tick finish.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        info!("monitor stopped");
    }
}
