//! Binary entry point for the `azpower` CLI.

mod cli;

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::info;

use azpower::{
    CommandError, CommandOutcome, ConfigError, Monitor, MonitorConfig, MonitorError,
    StateObserver, VmState, logging,
};
use cli::{Cli, Command, ToggleCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("failed to listen for Ctrl-C: {0}")]
    Signal(String),
}

/// Logs store notifications for `azpower watch`.
struct LogObserver;

impl StateObserver for LogObserver {
    fn on_all_ready(&self, states: &BTreeMap<String, VmState>) {
        info!(machines = states.len(), "all states ready");
        for state in states.values() {
            info!(
                vm_name = %state.vm_name,
                resource_group = %state.resource_group_name,
                power_state = %state.power_state,
                "machine"
            );
        }
    }

    fn on_state_changed(&self, state: &VmState) {
        info!(
            vm_name = %state.vm_name,
            power_state = %state.power_state,
            "state updated"
        );
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(cli.log_level.as_deref()) {
        writeln!(io::stderr(), "failed to initialise logging: {err}").ok();
    }
    let exit_code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(command: Command) -> Result<i32, CliError> {
    let config = MonitorConfig::load_without_cli_args()?;
    let monitor = Monitor::for_azure(&config)?;

    match command {
        Command::Watch => watch(&monitor).await,
        Command::List => {
            let report = monitor.refresh().await;
            let mut stdout = io::stdout();
            for state in monitor.store().snapshot().values() {
                writeln!(stdout, "{}", render_state_line(state)).ok();
            }
            Ok(i32::from(!report.failed_subscriptions.is_empty()))
        }
        Command::Toggle(ToggleCommand { resource_id }) => {
            monitor.refresh().await;
            let outcome = monitor.run_command(&resource_id).await?;
            writeln!(io::stdout(), "{}", render_outcome(&outcome)).ok();
            Ok(0)
        }
    }
}

async fn watch<C: azpower::ComputeClient + 'static>(monitor: &Monitor<C>) -> Result<i32, CliError> {
    monitor.subscribe(Arc::new(LogObserver));
    monitor.activate().await?;
    let signal = tokio::signal::ctrl_c().await;
    monitor.shutdown().await;
    signal.map_err(|err| CliError::Signal(err.to_string()))?;
    Ok(0)
}

fn render_state_line(state: &VmState) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        state.power_state, state.vm_name, state.resource_group_name, state.resource_id
    )
}

fn render_outcome(outcome: &CommandOutcome) -> String {
    let verb = match outcome {
        CommandOutcome::Stopping(_) => "stopping",
        CommandOutcome::Starting(_) => "starting",
        CommandOutcome::AlreadyChanging(_) => "already changing",
        CommandOutcome::Unresolved(_) => "state unknown; not changed",
    };
    format!("{}: {verb}", outcome.state().vm_name)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
