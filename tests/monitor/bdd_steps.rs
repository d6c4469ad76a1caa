//! BDD step definitions for reconciliation and command behaviour.

use azpower::{CommandError, CommandOutcome, ComputeError};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{CommandResult, MonitorContext, machine_id};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("subscription \"{subscription}\" lists machine \"{name}\" reporting \"{status}\"")]
fn subscription_lists_machine(
    mut monitor_context: MonitorContext,
    subscription: String,
    name: String,
    status: String,
) -> MonitorContext {
    monitor_context.list_machine(&subscription, &name, &status);
    monitor_context
}

#[given("subscription \"{subscription}\" fails to list machines")]
fn subscription_fails_to_list(
    mut monitor_context: MonitorContext,
    subscription: String,
) -> MonitorContext {
    monitor_context.configure(&subscription);
    monitor_context.compute.fail_listing(
        &subscription,
        ComputeError::Transport {
            message: String::from("connection reset by peer"),
        },
    );
    monitor_context
}

#[given("the provider rejects power requests")]
fn provider_rejects_requests(monitor_context: MonitorContext) -> MonitorContext {
    monitor_context.compute.fail_commands(ComputeError::Http {
        target: String::from("any"),
        status: 409,
        message: String::from("operation not allowed"),
    });
    monitor_context
}

fn tick(mut monitor_context: MonitorContext) -> Result<MonitorContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let reconciler = monitor_context.reconciler();
    monitor_context.report = Some(runtime.block_on(async move { reconciler.tick().await }));
    Ok(monitor_context)
}

#[given("a reconciliation tick has run")]
fn tick_has_run(monitor_context: MonitorContext) -> Result<MonitorContext, StepError> {
    tick(monitor_context)
}

#[when("a reconciliation tick runs")]
fn tick_runs(monitor_context: MonitorContext) -> Result<MonitorContext, StepError> {
    tick(monitor_context)
}

#[when("I toggle machine \"{name}\" in subscription \"{subscription}\"")]
fn toggle_machine(
    mut monitor_context: MonitorContext,
    name: String,
    subscription: String,
) -> Result<MonitorContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let dispatcher = monitor_context.dispatcher();
    let id = machine_id(&subscription, &name);
    let result = runtime.block_on(async move { dispatcher.run_command(&id).await });
    monitor_context.command = Some(match result {
        Ok(outcome) => CommandResult::Outcome(outcome),
        Err(CommandError::UnknownVm { .. }) => CommandResult::UnknownVm,
        Err(err) => CommandResult::Failure(err.to_string()),
    });
    Ok(monitor_context)
}

#[then("machine \"{name}\" in subscription \"{subscription}\" is \"{state}\"")]
fn machine_is(
    monitor_context: &MonitorContext,
    name: String,
    subscription: String,
    state: String,
) -> Result<(), StepError> {
    let id = machine_id(&subscription, &name);
    let stored = monitor_context
        .store
        .get(&id)
        .ok_or_else(|| StepError::Assertion(format!("machine {id} is not stored")))?;
    if stored.power_state.label() == state {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {name} to be {state}, got {}",
            stored.power_state
        )))
    }
}

#[then("the store holds {count:u32} machines")]
fn store_holds(monitor_context: &MonitorContext, count: u32) -> Result<(), StepError> {
    let stored = monitor_context.store.len();
    if stored == count as usize {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} machines, found {stored}"
        )))
    }
}

#[then("no fast reschedule was requested")]
fn no_reschedule(monitor_context: &MonitorContext) -> Result<(), StepError> {
    let delays = monitor_context.rescheduler.delays();
    if delays.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no reschedule, got {delays:?}"
        )))
    }
}

#[then("a reschedule of {seconds:u32} seconds was requested")]
fn reschedule_requested(monitor_context: &MonitorContext, seconds: u32) -> Result<(), StepError> {
    let delays = monitor_context.rescheduler.delays();
    if delays.last().map(std::time::Duration::as_secs) == Some(u64::from(seconds)) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a final reschedule of {seconds}s, got {delays:?}"
        )))
    }
}

#[then("subscription \"{subscription}\" is reported as failed")]
fn subscription_failed(
    monitor_context: &MonitorContext,
    subscription: String,
) -> Result<(), StepError> {
    let Some(report) = monitor_context.report.as_ref() else {
        return Err(StepError::Assertion(String::from("missing tick report")));
    };
    if report.failed_subscriptions.contains(&subscription) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {subscription} to fail, got {:?}",
            report.failed_subscriptions
        )))
    }
}

#[then("the provider received {count:u32} {kind} request")]
fn provider_received(
    monitor_context: &MonitorContext,
    count: u32,
    kind: String,
) -> Result<(), StepError> {
    let received = match kind.as_str() {
        "stop" => monitor_context.compute.stops().len(),
        "start" => monitor_context.compute.starts().len(),
        other => return Err(StepError::Assertion(format!("unknown request kind {other}"))),
    };
    if received == count as usize {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} {kind} requests, got {received}"
        )))
    }
}

#[then("the provider received no power requests")]
fn no_power_requests(monitor_context: &MonitorContext) -> Result<(), StepError> {
    let starts = monitor_context.compute.starts();
    let stops = monitor_context.compute.stops();
    if starts.is_empty() && stops.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no power requests, got starts {starts:?} and stops {stops:?}"
        )))
    }
}

#[then("the command is ignored as already changing")]
fn ignored_as_changing(monitor_context: &MonitorContext) -> Result<(), StepError> {
    match monitor_context.command.as_ref() {
        Some(CommandResult::Outcome(CommandOutcome::AlreadyChanging(_))) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected an already-changing no-op, got {other:?}"
        ))),
    }
}

#[then("the command fails because the machine is unknown")]
fn fails_unknown(monitor_context: &MonitorContext) -> Result<(), StepError> {
    match monitor_context.command.as_ref() {
        Some(CommandResult::UnknownVm) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected an unknown machine error, got {other:?}"
        ))),
    }
}

#[then("the command fails with a provider error")]
fn fails_provider(monitor_context: &MonitorContext) -> Result<(), StepError> {
    match monitor_context.command.as_ref() {
        Some(CommandResult::Failure(message)) if message.contains("provider rejected") => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a provider failure, got {other:?}"
        ))),
    }
}
