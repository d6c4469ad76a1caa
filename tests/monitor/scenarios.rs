//! BDD scenarios for reconciliation ticks and power commands.

use rstest_bdd_macros::scenario;

use super::test_helpers::{MonitorContext, monitor_context};

#[scenario(
    path = "tests/features/reconciliation.feature",
    name = "Two subscriptions with stable machines"
)]
fn scenario_stable_machines(monitor_context: MonitorContext) {
    let _ = monitor_context;
}

#[scenario(
    path = "tests/features/reconciliation.feature",
    name = "A transitioning machine accelerates polling"
)]
fn scenario_transition_accelerates(monitor_context: MonitorContext) {
    let _ = monitor_context;
}

#[scenario(
    path = "tests/features/reconciliation.feature",
    name = "One failing subscription does not block another"
)]
fn scenario_failure_isolated(monitor_context: MonitorContext) {
    let _ = monitor_context;
}

#[scenario(
    path = "tests/features/reconciliation.feature",
    name = "A machine without a power status is not found"
)]
fn scenario_missing_status(monitor_context: MonitorContext) {
    let _ = monitor_context;
}

#[scenario(
    path = "tests/features/commands.feature",
    name = "Stopping a running machine"
)]
fn scenario_stop_running(monitor_context: MonitorContext) {
    let _ = monitor_context;
}

#[scenario(
    path = "tests/features/commands.feature",
    name = "Starting a deallocated machine"
)]
fn scenario_start_deallocated(monitor_context: MonitorContext) {
    let _ = monitor_context;
}

#[scenario(
    path = "tests/features/commands.feature",
    name = "Ignoring a machine that is already changing"
)]
fn scenario_ignore_changing(monitor_context: MonitorContext) {
    let _ = monitor_context;
}

#[scenario(
    path = "tests/features/commands.feature",
    name = "Rejecting an unknown machine"
)]
fn scenario_unknown_machine(monitor_context: MonitorContext) {
    let _ = monitor_context;
}

#[scenario(
    path = "tests/features/commands.feature",
    name = "A rejected request still schedules a confirming tick"
)]
fn scenario_rejected_request(monitor_context: MonitorContext) {
    let _ = monitor_context;
}
