//! Command-line interface definitions for the `azpower` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `azpower` binary.
#[derive(Debug, Parser)]
#[command(
    name = "azpower",
    about = "Watch and toggle the power state of Azure virtual machines",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log level for diagnostics on stderr (overrides `RUST_LOG`).
    #[arg(long, global = true, value_name = "LEVEL")]
    pub(crate) log_level: Option<String>,
    /// Action to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `azpower`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Reconcile continuously and log every state change until interrupted.
    #[command(name = "watch", about = "Reconcile continuously until Ctrl-C")]
    Watch,
    /// Reconcile once and print one line per virtual machine.
    #[command(name = "list", about = "Reconcile once and print every machine")]
    List,
    /// Start a deallocated machine or stop a running one.
    #[command(name = "toggle", about = "Start a deallocated machine or stop a running one")]
    Toggle(ToggleCommand),
}

/// Arguments for the `azpower toggle` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ToggleCommand {
    /// Full resource id of the virtual machine.
    #[arg(value_name = "RESOURCE_ID")]
    pub(crate) resource_id: String,
}
