//! Monitor behaviour scenarios.

mod bdd_steps;
mod scenarios;
mod test_helpers;
