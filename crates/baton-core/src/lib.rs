//! Baton Core — step orchestration for multi-agent media pipelines.
//!
//! A workflow instance is a linear chain of steps kept in a step store.
//! Each step change produces an event; the [`orchestration::Dispatcher`]
//! re-reads the step and runs the handler registered for its name:
//!
//! - `init` expands the workflow definition into its successor chain
//! - `delegate` hands one prompt to an external agent and waits for it
//! - `fan_out` hands N prompts to an agent concurrently and joins them
//!
//! Every delegation is gated on the paying plan's credit balance. The core
//! talks to the outside only through the traits in [`ledger`] and [`store`],
//! so it runs unchanged against the REST ledger, the local SQLite store, or
//! in-memory fakes.

pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use config::BatonConfig;
pub use db::Database;
pub use error::BatonError;
pub use logging::TaskLogger;
pub use orchestration::{Collaborators, Dispatcher};
pub use workflow::{HandlerRegistry, WorkflowDefinition};
