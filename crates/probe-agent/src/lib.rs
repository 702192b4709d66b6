//! Worker units for probe sessions.
//!
//! A worker is a bounded reasoning/action loop behind the [`WorkerUnit`]
//! trait. It reads derived session state, talks to external capabilities
//! through [`ActionExecutor`] and [`ReasoningProvider`], and returns event
//! drafts for the orchestrator to append.

pub mod action_loop;
pub mod capability;
pub mod config;
pub mod errors;
pub mod healing;
pub mod testing;
pub mod worker;
pub mod workers;

pub use action_loop::*;
pub use capability::*;
pub use config::*;
pub use errors::*;
pub use healing::*;
pub use worker::*;
pub use workers::*;
