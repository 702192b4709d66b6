//! Multi-worker routing over a session event log.
//!
//! [`OrchestrationGraph`] routes a thread to registered workers, appends what
//! they produced, and checkpoints the thread state. [`SessionManager`] owns
//! open sessions, serializes steps per thread, and streams events.

pub mod checkpoint;
pub mod condition;
pub mod errors;
pub mod graph;
pub mod registry;
pub mod routing;
pub mod session;
pub mod stream;
pub mod thread;

pub use checkpoint::*;
pub use condition::Condition;
pub use errors::*;
pub use graph::*;
pub use registry::*;
pub use routing::*;
pub use session::*;
pub use stream::*;
pub use thread::*;
