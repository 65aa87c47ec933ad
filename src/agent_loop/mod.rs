//! Agent loop primitives (runs, events, approvals, session log).

pub mod approvals;
pub mod events;
pub mod runner;
pub mod session_log;
pub mod types;

pub use approvals::*;
pub use events::*;
pub use runner::*;
pub use session_log::*;
pub use types::*;
