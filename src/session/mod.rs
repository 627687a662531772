//! Session model: identifiers, states, snapshots and the per-session state
//! machine.

pub mod state;
pub mod types;

pub use state::{SessionMachine, Transition};
pub use types::{CallerContext, FocusContext, SessionId, SessionSnapshot, SessionState};
