//! The session core: a store holding the single current session, the
//! reconciler that applies server events to it, and the dispatcher that turns
//! user intents into commands.

pub mod dispatcher;
pub mod reconciler;
pub mod store;

pub use dispatcher::{CommandDispatcher, DEFAULT_ACK_TIMEOUT, Dispatch};
pub use reconciler::Reconciler;
pub use store::{NotCurrent, PendingRequest, SessionPhase, SessionSnapshot, SessionStore};
