//! chatterbox server: TCP plumbing around the core session engine.
//!
//! - [`codec`] frames the inbound byte stream into command lines
//! - [`session`] runs one connection: join, inbound and delivery workers, teardown
//! - [`listener`] binds the listening socket and spawns a session per connection

pub mod codec;
pub mod listener;
pub mod session;

pub use listener::{ServerHandle, start_server};
pub use session::{ExitReason, Session, SessionError, SessionPhase};
