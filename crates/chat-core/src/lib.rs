//! Core types and logic for chatterbox
//!
//! This crate holds everything about the chat service that does not touch a
//! socket:
//! - anonymous identity allocation and username rules
//! - the shared mailbox registry that maps live identities to sessions
//! - command parsing and dispatch
//! - the exact wording of every server-generated line
//! - configuration resolution and logging setup
//!
//! The `chatterbox-server` crate wires these pieces to TCP connections.

pub mod command;
pub mod config;
pub mod dispatch;
pub mod identity;
pub mod logging;
pub mod message;
pub mod protocol;
pub mod registry;

pub use command::{Command, Verb};
pub use dispatch::{Dispatcher, Outcome, Rejection, SessionContext};
pub use identity::{IdentityAllocator, IdentityError};
pub use message::{Message, MessageKind};
pub use registry::{Directory, Presence, Registry, SessionId, SessionLink, SharedRegistry};
