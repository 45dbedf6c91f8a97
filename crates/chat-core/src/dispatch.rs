//! Command dispatch: validation rules and their effect on the registry.
//!
//! The dispatcher is synchronous and never touches a socket. It mutates the
//! shared [`Registry`], enqueues messages into other users' mailboxes, and
//! returns the direct replies for the invoking session as an [`Outcome`].
//! A rejected command yields exactly one error line and changes nothing.

use std::net::SocketAddr;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::command::{Command, Verb};
use crate::identity::{ANONYMOUS, display_name, is_anonymous, is_valid_username};
use crate::message::Message;
use crate::protocol::{self, SERVER_SENDER};
use crate::registry::{SessionLink, SharedRegistry};

/// Reasons a command is refused. The `Display` text is the reply reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Username cannot be anonymous.")]
    NameIsKeyword,

    #[error("{0} has been used by others.")]
    NameInUse(String),

    #[error("Username can only consists of 2~12 English letters.")]
    NameInvalid,

    #[error("Usage: tell <username> <message>")]
    TellUsage,

    #[error("You are anonymous.")]
    SenderAnonymous,

    #[error("The client to which you sent is anonymous.")]
    ReceiverAnonymous,

    #[error("The receiver doesn't exist.")]
    ReceiverMissing,

    #[error("Error command.")]
    UnknownCommand,
}

/// What the invoking session must do after a command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    /// Lines to write back to the invoking session, in order.
    pub replies: Vec<String>,
    /// Whether the session asked to disconnect.
    pub disconnect: bool,
}

impl Outcome {
    fn reply(line: String) -> Self {
        Self {
            replies: vec![line],
            disconnect: false,
        }
    }

    fn rejected(reason: Rejection) -> Self {
        Self::reply(protocol::error(reason))
    }

    fn silent() -> Self {
        Self::default()
    }

    fn disconnect() -> Self {
        Self {
            replies: Vec::new(),
            disconnect: true,
        }
    }
}

/// Per-session data the dispatcher reads and, on rename, updates.
///
/// Owned by the session's inbound worker; never shared.
#[derive(Debug, Clone)]
pub struct SessionContext {
    identity: String,
    link: SessionLink,
}

impl SessionContext {
    pub fn new(identity: impl Into<String>, link: SessionLink) -> Self {
        Self {
            identity: identity.into(),
            link,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn link(&self) -> &SessionLink {
        &self.link
    }

    pub fn peer(&self) -> SocketAddr {
        self.link.peer()
    }
}

/// Maps parsed commands to registry effects and replies.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: SharedRegistry,
}

impl Dispatcher {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Execute `command` on behalf of `session`.
    pub fn dispatch(&self, session: &mut SessionContext, command: Command) -> Outcome {
        debug!(
            identity = %session.identity,
            verb = command.verb.as_str(),
            "Dispatching command"
        );
        match command.verb {
            Verb::Who => self.who(session),
            Verb::Name => self.name(session, command.args.trim()),
            Verb::Tell => self.tell(session, &command.args),
            Verb::Yell => self.yell(session, &command.args),
            Verb::Exit => Outcome::disconnect(),
            Verb::Unknown(verb) => {
                info!(identity = %session.identity, %verb, "Unknown command");
                Outcome::rejected(Rejection::UnknownCommand)
            }
        }
    }

    fn who(&self, session: &SessionContext) -> Outcome {
        let replies = self
            .registry
            .list()
            .into_iter()
            .map(|p| protocol::who_entry(&p.identity, p.peer, p.session == session.link.id()))
            .collect();
        Outcome {
            replies,
            disconnect: false,
        }
    }

    fn name(&self, session: &mut SessionContext, new: &str) -> Outcome {
        if new == ANONYMOUS {
            return reject(session, Rejection::NameIsKeyword);
        }
        if new == session.identity {
            return Outcome::reply(protocol::renamed_to_self(new));
        }

        let old = session.identity.clone();
        let link = session.link.clone();
        let renamed = self.registry.atomically(|dir| {
            if dir.contains(new) {
                return Err(Rejection::NameInUse(new.to_string()));
            }
            if !is_valid_username(new) {
                return Err(Rejection::NameInvalid);
            }
            if !dir.register(new, link.clone()) {
                error!(identity = %old, requested = new, "Name vanished from registry check");
                return Err(Rejection::NameInUse(new.to_string()));
            }
            if !dir.unregister_session(&old, link.id()) {
                error!(
                    identity = %old,
                    session = %link.id(),
                    "Renaming session was not registered"
                );
            }
            dir.broadcast(|recipient| {
                let line = if recipient == new {
                    protocol::renamed_to_self(new)
                } else {
                    protocol::renamed_to_others(&old, new)
                };
                Some(Message::notice(SERVER_SENDER, &line))
            });
            Ok(())
        });

        match renamed {
            Ok(()) => {
                info!(from = %old, to = new, "Identity renamed");
                session.identity = new.to_string();
                Outcome::silent()
            }
            Err(reason) => reject(session, reason),
        }
    }

    fn tell(&self, session: &SessionContext, args: &str) -> Outcome {
        let Some((target, text)) = args.split_once(' ') else {
            return reject(session, Rejection::TellUsage);
        };
        if text.trim().is_empty() {
            return reject(session, Rejection::TellUsage);
        }
        if is_anonymous(&session.identity) {
            return reject(session, Rejection::SenderAnonymous);
        }
        if target == ANONYMOUS || is_anonymous(target) {
            return reject(session, Rejection::ReceiverAnonymous);
        }
        if !self
            .registry
            .enqueue(target, Message::tell(session.identity.as_str(), text))
        {
            return reject(session, Rejection::ReceiverMissing);
        }
        debug!(from = %session.identity, to = target, "Message queued");
        Outcome::reply(protocol::tell_sent())
    }

    fn yell(&self, session: &SessionContext, text: &str) -> Outcome {
        let line = protocol::yells(&session.identity, text);
        let sent = self
            .registry
            .broadcast(|_| Some(Message::notice(session.identity.as_str(), &line)));
        debug!(from = display_name(&session.identity), recipients = sent, "Yell broadcast");
        Outcome::silent()
    }
}

fn reject(session: &SessionContext, reason: Rejection) -> Outcome {
    debug!(identity = %session.identity, %reason, "Command rejected");
    Outcome::rejected(reason)
}
