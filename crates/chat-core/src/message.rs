//! Messages queued in a user's mailbox.

/// What a queued message represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Private message sent with `tell`.
    Tell,
    /// Server-originated notice (join, leave, rename, yell).
    BroadcastNotice,
}

/// An immutable message waiting for delivery.
///
/// Messages are cloned into each mailbox they are enqueued into, so a later
/// rename of the sender never changes an already queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: String,
    kind: MessageKind,
    payload: String,
}

impl Message {
    /// A private message from `sender` carrying `text`.
    pub fn tell(sender: impl Into<String>, text: &str) -> Self {
        Self {
            sender: sender.into(),
            kind: MessageKind::Tell,
            payload: terminated(text),
        }
    }

    /// A notice whose payload is the complete wire line.
    pub fn notice(sender: impl Into<String>, line: &str) -> Self {
        Self {
            sender: sender.into(),
            kind: MessageKind::BroadcastNotice,
            payload: terminated(line),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The newline-terminated line written to the recipient's connection.
    pub fn render(&self) -> String {
        match self.kind {
            MessageKind::Tell => crate::protocol::tell_delivery(&self.sender, &self.payload),
            MessageKind::BroadcastNotice => self.payload.clone(),
        }
    }
}

fn terminated(text: &str) -> String {
    let mut line = String::with_capacity(text.len() + 1);
    line.push_str(text);
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}
