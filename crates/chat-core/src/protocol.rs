//! Wording of every line the server writes.
//!
//! Clients only rely on line termination, but the exact strings are kept
//! stable for compatibility with existing clients and scripts. Every function
//! returns a newline-terminated line.

use std::net::SocketAddr;

use crate::identity::display_name;

/// Sender recorded on server-originated notices.
pub const SERVER_SENDER: &str = "Server";

pub fn greeting(identity: &str, peer: SocketAddr) -> String {
    format!("[Server] Hello, {identity}! From: {}:{}\n", peer.ip(), peer.port())
}

pub fn someone_is_coming() -> String {
    "[Server] Someone is coming!\n".to_string()
}

pub fn who_entry(identity: &str, peer: SocketAddr, is_self: bool) -> String {
    let marker = if is_self { " ->me" } else { "" };
    format!("[Server] {identity} {}:{}{marker}\n", peer.ip(), peer.port())
}

pub fn renamed_to_others(old: &str, new: &str) -> String {
    format!("[Server] {} is now known as {new}.\n", display_name(old))
}

pub fn renamed_to_self(new: &str) -> String {
    format!("[Server] You're now known as {new}.\n")
}

/// `payload` is already newline-terminated.
pub fn tell_delivery(sender: &str, payload: &str) -> String {
    format!("[SERVER] {sender} tells you {payload}")
}

pub fn tell_sent() -> String {
    "[Server] SUCCESS: Your message has been sent.\n".to_string()
}

pub fn yells(sender: &str, text: &str) -> String {
    format!("[Server] {} yells {text}\n", display_name(sender))
}

pub fn offline(identity: &str) -> String {
    format!("[Server] {} is offline.\n", display_name(identity))
}

pub fn error(reason: impl std::fmt::Display) -> String {
    format!("[Server] ERROR: {reason}\n")
}

pub fn line_too_long() -> String {
    error("Line too long.")
}
