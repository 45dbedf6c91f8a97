//! Session registry: the mailbox directory shared by all connections.
//!
//! The registry maps each live identity to its FIFO mailbox and to a
//! [`SessionLink`] describing the owning session. It is the single source of
//! truth for "who is online".
//!
//! ## Locking
//!
//! [`Directory`] holds the data and is not synchronized. [`Registry`] wraps it
//! in one mutex; every public `Registry` method is a single critical section.
//! Compound operations (rename, join, leave) use [`Registry::atomically`] to
//! run several `Directory` primitives under one lock acquisition, so no other
//! session can observe a half-applied change. Nothing in this module performs
//! I/O while the lock is held.
//!
//! ## Wake-ups
//!
//! Each session owns a [`tokio::sync::Notify`] shared through its link.
//! Enqueueing a message notifies only the recipient's handle.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::message::Message;

/// Process-unique identifier of a connected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next unused session id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only view of a session held by the registry.
///
/// The registry never references session memory directly; it only keeps
/// the data needed for `who` and a handle to wake the session's delivery
/// worker.
#[derive(Debug, Clone)]
pub struct SessionLink {
    id: SessionId,
    peer: SocketAddr,
    wake: Arc<Notify>,
}

impl SessionLink {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: SessionId::next(),
            peer,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Wait until a message is enqueued for this session.
    ///
    /// A notification sent while nobody waits is stored, so a wake-up is
    /// never lost between a drain and the next wait.
    pub async fn notified(&self) {
        self.wake.notified().await;
    }

    fn wake(&self) {
        self.wake.notify_one();
    }
}

/// One row of a `who` snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub identity: String,
    pub peer: SocketAddr,
    pub session: SessionId,
}

#[derive(Debug)]
struct Entry {
    mailbox: VecDeque<Message>,
    link: SessionLink,
}

/// Unsynchronized identity → (mailbox, session link) map.
///
/// Obtained only through [`Registry::atomically`].
#[derive(Debug, Default)]
pub struct Directory {
    entries: BTreeMap<String, Entry>,
}

impl Directory {
    /// Insert `identity` with an empty mailbox.
    ///
    /// Returns `false` and changes nothing if the identity already exists.
    pub fn register(&mut self, identity: &str, link: SessionLink) -> bool {
        if self.entries.contains_key(identity) {
            return false;
        }
        self.entries.insert(
            identity.to_string(),
            Entry {
                mailbox: VecDeque::new(),
                link,
            },
        );
        true
    }

    /// Remove `identity` and drop any messages still queued for it.
    pub fn unregister(&mut self, identity: &str) -> bool {
        self.entries.remove(identity).is_some()
    }

    /// Remove `identity` only if it is still held by `session`.
    pub fn unregister_session(&mut self, identity: &str, session: SessionId) -> bool {
        if self.owner(identity) != Some(session) {
            return false;
        }
        self.unregister(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    /// Session currently holding `identity`.
    pub fn owner(&self, identity: &str) -> Option<SessionId> {
        self.entries.get(identity).map(|entry| entry.link.id)
    }

    /// Append `message` to the mailbox of `identity` and wake its session.
    ///
    /// Returns `false` if the identity is not registered.
    pub fn enqueue(&mut self, identity: &str, message: Message) -> bool {
        match self.entries.get_mut(identity) {
            Some(entry) => {
                entry.mailbox.push_back(message);
                entry.link.wake();
                true
            }
            None => false,
        }
    }

    /// Enqueue one message per registered identity.
    ///
    /// `factory` receives the recipient identity and returns the message for
    /// it, or `None` to skip that recipient. Returns the number of messages
    /// enqueued.
    pub fn broadcast<F>(&mut self, mut factory: F) -> usize
    where
        F: FnMut(&str) -> Option<Message>,
    {
        let mut sent = 0;
        for (identity, entry) in &mut self.entries {
            if let Some(message) = factory(identity) {
                entry.mailbox.push_back(message);
                entry.link.wake();
                sent += 1;
            }
        }
        sent
    }

    /// Snapshot of every registered identity, ordered by identity.
    pub fn list(&self) -> Vec<Presence> {
        self.entries
            .iter()
            .map(|(identity, entry)| Presence {
                identity: identity.clone(),
                peer: entry.link.peer,
                session: entry.link.id,
            })
            .collect()
    }

    /// Remove and return every message queued for `identity`, oldest first.
    pub fn drain(&mut self, identity: &str) -> Vec<Message> {
        self.entries
            .get_mut(identity)
            .map(|entry| entry.mailbox.drain(..).collect())
            .unwrap_or_default()
    }

    /// Like [`drain`](Self::drain), but only if `session` holds `identity`.
    pub fn drain_session(&mut self, identity: &str, session: SessionId) -> Vec<Message> {
        if self.owner(identity) != Some(session) {
            return Vec::new();
        }
        self.drain(identity)
    }

    /// Number of messages waiting for `identity`.
    pub fn pending(&self, identity: &str) -> usize {
        self.entries
            .get(identity)
            .map_or(0, |entry| entry.mailbox.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Thread-safe mailbox directory.
///
/// Share with `Arc<Registry>`; see [`new_registry`].
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Directory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        // A panicking holder cannot leave the map structurally broken, so a
        // poisoned lock is still usable by every other session.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with exclusive access to the directory.
    ///
    /// `f` must not block or await.
    pub fn atomically<R>(&self, f: impl FnOnce(&mut Directory) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn register(&self, identity: &str, link: SessionLink) -> bool {
        self.lock().register(identity, link)
    }

    pub fn unregister(&self, identity: &str) -> bool {
        self.lock().unregister(identity)
    }

    pub fn unregister_session(&self, identity: &str, session: SessionId) -> bool {
        self.lock().unregister_session(identity, session)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.lock().contains(identity)
    }

    pub fn enqueue(&self, identity: &str, message: Message) -> bool {
        self.lock().enqueue(identity, message)
    }

    pub fn broadcast<F>(&self, factory: F) -> usize
    where
        F: FnMut(&str) -> Option<Message>,
    {
        self.lock().broadcast(factory)
    }

    pub fn list(&self) -> Vec<Presence> {
        self.lock().list()
    }

    pub fn drain(&self, identity: &str) -> Vec<Message> {
        self.lock().drain(identity)
    }

    pub fn drain_session(&self, identity: &str, session: SessionId) -> Vec<Message> {
        self.lock().drain_session(identity, session)
    }

    pub fn pending(&self, identity: &str) -> usize {
        self.lock().pending(identity)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Shared, thread-safe registry handle.
pub type SharedRegistry = Arc<Registry>;

/// Create a new empty [`SharedRegistry`].
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn link(port: u16) -> SessionLink {
        SessionLink::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn notice(text: &str) -> Message {
        Message::notice("Server", text)
    }

    #[test]
    fn test_new_registry_is_empty() {
        let reg = Registry::new();
        assert!(reg.is_empty());
        assert_eq!(reg.len(), 0);
        assert!(reg.list().is_empty());
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let reg = Registry::new();
        assert!(reg.register("Alice", link(1)));
        assert!(!reg.register("Alice", link(2)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.list()[0].peer.port(), 1);
    }

    #[test]
    fn test_unregister() {
        let reg = Registry::new();
        reg.register("Alice", link(1));
        assert!(reg.unregister("Alice"));
        assert!(!reg.unregister("Alice"));
        assert!(!reg.contains("Alice"));
    }

    #[test]
    fn test_unregister_session_ignores_other_owner() {
        let reg = Registry::new();
        let first = link(1);
        let second = link(2);
        reg.register("Alice", second.clone());

        assert!(!reg.unregister_session("Alice", first.id()));
        assert!(reg.contains("Alice"));
        assert!(reg.unregister_session("Alice", second.id()));
        assert!(!reg.contains("Alice"));
    }

    #[test]
    fn test_enqueue_missing_identity_returns_false() {
        let reg = Registry::new();
        assert!(!reg.enqueue("Bob", notice("hi")));
    }

    #[test]
    fn test_drain_is_fifo_and_empties_mailbox() {
        let reg = Registry::new();
        reg.register("Bob", link(1));
        reg.enqueue("Bob", notice("one"));
        reg.enqueue("Bob", notice("two"));
        reg.enqueue("Bob", notice("three"));
        assert_eq!(reg.pending("Bob"), 3);

        let drained: Vec<String> = reg.drain("Bob").iter().map(Message::render).collect();
        assert_eq!(drained, vec!["one\n", "two\n", "three\n"]);
        assert!(reg.drain("Bob").is_empty());
        assert_eq!(reg.pending("Bob"), 0);
    }

    #[test]
    fn test_drain_session_requires_ownership() {
        let reg = Registry::new();
        let owner = link(1);
        let stranger = link(2);
        reg.register("Bob", owner.clone());
        reg.enqueue("Bob", notice("secret"));

        assert!(reg.drain_session("Bob", stranger.id()).is_empty());
        assert_eq!(reg.pending("Bob"), 1);
        assert_eq!(reg.drain_session("Bob", owner.id()).len(), 1);
    }

    #[test]
    fn test_unregister_drops_queued_messages() {
        let reg = Registry::new();
        reg.register("Bob", link(1));
        reg.enqueue("Bob", notice("lost"));
        reg.unregister("Bob");
        reg.register("Bob", link(2));
        assert_eq!(reg.pending("Bob"), 0);
    }

    #[test]
    fn test_broadcast_is_recipient_specific() {
        let reg = Registry::new();
        reg.register("Alice", link(1));
        reg.register("Bob", link(2));
        reg.register("Carol", link(3));

        let sent = reg.broadcast(|recipient| {
            (recipient != "Carol").then(|| notice(&format!("hello {recipient}")))
        });

        assert_eq!(sent, 2);
        assert_eq!(reg.drain("Alice")[0].render(), "hello Alice\n");
        assert_eq!(reg.drain("Bob")[0].render(), "hello Bob\n");
        assert!(reg.drain("Carol").is_empty());
    }

    #[test]
    fn test_list_snapshot_is_ordered() {
        let reg = Registry::new();
        reg.register("Carol", link(3));
        reg.register("Alice", link(1));
        reg.register("Bob", link(2));

        let names: Vec<String> = reg.list().into_iter().map(|p| p.identity).collect();
        assert_eq!(names, vec!["Alice", "Bob", "Carol"]);
    }

    #[test]
    fn test_atomically_composes_rename() {
        let reg = Registry::new();
        let alice = link(1);
        reg.register("anonymousAbC123xyZ9", alice.clone());

        let renamed = reg.atomically(|dir| {
            let ok = dir.register("Alice", alice.clone());
            dir.unregister_session("anonymousAbC123xyZ9", alice.id());
            ok
        });

        assert!(renamed);
        assert!(reg.contains("Alice"));
        assert!(!reg.contains("anonymousAbC123xyZ9"));
        assert_eq!(reg.atomically(|dir| dir.owner("Alice")), Some(alice.id()));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_only_recipient() {
        let reg = Registry::new();
        let alice = link(1);
        let bob = link(2);
        reg.register("Alice", alice.clone());
        reg.register("Bob", bob.clone());

        reg.enqueue("Bob", notice("ping"));

        tokio::time::timeout(Duration::from_millis(500), bob.notified())
            .await
            .expect("Bob should have been woken");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), alice.notified())
                .await
                .is_err(),
            "Alice must not be woken by Bob's mail"
        );
    }

    #[test]
    fn test_concurrent_registration_keeps_identities_unique() {
        let reg = new_registry();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || reg.register("Alice", link(i)))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(reg.len(), 1);
    }
}
