//! One connected client.
//!
//! A session moves through `Connecting → Active → Closing → Closed`:
//!
//! - **Connecting**: allocate an anonymous identity, register it, and tell
//!   everyone else that someone is coming (one registry critical section).
//! - **Active**: two workers run concurrently. The inbound worker reads and
//!   dispatches command lines; the delivery worker is the only writer to the
//!   connection and drains this session's mailbox plus the inbound worker's
//!   direct replies.
//! - **Closing**: entered on end of stream, read error, `exit`, write failure
//!   or server shutdown. The exit token is cancelled, the identity is removed
//!   and a departure notice broadcast, then the connection is released.
//! - **Closed**: both workers have returned.
//!
//! The inbound worker owns the identity and publishes renames over a
//! `watch` channel; the delivery worker only reads it.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use chatterbox_core::config::{ServerConfig, SessionConfig};
use chatterbox_core::protocol::{self, SERVER_SENDER};
use chatterbox_core::{
    Command, Dispatcher, IdentityAllocator, IdentityError, Message, SessionContext, SessionLink,
    SharedRegistry,
};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{Frame, LineCodec};

/// How long a closing session may spend writing replies that were already
/// queued before the connection is released.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Errors that end a session before it becomes active.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why an active session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The peer closed its side of the stream.
    PeerClosed,
    /// The client sent `exit`.
    ExitCommand,
    /// Reading from the connection failed.
    ReadFailed,
    /// Writing to the connection failed.
    WriteFailed,
    /// The session's exit token was cancelled from outside (server shutdown).
    Cancelled,
}

/// A single client connection bound to the shared registry.
pub struct Session {
    peer: SocketAddr,
    registry: SharedRegistry,
    settings: SessionConfig,
    allocator: IdentityAllocator,
    exit: CancellationToken,
    phase: SessionPhase,
}

impl Session {
    /// Create a session for a connection from `peer`.
    ///
    /// Cancelling `exit` tears the session down as if the peer had left.
    pub fn new(
        peer: SocketAddr,
        registry: SharedRegistry,
        config: &ServerConfig,
        exit: CancellationToken,
    ) -> Self {
        Self {
            peer,
            registry,
            settings: config.session.clone(),
            allocator: IdentityAllocator::new(config.identity.max_attempts),
            exit,
            phase: SessionPhase::Connecting,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Drive the session over `stream` until it closes.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Identity`] if no unique identity could be
    /// allocated; the connection is closed without joining.
    pub async fn run<S>(mut self, stream: S) -> Result<ExitReason, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let link = SessionLink::new(self.peer);
        let identity = match self.join(&link) {
            Ok(identity) => identity,
            Err(e) => {
                error!(peer = %self.peer, "Identity allocation failed: {e}");
                self.advance(SessionPhase::Closed);
                return Err(e.into());
            }
        };
        info!(peer = %self.peer, %identity, session = %link.id(), "Session joined");

        let (reader, writer) = tokio::io::split(stream);
        let (identity_tx, identity_rx) = watch::channel(identity.clone());
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        // Queued before the delivery worker starts, so it is written first.
        let _ = reply_tx.send(protocol::greeting(&identity, self.peer));

        let delivery = DeliveryWorker {
            writer,
            registry: self.registry.clone(),
            link: link.clone(),
            identity: identity_rx,
            replies: reply_rx,
            exit: self.exit.clone(),
            poll: self.settings.delivery_poll(),
        };
        let inbound = InboundWorker {
            frames: FramedRead::new(reader, LineCodec::new(self.settings.max_line_length)),
            dispatcher: Dispatcher::new(self.registry.clone()),
            context: SessionContext::new(identity, link),
            identity: identity_tx,
            replies: reply_tx,
            exit: self.exit.clone(),
        };

        self.advance(SessionPhase::Active);
        let delivery_task = tokio::spawn(delivery.run());
        let (context, mut reason) = inbound.run().await;

        self.advance(SessionPhase::Closing);
        self.exit.cancel();
        self.leave(&context);

        match delivery_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(identity = context.identity(), "Delivery ended with error: {e}");
                if reason == ExitReason::Cancelled {
                    reason = ExitReason::WriteFailed;
                }
            }
            Err(e) => error!(identity = context.identity(), "Delivery worker panicked: {e}"),
        }

        self.advance(SessionPhase::Closed);
        info!(
            peer = %self.peer,
            identity = context.identity(),
            reason = ?reason,
            "Session closed"
        );
        Ok(reason)
    }

    /// Allocate, register and announce a new identity in one critical section.
    fn join(&self, link: &SessionLink) -> Result<String, IdentityError> {
        let coming = protocol::someone_is_coming();
        self.registry.atomically(|dir| {
            let identity = self.allocator.allocate(|candidate| dir.contains(candidate))?;
            if !dir.register(&identity, link.clone()) {
                error!(%identity, "Freshly allocated identity already registered");
            }
            dir.broadcast(|recipient| {
                (recipient != identity).then(|| Message::notice(SERVER_SENDER, &coming))
            });
            Ok(identity)
        })
    }

    /// Remove this session's identity and announce the departure.
    fn leave(&self, context: &SessionContext) {
        let identity = context.identity();
        let notice = protocol::offline(identity);
        let removed = self.registry.atomically(|dir| {
            if !dir.unregister_session(identity, context.link().id()) {
                return false;
            }
            dir.broadcast(|_| Some(Message::notice(SERVER_SENDER, &notice)));
            true
        });
        if !removed {
            warn!(
                %identity,
                session = %context.link().id(),
                "Session was not registered at teardown"
            );
        }
    }

    fn advance(&mut self, next: SessionPhase) {
        if next <= self.phase {
            error!(peer = %self.peer, from = ?self.phase, to = ?next, "Invalid session transition");
            return;
        }
        debug!(peer = %self.peer, from = ?self.phase, to = ?next, "Session transition");
        self.phase = next;
    }
}

/// Reads command lines and dispatches them.
struct InboundWorker<S> {
    frames: FramedRead<ReadHalf<S>, LineCodec>,
    dispatcher: Dispatcher,
    context: SessionContext,
    identity: watch::Sender<String>,
    replies: mpsc::UnboundedSender<String>,
    exit: CancellationToken,
}

impl<S: AsyncRead> InboundWorker<S> {
    async fn run(mut self) -> (SessionContext, ExitReason) {
        let reason = self.read_loop().await;
        debug!(identity = self.context.identity(), ?reason, "Inbound worker stopped");
        (self.context, reason)
    }

    async fn read_loop(&mut self) -> ExitReason {
        loop {
            let frame = tokio::select! {
                _ = self.exit.cancelled() => return ExitReason::Cancelled,
                frame = self.frames.next() => frame,
            };

            match frame {
                None => return ExitReason::PeerClosed,
                Some(Err(e)) => {
                    warn!(identity = self.context.identity(), "Read failed: {e}");
                    return ExitReason::ReadFailed;
                }
                Some(Ok(Frame::Overlong)) => {
                    debug!(identity = self.context.identity(), "Discarding overlong line");
                    if !self.reply(protocol::line_too_long()) {
                        return ExitReason::WriteFailed;
                    }
                }
                Some(Ok(Frame::Line(line))) => {
                    let Some(command) = Command::parse(&line) else {
                        continue;
                    };
                    let outcome = self.dispatcher.dispatch(&mut self.context, command);
                    self.publish_identity();
                    for line in outcome.replies {
                        if !self.reply(line) {
                            return ExitReason::WriteFailed;
                        }
                    }
                    if outcome.disconnect {
                        return ExitReason::ExitCommand;
                    }
                }
            }
        }
    }

    /// Hand a reply to the delivery worker; `false` once it has stopped.
    fn reply(&self, line: String) -> bool {
        self.replies.send(line).is_ok()
    }

    fn publish_identity(&self) {
        let current = self.context.identity();
        self.identity.send_if_modified(|published| {
            if published == current {
                return false;
            }
            *published = current.to_string();
            true
        });
    }
}

/// Sole writer to the connection.
struct DeliveryWorker<S> {
    writer: WriteHalf<S>,
    registry: SharedRegistry,
    link: SessionLink,
    identity: watch::Receiver<String>,
    replies: mpsc::UnboundedReceiver<String>,
    exit: CancellationToken,
    poll: Option<Duration>,
}

impl<S: AsyncWrite> DeliveryWorker<S> {
    async fn run(mut self) -> io::Result<()> {
        let result = match self.deliver_loop().await {
            // A write cut short by the exit token is a normal close.
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionAborted && self.exit.is_cancelled() =>
            {
                debug!("Pending write abandoned on close");
                Ok(())
            }
            other => other,
        };
        if let Err(e) = &result {
            let identity = self.identity.borrow().clone();
            warn!(%identity, "Write failed: {e}");
            self.exit.cancel();
        }
        match tokio::time::timeout(CLOSE_GRACE, self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Connection shutdown failed: {e}"),
            Err(_) => debug!("Connection shutdown timed out"),
        }
        result
    }

    async fn deliver_loop(&mut self) -> io::Result<()> {
        let mut ticker = self.poll.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        loop {
            tokio::select! {
                biased;
                _ = self.exit.cancelled() => return self.flush_replies().await,
                _ = self.link.notified() => self.flush_mailbox().await?,
                reply = self.replies.recv() => match reply {
                    Some(line) => self.write(line.as_bytes()).await?,
                    None => return Ok(()),
                },
                changed = self.identity.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    self.flush_mailbox().await?;
                }
                _ = tick(&mut ticker) => self.flush_mailbox().await?,
            }
        }
    }

    /// Write and flush `bytes`, giving up as soon as the session closes.
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let writer = &mut self.writer;
        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        tokio::select! {
            biased;
            result = write => result,
            _ = self.exit.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session closing",
            )),
        }
    }

    /// Write replies queued before the session started closing, within
    /// [`CLOSE_GRACE`].
    async fn flush_replies(&mut self) -> io::Result<()> {
        let mut pending = String::new();
        while let Ok(line) = self.replies.try_recv() {
            pending.push_str(&line);
        }
        if pending.is_empty() {
            return Ok(());
        }
        let writer = &mut self.writer;
        let write = async {
            writer.write_all(pending.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(CLOSE_GRACE, write).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Dropping replies to a peer that is not reading");
                Ok(())
            }
        }
    }

    async fn flush_mailbox(&mut self) -> io::Result<()> {
        let identity = self.identity.borrow_and_update().clone();
        let batch = self.registry.drain_session(&identity, self.link.id());
        if batch.is_empty() {
            return Ok(());
        }
        debug!(%identity, count = batch.len(), "Delivering messages");
        let rendered: String = batch.iter().map(Message::render).collect();
        self.write(rendered.as_bytes()).await
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatterbox_core::identity::{ANONYMOUS, is_anonymous};
    use chatterbox_core::registry::new_registry;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn peer() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    struct Client {
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn line(&mut self) -> Option<String> {
            tokio::time::timeout(TIMEOUT, self.lines.next_line())
                .await
                .expect("timed out waiting for a server line")
                .unwrap()
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn spawn_session(
        registry: &SharedRegistry,
        config: &ServerConfig,
    ) -> (
        Client,
        CancellationToken,
        tokio::task::JoinHandle<Result<ExitReason, SessionError>>,
    ) {
        let (client, server) = tokio::io::duplex(4096);
        let exit = CancellationToken::new();
        let session = Session::new(peer(), registry.clone(), config, exit.clone());
        let task = tokio::spawn(session.run(server));
        let (read, writer) = tokio::io::split(client);
        let client = Client {
            lines: BufReader::new(read).lines(),
            writer,
        };
        (client, exit, task)
    }

    async fn finish(
        task: tokio::task::JoinHandle<Result<ExitReason, SessionError>>,
    ) -> ExitReason {
        tokio::time::timeout(TIMEOUT, task)
            .await
            .expect("session did not finish")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_session_greets_with_anonymous_identity() {
        let registry = new_registry();
        let (mut client, _exit, task) = spawn_session(&registry, &ServerConfig::default());

        let greeting = client.line().await.unwrap();
        assert!(greeting.starts_with("[Server] Hello, anonymous"), "{greeting}");
        assert!(greeting.ends_with("! From: 192.0.2.10:40000"), "{greeting}");

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert!(is_anonymous(&listed[0].identity));
        assert!(listed[0].identity.len() > 15);
        assert!(greeting.contains(&listed[0].identity));

        drop(client);
        assert_eq!(finish(task).await, ExitReason::PeerClosed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_join_and_leave_are_announced_to_others() {
        let registry = new_registry();
        let bob = SessionLink::new("192.0.2.11:40001".parse().unwrap());
        registry.register("Bob", bob.clone());

        let (mut client, _exit, task) = spawn_session(&registry, &ServerConfig::default());
        client.line().await.unwrap();
        client.send("exit\n").await;

        assert_eq!(finish(task).await, ExitReason::ExitCommand);
        let bob_inbox: Vec<String> = registry.drain("Bob").iter().map(Message::render).collect();
        assert_eq!(
            bob_inbox,
            vec![
                "[Server] Someone is coming!\n".to_string(),
                format!("[Server] {ANONYMOUS} is offline.\n"),
            ]
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_replies_and_mailbox_reach_the_client() {
        let registry = new_registry();
        let (mut client, _exit, task) = spawn_session(&registry, &ServerConfig::default());
        client.line().await.unwrap();

        client.send("who\n").await;
        let who = client.line().await.unwrap();
        assert!(who.ends_with("192.0.2.10:40000 ->me"), "{who}");

        client.send("name Alice\n").await;
        assert_eq!(
            client.line().await.unwrap(),
            "[Server] You're now known as Alice."
        );
        assert!(registry.contains("Alice"));

        client.send("yell hello\n").await;
        assert_eq!(client.line().await.unwrap(), "[Server] Alice yells hello");

        drop(client);
        finish(task).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_mail_arriving_after_rename_is_delivered() {
        let registry = new_registry();
        let (mut client, _exit, task) = spawn_session(&registry, &ServerConfig::default());
        client.line().await.unwrap();

        client.send("name Bob\n").await;
        client.line().await.unwrap();

        let alice = SessionLink::new("192.0.2.12:40002".parse().unwrap());
        registry.register("Alice", alice);
        assert!(registry.enqueue("Bob", Message::tell("Alice", "hi")));
        assert_eq!(client.line().await.unwrap(), "[SERVER] Alice tells you hi");

        drop(client);
        finish(task).await;
    }

    #[tokio::test]
    async fn test_overlong_line_is_rejected_without_disconnect() {
        let registry = new_registry();
        let mut config = ServerConfig::default();
        config.session.max_line_length = 16;
        let (mut client, _exit, task) = spawn_session(&registry, &config);
        client.line().await.unwrap();

        client.send(&format!("yell {}\n", "x".repeat(64))).await;
        assert_eq!(client.line().await.unwrap(), "[Server] ERROR: Line too long.");

        client.send("bogus\n").await;
        assert_eq!(client.line().await.unwrap(), "[Server] ERROR: Error command.");

        drop(client);
        assert_eq!(finish(task).await, ExitReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_replies_queued_before_exit_are_written() {
        let registry = new_registry();
        let (mut client, _exit, task) = spawn_session(&registry, &ServerConfig::default());
        client.line().await.unwrap();

        client.send("who\nexit\n").await;
        let who = client.line().await.unwrap();
        assert!(who.ends_with(" ->me"), "{who}");
        assert_eq!(client.line().await, None);
        assert_eq!(finish(task).await, ExitReason::ExitCommand);
    }

    #[tokio::test]
    async fn test_cancel_finishes_while_peer_is_not_reading() {
        let registry = new_registry();
        let (client, server) = tokio::io::duplex(256);
        let exit = CancellationToken::new();
        let session = Session::new(
            peer(),
            registry.clone(),
            &ServerConfig::default(),
            exit.clone(),
        );
        let task = tokio::spawn(session.run(server));

        let registry_ref = registry.clone();
        tokio::time::timeout(TIMEOUT, async move {
            while registry_ref.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let identity = registry.list()[0].identity.clone();
        for i in 0..200 {
            let line = format!("[Server] notice number {i}");
            registry.enqueue(&identity, Message::notice(SERVER_SENDER, &line));
        }
        // Let the delivery worker fill the pipe and block on the write.
        tokio::time::sleep(Duration::from_millis(50)).await;

        exit.cancel();
        let reason = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("session stuck behind a blocked write")
            .unwrap()
            .unwrap();
        assert_eq!(reason, ExitReason::Cancelled);
        assert!(registry.is_empty());
        drop(client);
    }

    #[tokio::test]
    async fn test_mail_is_not_starved_by_a_command_burst() {
        let registry = new_registry();
        let (mut client, _exit, task) = spawn_session(&registry, &ServerConfig::default());
        client.line().await.unwrap();
        let identity = registry.list()[0].identity.clone();

        client.send(&"dance\n".repeat(200)).await;
        registry.enqueue(&identity, Message::notice(SERVER_SENDER, "[Server] mail"));

        let mut position = None;
        for i in 0..201 {
            if client.line().await.unwrap() == "[Server] mail" {
                position = Some(i);
                break;
            }
        }
        let position = position.expect("mail never delivered");
        assert!(position < 200, "mail arrived after every reply");

        drop(client);
        finish(task).await;
    }

    #[test]
    fn test_identity_exhaustion_is_a_session_error() {
        let err = SessionError::from(IdentityError::Exhausted { attempts: 3 });
        assert!(matches!(err, SessionError::Identity(_)));
        assert!(err.to_string().contains('3'), "{err}");
    }

    #[tokio::test]
    async fn test_cancellation_tears_down_session() {
        let registry = new_registry();
        let (mut client, exit, task) = spawn_session(&registry, &ServerConfig::default());
        client.line().await.unwrap();

        exit.cancel();
        assert_eq!(finish(task).await, ExitReason::Cancelled);
        assert!(registry.is_empty());
        assert_eq!(client.line().await, None);
    }

    #[tokio::test]
    async fn test_delivery_without_polling() {
        let registry = new_registry();
        let mut config = ServerConfig::default();
        config.session.delivery_poll_ms = 0;
        let (mut client, _exit, task) = spawn_session(&registry, &config);
        client.line().await.unwrap();

        client.send("name Carol\n").await;
        assert_eq!(
            client.line().await.unwrap(),
            "[Server] You're now known as Carol."
        );
        registry.enqueue("Carol", Message::notice(SERVER_SENDER, "[Server] ping"));
        assert_eq!(client.line().await.unwrap(), "[Server] ping");

        drop(client);
        finish(task).await;
    }

    #[test]
    fn test_phase_transitions_are_monotonic() {
        let mut session = Session::new(
            peer(),
            new_registry(),
            &ServerConfig::default(),
            CancellationToken::new(),
        );
        assert_eq!(session.phase(), SessionPhase::Connecting);
        session.advance(SessionPhase::Active);
        session.advance(SessionPhase::Connecting);
        assert_eq!(session.phase(), SessionPhase::Active);
        session.advance(SessionPhase::Closed);
        assert_eq!(session.phase(), SessionPhase::Closed);
    }
}
