//! QMP session: connection lifecycle, command correlation and the background reader.
//!
//! A [`Session`] is a cheap handle; clones share one connection. Callers issue
//! commands through it and observe everything else (run state, connectivity, pages,
//! clock ticks) by subscribing to [`Topic`]s. Runtime failures never surface as
//! errors. They show up as a `Connectivity(false)` notification and a terminal
//! [`RunState`], after which the caller decides whether to [`Session::reconnect`].

mod dispatch;
mod frame;
mod poller;
mod state;

pub use frame::{FrameError, FrameReader, MAX_FRAME_BYTES};
pub use poller::ClockPoller;
pub use state::{PageArrival, RunState, SessionEvent, SessionState, Topic};

use crate::memory::{PageSource, ReadRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use qmp_proto::{
    self as proto, CorrelationTag, Greeting, Inbound, ReadMemoryArgs, RequestKind, StatusInfo,
};
use rand::Rng;
use serde_json::Value;
use session_bus::{Bus, LocalBus};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

const REPLY_LOG_CAPACITY: usize = 64;
const TAG_MASK: u64 = 0x0fff_ffff_ffff_ffff;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub monitor_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_cap: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            monitor_timeout: Duration::from_secs(2),
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(200),
            reconnect_backoff_cap: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    pub fn with_connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    pub fn with_handshake_timeout(mut self, value: Duration) -> Self {
        self.handshake_timeout = value;
        self
    }

    pub fn with_monitor_timeout(mut self, value: Duration) -> Self {
        self.monitor_timeout = value;
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, backoff: Duration, cap: Duration) -> Self {
        self.reconnect_attempts = attempts.max(1);
        self.reconnect_backoff = backoff;
        self.reconnect_backoff_cap = cap.max(backoff);
        self
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },
    #[error("gave up reconnecting to {addr} after {attempts} attempts: {last}")]
    ReconnectExhausted {
        addr: String,
        attempts: u32,
        last: Box<SessionError>,
    },
}

/// A reply the reader still owes to a sent command.
struct PendingReply {
    kind: RequestKind,
    waiter: Option<oneshot::Sender<Option<Value>>>,
}

/// The newest memory read. Only a page echoing this tag is ever delivered.
#[derive(Debug, Clone)]
struct PendingRead {
    tag: CorrelationTag,
    request: ReadRequest,
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    state: Mutex<SessionState>,
    // Serializes connect, disconnect and reconnect against each other.
    lifecycle: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<VecDeque<PendingReply>>,
    page_slot: Mutex<Option<PendingRead>>,
    replies: Mutex<VecDeque<Value>>,
    close: Mutex<Option<watch::Sender<bool>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    peer: Mutex<Option<String>>,
    bus: LocalBus<SessionEvent>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                state: Mutex::new(SessionState::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                page_slot: Mutex::new(None),
                replies: Mutex::new(VecDeque::with_capacity(REPLY_LOG_CAPACITY)),
                close: Mutex::new(None),
                reader: Mutex::new(None),
                generation: AtomicU64::new(0),
                peer: Mutex::new(None),
                bus: LocalBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().ready
    }

    pub fn run_state(&self) -> RunState {
        self.inner.state.lock().running
    }

    pub fn banner(&self) -> Option<Greeting> {
        self.inner.state.lock().banner.clone()
    }

    /// Address of the last successful connect.
    pub fn peer(&self) -> Option<String> {
        self.inner.peer.lock().clone()
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<SessionEvent> {
        self.inner.bus.subscribe(topic)
    }

    /// Most recent replies, oldest first.
    pub fn recent_replies(&self) -> Vec<Value> {
        self.inner.replies.lock().iter().cloned().collect()
    }

    /// Open the control socket and run the capability/status handshake.
    ///
    /// On success the session is `ready`, `running` reflects the peer's status reply,
    /// and the background reader owns the read half. Any existing connection is
    /// closed first.
    pub async fn connect(&self, addr: &str) -> Result<(), SessionError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.teardown(None, RunState::Disconnected).await;
        self.inner.clone().open(addr).await
    }

    /// Close the connection. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.teardown(None, RunState::Disconnected).await;
    }

    /// Disconnect, then connect again with bounded attempts and doubling backoff.
    pub async fn reconnect(&self, addr: &str) -> Result<(), SessionError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.teardown(None, RunState::Disconnected).await;

        let attempts = self.inner.config.reconnect_attempts.max(1);
        let mut backoff = self.inner.config.reconnect_backoff;
        let mut last = None;
        for attempt in 1..=attempts {
            match self.inner.clone().open(addr).await {
                Ok(()) => {
                    info!(target: "vmpeek::session", addr, attempt, "reconnected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(target: "vmpeek::session", addr, attempt, error = %err, "reconnect attempt failed");
                    last = Some(err);
                }
            }
            if attempt < attempts {
                sleep(backoff).await;
                backoff = (backoff * 2).min(self.inner.config.reconnect_backoff_cap);
            }
        }
        Err(SessionError::ReconnectExhausted {
            addr: addr.to_string(),
            attempts,
            last: Box::new(last.unwrap_or_else(|| SessionError::Handshake {
                addr: addr.to_string(),
                reason: "no attempt was made".into(),
            })),
        })
    }

    /// Send one command. Returns false when nothing was written: not connected, or
    /// the write failed and the session was torn down.
    pub async fn command(&self, name: &str, arguments: Option<Value>) -> bool {
        self.inner.send(name, arguments.as_ref(), None).await
    }

    pub async fn pause(&self) -> bool {
        self.command(proto::STOP, None).await
    }

    pub async fn resume(&self) -> bool {
        self.command(proto::CONT, None).await
    }

    /// Run a human monitor command and wait for its reply.
    ///
    /// Returns the reply's `return` payload, or `None` when not connected, when the
    /// peer answered with an error, or when no reply arrived in time.
    pub async fn monitor(&self, command_line: &str) -> Option<Value> {
        let (tx, rx) = oneshot::channel();
        let args = proto::monitor_args(command_line);
        if !self.inner.send(proto::MONITOR, Some(&args), Some(tx)).await {
            return None;
        }
        match timeout(self.inner.config.monitor_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(
                    target: "vmpeek::session",
                    command = command_line,
                    timeout_ms = self.inner.config.monitor_timeout.as_millis() as u64,
                    "monitor reply timed out"
                );
                None
            }
        }
    }

    /// Monitor command whose reply is plain text, e.g. `info registers`.
    pub async fn monitor_text(&self, command_line: &str) -> Option<String> {
        match self.monitor(command_line).await? {
            Value::String(text) => Some(text),
            other => Some(other.to_string()),
        }
    }

    /// Tag of the newest memory read; only its page will be delivered.
    pub fn current_tag(&self) -> Option<CorrelationTag> {
        self.inner.page_slot.lock().as_ref().map(|slot| slot.tag)
    }

    /// Issue one tagged memory read outside any window.
    pub async fn read_memory(&self, request: ReadRequest) -> Option<CorrelationTag> {
        let tag = self.reserve_tag(request);
        self.issue_read(tag, request).await.then_some(tag)
    }
}

#[async_trait]
impl PageSource for Session {
    fn reserve_tag(&self, request: ReadRequest) -> CorrelationTag {
        let mut slot = self.inner.page_slot.lock();
        let tag = fresh_tag(slot.as_ref().map(|pending| pending.tag));
        *slot = Some(PendingRead { tag, request });
        tag
    }

    async fn issue_read(&self, tag: CorrelationTag, request: ReadRequest) -> bool {
        self.inner.issue_read(tag, request).await
    }
}

impl SessionInner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn publish(&self, event: SessionEvent) {
        self.bus.publish(event);
    }

    async fn open(self: Arc<Self>, addr: &str) -> Result<(), SessionError> {
        let connect_timeout = self.config.connect_timeout;
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(SessionError::Connection {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(SessionError::ConnectTimeout {
                    addr: addr.to_string(),
                    timeout: connect_timeout,
                });
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(target: "vmpeek::session", error = %err, "failed to set TCP_NODELAY");
        }

        let (read_half, mut write_half) = stream.into_split();
        let mut frames = FrameReader::new(read_half);

        let handshake = timeout(
            self.config.handshake_timeout,
            self.handshake(&mut frames, &mut write_half),
        )
        .await;
        let (banner, status) = match handshake {
            Ok(Ok(result)) => result,
            Ok(Err(reason)) => {
                return Err(SessionError::Handshake {
                    addr: addr.to_string(),
                    reason,
                });
            }
            Err(_) => {
                return Err(SessionError::Handshake {
                    addr: addr.to_string(),
                    reason: format!("no status reply within {:?}", self.config.handshake_timeout),
                });
            }
        };

        let running = RunState::from_running(status.running);
        let (close_tx, close_rx) = watch::channel(false);
        let generation = {
            // Nothing may be written before the reply queue is reset for this socket.
            let mut writer = self.writer.lock().await;
            self.pending.lock().clear();
            *writer = Some(write_half);
            let mut state = self.state.lock();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            state.connected = true;
            state.ready = true;
            state.running = running;
            state.banner = banner;
            generation
        };
        *self.close.lock() = Some(close_tx);
        *self.peer.lock() = Some(addr.to_string());

        info!(
            target: "vmpeek::session",
            addr,
            running = %running,
            status = status.status.as_deref().unwrap_or("-"),
            "session ready"
        );
        self.publish(SessionEvent::Connectivity(true));
        self.publish(SessionEvent::RunState(running));

        let reader = tokio::spawn(dispatch::run_reader(
            self.clone(),
            frames,
            close_rx,
            generation,
        ));
        *self.reader.lock() = Some(reader);
        Ok(())
    }

    /// Capability negotiation, then status. Events seen meanwhile are republished.
    async fn handshake(
        &self,
        frames: &mut FrameReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(Option<Greeting>, StatusInfo), String> {
        let mut banner = None;

        write_frame(writer, proto::CAPABILITIES, None).await?;
        loop {
            let frame = next_handshake_frame(frames).await?;
            let is_reply = proto::is_reply(&frame);
            let classified = proto::classify(&frame, is_reply.then_some(RequestKind::Capabilities));
            self.publish(SessionEvent::Raw(Arc::new(frame)));
            match classified {
                Ok(Inbound::Greeting(greeting)) => {
                    debug!(target: "vmpeek::session", version = %greeting.version, "greeting received");
                    banner = Some(greeting);
                }
                Ok(Inbound::ErrorReply(err)) => {
                    return Err(format!("capabilities rejected: {} ({})", err.desc, err.class));
                }
                Ok(Inbound::Event(event)) => self.publish(SessionEvent::Event(Arc::new(event))),
                _ if is_reply => break,
                _ => {}
            }
        }

        write_frame(writer, proto::QUERY_STATUS, None).await?;
        loop {
            let frame = next_handshake_frame(frames).await?;
            let is_reply = proto::is_reply(&frame);
            let classified = proto::classify(&frame, is_reply.then_some(RequestKind::Status));
            self.publish(SessionEvent::Raw(Arc::new(frame)));
            match classified {
                Ok(Inbound::Status(status)) => return Ok((banner, status)),
                Ok(Inbound::ErrorReply(err)) => {
                    return Err(format!("status query rejected: {} ({})", err.desc, err.class));
                }
                Ok(Inbound::Event(event)) => self.publish(SessionEvent::Event(Arc::new(event))),
                Ok(other) => {
                    trace!(target: "vmpeek::session", kind = other.label(), "ignoring frame during handshake");
                }
                Err(err) => {
                    debug!(target: "vmpeek::session", error = %err, "undecodable frame during handshake");
                }
            }
        }
    }

    /// Write one command. The reply kind is queued before the bytes go out so the
    /// reader can never see a reply without knowing what it answers.
    async fn send(
        &self,
        name: &str,
        arguments: Option<&Value>,
        waiter: Option<oneshot::Sender<Option<Value>>>,
    ) -> bool {
        let bytes = match proto::encode_command(name, arguments) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "vmpeek::session", command = name, error = %err, "failed to encode command");
                return false;
            }
        };

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            debug!(target: "vmpeek::session", command = name, "not connected; command dropped");
            return false;
        };
        let generation = self.generation();
        self.pending.lock().push_back(PendingReply {
            kind: RequestKind::for_command(name),
            waiter,
        });
        trace!(target: "vmpeek::session", command = name, "sending command");
        if let Err(err) = stream.write_all(&bytes).await {
            drop(writer);
            self.write_failed(name, err, generation).await;
            return false;
        }
        true
    }

    /// Write a read whose tag was already reserved. A read that cannot be sent gives
    /// its reservation back if nothing newer took the slot.
    async fn issue_read(&self, tag: CorrelationTag, request: ReadRequest) -> bool {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            debug!(target: "vmpeek::session", addr = request.addr, "not connected; read dropped");
            self.release_tag(tag);
            return false;
        };
        let generation = self.generation();

        let args = ReadMemoryArgs {
            addr: request.addr,
            size: request.size,
            hash: tag,
        }
        .to_value();
        let bytes = match proto::encode_command(proto::READ_MEMORY, Some(&args)) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "vmpeek::session", error = %err, "failed to encode memory read");
                self.release_tag(tag);
                return false;
            }
        };
        self.pending.lock().push_back(PendingReply {
            kind: RequestKind::MemoryRead,
            waiter: None,
        });
        trace!(
            target: "vmpeek::session",
            addr = request.addr,
            size = request.size,
            tag = %tag,
            "memory read issued"
        );
        if let Err(err) = stream.write_all(&bytes).await {
            drop(writer);
            self.write_failed(proto::READ_MEMORY, err, generation).await;
            return false;
        }
        true
    }

    fn release_tag(&self, tag: CorrelationTag) {
        let mut slot = self.page_slot.lock();
        if slot.as_ref().is_some_and(|pending| pending.tag == tag) {
            *slot = None;
        }
    }

    async fn write_failed(&self, command: &str, err: io::Error, generation: u64) {
        warn!(
            target: "vmpeek::session",
            command,
            error = %err,
            "write failed; dropping command and disconnecting"
        );
        self.teardown(Some(generation), RunState::Disconnected).await;
    }

    /// Drop the current connection and publish the transition.
    ///
    /// With `expected` set, only the connection of that generation is torn down; a
    /// stale reader or writer can never close a newer connection. Returns whether
    /// anything was torn down.
    async fn teardown(&self, expected: Option<u64>, next: RunState) -> bool {
        let mut writer = self.writer.lock().await;
        {
            let mut state = self.state.lock();
            if expected.is_some_and(|generation| generation != self.generation()) {
                return false;
            }
            if !state.connected {
                return false;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            state.connected = false;
            state.ready = false;
            state.running = next;
        }

        if let Some(mut stream) = writer.take() {
            let _ = stream.shutdown().await;
        }
        drop(writer);

        if let Some(close) = self.close.lock().take() {
            let _ = close.send(true);
        }
        // The reader exits on the close signal; it may be the caller itself.
        self.reader.lock().take();
        // Dropping the waiters resolves pending monitor calls with nothing.
        self.pending.lock().clear();
        self.page_slot.lock().take();

        info!(target: "vmpeek::session", run_state = %next, "session closed");
        self.publish(SessionEvent::Connectivity(false));
        self.publish(SessionEvent::RunState(next));
        true
    }

    fn record_reply(&self, frame: &Value) {
        let mut replies = self.replies.lock();
        if replies.len() == REPLY_LOG_CAPACITY {
            replies.pop_front();
        }
        replies.push_back(frame.clone());
    }

    fn set_running(&self, next: RunState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.running != next;
            state.running = next;
            changed
        };
        if changed {
            debug!(target: "vmpeek::dispatch", run_state = %next, "run state changed");
            self.publish(SessionEvent::RunState(next));
        }
    }
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    name: &str,
    arguments: Option<&Value>,
) -> Result<(), String> {
    let bytes = proto::encode_command(name, arguments).map_err(|err| err.to_string())?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|err| format!("failed to send {name}: {err}"))
}

async fn next_handshake_frame(frames: &mut FrameReader<OwnedReadHalf>) -> Result<Value, String> {
    match frames.next_frame().await {
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err("peer closed the connection".into()),
        Err(err) => Err(err.to_string()),
    }
}

/// Random nonzero tag that differs from the previous one.
fn fresh_tag(previous: Option<CorrelationTag>) -> CorrelationTag {
    let mut rng = rand::thread_rng();
    loop {
        let tag = CorrelationTag(rng.gen_range(1..=TAG_MASK));
        if Some(tag) != previous {
            return tag;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_fresh_and_bounded() {
        let mut previous = None;
        for _ in 0..256 {
            let tag = fresh_tag(previous);
            assert_ne!(Some(tag), previous);
            assert!(tag.0 >= 1 && tag.0 <= TAG_MASK);
            previous = Some(tag);
        }
    }

    #[test]
    fn reconnect_settings_are_sane() {
        let config = SessionConfig::default().with_reconnect(
            0,
            Duration::from_millis(500),
            Duration::from_millis(100),
        );
        assert_eq!(config.reconnect_attempts, 1);
        assert_eq!(config.reconnect_backoff_cap, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn commands_without_a_connection_are_dropped() {
        let session = Session::default();
        assert!(!session.command("query-status", None).await);
        assert!(!session.pause().await);
        assert_eq!(session.monitor("info registers").await, None);
        assert_eq!(session.current_tag(), None);
        let request = ReadRequest {
            addr: 0x1000,
            size: 16,
            intent: crate::memory::ReadIntent {
                reset: true,
                scroll: Default::default(),
                origin: crate::memory::ReadOrigin::User,
            },
        };
        assert_eq!(session.read_memory(request).await, None);
        assert_eq!(session.current_tag(), None);
        assert_eq!(session.run_state(), RunState::Unknown);
        // Nothing to tear down, so nothing is published.
        let mut connectivity = session.subscribe(Topic::Connectivity);
        session.disconnect().await;
        assert!(connectivity.try_recv().is_err());
    }

    #[tokio::test]
    async fn refused_connect_is_a_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let session = Session::new(
            SessionConfig::default().with_connect_timeout(Duration::from_millis(500)),
        );
        let err = session.connect(&addr).await.expect_err("nothing listening");
        assert!(matches!(
            err,
            SessionError::Connection { .. } | SessionError::ConnectTimeout { .. }
        ));
        let state = session.state();
        assert!(!state.connected);
        assert!(!state.ready);
    }

    /// Completes the handshake, then hangs up once `hang_up` fires.
    async fn answer_handshake(listener: tokio::net::TcpListener, hang_up: oneshot::Receiver<()>) {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        write_half
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();
        while let Some(line) = lines.next_line().await.unwrap() {
            if line.contains("qmp_capabilities") {
                write_half.write_all(b"{\"return\": {}}\n").await.unwrap();
            } else if line.contains("query-status") {
                write_half
                    .write_all(b"{\"return\": {\"running\": true, \"status\": \"running\"}}\n")
                    .await
                    .unwrap();
                break;
            }
        }
        let _ = hang_up.await;
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn failed_write_disconnects_and_drops_the_command() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (hang_up, hang_up_rx) = oneshot::channel();
        let peer = tokio::spawn(answer_handshake(listener, hang_up_rx));

        let session = Session::default();
        session.connect(&addr).await.expect("connect");
        let mut connectivity = session.subscribe(Topic::Connectivity);

        // Stop the reader first so only the write path can notice the hangup.
        let reader = session.inner.reader.lock().take().expect("reader running");
        if let Some(close) = session.inner.close.lock().as_ref() {
            close.send(true).unwrap();
        }
        reader.await.unwrap();
        assert!(session.state().connected);

        hang_up.send(()).unwrap();
        peer.await.unwrap();

        let mut dropped = false;
        for _ in 0..50 {
            if !session.command(proto::QUERY_STATUS, None).await {
                dropped = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(dropped, "writes kept succeeding after the peer hung up");
        assert!(matches!(
            connectivity.try_recv(),
            Ok(SessionEvent::Connectivity(false))
        ));
        let state = session.state();
        assert!(!state.connected);
        assert_eq!(state.running, RunState::Disconnected);
        assert!(session.inner.pending.lock().is_empty());
        assert!(!session.command(proto::QUERY_STATUS, None).await);
    }
}
