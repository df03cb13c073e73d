use crate::memory::ReadRequest;
use qmp_proto::{AsyncEvent, ClockTick, CorrelationTag, Greeting, MemoryRegion, MemorySize, TimingPair};
use serde_json::Value;
use session_bus::Topical;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    Running,
    Paused,
    Disconnected,
    Error,
    #[default]
    Unknown,
}

impl RunState {
    pub fn from_running(running: bool) -> Self {
        if running {
            RunState::Running
        } else {
            RunState::Paused
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Disconnected => "disconnected",
            RunState::Error => "error",
            RunState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the session as seen by callers.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub connected: bool,
    /// Set once the first status reply has been seen on this connection.
    pub ready: bool,
    pub running: RunState,
    pub banner: Option<Greeting>,
}

/// A memory page whose tag matched the newest read when it was decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageArrival {
    pub tag: CorrelationTag,
    pub request: ReadRequest,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connectivity,
    RunState,
    MemoryPage,
    MemoryMap,
    ClockTick,
    Timing,
    SizeInfo,
    Generic,
    Raw,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connectivity(bool),
    RunState(RunState),
    MemoryPage(Arc<PageArrival>),
    MemoryMap(Arc<Vec<MemoryRegion>>),
    ClockTick(ClockTick),
    Timing(TimingPair),
    SizeInfo(MemorySize),
    /// Asynchronous events, lifecycle ones included.
    Event(Arc<AsyncEvent>),
    /// Replies and frames no other rule claimed.
    Generic(Arc<Value>),
    /// Every frame, before any filtering.
    Raw(Arc<Value>),
}

impl Topical for SessionEvent {
    type Topic = Topic;

    fn topic(&self) -> Topic {
        match self {
            SessionEvent::Connectivity(_) => Topic::Connectivity,
            SessionEvent::RunState(_) => Topic::RunState,
            SessionEvent::MemoryPage(_) => Topic::MemoryPage,
            SessionEvent::MemoryMap(_) => Topic::MemoryMap,
            SessionEvent::ClockTick(_) => Topic::ClockTick,
            SessionEvent::Timing(_) => Topic::Timing,
            SessionEvent::SizeInfo(_) => Topic::SizeInfo,
            SessionEvent::Event(_) | SessionEvent::Generic(_) => Topic::Generic,
            SessionEvent::Raw(_) => Topic::Raw,
        }
    }
}
