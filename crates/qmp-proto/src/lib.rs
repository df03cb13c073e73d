//! Shared protocol definitions for the QEMU machine protocol (QMP) control socket.
//! Keeping this in a dedicated crate keeps the decode rules free of any socket
//! or runtime code, so they can be exercised directly.
//!
//! Outbound requests are single-line JSON objects:
//!
//! ```
//! # use qmp_proto::encode_command;
//! let bytes = encode_command("query-status", None).unwrap();
//! assert_eq!(bytes, b"{\"execute\":\"query-status\"}\n");
//! ```

mod inbound;

pub use inbound::{
    classify, is_reply, AsyncEvent, ClockTick, DecodeError, ErrorReply, EventTimestamp, Greeting,
    Inbound, Lifecycle, MemoryRegion, MemorySize, PageReply, StatusInfo, TimingPair, TimingSample,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const CAPABILITIES: &str = "qmp_capabilities";
pub const QUERY_STATUS: &str = "query-status";
pub const READ_MEMORY: &str = "get-pmem";
pub const MONITOR: &str = "human-monitor-command";
pub const SIM_TIME: &str = "itc-sim-time";
pub const STOP: &str = "stop";
pub const CONT: &str = "cont";

/// Opaque tag attached to a memory read and echoed back in its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationTag(pub u64);

impl fmt::Display for CorrelationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What an outbound command was, remembered until its reply comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Capabilities,
    Status,
    MemoryRead,
    Monitor,
    Other,
}

impl RequestKind {
    pub fn for_command(name: &str) -> Self {
        match name {
            CAPABILITIES => RequestKind::Capabilities,
            QUERY_STATUS => RequestKind::Status,
            READ_MEMORY => RequestKind::MemoryRead,
            MONITOR => RequestKind::Monitor,
            _ => RequestKind::Other,
        }
    }
}

#[derive(Debug, Serialize)]
struct Command<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a Value>,
}

/// Serialize one request frame, newline included.
pub fn encode_command(name: &str, arguments: Option<&Value>) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = serde_json::to_vec(&Command {
        execute: name,
        arguments,
    })?;
    out.push(b'\n');
    Ok(out)
}

/// Arguments of a physical memory read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadMemoryArgs {
    pub addr: u64,
    pub size: u64,
    pub hash: CorrelationTag,
}

impl ReadMemoryArgs {
    pub fn to_value(self) -> Value {
        serde_json::json!({
            "addr": self.addr,
            "size": self.size,
            "hash": self.hash,
        })
    }
}

pub fn monitor_args(command_line: &str) -> Value {
    serde_json::json!({ "command-line": command_line })
}

pub fn sim_time_args(clock: &str) -> Value {
    serde_json::json!({ "clock": clock })
}
