use crate::{CorrelationTag, RequestKind};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// Lifecycle transitions carried by asynchronous events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stop,
    Resume,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EventTimestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsyncEvent {
    pub name: String,
    pub timestamp: Option<EventTimestamp>,
    pub data: Value,
}

impl AsyncEvent {
    pub fn lifecycle(&self) -> Option<Lifecycle> {
        match self.name.as_str() {
            "STOP" => Some(Lifecycle::Stop),
            "RESUME" => Some(Lifecycle::Resume),
            "SHUTDOWN" => Some(Lifecycle::Shutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusInfo {
    pub running: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub singlestep: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageReply {
    pub tag: CorrelationTag,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemoryRegion {
    pub name: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimingSample {
    #[serde(default)]
    pub clock: Option<String>,
    pub time_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingPair {
    pub first: TimingSample,
    pub second: TimingSample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ClockTick {
    pub time_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemorySize {
    pub base_memory: u64,
    #[serde(default)]
    pub plugged_memory: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorReply {
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Greeting {
    #[serde(default)]
    pub version: Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(AsyncEvent),
    Status(StatusInfo),
    MemoryPage(PageReply),
    MemoryMap(Vec<MemoryRegion>),
    Timing(TimingPair),
    ClockTick(ClockTick),
    SizeInfo(MemorySize),
    ErrorReply(ErrorReply),
    Greeting(Greeting),
    Generic(Value),
}

impl Inbound {
    pub fn label(&self) -> &'static str {
        match self {
            Inbound::Event(_) => "event",
            Inbound::Status(_) => "status",
            Inbound::MemoryPage(_) => "memory_page",
            Inbound::MemoryMap(_) => "memory_map",
            Inbound::Timing(_) => "timing",
            Inbound::ClockTick(_) => "clock_tick",
            Inbound::SizeInfo(_) => "size_info",
            Inbound::ErrorReply(_) => "error_reply",
            Inbound::Greeting(_) => "greeting",
            Inbound::Generic(_) => "generic",
        }
    }
}

/// True for frames that answer a command (as opposed to events and the greeting).
pub fn is_reply(frame: &Value) -> bool {
    frame.get("timestamp").is_none() && (frame.get("return").is_some() || frame.get("error").is_some())
}

/// Classify a decoded frame. Rules are applied in order and the first match wins:
/// events, status, memory page, memory map, timing pair, clock tick, size info,
/// then error replies, the greeting banner and finally the generic fallback.
///
/// `expected` is the kind of request the frame answers, when known. A status reply
/// is recognized from it; without it the reply must carry both `running` and
/// `status` to be taken as one.
pub fn classify(frame: &Value, expected: Option<RequestKind>) -> Result<Inbound, DecodeError> {
    let object = frame.as_object().ok_or(DecodeError::NotAnObject)?;

    if object.contains_key("timestamp") {
        return Ok(Inbound::Event(decode_event(object)));
    }
    if let Some(ret) = object.get("return") {
        if let Some(inbound) = classify_return(ret, expected)? {
            return Ok(inbound);
        }
    }
    if let Some(error) = object.get("error") {
        return decode("error reply", error).map(Inbound::ErrorReply);
    }
    if let Some(greeting) = object.get("QMP") {
        return decode("greeting", greeting).map(Inbound::Greeting);
    }
    Ok(Inbound::Generic(frame.clone()))
}

fn classify_return(ret: &Value, expected: Option<RequestKind>) -> Result<Option<Inbound>, DecodeError> {
    match ret {
        Value::Object(map) => {
            if is_status(map, expected) {
                return decode("status reply", ret).map(|s| Some(Inbound::Status(s)));
            }
            if map.contains_key("hash") && map.get("vals").is_some_and(Value::is_array) {
                return decode_page(map).map(|p| Some(Inbound::MemoryPage(p)));
            }
            if map.len() == 1 && map.contains_key("time_ns") {
                return decode("clock tick", ret).map(|t| Some(Inbound::ClockTick(t)));
            }
            if map.contains_key("base-memory") {
                return decode("size info", ret).map(|s| Some(Inbound::SizeInfo(s)));
            }
            Ok(None)
        }
        Value::Array(items) => {
            if !items.is_empty()
                && items
                    .iter()
                    .all(|item| item.get("name").is_some_and(Value::is_string))
            {
                return decode("memory map", ret).map(|m| Some(Inbound::MemoryMap(m)));
            }
            if items.len() == 2 && items.iter().all(is_timing_sample) {
                let first = timing_sample(&items[0])?;
                let second = timing_sample(&items[1])?;
                return Ok(Some(Inbound::Timing(TimingPair { first, second })));
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

fn is_status(map: &Map<String, Value>, expected: Option<RequestKind>) -> bool {
    map.get("running").is_some_and(Value::is_boolean)
        && (expected == Some(RequestKind::Status)
            || map.get("status").is_some_and(Value::is_string))
}

fn is_timing_sample(item: &Value) -> bool {
    item.is_u64() || item.get("time_ns").is_some_and(Value::is_u64)
}

fn timing_sample(item: &Value) -> Result<TimingSample, DecodeError> {
    match item.as_u64() {
        Some(time_ns) => Ok(TimingSample {
            clock: None,
            time_ns,
        }),
        None => decode("timing sample", item),
    }
}

fn decode_event(object: &Map<String, Value>) -> AsyncEvent {
    let name = object
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let timestamp = object
        .get("timestamp")
        .and_then(|ts| EventTimestamp::deserialize(ts).ok());
    let data = object.get("data").cloned().unwrap_or(Value::Null);
    AsyncEvent {
        name,
        timestamp,
        data,
    }
}

fn decode_page(map: &Map<String, Value>) -> Result<PageReply, DecodeError> {
    let malformed = |reason: String| DecodeError::Malformed {
        kind: "memory page",
        reason,
    };
    let tag = map
        .get("hash")
        .and_then(Value::as_u64)
        .map(CorrelationTag)
        .ok_or_else(|| malformed("correlation tag is not an unsigned integer".into()))?;
    let vals = map
        .get("vals")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing value list".into()))?;
    let mut bytes = Vec::with_capacity(vals.len());
    for (index, val) in vals.iter().enumerate() {
        // Peers send either bare numbers or {"val": n} entries.
        let raw = val
            .as_u64()
            .or_else(|| val.get("val").and_then(Value::as_u64));
        match raw.and_then(|n| u8::try_from(n).ok()) {
            Some(byte) => bytes.push(byte),
            None => return Err(malformed(format!("entry {index} is not a byte: {val}"))),
        }
    }
    Ok(PageReply { tag, bytes })
}

fn decode<T: DeserializeOwned>(kind: &'static str, value: &Value) -> Result<T, DecodeError> {
    T::deserialize(value).map_err(|err| DecodeError::Malformed {
        kind,
        reason: err.to_string(),
    })
}
