#![allow(dead_code)]

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use vmpeek::session::SessionEvent;

pub const WAIT: Duration = Duration::from_secs(3);

pub type Responder = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

enum Outbound {
    Frame(Value),
    Close,
}

/// A scripted QMP endpoint on a loopback port. Serves one connection at a time
/// and accepts again after each close, so reconnects land on the same peer.
pub struct FakePeer {
    pub addr: String,
    commands: mpsc::UnboundedReceiver<Value>,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl FakePeer {
    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake peer");
        let addr = listener.local_addr().expect("local addr").to_string();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if !serve(stream, &responder, &commands_tx, &mut outbound_rx).await {
                    break;
                }
            }
        });
        Self {
            addr,
            commands,
            outbound,
            task,
        }
    }

    pub async fn qemu_like(running: bool) -> Self {
        Self::start(qemu_like(running, false)).await
    }

    /// Push an unsolicited frame on the current connection.
    pub fn push(&self, frame: Value) {
        let _ = self.outbound.send(Outbound::Frame(frame));
    }

    /// Drop the current connection.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Next command named `name`, skipping others.
    pub async fn next_command(&mut self, name: &str) -> Value {
        timeout(WAIT, async {
            loop {
                let command = self.commands.recv().await.expect("peer stopped");
                if command["execute"] == name {
                    return command;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {name} command arrived"))
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// Returns false once the test side has gone away.
async fn serve(
    stream: TcpStream,
    responder: &Responder,
    commands: &mpsc::UnboundedSender<Value>,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> bool {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let greeting = json!({
        "QMP": {
            "version": { "qemu": { "major": 8, "minor": 2, "micro": 1 }, "package": "" },
            "capabilities": ["oob"]
        }
    });
    if write_line(&mut write_half, &greeting).await.is_err() {
        return true;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return true };
                let Ok(command) = serde_json::from_str::<Value>(&line) else { continue };
                let replies = responder(&command);
                let _ = commands.send(command);
                for reply in replies {
                    if write_line(&mut write_half, &reply).await.is_err() {
                        return true;
                    }
                }
            }
            next = outbound.recv() => match next {
                Some(Outbound::Frame(frame)) => {
                    if write_line(&mut write_half, &frame).await.is_err() {
                        return true;
                    }
                }
                Some(Outbound::Close) => {
                    let _ = write_half.shutdown().await;
                    return true;
                }
                None => return false,
            }
        }
    }
}

async fn write_line(writer: &mut tokio::net::tcp::OwnedWriteHalf, frame: &Value) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(frame).expect("encode frame");
    bytes.push(b'\n');
    writer.write_all(&bytes).await
}

pub fn event(name: &str) -> Value {
    json!({
        "event": name,
        "timestamp": { "seconds": 1_700_000_000, "microseconds": 0 },
        "data": {}
    })
}

/// Page reply for a `get-pmem` command: each byte is the low byte of its address.
pub fn page_for(command: &Value) -> Value {
    let args = &command["arguments"];
    let addr = args["addr"].as_u64().expect("addr");
    let size = args["size"].as_u64().expect("size");
    page_with(command, (addr..addr + size).map(|a| a as u8).collect())
}

pub fn page_with(command: &Value, bytes: Vec<u8>) -> Value {
    json!({ "return": { "hash": command["arguments"]["hash"], "vals": bytes } })
}

/// Answers like QEMU would. With `hold_reads`, memory reads go unanswered so the
/// test can reply out of order through [`FakePeer::push`].
pub fn qemu_like(running: bool, hold_reads: bool) -> Responder {
    Arc::new(move |command: &Value| {
        let name = command["execute"].as_str().unwrap_or_default();
        let status = if running { "running" } else { "paused" };
        match name {
            "qmp_capabilities" => vec![json!({ "return": {} })],
            "query-status" => vec![json!({
                "return": {
                    "running": running,
                    "singlestep": false,
                    "status": status
                }
            })],
            "stop" => vec![json!({ "return": {} }), event("STOP")],
            "cont" => vec![json!({ "return": {} }), event("RESUME")],
            "human-monitor-command" => {
                let line = command["arguments"]["command-line"].as_str().unwrap_or_default();
                vec![json!({ "return": format!("echo: {line}\r\n") })]
            }
            "itc-sim-time" => vec![json!({ "return": { "time_ns": 1_234_567_890u64 } })],
            "get-pmem" if hold_reads => vec![],
            "get-pmem" => vec![page_for(command)],
            _ => vec![json!({ "return": {} })],
        }
    })
}

/// Wait for the first event on `rx` matching `pick`.
pub async fn expect_event<T>(
    rx: &mut broadcast::Receiver<SessionEvent>,
    mut pick: impl FnMut(SessionEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}
