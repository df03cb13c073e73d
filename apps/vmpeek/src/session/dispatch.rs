use super::{FrameError, FrameReader, PageArrival, RunState, SessionEvent, SessionInner};
use crate::telemetry::PerfGuard;
use qmp_proto::{self as proto, Inbound, Lifecycle, PageReply};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

enum ReaderExit {
    Closed,
    PeerClosed,
    Shutdown,
    Failed(FrameError),
}

enum Flow {
    Continue,
    Shutdown,
}

/// Background reader for one connection. Ends on close, EOF, a fatal read error or
/// a SHUTDOWN event; nothing is retried.
pub(super) async fn run_reader(
    inner: Arc<SessionInner>,
    mut frames: FrameReader<OwnedReadHalf>,
    mut close: watch::Receiver<bool>,
    generation: u64,
) {
    debug!(target: "vmpeek::dispatch", generation, "reader started");
    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = close.changed() => break ReaderExit::Closed,
            next = frames.next_frame() => next,
        };
        match next {
            Ok(Some(frame)) => {
                if let Flow::Shutdown = inner.dispatch(frame) {
                    break ReaderExit::Shutdown;
                }
            }
            Ok(None) => break ReaderExit::PeerClosed,
            Err(err) if err.is_hangup() => {
                debug!(target: "vmpeek::dispatch", generation, error = %err, "connection reset");
                break ReaderExit::PeerClosed;
            }
            Err(err) => break ReaderExit::Failed(err),
        }
    };

    match exit {
        ReaderExit::Closed => {
            debug!(target: "vmpeek::dispatch", generation, "reader closed by session");
        }
        ReaderExit::PeerClosed => {
            info!(target: "vmpeek::dispatch", generation, "peer closed the connection");
            inner.teardown(Some(generation), RunState::Disconnected).await;
        }
        ReaderExit::Shutdown => {
            info!(target: "vmpeek::dispatch", generation, "guest shut down");
            inner.teardown(Some(generation), RunState::Disconnected).await;
        }
        ReaderExit::Failed(err) => {
            warn!(target: "vmpeek::dispatch", generation, error = %err, "reader failed");
            inner.teardown(Some(generation), RunState::Error).await;
        }
    }
}

impl SessionInner {
    /// Classify one frame and fan it out. Replies consume the oldest pending request
    /// so the classifier knows what each reply answers.
    fn dispatch(&self, frame: Value) -> Flow {
        let is_reply = proto::is_reply(&frame);
        let pending = if is_reply {
            self.record_reply(&frame);
            self.pending.lock().pop_front()
        } else {
            None
        };
        let expected = pending.as_ref().map(|reply| reply.kind);

        let classified = {
            let _perf = PerfGuard::new("dispatch.classify");
            proto::classify(&frame, expected)
        };

        if let Some(waiter) = pending.and_then(|reply| reply.waiter) {
            let _ = waiter.send(frame.get("return").cloned());
        }

        let frame = Arc::new(frame);
        self.publish(SessionEvent::Raw(frame.clone()));

        let inbound = match classified {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(target: "vmpeek::dispatch", error = %err, "frame failed to decode");
                self.publish(SessionEvent::Generic(frame));
                return Flow::Continue;
            }
        };
        trace!(target: "vmpeek::dispatch", kind = inbound.label(), "frame classified");

        match inbound {
            Inbound::Event(event) => {
                let lifecycle = event.lifecycle();
                debug!(target: "vmpeek::dispatch", event = %event.name, "event received");
                self.publish(SessionEvent::Event(Arc::new(event)));
                match lifecycle {
                    Some(Lifecycle::Stop) => self.set_running(RunState::Paused),
                    Some(Lifecycle::Resume) => self.set_running(RunState::Running),
                    Some(Lifecycle::Shutdown) => return Flow::Shutdown,
                    None => {}
                }
            }
            Inbound::Status(status) => {
                self.state.lock().ready = true;
                self.set_running(RunState::from_running(status.running));
            }
            Inbound::MemoryPage(page) => self.deliver_page(page),
            Inbound::MemoryMap(regions) => {
                self.publish(SessionEvent::MemoryMap(Arc::new(regions)));
            }
            Inbound::Timing(pair) => self.publish(SessionEvent::Timing(pair)),
            Inbound::ClockTick(tick) => self.publish(SessionEvent::ClockTick(tick)),
            Inbound::SizeInfo(size) => self.publish(SessionEvent::SizeInfo(size)),
            Inbound::ErrorReply(err) => {
                warn!(
                    target: "vmpeek::dispatch",
                    class = %err.class,
                    desc = %err.desc,
                    "command failed"
                );
                self.publish(SessionEvent::Generic(frame));
            }
            Inbound::Greeting(greeting) => {
                self.state.lock().banner = Some(greeting);
                self.publish(SessionEvent::Generic(frame));
            }
            Inbound::Generic(_) => self.publish(SessionEvent::Generic(frame)),
        }
        Flow::Continue
    }

    fn deliver_page(&self, page: PageReply) {
        let request = {
            let slot = self.page_slot.lock();
            match slot.as_ref() {
                Some(pending) if pending.tag == page.tag => pending.request,
                current => {
                    trace!(
                        target: "vmpeek::dispatch",
                        tag = %page.tag,
                        current = ?current.map(|pending| pending.tag),
                        "stale memory page dropped"
                    );
                    return;
                }
            }
        };
        trace!(
            target: "vmpeek::dispatch",
            tag = %page.tag,
            addr = request.addr,
            bytes = page.bytes.len(),
            "memory page arrived"
        );
        self.publish(SessionEvent::MemoryPage(Arc::new(PageArrival {
            tag: page.tag,
            request,
            bytes: page.bytes,
        })));
    }
}
