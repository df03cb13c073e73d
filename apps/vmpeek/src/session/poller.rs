use super::{Session, SessionEvent, Topic};
use qmp_proto as proto;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace};

pub const CLOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Periodically asks the guest for its virtual clock. Replies come back through the
/// reader as clock-tick notifications.
pub struct ClockPoller {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ClockPoller {
    pub fn spawn(session: Session) -> Self {
        Self::spawn_with_interval(session, CLOCK_POLL_INTERVAL)
    }

    pub fn spawn_with_interval(session: Session, period: Duration) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let connectivity = session.subscribe(Topic::Connectivity);
        let handle = tokio::spawn(poll_clock(session, period, stop_rx, connectivity));
        Self { stop, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

async fn poll_clock(
    session: Session,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut connectivity: broadcast::Receiver<SessionEvent>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let args = proto::sim_time_args("virtual");
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            event = connectivity.recv() => match event {
                Ok(SessionEvent::Connectivity(false)) | Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            },
            _ = ticker.tick() => {
                if session.is_ready() {
                    trace!(target: "vmpeek::poller", "polling virtual clock");
                    session.command(proto::SIM_TIME, Some(args.clone())).await;
                }
            }
        }
    }
    debug!(target: "vmpeek::poller", "clock poller stopped");
}
