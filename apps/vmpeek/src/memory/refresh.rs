use super::{MemoryWindow, PageSource};
use crate::session::{RunState, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

pub const AUTO_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Re-reads the materialized window on a fixed period while the guest runs.
///
/// A pause halts refreshing and a resume restarts it. The task ends on
/// [`AutoRefresh::stop`], on disconnect, or when the guest reports an error state.
pub struct AutoRefresh {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AutoRefresh {
    pub fn spawn<S>(
        window: Arc<MemoryWindow<S>>,
        run_state: broadcast::Receiver<SessionEvent>,
        initial: RunState,
        period: Duration,
    ) -> Self
    where
        S: PageSource + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(refresh_loop(window, run_state, initial, period, stop_rx));
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

async fn refresh_loop<S: PageSource>(
    window: Arc<MemoryWindow<S>>,
    mut run_state: broadcast::Receiver<SessionEvent>,
    initial: RunState,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut running = initial == RunState::Running;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; the window was just fetched.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            event = run_state.recv() => match event {
                Ok(SessionEvent::RunState(state)) => match state {
                    RunState::Running => running = true,
                    RunState::Paused | RunState::Unknown => running = false,
                    RunState::Disconnected | RunState::Error => break,
                },
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                if running {
                    window.refresh().await;
                }
            }
        }
    }
    debug!(target: "vmpeek::window", "auto refresh stopped");
}
