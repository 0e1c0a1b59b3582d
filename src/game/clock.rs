//! Game Clock
//!
//! One-second countdown per session. Remaining time lives in the
//! [`Session`] and is only touched under the session lock; the clock owns the
//! tick task and its cancellation.
//!
//! ```text
//! Idle ──start──► Running ──stop / timeout──► Stopped
//!   └──────────────────stop──────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::game::session::{FinishReason, Session, Side};
use crate::network::protocol::TimeUpdate;

/// Default tick interval.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Receives clock output. Called with no session lock held.
#[async_trait]
pub trait ClockHooks: Send + Sync {
    /// Broadcast a clock snapshot.
    async fn time_update(&self, session_id: &str, update: TimeUpdate);

    /// A side ran out of time. The session is already `Finished`.
    async fn timed_out(&self, session_id: &str, winner: Side, update: TimeUpdate);
}

/// Clock lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockState {
    /// Not started.
    Idle,
    /// Ticking.
    Running,
    /// Stopped for good.
    Stopped,
}

/// Per-session countdown.
pub struct GameClock {
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

enum Tick {
    Frozen,
    Ticked(TimeUpdate),
    Expired { winner: Side, update: TimeUpdate },
}

impl GameClock {
    /// Create an idle clock.
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ClockState {
        if self.stopped.load(Ordering::Acquire) {
            ClockState::Stopped
        } else if self.started.load(Ordering::Acquire) {
            ClockState::Running
        } else {
            ClockState::Idle
        }
    }

    /// Start ticking. Returns false if already started or stopped.
    pub fn start(
        self: &Arc<Self>,
        session: Arc<RwLock<Session>>,
        hooks: Arc<dyn ClockHooks>,
        tick: Duration,
    ) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let clock = self.clone();
        tokio::spawn(async move {
            clock.run(session, hooks, tick).await;
        });
        true
    }

    /// Stop ticking. Synchronous so it can run under the session lock.
    /// Returns true on the first call.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Announce a turn change. The turn itself is flipped by the move.
    pub async fn switch_turn(&self, session: &RwLock<Session>, hooks: &dyn ClockHooks) {
        if self.state() != ClockState::Running {
            return;
        }
        let (session_id, update) = {
            let s = session.read().await;
            if s.is_finished() {
                return;
            }
            (s.id.clone(), s.time_update())
        };
        hooks.time_update(&session_id, update).await;
    }

    async fn run(self: Arc<Self>, session: Arc<RwLock<Session>>, hooks: Arc<dyn ClockHooks>, tick: Duration) {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let (session_id, initial) = {
            let s = session.read().await;
            (s.id.clone(), s.time_update())
        };
        debug!("Clock started for {}", session_id);
        hooks.time_update(&session_id, initial).await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = {
                let mut s = session.write().await;
                match s.consume_second() {
                    None => Tick::Frozen,
                    Some(0) => {
                        let winner = s.turn().opposite();
                        s.finish(Some(winner), FinishReason::Timeout);
                        Tick::Expired {
                            winner,
                            update: s.time_update(),
                        }
                    }
                    Some(_) => Tick::Ticked(s.time_update()),
                }
            };

            match outcome {
                Tick::Frozen => continue,
                Tick::Ticked(update) => {
                    #[cfg(feature = "debug-tracing")]
                    tracing::trace!(
                        "Clock {} white={} black={}",
                        session_id,
                        update.white_time,
                        update.black_time
                    );
                    hooks.time_update(&session_id, update).await;
                }
                Tick::Expired { winner, update } => {
                    info!("Session {} timed out, {} wins", session_id, winner);
                    hooks.timed_out(&session_id, winner, update).await;
                    break;
                }
            }
        }

        debug!("Clock stopped for {}", session_id);
    }
}

impl Default for GameClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Render seconds as `MM:SS`.
pub fn format_clock(seconds: u32) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
