//! Liveness timer for an open connection.
//!
//! A `PING` goes out every `interval`; after each one the next inbound frame must
//! arrive within `interval / 2` or the connection is considered dead. The two timers
//! never run at the same time:
//!
//! ```text
//! Idle --arm--> Armed --ping due--> ReplyPending --traffic--> Armed
//!                                        |
//!                                        +--deadline--> Idle (connection is killed)
//! ```
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(60_000);
/// Intervals below this are accepted but not recommended.
pub const MIN_RECOMMENDED_INTERVAL: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    Idle,
    Armed { next_ping: Instant },
    ReplyPending { ping_sent: Instant, deadline: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    SendPing,
    ReplyTimedOut,
}

#[derive(Debug, Clone)]
pub struct Keepalive {
    interval: Duration,
    reply_timeout: Duration,
    state: KeepaliveState,
}

impl Keepalive {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            reply_timeout: interval / 2,
            state: KeepaliveState::Idle,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn state(&self) -> KeepaliveState {
        self.state
    }

    /// Starts the ping cadence; the first ping is due one interval from `now`.
    pub fn arm(&mut self, now: Instant) {
        self.state = KeepaliveState::Armed {
            next_ping: now + self.interval,
        };
    }

    pub fn disarm(&mut self) {
        self.state = KeepaliveState::Idle;
    }

    /// Any well-formed inbound frame proves liveness. Returns `true` if it
    /// cancelled a pending reply timer.
    pub fn on_traffic(&mut self) -> bool {
        match self.state {
            KeepaliveState::ReplyPending { ping_sent, .. } => {
                self.state = KeepaliveState::Armed {
                    next_ping: ping_sent + self.interval,
                };
                true
            }
            _ => false,
        }
    }

    /// When the driver should next call [`Keepalive::poll`].
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            KeepaliveState::Idle => None,
            KeepaliveState::Armed { next_ping } => Some(next_ping),
            KeepaliveState::ReplyPending { deadline, .. } => Some(deadline),
        }
    }

    /// Advances the timer to `now`, reporting at most one due action.
    pub fn poll(&mut self, now: Instant) -> Option<KeepaliveAction> {
        match self.state {
            KeepaliveState::Armed { next_ping } if now >= next_ping => {
                self.state = KeepaliveState::ReplyPending {
                    ping_sent: now,
                    deadline: now + self.reply_timeout,
                };
                Some(KeepaliveAction::SendPing)
            }
            KeepaliveState::ReplyPending { deadline, .. } if now >= deadline => {
                self.state = KeepaliveState::Idle;
                Some(KeepaliveAction::ReplyTimedOut)
            }
            _ => None,
        }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new(DEFAULT_KEEPALIVE_INTERVAL)
    }
}
