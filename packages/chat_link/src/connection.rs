//! Connection state machine.
//!
//! Pure bookkeeping: no I/O and no timers. The client actor feeds it transport
//! events and acts on what it returns.
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Connected
//!      ^                        ^                    |
//!      |                        |              unexpected close
//!      |                  backoff elapses            v
//!      |                        +------------- Reconnecting
//!      +------------------ deliberate close (from any state)
//! ```

use std::time::Duration;

use tracing::{debug, info};

use crate::protocol::is_intentional_close;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Exponential backoff: `min(base * 2^attempt, cap)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^31 * base overflows long before the shift does; saturate instead.
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// What the owner should do after a successful open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Opened {
    /// Attempt counter before it was reset. Non-zero means this open
    /// recovered from an unexpected close.
    pub recovered_after: u32,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempt: u32,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Returns true if the owner should start dialing now.
    ///
    /// Idempotent while a connection is open or being opened. Calling it while
    /// a reconnect is scheduled dials immediately; the owner cancels the timer.
    pub fn connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => false,
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                self.transition(ConnectionState::Connecting);
                true
            }
        }
    }

    pub fn opened(&mut self) -> Opened {
        let recovered_after = self.attempt;
        self.attempt = 0;
        self.transition(ConnectionState::Connected);
        Opened { recovered_after }
    }

    /// The dial itself failed. Always schedules a retry, unless the dial was
    /// already abandoned by a deliberate disconnect.
    pub fn dial_failed(&mut self) -> Option<Duration> {
        if self.state != ConnectionState::Connecting {
            return None;
        }
        Some(self.schedule_reconnect())
    }

    /// The transport closed. Returns the backoff delay if a reconnect must be
    /// scheduled.
    pub fn closed(&mut self, code: Option<u16>) -> Option<Duration> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Reconnecting => None,
            ConnectionState::Connecting | ConnectionState::Connected => {
                if is_intentional_close(code) {
                    self.attempt = 0;
                    self.transition(ConnectionState::Disconnected);
                    None
                } else {
                    Some(self.schedule_reconnect())
                }
            }
        }
    }

    /// Deliberate close. Returns true if there was anything to tear down.
    pub fn disconnect(&mut self) -> bool {
        let was_active = self.state != ConnectionState::Disconnected;
        self.attempt = 0;
        self.transition(ConnectionState::Disconnected);
        was_active
    }

    /// The backoff timer fired. Returns true if the owner should dial.
    pub fn backoff_elapsed(&mut self) -> bool {
        if self.state != ConnectionState::Reconnecting {
            return false;
        }
        self.transition(ConnectionState::Connecting);
        true
    }

    fn schedule_reconnect(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.transition(ConnectionState::Reconnecting);
        info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        delay
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "connection state");
            self.state = next;
        }
    }
}
