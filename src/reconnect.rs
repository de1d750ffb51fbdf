//! Connection lifecycle as a pure state machine.
//!
//! DESIGN
//! ======
//! `LinkState::step` maps `(state, event)` to the next state plus a list of
//! commands for the session driver to run in order. The machine does no
//! I/O, so the reconnect policy can be tested without sockets or clocks.
//!
//! ```text
//! Idle -Start-> Connecting -ok-> Connected -close-> Disconnected -delay-> Reconnecting
//!                  |  ^                                                  |   ^
//!                  fail, retry                                 ok -> Resyncing  fail, retry
//!                                                       accepted -> Connected
//!                                                       rejected -> Disconnected(hopeless)
//! ```
//!
//! With auto-reconnect off, an unexpected close ends in
//! `Disconnected { hopeless: true }`. `Kill` ends everything.

use std::time::Duration;

use crate::config::ClientConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// First connection attempt, retried until it succeeds.
    Connecting,
    Connected,
    /// Lost the connection; waiting before reconnecting. `hopeless` means
    /// no reconnect will happen.
    Disconnected { hopeless: bool },
    Reconnecting,
    /// Reconnected; waiting for the state resync to finish.
    Resyncing,
    Killed,
}

impl LinkState {
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// No further transition will reach `Connected`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Killed | Self::Disconnected { hopeless: true })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Start,
    ConnectSucceeded,
    ConnectFailed,
    UnexpectedClose,
    /// A scheduled delay ran out.
    RetryElapsed,
    ResyncFinished { accepted: bool },
    Kill,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkCommand {
    /// Open a socket and run the handshake; report `ConnectSucceeded` or
    /// `ConnectFailed`.
    OpenSocket,
    /// Feed `RetryElapsed` after the delay.
    ScheduleRetry(Duration),
    /// Run the resync hook; report `ResyncFinished`.
    Resync,
    NotifyStatus { connected: bool, hopeless: bool },
    StartKeepalive,
    StopKeepalive,
    ShowReloadNotice,
    CloseSocket,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub retry_delay: Duration,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            auto_reconnect: config.auto_reconnect,
            reconnect_delay: config.reconnect_delay,
            retry_delay: config.retry_delay,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub next: LinkState,
    pub commands: Vec<LinkCommand>,
}

impl Transition {
    fn to(next: LinkState, commands: Vec<LinkCommand>) -> Self {
        Self { next, commands }
    }

    fn stay(state: LinkState) -> Self {
        Self::to(state, Vec::new())
    }
}

impl LinkState {
    #[must_use]
    pub fn step(self, event: LinkEvent, policy: &ReconnectPolicy) -> Transition {
        use LinkCommand::{
            CloseSocket, NotifyStatus, OpenSocket, Resync, ScheduleRetry, ShowReloadNotice, StartKeepalive,
            StopKeepalive,
        };
        use LinkEvent::{
            ConnectFailed, ConnectSucceeded, Kill, ResyncFinished, RetryElapsed, Start, UnexpectedClose,
        };

        match (self, event) {
            (Self::Killed, _) => Transition::stay(self),
            (_, Kill) => Transition::to(Self::Killed, vec![StopKeepalive, CloseSocket]),

            (Self::Idle, Start) | (Self::Connecting, RetryElapsed) => {
                Transition::to(Self::Connecting, vec![OpenSocket])
            }
            (Self::Connecting, ConnectSucceeded) => Transition::to(
                Self::Connected,
                vec![StartKeepalive, NotifyStatus { connected: true, hopeless: false }],
            ),
            (Self::Connecting, ConnectFailed) => {
                Transition::to(Self::Connecting, vec![ScheduleRetry(policy.retry_delay)])
            }

            (Self::Connected | Self::Resyncing, UnexpectedClose) if policy.auto_reconnect => Transition::to(
                Self::Disconnected { hopeless: false },
                vec![
                    StopKeepalive,
                    NotifyStatus { connected: false, hopeless: false },
                    ScheduleRetry(policy.reconnect_delay),
                ],
            ),
            (Self::Connected | Self::Resyncing, UnexpectedClose) => Transition::to(
                Self::Disconnected { hopeless: true },
                vec![
                    StopKeepalive,
                    NotifyStatus { connected: false, hopeless: false },
                    NotifyStatus { connected: false, hopeless: true },
                ],
            ),

            (Self::Disconnected { hopeless: false } | Self::Reconnecting, RetryElapsed) => {
                Transition::to(Self::Reconnecting, vec![OpenSocket])
            }
            (Self::Reconnecting, ConnectSucceeded) => Transition::to(Self::Resyncing, vec![StartKeepalive, Resync]),
            (Self::Reconnecting, ConnectFailed) => {
                Transition::to(Self::Reconnecting, vec![ScheduleRetry(policy.retry_delay)])
            }

            (Self::Resyncing, ResyncFinished { accepted: true }) => Transition::to(
                Self::Connected,
                vec![NotifyStatus { connected: true, hopeless: false }],
            ),
            (Self::Resyncing, ResyncFinished { accepted: false }) => Transition::to(
                Self::Disconnected { hopeless: true },
                vec![StopKeepalive, NotifyStatus { connected: false, hopeless: false }, ShowReloadNotice],
            ),

            _ => Transition::stay(self),
        }
    }
}

#[cfg(test)]
#[path = "reconnect_test.rs"]
mod tests;
