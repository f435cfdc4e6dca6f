//! Session status state machine

use derive_more::Display;

/// Status of a T=1 session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum LinkStatus {
    /// No link, `open` required
    #[default]
    #[display("closed")]
    Closed,
    /// An exchange is in progress
    #[display("busy")]
    Busy,
    /// Resynchronising after an escalated fault
    #[display("recovery")]
    Recovery,
    /// Between exchanges
    #[display("idle")]
    Idle,
    /// Handshake done, no exchange yet
    #[display("open")]
    Open,
}

impl LinkStatus {
    /// Whether the state machine allows moving to `next`
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (_, Self::Closed)
                | (Self::Closed, Self::Open)
                | (Self::Open | Self::Idle, Self::Busy)
                | (Self::Busy, Self::Idle | Self::Recovery)
                | (Self::Recovery, Self::Idle)
        )
    }

    /// Whether the link is up
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Closed)
    }

    /// Whether a new exchange may start
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Open | Self::Idle)
    }
}
