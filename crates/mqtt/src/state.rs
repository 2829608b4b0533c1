//! Connection state machine.
//!
//! ```text
//! Idle ──start──▶ Connecting ──success──▶ Ready ◀──▶ Disconnected
//!   │                 │                     │             │
//!   └───────stop──────┴─────────────────────┴─────────────┴──▶ Stopped
//! ```
//!
//! `Disconnected` may be entered and left many times while the transport
//! reconnects. `Stopped` is terminal.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handle built, `start` not called yet.
    Idle,

    /// Connection attempt in progress; no connection success seen yet.
    Connecting,

    /// Handshake complete; publishes are accepted.
    Ready,

    /// Link lost after having been ready. The string carries the reason.
    Disconnected(String),

    /// Stop sequence completed and the transport was released.
    Stopped,
}

impl ConnectionState {
    /// Short, allocation-free name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Ready => "Ready",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Stopped => "Stopped",
        }
    }

    /// Reason attached to `Disconnected`, empty otherwise.
    pub fn details(&self) -> &str {
        match self {
            ConnectionState::Disconnected(reason) => reason,
            _ => "",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ConnectionState::Stopped)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Self-transitions are not transitions and return false; `Disconnected`
    /// with a new reason counts as a transition.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Idle, Connecting) => true,
            (Connecting, Ready) => true,
            (Ready, Disconnected(_)) => true,
            (Disconnected(_), Ready) => true,
            (Disconnected(a), Disconnected(b)) => a != b,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
