//! Session lifecycle

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer session
///
/// ```text
/// Idle -> CodeReady -> Negotiating -> Transporting -> Verifying -> Completed
///                                       |    ^
///                                       +----+ next backend
/// ```
///
/// Every non-terminal state may end in `Failed` or `Cancelled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, nothing done yet
    Idle,
    /// Key derived from the transfer code
    CodeReady,
    /// Probing the network and ranking transports
    Negotiating,
    /// A transport attempt is in flight
    Transporting,
    /// Payload delivered, checking it
    Verifying,
    /// Done
    Completed,
    /// Ended with an error
    Failed,
    /// Ended by the caller
    Cancelled,
}

impl SessionState {
    /// Whether the session has ended
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Cancelled) | (_, Failed) => true,
            (Idle, CodeReady) => true,
            (CodeReady, Negotiating) => true,
            (Negotiating, Transporting) => true,
            (Transporting, Transporting) => true,
            (Transporting, Verifying) => true,
            (Verifying, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::CodeReady => "code ready",
            SessionState::Negotiating => "negotiating",
            SessionState::Transporting => "transporting",
            SessionState::Verifying => "verifying",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Which side of the transfer a session is on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Encrypts and sends
    Sender,
    /// Receives and decrypts
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}
