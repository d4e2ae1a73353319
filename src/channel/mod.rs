//! Logical channels multiplexed over one connection.
//!
//! A channel is identified by its action name and goes through the same
//! lifecycle in both directions:
//!
//! ```text
//!              open()            ready            ack
//! ReadyToOpen ───────► Waiting ────────► Opening ─────► Opened
//!      ▲              OnConnection          │              │
//!      └──────────── failure / remote close ┴──────────────┘
//!
//! close() ──► ClosedForever (removed from the connection)
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | Shared state machine and handshake |
//! | `sender` | Outbound channel |
//! | `receiver` | Inbound channel |
//! | `state` | Channel lifecycle states |
//! | `supervisor` | Interest-driven auto-reopening receiver |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::protocol::FrameKind;

// ============================================================================
// Submodules
// ============================================================================

/// Shared channel state machine.
pub(crate) mod core;

/// Outbound channel.
pub mod sender;

/// Inbound channel.
pub mod receiver;

/// Channel lifecycle states.
pub mod state;

/// Auto-reopening receiver supervisor.
pub mod supervisor;

// ============================================================================
// Re-exports
// ============================================================================

pub use receiver::{ParseFn, Receiver};
pub use sender::Sender;
pub use state::ChannelState;
pub use supervisor::{Opener, ReceiverSupervisor, SupervisorState, SupervisorSubscription};

// ============================================================================
// ChannelRole
// ============================================================================

/// Direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Local end sends messages.
    Sender,
    /// Local end receives messages.
    Receiver,
}

impl ChannelRole {
    /// Frame kind used for the open handshake.
    #[inline]
    #[must_use]
    pub const fn request_kind(self) -> FrameKind {
        match self {
            Self::Sender => FrameKind::SenderRequest,
            Self::Receiver => FrameKind::ReceiverRequest,
        }
    }

    /// Frame kind carrying payloads.
    #[inline]
    #[must_use]
    pub const fn message_kind(self) -> FrameKind {
        match self {
            Self::Sender => FrameKind::SenderMessage,
            Self::Receiver => FrameKind::ReceiverMessage,
        }
    }

    /// Frame kind used to close the channel.
    #[inline]
    #[must_use]
    pub const fn close_kind(self) -> FrameKind {
        match self {
            Self::Sender => FrameKind::SenderClose,
            Self::Receiver => FrameKind::ReceiverClose,
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("Sender"),
            Self::Receiver => f.write_str("Receiver"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
