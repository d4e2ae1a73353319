//! Channel lifecycle states.

// ============================================================================
// ChannelState
// ============================================================================

/// Lifecycle state of a [`Sender`](super::Sender) or
/// [`Receiver`](super::Receiver).
///
/// States are ordered: everything at or above
/// [`ChannelState::WaitingOnConnection`] counts as "opening or open".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelState {
    /// Removed from its connection; can never open again.
    ClosedForever,
    /// Idle, `open()` may be called.
    #[default]
    ReadyToOpen,
    /// `open()` is waiting for the connection to become usable.
    WaitingOnConnection,
    /// Request sent, waiting for the acknowledgment.
    Opening,
    /// Handshake completed.
    Opened,
}

impl ChannelState {
    /// Returns `true` while an `open()` call is in flight.
    #[inline]
    #[must_use]
    pub const fn is_opening(self) -> bool {
        matches!(self, Self::WaitingOnConnection | Self::Opening)
    }
}
