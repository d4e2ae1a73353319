//! WebSocket protocol message types.
//!
//! This module defines the frame format shared by the connection and
//! every channel.
//!
//! # Protocol Overview
//!
//! | Frame Kind | Routed To | Purpose |
//! |------------|-----------|---------|
//! | `SenderRequest` | sender table | Open handshake |
//! | `SenderClose` | sender table | Remote closed the sender |
//! | `SenderMessage` | dropped | Only ever sent by this side |
//! | `ReceiverRequest` | receiver table | Open handshake |
//! | `ReceiverMessage` | receiver table | Payload for listeners |
//! | `ReceiverClose` | receiver table | Remote closed the receiver |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Frame and FrameKind types |

// ============================================================================
// Submodules
// ============================================================================

/// Frame message types.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use frame::{Frame, FrameKind};
