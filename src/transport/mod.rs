//! WebSocket transport layer.
//!
//! Owns the single WebSocket shared by every channel of a connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                        ┌─────────────────┐
//! │  Connection          │       WebSocket        │  Server         │
//! │   senders[action]    │◄──────────────────────►│                 │
//! │   receivers[action]  │   {kind,action,data}   │                 │
//! └──────────────────────┘                        └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `Connection::new` - Validate the address, nothing is opened yet
//! 2. `Connection::connect` - Spawn the socket task
//! 3. Open event - Channels waiting on the connection send their requests
//! 4. Close event - Channels past their handshake receive `StreamClosed`
//! 5. `Connection::connect` may be called again
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `config` | Address configuration and builder |
//! | `connection` | Connection state and frame routing |
//! | `socket` | WebSocket task |

// ============================================================================
// Submodules
// ============================================================================

/// Connection configuration and builder.
pub mod config;

/// Connection state and frame routing.
pub mod connection;

/// WebSocket task.
pub(crate) mod socket;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConnectionBuilder, ConnectionConfig};
pub use connection::Connection;
