//! Connection configuration.
//!
//! Provides a fluent API for configuring and creating [`Connection`]
//! instances.
//!
//! # Example
//!
//! ```no_run
//! use muxstream::Connection;
//!
//! # fn example() -> muxstream::Result<()> {
//! let connection = Connection::builder()
//!     .addr("https://example.com/api")
//!     .path("/stream")
//!     .build()?;
//!
//! assert_eq!(connection.transport_url()?, "wss://example.com/api/stream");
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use url::Url;

use crate::error::{Error, Result};

use super::Connection;

// ============================================================================
// ConnectionConfig
// ============================================================================

/// Validated connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Base address of the server, e.g. `https://example.com`.
    addr: String,
    /// Path appended to the derived WebSocket address.
    path: String,
}

impl ConnectionConfig {
    /// Returns the configured base address.
    #[inline]
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns the configured channel path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Derives the WebSocket address.
    ///
    /// The scheme is rewritten (`https`/`wss` → `wss`, anything else →
    /// `ws`), a trailing slash is stripped and the path is appended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the address is empty, cannot be parsed
    /// or cannot carry a WebSocket scheme.
    pub fn transport_url(&self) -> Result<String> {
        if self.addr.is_empty() {
            return Err(Error::config("Server address not defined"));
        }

        let mut url = Url::parse(&self.addr)
            .map_err(|e| Error::config(format!("Invalid server address `{}`: {e}", self.addr)))?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|()| {
            Error::config(format!(
                "Cannot derive a WebSocket address from `{}`",
                self.addr
            ))
        })?;

        let mut base = String::from(url);
        if base.ends_with('/') {
            base.pop();
        }

        Ok(format!("{base}{}", self.path))
    }
}

// ============================================================================
// ConnectionBuilder
// ============================================================================

/// Builder for configuring a [`Connection`].
///
/// Use [`Connection::builder()`] to create a new builder.
#[derive(Debug, Default, Clone)]
pub struct ConnectionBuilder {
    /// Base server address.
    addr: Option<String>,
    /// Channel path.
    path: Option<String>,
}

impl ConnectionBuilder {
    /// Creates a new builder with no configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base server address.
    ///
    /// # Arguments
    ///
    /// * `addr` - Server address (e.g., "https://example.com")
    #[inline]
    #[must_use]
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Sets the path appended to the WebSocket address.
    ///
    /// # Arguments
    ///
    /// * `path` - Channel path (e.g., "/stream"); empty by default
    #[inline]
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Builds the connection with validation.
    ///
    /// The connection is not connected yet; call
    /// [`Connection::connect`].
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the address is missing or invalid
    /// - [`Error::Config`] if the path does not start with `/`
    pub fn build(self) -> Result<Connection> {
        let config = self.validate()?;
        Ok(Connection::from_config(config))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ConnectionBuilder {
    /// Validates the builder into a config.
    fn validate(self) -> Result<ConnectionConfig> {
        let addr = self.addr.ok_or_else(|| {
            Error::config(
                "Server address is required. Use .addr() to set it.\n\
                 Example: Connection::builder().addr(\"https://example.com\")",
            )
        })?;

        let path = self.path.unwrap_or_default();
        if !path.is_empty() && !path.starts_with('/') {
            return Err(Error::config(format!(
                "Path `{path}` must start with `/`.\n\
                 Example: Connection::builder().path(\"/stream\")"
            )));
        }

        let config = ConnectionConfig { addr, path };
        config.transport_url()?;

        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
