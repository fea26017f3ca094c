//! Error kinds produced by the connection engine, codec, and dispatcher.
//!
//! Mirrors the error taxonomy of the wire protocol core: a framing or I/O
//! failure is fatal for the connection (the engine moves to FAILED); a
//! `NotConnected` or `Timeout` is a per-call result the caller can retry.

use thiserror::Error;

/// Errors surfaced by the HTSP client core.
#[derive(Error, Debug)]
pub enum HtspError {
    /// Wire framing or type byte invalid, declared length inconsistent, or a
    /// string getter found non-UTF-8 bytes.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Socket I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS resolution of the configured hostname failed.
    #[error("could not resolve address: {0}")]
    UnresolvedAddress(String),

    /// A send was attempted while the engine was not CONNECTED.
    #[error("not connected")]
    NotConnected,

    /// A synchronous reply did not arrive before the deadline.
    #[error("timed out waiting for reply")]
    Timeout,

    /// Server rejected the `authenticate` request (`noaccess` set).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A message was missing fields required to act on it. Non-fatal: the
    /// message is dropped and the connection continues.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, HtspError>;
