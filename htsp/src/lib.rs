//! Client core for the Home TV Streaming Protocol (HTSP).
//!
//! Wires a binary field-list codec onto a non-blocking, readiness-driven
//! TCP loop, a request/reply dispatcher keyed by sequence number, a
//! challenge-response authenticator, and per-channel subscriptions that
//! re-establish themselves across reconnects. [`Supervisor`] is the
//! top-level entry point; everything else is exposed for callers who want
//! finer-grained control.

pub mod auth;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod listener;
pub mod message;
pub mod reader;
pub mod subscriber;
pub mod supervisor;
pub mod writer;

pub use auth::{AuthListener, AuthState, Authenticator};
pub use config::{ClientConfig, ReconnectBackoff};
pub use dispatcher::{Dispatcher, MessageListener};
pub use engine::{ConnectionListener, ConnectionState};
pub use error::{HtspError, Result};
pub use message::{Message, Value};
pub use subscriber::Subscriber;
pub use supervisor::Supervisor;
