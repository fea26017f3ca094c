//! ## CONNECTION ENGINE
//!
//! A non-blocking, readiness-driven TCP loop owning exactly one socket for
//! the lifetime of one connection attempt. State machine:
//!
//! ```text
//! CLOSED --start--> CONNECTING --socket connectable--> CONNECTED
//! CONNECTING --I/O error, DNS fail--> FAILED
//! CONNECTED --peer close / I/O error / framing error--> FAILED
//! CONNECTED --close_connection()--> CLOSING --> CLOSED
//! CONNECTING --close_connection()--> CLOSING --> CLOSED
//! ```
//!
//! FAILED and CLOSED are terminal for this run; reconnecting means the
//! [Supervisor] constructing a fresh engine, not resetting this one.
//!
//! [Supervisor]: crate::supervisor::Supervisor

use std::io;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::dispatcher::SendQueue;
use crate::error::HtspError;
use crate::listener::{dispatch, Executor};
use crate::message::Message;
use crate::reader::Reader;
use crate::writer::Writer;

const STREAM_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// One of {CLOSED, CONNECTING, CONNECTED, CLOSING, FAILED}. Initial CLOSED.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Closing,
    Failed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Closed
    }
}

/// Receives messages delivered by the engine and is told when the
/// connection has torn down, so it can clear whatever it keyed off the old
/// connection (outstanding requests, rendezvous waiters).
pub trait MessageSink: Send + Sync {
    fn on_message(&self, msg: Message);
    fn on_closed(&self);
}

/// What a [Dispatcher] needs from the engine to implement
/// `send_fire_and_forget`/`send_await_reply`: the current state, and a way
/// to arm write-readiness from any thread.
///
/// [Dispatcher]: crate::dispatcher::Dispatcher
pub trait EngineHandle: Send + Sync {
    fn state(&self) -> ConnectionState;
    fn set_write_pending(&self);
}

pub trait ConnectionListener: Send + Sync {
    fn on_state_change(&self, state: ConnectionState);
    fn executor(&self) -> Option<Arc<dyn Executor>> {
        None
    }
}

struct ListenerEntry {
    listener: Arc<dyn ConnectionListener>,
}

pub struct ConnectionEngine {
    host: String,
    port: u16,
    connect_timeout: Duration,
    state: Mutex<ConnectionState>,
    listeners: Mutex<Vec<ListenerEntry>>,
    poll: Mutex<Option<Poll>>,
    waker: Arc<Waker>,
    write_pending: AtomicBool,
    close_requested: AtomicBool,
}

impl ConnectionEngine {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let waker_registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(&waker_registry, WAKE_TOKEN)?);
        Ok(Arc::new(Self {
            host: host.into(),
            port,
            connect_timeout,
            state: Mutex::new(ConnectionState::Closed),
            listeners: Mutex::new(Vec::new()),
            poll: Mutex::new(Some(poll)),
            waker,
            write_pending: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
        }))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.iter().any(|e| Arc::ptr_eq(&e.listener, &listener)) {
            warn!("duplicate add_connection_listener ignored");
            return;
        }
        listeners.push(ListenerEntry { listener });
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|e| !Arc::ptr_eq(&e.listener, listener));
        if listeners.len() == before {
            warn!("remove_connection_listener: listener was not registered");
        }
    }

    fn set_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.lock().unwrap();
            *state = new_state;
        }
        info!(?new_state, "connection state transition");
        let listeners = self.listeners.lock().unwrap().iter().map(|e| e.listener.clone()).collect::<Vec<_>>();
        for listener in listeners {
            let executor = listener.executor();
            dispatch(&executor, move || listener.on_state_change(new_state));
        }
    }

    /// Arms WRITE interest and wakes the readiness wait; callable from any
    /// thread.
    pub fn set_write_pending(&self) {
        self.write_pending.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    /// Requests the I/O loop close the socket and exit; callable from any
    /// thread, including concurrently with the loop itself running.
    pub fn close_connection(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    /// Runs the readiness loop to completion on the calling thread. Intended
    /// to be called once, from the thread the [Supervisor] dedicates to this
    /// connection; blocks until the connection reaches CLOSED or FAILED.
    ///
    /// [Supervisor]: crate::supervisor::Supervisor
    pub fn run(&self, sink: Arc<dyn MessageSink>, send_queue: Arc<SendQueue>) {
        let mut poll = match self.poll.lock().unwrap().take() {
            Some(poll) => poll,
            None => {
                error!("ConnectionEngine::run called more than once");
                return;
            }
        };

        let addr = match (self.host.as_str(), self.port).to_socket_addrs().ok().and_then(|mut i| i.next()) {
            Some(addr) => addr,
            None => {
                error!(host = %self.host, port = self.port, "address resolution failed");
                self.set_state(ConnectionState::Failed);
                sink.on_closed();
                return;
            }
        };

        let mut stream = match MioTcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "tcp connect failed");
                self.set_state(ConnectionState::Failed);
                sink.on_closed();
                return;
            }
        };

        if let Err(e) = poll.registry().register(&mut stream, STREAM_TOKEN, Interest::READABLE | Interest::WRITABLE) {
            error!(error = %e, "failed to register socket with poller");
            self.set_state(ConnectionState::Failed);
            sink.on_closed();
            return;
        }

        self.set_state(ConnectionState::Connecting);

        let mut reader = Reader::new();
        let mut writer = Writer::new(send_queue);
        let mut events = Events::with_capacity(64);
        let mut connect_deadline = std::time::Instant::now() + self.connect_timeout;

        let final_state = 'io_loop: loop {
            let timeout = if self.state() == ConnectionState::Connecting {
                Some(connect_deadline.saturating_duration_since(std::time::Instant::now()))
            } else {
                None
            };

            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                break 'io_loop ConnectionState::Failed;
            }

            if events.is_empty() && self.state() == ConnectionState::Connecting {
                warn!("connect timed out");
                break 'io_loop ConnectionState::Failed;
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {
                        if self.close_requested.load(Ordering::SeqCst) {
                            break 'io_loop ConnectionState::Closed;
                        }
                    }
                    STREAM_TOKEN => {
                        if self.state() == ConnectionState::Connecting {
                            match stream.take_error() {
                                Ok(None) => {
                                    connect_deadline = std::time::Instant::now();
                                    self.set_state(ConnectionState::Connected);
                                }
                                Ok(Some(e)) | Err(e) => {
                                    error!(error = %e, "connect failed");
                                    break 'io_loop ConnectionState::Failed;
                                }
                            }
                        }

                        if self.state() == ConnectionState::Connected {
                            if event.is_readable() {
                                match reader.fill_from(&mut stream) {
                                    Ok(messages) => {
                                        for msg in messages {
                                            debug!(?msg, "message received");
                                            sink.on_message(msg);
                                        }
                                    }
                                    Err(e) => {
                                        error!(error = %e, "read failed");
                                        break 'io_loop ConnectionState::Failed;
                                    }
                                }
                            }
                            if event.is_writable() {
                                if let Err(e) = writer.drain_to(&mut stream) {
                                    error!(error = %e, "write failed");
                                    break 'io_loop ConnectionState::Failed;
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }

            if self.close_requested.load(Ordering::SeqCst) {
                break 'io_loop ConnectionState::Closed;
            }

            let mut interest = Interest::READABLE;
            let connecting = self.state() == ConnectionState::Connecting;
            let write_requested = self.write_pending.swap(false, Ordering::SeqCst);
            if connecting || writer.has_pending_data() || write_requested {
                interest = interest.add(Interest::WRITABLE);
            }
            if let Err(e) = poll.registry().reregister(&mut stream, STREAM_TOKEN, interest) {
                error!(error = %e, "failed to reregister socket interest");
                break 'io_loop ConnectionState::Failed;
            }
        };

        if final_state == ConnectionState::Closed {
            self.set_state(ConnectionState::Closing);
        }
        let _ = poll.registry().deregister(&mut stream);
        drop(stream);
        sink.on_closed();
        self.set_state(final_state);
    }
}

impl EngineHandle for ConnectionEngine {
    fn state(&self) -> ConnectionState {
        ConnectionEngine::state(self)
    }

    fn set_write_pending(&self) {
        ConnectionEngine::set_write_pending(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl MessageSink for NullSink {
        fn on_message(&self, _msg: Message) {}
        fn on_closed(&self) {}
    }

    #[test]
    fn unresolvable_host_transitions_to_failed() {
        let engine = ConnectionEngine::new("this.host.does.not.resolve.invalid", 1, Duration::from_millis(50)).unwrap();
        let queue = Arc::new(SendQueue::new());
        engine.run(Arc::new(NullSink), queue);
        assert_eq!(engine.state(), ConnectionState::Failed);
    }

    #[test]
    fn duplicate_listener_add_is_idempotent() {
        struct L;
        impl ConnectionListener for L {
            fn on_state_change(&self, _state: ConnectionState) {}
        }
        let engine = ConnectionEngine::new("example.invalid", 1, Duration::from_millis(10)).unwrap();
        let l: Arc<dyn ConnectionListener> = Arc::new(L);
        engine.add_connection_listener(l.clone());
        engine.add_connection_listener(l.clone());
        assert_eq!(engine.listeners.lock().unwrap().len(), 1);
    }
}
