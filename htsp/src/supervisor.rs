//! ## SUPERVISOR
//!
//! Owns the long-lived connection lifecycle: constructs a fresh
//! [`ConnectionEngine`] per attempt, wires the [`Dispatcher`] and
//! [`Authenticator`] onto it, runs it to completion on a dedicated thread,
//! and reconnects with exponential backoff and jitter on unexpected
//! failure. A clean `stop()` is terminal; nothing reconnects afterwards.
//!
//! Also hands out the per-connection subscription-id counter consumed by
//! [`Subscriber`](crate::subscriber::Subscriber) — kept here, scoped to one
//! `Supervisor`, rather than process-global (see DESIGN.md).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::auth::{AuthListener, AuthState, Authenticator};
use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::{ConnectionEngine, ConnectionListener, ConnectionState, MessageSink};

pub struct Supervisor {
    config: ClientConfig,
    dispatcher: Arc<Dispatcher>,
    authenticator: Arc<Authenticator>,
    engine: Mutex<Option<Arc<ConnectionEngine>>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    reached_authenticated: AtomicBool,
    next_subscription_id: AtomicI64,
    thread: Mutex<Option<JoinHandle<()>>>,
    connection_listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
}

impl Supervisor {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let dispatcher = Dispatcher::new();
        let authenticator = Authenticator::new(dispatcher.clone(), &config);
        let supervisor = Arc::new(Self {
            config,
            dispatcher,
            authenticator: authenticator.clone(),
            engine: Mutex::new(None),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
            reached_authenticated: AtomicBool::new(false),
            next_subscription_id: AtomicI64::new(0),
            thread: Mutex::new(None),
            connection_listeners: Mutex::new(Vec::new()),
        });
        // AuthFailed is treated as fatal for this connection attempt (see
        // DESIGN.md): close it so the reconnect loop below picks up with
        // backoff rather than staying connected-but-unauthenticated forever.
        authenticator.add_auth_listener(supervisor.clone() as Arc<dyn AuthListener>);
        supervisor
    }

    /// Registers a listener that is re-attached to every engine this
    /// supervisor constructs across reconnects, unlike
    /// [`ConnectionEngine::add_connection_listener`] which only applies to
    /// one connection attempt.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.connection_listeners.lock().unwrap().push(listener);
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn authenticator(&self) -> Arc<Authenticator> {
        self.authenticator.clone()
    }

    pub fn next_subscription_id(&self) -> i64 {
        self.next_subscription_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop.0.lock().unwrap()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticator.state() == AuthState::Authenticated
    }

    pub fn is_closed(&self) -> bool {
        match self.engine.lock().unwrap().as_ref() {
            Some(engine) => matches!(engine.state(), ConnectionState::Closed | ConnectionState::Failed),
            None => true,
        }
    }

    /// Spawns the dedicated connection thread. Idempotent in the sense that
    /// calling it twice on the same instance just leaks the first thread
    /// handle; callers are expected to call it once, matching how the
    /// engine's own `run()` guards against double-invocation.
    pub fn start(self: &Arc<Self>) {
        let me = self.clone();
        let handle = thread::spawn(move || me.run_loop());
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Requests a clean shutdown: no further reconnect attempts, the
    /// in-flight engine (if any) is asked to close, and this call blocks
    /// until the connection thread has actually exited.
    pub fn stop(&self) {
        *self.stop.0.lock().unwrap() = true;
        self.stop.1.notify_all();
        if let Some(engine) = self.engine.lock().unwrap().as_ref() {
            engine.close_connection();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn run_loop(self: Arc<Self>) {
        let mut backoff_ms = self.config.reconnect_backoff.initial_ms;

        while !self.is_stop_requested() {
            let engine = match ConnectionEngine::new(
                self.config.hostname.clone(),
                self.config.port,
                Duration::from_millis(self.config.connect_timeout_ms),
            ) {
                Ok(engine) => engine,
                Err(e) => {
                    warn!(error = %e, "failed to construct connection engine");
                    if !self.interruptible_sleep(Duration::from_millis(backoff_ms)) {
                        break;
                    }
                    continue;
                }
            };

            self.reached_authenticated.store(false, Ordering::SeqCst);
            *self.engine.lock().unwrap() = Some(engine.clone());
            self.dispatcher.bind_engine(engine.clone());
            engine.add_connection_listener(self.authenticator.clone() as Arc<dyn ConnectionListener>);
            for listener in self.connection_listeners.lock().unwrap().iter() {
                engine.add_connection_listener(listener.clone());
            }

            engine.run(self.dispatcher.clone() as Arc<dyn MessageSink>, self.dispatcher.queue());

            // Closed here can mean either an explicit stop() or this
            // supervisor's own AuthFailed handler closing a connection
            // that never got past the handshake — only a real stop()
            // should end the loop; everything else reconnects.
            if self.is_stop_requested() {
                break;
            }

            if self.reached_authenticated.swap(false, Ordering::SeqCst) {
                backoff_ms = self.config.reconnect_backoff.initial_ms;
            }

            info!(backoff_ms, "reconnecting after connection failure");
            if !self.interruptible_sleep(Duration::from_millis(backoff_ms)) {
                break;
            }
            let jitter = backoff_ms as f64 * self.config.reconnect_backoff.jitter * rand::random::<f64>();
            backoff_ms = ((backoff_ms * 2) + jitter as u64).min(self.config.reconnect_backoff.max_ms);
        }
    }

    /// Sleeps up to `duration`, waking early if `stop()` is called.
    /// Returns `false` if the sleep ended because of a stop request.
    fn interruptible_sleep(&self, duration: Duration) -> bool {
        let (lock, cvar) = &*self.stop;
        let guard = lock.lock().unwrap();
        let (guard, _) = cvar.wait_timeout(guard, duration).unwrap();
        !*guard
    }
}

impl AuthListener for Supervisor {
    fn on_auth_state(&self, state: AuthState) {
        match state {
            AuthState::Authenticated => {
                self.reached_authenticated.store(true, Ordering::SeqCst);
            }
            AuthState::Failed => {
                warn!("authentication failed; closing connection to trigger a backoff reconnect");
                if let Some(engine) = self.engine.lock().unwrap().as_ref() {
                    engine.close_connection();
                }
            }
            _ => {}
        }
    }
}
