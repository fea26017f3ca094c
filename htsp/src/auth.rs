//! ## AUTHENTICATOR
//!
//! Drives the `hello`/`authenticate` challenge-response handshake that gates
//! every higher-level use of the connection. Registered as a connection
//! state listener: it runs the handshake automatically the moment the
//! engine reaches CONNECTED, and resets to IDLE the moment the connection
//! tears down.

use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tracing::{error, info, warn};

use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::{ConnectionListener, ConnectionState};
use crate::listener::{dispatch, Executor};
use crate::message::Message;

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// One of {IDLE, AUTHENTICATING, AUTHENTICATED, FAILED}. Reset to IDLE on
/// every CLOSED transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    Authenticating,
    Authenticated,
    Failed,
}

pub trait AuthListener: Send + Sync {
    fn on_auth_state(&self, state: AuthState);
    fn executor(&self) -> Option<Arc<dyn Executor>> {
        None
    }
}

struct ListenerEntry {
    listener: Arc<dyn AuthListener>,
}

pub struct Authenticator {
    dispatcher: Arc<Dispatcher>,
    username: String,
    password: String,
    client_name: String,
    client_version: String,
    htsp_version: i64,
    reply_timeout: Duration,
    state: Mutex<AuthState>,
    listeners: Mutex<Vec<ListenerEntry>>,
    self_weak: Weak<Authenticator>,
}

impl Authenticator {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &ClientConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            dispatcher,
            username: config.username.clone(),
            password: config.password.clone(),
            client_name: config.client_name.clone(),
            client_version: config.client_version.clone(),
            htsp_version: config.htsp_version,
            reply_timeout: Duration::from_millis(config.reply_timeout_ms),
            state: Mutex::new(AuthState::Idle),
            listeners: Mutex::new(Vec::new()),
            self_weak: weak.clone(),
        })
    }

    pub fn state(&self) -> AuthState {
        *self.state.lock().unwrap()
    }

    pub fn add_auth_listener(&self, listener: Arc<dyn AuthListener>) {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.iter().any(|e| Arc::ptr_eq(&e.listener, &listener)) {
            warn!("duplicate add_auth_listener ignored");
            return;
        }
        listeners.push(ListenerEntry { listener });
    }

    pub fn remove_auth_listener(&self, listener: &Arc<dyn AuthListener>) {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|e| !Arc::ptr_eq(&e.listener, listener));
        if listeners.len() == before {
            warn!("remove_auth_listener: listener was not registered");
        }
    }

    fn set_state(&self, new_state: AuthState) {
        *self.state.lock().unwrap() = new_state;
        info!(?new_state, "auth state transition");
        let listeners = self.listeners.lock().unwrap().iter().map(|e| e.listener.clone()).collect::<Vec<_>>();
        for listener in listeners {
            let executor = listener.executor();
            dispatch(&executor, move || listener.on_auth_state(new_state));
        }
    }

    fn handshake(self: Arc<Self>) {
        self.set_state(AuthState::Authenticating);

        let mut hello = Message::request("hello");
        hello.set_long("htspversion", self.htsp_version);
        hello.set_string("clientname", self.client_name.clone());
        hello.set_string("clientversion", self.client_version.clone());

        let hello_reply = match self.dispatcher.send_await_reply(hello, HELLO_TIMEOUT) {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "hello failed");
                self.set_state(AuthState::Failed);
                return;
            }
        };

        let challenge = hello_reply.bin("challenge");
        let digest = sha1_digest(self.password.as_bytes(), &challenge);

        let mut authenticate = Message::request("authenticate");
        authenticate.set_string("username", self.username.clone());
        authenticate.set_bin("digest", digest);

        let auth_reply = match self.dispatcher.send_await_reply(authenticate, self.reply_timeout) {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "authenticate failed");
                self.set_state(AuthState::Failed);
                return;
            }
        };

        if auth_reply.long("noaccess", 0) == 0 {
            self.set_state(AuthState::Authenticated);
        } else {
            warn!("server reported noaccess");
            self.set_state(AuthState::Failed);
        }
    }
}

impl ConnectionListener for Authenticator {
    fn on_state_change(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                // send_await_reply blocks, so the handshake must not run on
                // the I/O thread that produced this callback.
                if let Some(me) = self.self_weak.upgrade() {
                    thread::spawn(move || me.handshake());
                }
            }
            ConnectionState::Closed | ConnectionState::Failed => {
                self.set_state(AuthState::Idle);
            }
            _ => {}
        }
    }
}

fn sha1_digest(password: &[u8], challenge: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(password);
    hasher.update(challenge);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_sha1_of_password_then_challenge() {
        let digest = sha1_digest(b"dev", &[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(digest.len(), 20);

        let mut expected_input = b"dev".to_vec();
        expected_input.extend_from_slice(&[0x00, 0x01, 0x02, 0x03]);
        let mut hasher = Sha1::new();
        hasher.update(&expected_input);
        assert_eq!(digest, hasher.finalize().to_vec());
    }
}
