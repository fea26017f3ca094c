//! ## SUBSCRIBER TASK
//!
//! One instance per logical channel subscription, multiplexed onto the
//! shared connection by `subscriptionId`. Filters the shared message stream
//! down to the methods it understands and, among those, to messages
//! addressed to its own id; everything else is dropped silently.
//!
//! Re-subscription on reconnect is driven by auth-state, not
//! connection-state: a subscriber only re-issues `subscribe` once the
//! authenticator reaches AUTHENTICATED again, since the server won't accept
//! a subscribe request before that.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::auth::{AuthListener, AuthState};
use crate::dispatcher::{Dispatcher, MessageListener};
use crate::error::HtspError;
use crate::message::Message;
use crate::supervisor::Supervisor;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

const HANDLED_METHODS: &[&str] = &[
    "subscriptionStart",
    "subscriptionStatus",
    "subscriptionStop",
    "subscriptionSkip",
    "subscriptionSpeed",
    "queueStatus",
    "signalStatus",
    "timeshiftStatus",
    "muxpkt",
];

pub const SPEED_PAUSE: i64 = 0;
pub const SPEED_RESUME: i64 = 100;

#[derive(Clone)]
struct SubscribeParams {
    channel_id: i64,
    profile: Option<String>,
    timeshift_period: Option<i64>,
}

#[derive(Default)]
struct LastStats {
    queue: Option<Message>,
    signal: Option<Message>,
    timeshift: Option<Message>,
}

struct StatsTimer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl StatsTimer {
    fn start(interval: Duration, mut tick: impl FnMut() + Send + 'static) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_clone = stop.clone();
        let handle = thread::spawn(move || {
            let (lock, cvar) = &*stop_clone;
            let mut stopped = lock.lock().unwrap();
            loop {
                let (guard, result) = cvar.wait_timeout(stopped, interval).unwrap();
                stopped = guard;
                if *stopped {
                    break;
                }
                if result.timed_out() {
                    tick();
                }
            }
        });
        Self { stop, handle: Some(handle) }
    }

    fn cancel(mut self) {
        *self.stop.0.lock().unwrap() = true;
        self.stop.1.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct Subscriber {
    dispatcher: Arc<Dispatcher>,
    supervisor: Weak<Supervisor>,
    subscription_id: i64,
    reply_timeout: Duration,
    subscribed: Mutex<Option<SubscribeParams>>,
    stats: Mutex<LastStats>,
    timer: Mutex<Option<StatsTimer>>,
    self_weak: Weak<Subscriber>,
}

impl Subscriber {
    pub fn new(dispatcher: Arc<Dispatcher>, supervisor: &Arc<Supervisor>, reply_timeout: Duration) -> Arc<Self> {
        let subscription_id = supervisor.next_subscription_id();
        let subscriber = Arc::new_cyclic(|weak| Self {
            dispatcher,
            supervisor: Arc::downgrade(supervisor),
            subscription_id,
            reply_timeout,
            subscribed: Mutex::new(None),
            stats: Mutex::new(LastStats::default()),
            timer: Mutex::new(None),
            self_weak: weak.clone(),
        });
        supervisor.authenticator().add_auth_listener(subscriber.clone() as Arc<dyn AuthListener>);
        subscriber
    }

    pub fn subscription_id(&self) -> i64 {
        self.subscription_id
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.lock().unwrap().is_some()
    }

    fn ensure_registered(self: &Arc<Self>) {
        self.dispatcher.add_message_listener(self.clone() as Arc<dyn MessageListener>);
    }

    pub fn subscribe(self: &Arc<Self>, channel_id: i64, profile: Option<String>, timeshift_period: Option<i64>) -> Result<(), HtspError> {
        self.ensure_registered();

        let mut request = Message::request("subscribe");
        request.set_long("channelId", channel_id);
        request.set_long("subscriptionId", self.subscription_id);
        if let Some(profile) = &profile {
            request.set_string("profile", profile.clone());
        }
        if let Some(period) = timeshift_period {
            request.set_long("timeshiftPeriod", period);
        }

        let reply = self.dispatcher.send_await_reply(request, self.reply_timeout)?;
        let granted_timeshift = reply.long_opt("timeshiftPeriod").or(timeshift_period);

        *self.subscribed.lock().unwrap() = Some(SubscribeParams { channel_id, profile, timeshift_period: granted_timeshift });

        info!(subscription_id = self.subscription_id, channel_id, "subscribed");
        self.start_stats_timer();
        Ok(())
    }

    pub fn unsubscribe(self: &Arc<Self>) {
        self.cancel_stats_timer();
        // Unregister before sending, so a late subscriptionStop from the
        // server after this point is never delivered to our listener.
        self.dispatcher.remove_message_listener(&(self.clone() as Arc<dyn MessageListener>));

        let mut request = Message::request("unsubscribe");
        request.set_long("subscriptionId", self.subscription_id);
        match self.dispatcher.send_fire_and_forget(request) {
            Ok(()) | Err(HtspError::NotConnected) => {}
            Err(e) => warn!(error = %e, "unsubscribe send failed"),
        }

        *self.subscribed.lock().unwrap() = None;
    }

    pub fn set_speed(&self, speed: i64) {
        self.tolerant_send("subscriptionSpeed", |m| {
            m.set_long("speed", speed);
        });
    }

    pub fn pause(&self) {
        self.set_speed(SPEED_PAUSE);
    }

    pub fn resume(&self) {
        self.set_speed(SPEED_RESUME);
    }

    pub fn skip(&self, time: i64) {
        self.tolerant_send("subscriptionSkip", |m| {
            m.set_long("time", time);
        });
    }

    pub fn live(&self) {
        self.tolerant_send("subscriptionLive", |_| {});
    }

    fn tolerant_send(&self, method: &str, build: impl FnOnce(&mut Message)) {
        let mut request = Message::request(method);
        request.set_long("subscriptionId", self.subscription_id);
        build(&mut request);
        match self.dispatcher.send_fire_and_forget(request) {
            Ok(()) | Err(HtspError::NotConnected) => {}
            Err(e) => warn!(error = %e, method, "subscriber send failed"),
        }
    }

    fn start_stats_timer(self: &Arc<Self>) {
        self.cancel_stats_timer();
        let me = self.clone();
        let timer = StatsTimer::start(STATS_INTERVAL, move || me.log_stats());
        *self.timer.lock().unwrap() = Some(timer);
    }

    fn cancel_stats_timer(&self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }

    fn log_stats(&self) {
        let stats = self.stats.lock().unwrap();
        info!(
            subscription_id = self.subscription_id,
            queue = ?stats.queue,
            signal = ?stats.signal,
            timeshift = ?stats.timeshift,
            "subscription stats",
        );
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel_stats_timer();
    }
}

impl MessageListener for Subscriber {
    fn on_message(&self, msg: &Message) {
        let Some(method) = msg.method() else { return };
        if !HANDLED_METHODS.contains(&method.as_str()) {
            return;
        }
        if msg.long("subscriptionId", -1) != self.subscription_id {
            return;
        }

        match method.as_str() {
            "queueStatus" => self.stats.lock().unwrap().queue = Some(msg.clone()),
            "signalStatus" => self.stats.lock().unwrap().signal = Some(msg.clone()),
            "timeshiftStatus" => self.stats.lock().unwrap().timeshift = Some(msg.clone()),
            "subscriptionStop" => {
                info!(subscription_id = self.subscription_id, "server stopped subscription");
            }
            _ => {}
        }
    }
}

impl AuthListener for Subscriber {
    fn on_auth_state(&self, state: AuthState) {
        if state != AuthState::Authenticated {
            return;
        }
        let Some(params) = self.subscribed.lock().unwrap().clone() else { return };
        if let Some(supervisor) = self.supervisor.upgrade() {
            if supervisor.is_stop_requested() {
                return;
            }
        }
        let Some(me) = self.self_weak.upgrade() else { return };
        thread::spawn(move || {
            if let Err(e) = me.subscribe(params.channel_id, params.profile.clone(), params.timeshift_period) {
                warn!(error = %e, "resubscribe after reconnect failed");
            }
        });
    }
}
