use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use htsp::auth::{AuthListener, AuthState};
use htsp::config::ClientConfig;
use htsp::dispatcher::MessageListener;
use htsp::engine::{ConnectionListener, ConnectionState};
use htsp::message::Message;
use htsp::subscriber::Subscriber;
use htsp::supervisor::Supervisor;

#[derive(Parser)]
struct Args {
    #[arg(long, default_value = "localhost")]
    hostname: String,
    #[arg(long, default_value_t = 9982)]
    port: u16,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    channel_id: Option<i64>,
}

struct ConnectionLogger;
impl ConnectionListener for ConnectionLogger {
    fn on_state_change(&self, state: ConnectionState) {
        info!(?state, "connection");
    }
}

struct AuthLogger;
impl AuthListener for AuthLogger {
    fn on_auth_state(&self, state: AuthState) {
        info!(?state, "auth");
    }
}

struct ChannelLogger;
impl MessageListener for ChannelLogger {
    fn on_message(&self, msg: &Message) {
        if let Some(method) = msg.method() {
            if method == "channelAdd" || method == "channelUpdate" {
                info!(channel_id = msg.long("channelId", -1), name = %msg.string("channelName", ""), "channel");
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = ClientConfig {
        hostname: args.hostname,
        port: args.port,
        username: args.username,
        password: args.password,
        ..ClientConfig::default()
    };

    let supervisor = Supervisor::new(config);
    supervisor.dispatcher().add_message_listener(Arc::new(ChannelLogger));
    supervisor.authenticator().add_auth_listener(Arc::new(AuthLogger));
    supervisor.add_connection_listener(Arc::new(ConnectionLogger));

    supervisor.start();

    while !supervisor.is_authenticated() {
        if supervisor.is_stop_requested() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }

    if let Some(channel_id) = args.channel_id {
        let subscriber = Subscriber::new(supervisor.dispatcher(), &supervisor, Duration::from_secs(5));
        if let Err(e) = subscriber.subscribe(channel_id, None, None) {
            warn!(error = %e, "subscribe failed");
        }
    }

    loop {
        thread::sleep(Duration::from_secs(1));
        if supervisor.is_stop_requested() {
            break;
        }
    }
}
