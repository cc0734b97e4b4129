//! Keepalive and reconnect controller
//!
//! Both timers run as tokio tasks owned by the session. They hold only a
//! weak reference to it and re-check the session under its lock every time
//! they wake, so a timer that fires after `disconnect()` or after its link
//! was replaced does nothing.

use std::sync::Weak;
use std::time::Duration;

use mqttkit_transport::Connector;
use tracing::{info, warn};

use crate::options::Options;
use crate::session::{Shared, connect};

const MIN_RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// Timer policy derived from `Options`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Probe interval. `None` when keepalive is off.
    pub interval: Option<Duration>,
    /// Silence from the broker longer than this means the link is dead.
    pub dead_after: Duration,
    /// Pause between reconnect attempts.
    pub reconnect_every: Duration,
    /// Reconnecting stops once the broker has been silent this long.
    pub reconnect_window: Duration,
}

impl KeepAlive {
    pub fn from_options(options: &Options) -> Self {
        let interval = Duration::from_secs(u64::from(options.keep_alive));
        Self {
            interval: (!interval.is_zero()).then_some(interval),
            dead_after: interval * 3 / 2,
            reconnect_every: (interval / 2).max(MIN_RECONNECT_INTERVAL),
            reconnect_window: options.auto_reconnect_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectStep {
    Attempt,
    Stop,
}

/// Probes the broker every `interval` for as long as link `epoch` is current.
pub(crate) async fn keepalive_loop<C: Connector>(
    shared: Weak<Shared<C>>,
    epoch: u64,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(session) = shared.upgrade() else {
            return;
        };
        if !session.keepalive_tick(epoch) {
            return;
        }
    }
}

/// Reconnects while the session is disconnected, auto-reconnect is on, the
/// application has not disconnected and the broker was last heard from
/// within the reconnect window.
pub(crate) async fn reconnect_loop<C: Connector>(shared: Weak<Shared<C>>) {
    loop {
        let Some(session) = shared.upgrade() else {
            return;
        };
        if session.reconnect_step() == ReconnectStep::Stop {
            return;
        }

        info!("Attempting to reconnect");
        if let Err(err) = connect(session.clone(), false).await {
            warn!("Reconnect attempt failed: {err}");
        }

        let every = session.policy().reconnect_every;
        drop(session);
        tokio::time::sleep(every).await;
    }
}
