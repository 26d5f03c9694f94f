//! Client for the streaming event feed: session lifecycle, subscription
//! registration and reconnection.

pub mod retry;
pub mod session;
pub mod subscriptions;
pub mod transport;

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{ConnectionStatus, Credential, EventCategory},
    protocol::Notification,
};
use tokio::sync::{mpsc, oneshot, watch};

pub use retry::{Clock, RetryPolicy, TokioClock};
pub use session::{SessionEffect, SessionEvent, SessionMachine, SessionState};
pub use subscriptions::{
    HttpSubscriptionApi, Registration, Subscription, SubscriptionApi, SubscriptionError,
    SubscriptionManager,
};
pub use transport::{TransportError, KEEPALIVE_GRACE, TEARDOWN_BUDGET};

use transport::{Command, Driver};

pub const DEFAULT_FEED_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub endpoint: String,
    pub categories: Vec<EventCategory>,
    pub retry: RetryPolicy,
    /// Added to the keepalive window the feed announces.
    pub keepalive_grace: Duration,
    /// Upper bound on waiting for subscription removals at logout.
    pub teardown_budget: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_FEED_URL.to_string(),
            categories: EventCategory::ALL.to_vec(),
            retry: RetryPolicy::default(),
            keepalive_grace: KEEPALIVE_GRACE,
            teardown_budget: TEARDOWN_BUDGET,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Notification(Notification),
    Status(ConnectionStatus),
}

/// Handle to the background feed driver. Cloning shares the same session.
#[derive(Clone)]
pub struct FeedClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl FeedClient {
    pub fn spawn(
        config: FeedConfig,
        api: Arc<dyn SubscriptionApi>,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<FeedEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let driver = Driver::new(
            SessionMachine::new(config.endpoint, config.retry),
            SubscriptionManager::new(api),
            config.categories,
            clock,
            commands_rx,
            events_tx,
            status_tx,
            config.keepalive_grace,
            config.teardown_budget,
        );
        tokio::spawn(driver.run());

        (
            Self {
                commands: commands_tx,
                status: status_rx,
            },
            events_rx,
        )
    }

    /// Opens a session with `credential`. A no-op while a session is live.
    pub fn connect(&self, credential: Credential) {
        let _ = self.commands.send(Command::Connect(credential));
    }

    /// Removes every subscription, closes the connection and waits until the
    /// driver reports the session closed. No reconnect follows. Removals that
    /// outlast [`FeedConfig::teardown_budget`] are abandoned.
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod transport_tests;
