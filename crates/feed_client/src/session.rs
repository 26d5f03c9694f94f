//! Transport-free session state machine. The socket driver feeds it events
//! and carries out the effects it returns.

use std::time::Duration;

use shared::{
    domain::{ConnectionStatus, SessionId, SubscriptionId},
    protocol::{FeedMessage, Notification},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Welcomed,
    Active,
    Migrating,
    Closing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectRequested,
    DisconnectRequested,
    Frame(FeedMessage),
    SubscriptionsReady { session_id: SessionId },
    /// The successor connection of a migration could not be established.
    MigrationFailed,
    /// The live connection ended or could not be opened.
    ConnectionLost,
    RetryDue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    Open { url: String },
    Subscribe { session_id: SessionId },
    Deliver(Notification),
    Migrate { url: String },
    /// The successor is welcomed; let the old connection drain and close.
    RetirePrimary,
    Revoke { subscription_id: SubscriptionId },
    ForgetSubscriptions,
    ScheduleRetry { attempt: u32, delay: Duration },
    CancelRetry,
    Teardown,
    Close,
    WatchKeepalive { window: Duration },
    Status(ConnectionStatus),
}

pub struct SessionMachine {
    state: SessionState,
    endpoint: String,
    policy: RetryPolicy,
    session_id: Option<SessionId>,
    attempt: u32,
    closed_by_user: bool,
    retry_pending: bool,
}

impl SessionMachine {
    pub fn new(endpoint: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            state: SessionState::Disconnected,
            endpoint: endpoint.into(),
            policy,
            session_id: None,
            attempt: 0,
            closed_by_user: false,
            retry_pending: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionEffect> {
        match event {
            SessionEvent::ConnectRequested => self.on_connect_requested(),
            SessionEvent::DisconnectRequested => self.on_disconnect_requested(),
            SessionEvent::Frame(message) => self.on_frame(message),
            SessionEvent::SubscriptionsReady { session_id } => {
                if self.state == SessionState::Welcomed
                    && self.session_id.as_ref() == Some(&session_id)
                {
                    self.state = SessionState::Active;
                }
                Vec::new()
            }
            SessionEvent::MigrationFailed => {
                if self.state != SessionState::Migrating {
                    return Vec::new();
                }
                warn!("feed migration failed; keeping current connection");
                self.state = SessionState::Active;
                vec![SessionEffect::Status(ConnectionStatus::Connected)]
            }
            SessionEvent::ConnectionLost => self.on_connection_lost(),
            SessionEvent::RetryDue => {
                if !self.retry_pending || self.closed_by_user {
                    return Vec::new();
                }
                self.retry_pending = false;
                self.state = SessionState::Connecting;
                info!(attempt = self.attempt, "reconnecting to feed");
                self.open()
            }
        }
    }

    fn on_connect_requested(&mut self) -> Vec<SessionEffect> {
        match self.state {
            SessionState::Disconnected => {
                self.closed_by_user = false;
                let mut effects = Vec::new();
                if self.retry_pending {
                    self.retry_pending = false;
                    effects.push(SessionEffect::CancelRetry);
                } else {
                    self.attempt = 0;
                }
                self.state = SessionState::Connecting;
                effects.extend(self.open());
                effects
            }
            _ => {
                debug!(state = ?self.state, "connect ignored; session already live");
                Vec::new()
            }
        }
    }

    fn on_disconnect_requested(&mut self) -> Vec<SessionEffect> {
        self.closed_by_user = true;
        self.retry_pending = false;
        self.state = SessionState::Closing;
        vec![
            SessionEffect::CancelRetry,
            SessionEffect::Teardown,
            SessionEffect::Close,
        ]
    }

    fn on_frame(&mut self, message: FeedMessage) -> Vec<SessionEffect> {
        if matches!(
            self.state,
            SessionState::Closing | SessionState::Disconnected
        ) {
            debug!(kind = message.kind(), "ignoring frame on closed session");
            return Vec::new();
        }

        match message {
            FeedMessage::Welcome {
                session_id,
                keepalive_timeout_seconds,
            } => {
                self.attempt = 0;
                let mut effects = Vec::new();
                if self.state == SessionState::Migrating {
                    info!(%session_id, "feed session migrated");
                    self.state = SessionState::Active;
                    effects.push(SessionEffect::RetirePrimary);
                } else {
                    info!(%session_id, "feed session established");
                    self.state = SessionState::Welcomed;
                    effects.push(SessionEffect::Subscribe {
                        session_id: session_id.clone(),
                    });
                }
                self.session_id = Some(session_id);
                if let Some(seconds) = keepalive_timeout_seconds {
                    effects.push(SessionEffect::WatchKeepalive {
                        window: Duration::from_secs(seconds),
                    });
                }
                effects.push(SessionEffect::Status(ConnectionStatus::Connected));
                effects
            }
            FeedMessage::Keepalive => Vec::new(),
            FeedMessage::Notification(notification) => {
                vec![SessionEffect::Deliver(notification)]
            }
            FeedMessage::Reconnect { reconnect_url } => {
                let Some(url) = reconnect_url else {
                    warn!("dropping migrate directive without a target endpoint");
                    return Vec::new();
                };
                if !is_socket_url(&url) {
                    warn!(%url, "dropping migrate directive with an unusable endpoint");
                    return Vec::new();
                }
                if self.state == SessionState::Migrating {
                    warn!(%url, "migration already in progress; ignoring directive");
                    return Vec::new();
                }
                info!(%url, "feed requested session migration");
                self.state = SessionState::Migrating;
                vec![
                    SessionEffect::Status(ConnectionStatus::Migrating),
                    SessionEffect::Migrate { url },
                ]
            }
            FeedMessage::Revocation {
                subscription_id,
                status,
            } => {
                warn!(%subscription_id, status = status.as_deref().unwrap_or("unknown"), "subscription revoked");
                vec![SessionEffect::Revoke { subscription_id }]
            }
        }
    }

    fn on_connection_lost(&mut self) -> Vec<SessionEffect> {
        if self.closed_by_user || self.state == SessionState::Closing {
            self.state = SessionState::Disconnected;
            self.session_id = None;
            return vec![
                SessionEffect::ForgetSubscriptions,
                SessionEffect::Status(ConnectionStatus::Disconnected),
            ];
        }
        if self.state == SessionState::Disconnected {
            return Vec::new();
        }

        self.state = SessionState::Disconnected;
        self.session_id = None;
        self.attempt += 1;
        let mut effects = vec![SessionEffect::ForgetSubscriptions];
        match self.policy.delay_for(self.attempt) {
            Some(delay) => {
                warn!(
                    attempt = self.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "feed connection lost; scheduling reconnect"
                );
                self.retry_pending = true;
                effects.push(SessionEffect::Status(ConnectionStatus::Disconnected));
                effects.push(SessionEffect::ScheduleRetry {
                    attempt: self.attempt,
                    delay,
                });
            }
            None => {
                error!(
                    attempts = self.attempt - 1,
                    "feed reconnection budget exhausted; staying disconnected"
                );
                effects.push(SessionEffect::Status(ConnectionStatus::Exhausted));
            }
        }
        effects
    }

    fn open(&self) -> Vec<SessionEffect> {
        vec![
            SessionEffect::Status(ConnectionStatus::Connecting),
            SessionEffect::Open {
                url: self.endpoint.clone(),
            },
        ]
    }
}

fn is_socket_url(raw: &str) -> bool {
    Url::parse(raw)
        .map(|url| matches!(url.scheme(), "ws" | "wss"))
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
