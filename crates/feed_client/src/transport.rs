//! Socket driver: owns the live connections and runs [`SessionMachine`]
//! against them.

use std::{collections::VecDeque, future::Future, pin::Pin, sync::Arc, time::Duration};

use futures::{future::BoxFuture, StreamExt};
use shared::{
    domain::{ConnectionStatus, Credential, EventCategory, SessionId},
    protocol::FeedMessage,
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    time::Sleep,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{
    retry::Clock,
    session::{SessionEffect, SessionEvent, SessionMachine, SessionState},
    subscriptions::{register, Registration, SubscriptionManager},
    FeedEvent,
};

/// Slack added to the keepalive window announced in the welcome.
pub const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

/// Longest a logout waits on subscription removals before closing anyway.
pub const TEARDOWN_BUDGET: Duration = Duration::from_secs(2);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Opening = BoxFuture<'static, Result<Socket, TransportError>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
}

pub(crate) enum Command {
    Connect(Credential),
    Disconnect(oneshot::Sender<()>),
}

pub(crate) struct Driver {
    machine: SessionMachine,
    subscriptions: SubscriptionManager,
    categories: Vec<EventCategory>,
    clock: Arc<dyn Clock>,
    credential: Option<Credential>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<FeedEvent>,
    status: watch::Sender<ConnectionStatus>,
    registered_tx: mpsc::UnboundedSender<Registration>,
    registered_rx: mpsc::UnboundedReceiver<Registration>,
    primary: Option<Socket>,
    successor: Option<Socket>,
    /// Retired by a migration; read until the feed closes it.
    draining: Option<Socket>,
    /// Session ids since the last welcome that registered subscriptions.
    /// A migration keeps the subscriptions, so results for any of these
    /// still belong to the live session.
    lineage: Vec<SessionId>,
    opening_primary: Option<Opening>,
    opening_successor: Option<Opening>,
    retry: Option<BoxFuture<'static, ()>>,
    keepalive: Option<Pin<Box<Sleep>>>,
    keepalive_window: Option<Duration>,
    keepalive_grace: Duration,
    teardown_budget: Duration,
    pending_acks: Vec<oneshot::Sender<()>>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        machine: SessionMachine,
        subscriptions: SubscriptionManager,
        categories: Vec<EventCategory>,
        clock: Arc<dyn Clock>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<FeedEvent>,
        status: watch::Sender<ConnectionStatus>,
        keepalive_grace: Duration,
        teardown_budget: Duration,
    ) -> Self {
        let (registered_tx, registered_rx) = mpsc::unbounded_channel();
        Self {
            machine,
            subscriptions,
            categories,
            clock,
            credential: None,
            commands,
            events,
            status,
            registered_tx,
            registered_rx,
            primary: None,
            successor: None,
            draining: None,
            lineage: Vec::new(),
            opening_primary: None,
            opening_successor: None,
            retry: None,
            keepalive: None,
            keepalive_window: None,
            keepalive_grace,
            teardown_budget,
            pending_acks: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Connect(credential)) => {
                        self.credential = Some(credential);
                        self.dispatch(SessionEvent::ConnectRequested).await;
                    }
                    Some(Command::Disconnect(ack)) => {
                        self.pending_acks.push(ack);
                        self.dispatch(SessionEvent::DisconnectRequested).await;
                    }
                    None => {
                        if self.machine.state() != SessionState::Disconnected {
                            self.dispatch(SessionEvent::DisconnectRequested).await;
                        }
                        break;
                    }
                },
                Some(registration) = self.registered_rx.recv() => {
                    self.on_registration(registration).await;
                }
                message = next_message(&mut self.primary) => {
                    self.on_primary_message(message).await;
                }
                message = next_message(&mut self.successor) => {
                    self.on_successor_message(message).await;
                }
                message = next_message(&mut self.draining) => {
                    self.on_draining_message(message).await;
                }
                opened = poll_slot(&mut self.opening_primary) => {
                    self.opening_primary = None;
                    match opened {
                        Ok(socket) => {
                            debug!("feed socket open; awaiting welcome");
                            self.primary = Some(socket);
                        }
                        Err(error) => {
                            warn!(%error, "feed connection failed");
                            self.dispatch(SessionEvent::ConnectionLost).await;
                        }
                    }
                }
                opened = poll_slot(&mut self.opening_successor) => {
                    self.opening_successor = None;
                    match opened {
                        Ok(socket) => self.successor = Some(socket),
                        Err(error) => {
                            warn!(%error, "migration endpoint unreachable");
                            self.on_successor_lost().await;
                        }
                    }
                }
                () = poll_slot(&mut self.retry) => {
                    self.retry = None;
                    self.dispatch(SessionEvent::RetryDue).await;
                }
                () = poll_slot(&mut self.keepalive) => {
                    warn!(
                        window_ms = self.keepalive_window.map(|w| w.as_millis() as u64),
                        "feed went silent past its keepalive window"
                    );
                    self.primary = None;
                    self.on_primary_closed().await;
                }
            }

            if self.machine.state() == SessionState::Disconnected {
                for ack in self.pending_acks.drain(..) {
                    let _ = ack.send(());
                }
            }
        }
        for ack in self.pending_acks.drain(..) {
            let _ = ack.send(());
        }
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for effect in self.machine.handle(event) {
                if let Some(follow_up) = self.apply(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn apply(&mut self, effect: SessionEffect) -> Option<SessionEvent> {
        match effect {
            SessionEffect::Open { url } => {
                info!(%url, "connecting to feed");
                self.opening_primary = Some(open(url));
            }
            SessionEffect::Subscribe { session_id } => {
                let Some(credential) = self.credential.clone() else {
                    warn!(%session_id, "no credential; skipping subscriptions");
                    return None;
                };
                self.lineage = vec![session_id.clone()];
                let api = self.subscriptions.api();
                let categories = self.categories.clone();
                let registered = self.registered_tx.clone();
                tokio::spawn(async move {
                    let registration =
                        register(api.as_ref(), &credential, &session_id, &categories).await;
                    let _ = registered.send(registration);
                });
            }
            SessionEffect::Deliver(notification) => {
                let _ = self.events.send(FeedEvent::Notification(notification));
            }
            SessionEffect::Migrate { url } => {
                self.opening_successor = Some(open(url));
            }
            SessionEffect::RetirePrimary => {
                if let Some(successor) = self.successor.take() {
                    if let Some(retired) = self.primary.replace(successor) {
                        if let Some(mut stale) = self.draining.replace(retired) {
                            tokio::spawn(async move {
                                let _ = stale.close(None).await;
                            });
                        }
                    }
                }
                if let Some(session_id) = self.machine.session_id() {
                    self.lineage.push(session_id.clone());
                }
            }
            SessionEffect::Revoke { subscription_id } => {
                if !self.subscriptions.revoke(&subscription_id) {
                    debug!(%subscription_id, "revoked subscription was not tracked");
                }
            }
            SessionEffect::ForgetSubscriptions => {
                self.draining = None;
                self.lineage.clear();
                self.subscriptions.forget_all();
            }
            SessionEffect::ScheduleRetry { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
                self.retry = Some(self.clock.sleep(delay));
            }
            SessionEffect::CancelRetry => self.retry = None,
            SessionEffect::Teardown => {
                self.lineage.clear();
                match self.credential.clone() {
                    Some(credential) => {
                        self.subscriptions
                            .teardown(&credential, self.teardown_budget)
                            .await
                    }
                    None => self.subscriptions.forget_all(),
                }
            }
            SessionEffect::Close => {
                self.opening_primary = None;
                self.opening_successor = None;
                self.keepalive = None;
                self.keepalive_window = None;
                for mut socket in [
                    self.primary.take(),
                    self.successor.take(),
                    self.draining.take(),
                ]
                .into_iter()
                .flatten()
                {
                    let _ = socket.close(None).await;
                }
                return Some(SessionEvent::ConnectionLost);
            }
            SessionEffect::WatchKeepalive { window } => {
                self.keepalive_window = Some(window + self.keepalive_grace);
                self.rearm_keepalive();
            }
            SessionEffect::Status(status) => {
                self.status.send_replace(status);
                let _ = self.events.send(FeedEvent::Status(status));
            }
        }
        None
    }

    async fn on_registration(&mut self, registration: Registration) {
        let Some(session_id) = registration.session_id.clone() else {
            return;
        };
        if !self.lineage.contains(&session_id) {
            debug!(%session_id, "dropping registration for a stale session");
            return;
        }
        self.subscriptions.record(registration);
        debug!(%session_id, active = self.subscriptions.len(), "subscriptions recorded");
        self.dispatch(SessionEvent::SubscriptionsReady { session_id })
            .await;
    }

    async fn on_primary_message(&mut self, message: Option<Result<Message, tungstenite::Error>>) {
        match message {
            Some(Ok(Message::Text(text))) => {
                self.rearm_keepalive();
                self.on_text(&text).await;
            }
            Some(Ok(Message::Close(frame))) => {
                info!(?frame, "feed closed the connection");
                self.primary = None;
                self.on_primary_closed().await;
            }
            Some(Ok(_)) => self.rearm_keepalive(),
            Some(Err(error)) => {
                warn!(%error, "feed receive failed");
                self.primary = None;
                self.on_primary_closed().await;
            }
            None => {
                self.primary = None;
                self.on_primary_closed().await;
            }
        }
    }

    async fn on_successor_message(&mut self, message: Option<Result<Message, tungstenite::Error>>) {
        match message {
            Some(Ok(Message::Text(text))) => self.on_text(&text).await,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                warn!("migration connection dropped before taking over");
                self.successor = None;
                self.on_successor_lost().await;
            }
            Some(Ok(_)) => {}
        }
    }

    async fn on_draining_message(&mut self, message: Option<Result<Message, tungstenite::Error>>) {
        match message {
            Some(Ok(Message::Text(text))) => self.on_text(&text).await,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                debug!("retired feed connection drained");
                self.draining = None;
            }
            Some(Ok(_)) => {}
        }
    }

    async fn on_text(&mut self, text: &str) {
        match FeedMessage::decode(text) {
            Ok(message) => self.dispatch(SessionEvent::Frame(message)).await,
            Err(error) => warn!(%error, "dropping malformed feed frame"),
        }
    }

    async fn on_primary_closed(&mut self) {
        self.keepalive = None;
        if let Some(successor) = self.successor.take() {
            info!("promoting migration connection");
            self.primary = Some(successor);
            return;
        }
        if self.opening_successor.is_some() {
            debug!("primary closed while migration connection is opening");
            return;
        }
        self.dispatch(SessionEvent::ConnectionLost).await;
    }

    async fn on_successor_lost(&mut self) {
        self.dispatch(SessionEvent::MigrationFailed).await;
        if self.primary.is_none() {
            self.dispatch(SessionEvent::ConnectionLost).await;
        }
    }

    fn rearm_keepalive(&mut self) {
        if let Some(window) = self.keepalive_window {
            self.keepalive = Some(Box::pin(tokio::time::sleep(window)));
        }
    }
}

fn open(url: String) -> Opening {
    Box::pin(async move {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => Ok(socket),
            Err(source) => Err(TransportError::Connect { url, source }),
        }
    })
}

async fn next_message(
    socket: &mut Option<Socket>,
) -> Option<Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn poll_slot<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}
