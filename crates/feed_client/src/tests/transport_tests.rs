use super::*;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use shared::domain::{SessionId, SubscriptionId};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};
use tokio::net::TcpListener;

#[derive(Clone)]
enum Step {
    Send(String),
    AwaitSubscriptions(usize),
    Pause(Duration),
    Close,
}

#[derive(Clone, Default)]
struct MockFeed {
    scripts: Arc<StdMutex<HashMap<String, Vec<Vec<Step>>>>>,
    connections: Arc<StdMutex<HashMap<String, usize>>>,
    created: Arc<AtomicUsize>,
    removed: Arc<StdMutex<Vec<String>>>,
    stall_removals: Arc<AtomicBool>,
}

impl MockFeed {
    fn script(&self, path: &str, scripts: Vec<Vec<Step>>) {
        self.scripts
            .lock()
            .expect("lock")
            .insert(path.to_string(), scripts);
    }

    fn next_script(&self, path: &str) -> Vec<Step> {
        let index = {
            let mut connections = self.connections.lock().expect("lock");
            let count = connections.entry(path.to_string()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let scripts = self.scripts.lock().expect("lock");
        scripts
            .get(path)
            .and_then(|scripts| scripts.get(index).or_else(|| scripts.last()))
            .cloned()
            .unwrap_or_default()
    }

    fn connection_count(&self, path: &str) -> usize {
        self.connections
            .lock()
            .expect("lock")
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

async fn ws_handler(
    Path(path): Path<String>,
    State(feed): State<MockFeed>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_script(socket, feed, path))
}

async fn run_script(mut socket: WebSocket, feed: MockFeed, path: String) {
    for step in feed.next_script(&path) {
        match step {
            Step::Send(text) => {
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    return;
                }
            }
            Step::AwaitSubscriptions(count) => {
                let created = Arc::clone(&feed.created);
                let _ = tokio::time::timeout(Duration::from_secs(5), async move {
                    while created.load(Ordering::SeqCst) < count {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })
                .await;
            }
            Step::Pause(duration) => tokio::time::sleep(duration).await,
            Step::Close => {
                let _ = socket.send(WsMessage::Close(None)).await;
                return;
            }
        }
    }
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, WsMessage::Close(_)) {
            break;
        }
    }
}

async fn create_subscription(
    State(feed): State<MockFeed>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let n = feed.created.fetch_add(1, Ordering::SeqCst) + 1;
    let kind = body["type"].as_str().unwrap_or_default().to_string();
    (
        StatusCode::ACCEPTED,
        Json(json!({"data": [{"id": format!("sub-{n}"), "type": kind}]})),
    )
}

#[derive(serde::Deserialize)]
struct RemoveQuery {
    id: String,
}

async fn remove_subscription(
    State(feed): State<MockFeed>,
    Query(query): Query<RemoveQuery>,
) -> StatusCode {
    feed.removed.lock().expect("lock").push(query.id);
    if feed.stall_removals.load(Ordering::SeqCst) {
        std::future::pending::<()>().await;
    }
    StatusCode::NO_CONTENT
}

async fn spawn_mock_feed() -> (SocketAddr, MockFeed) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let feed = MockFeed::default();
    let app = Router::new()
        .route("/:path", get(ws_handler))
        .route(
            "/eventsub/subscriptions",
            post(create_subscription).delete(remove_subscription),
        )
        .with_state(feed.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, feed)
}

fn welcome(session_id: &str) -> Step {
    welcome_with_keepalive(session_id, 10)
}

fn welcome_with_keepalive(session_id: &str, keepalive_seconds: u64) -> Step {
    Step::Send(
        json!({
            "metadata": {"message_id": "m-welcome", "message_type": "session_welcome"},
            "payload": {"session": {
                "id": session_id,
                "status": "connected",
                "keepalive_timeout_seconds": keepalive_seconds,
            }},
        })
        .to_string(),
    )
}

fn cheer(user: &str, bits: u64) -> Step {
    Step::Send(
        json!({
            "metadata": {"message_type": "notification"},
            "payload": {
                "subscription": {"id": "sub-3", "type": "channel.cheer"},
                "event": {"user_name": user, "bits": bits},
            },
        })
        .to_string(),
    )
}

fn migrate_to(url: String) -> Step {
    Step::Send(
        json!({
            "metadata": {"message_type": "session_reconnect"},
            "payload": {"session": {"id": "s1", "reconnect_url": url}},
        })
        .to_string(),
    )
}

fn credential() -> Credential {
    Credential {
        client_id: "client".into(),
        access_token: "token".into(),
        broadcaster_id: "99".into(),
    }
}

#[derive(Default)]
struct RecordingClock {
    delays: StdMutex<Vec<Duration>>,
}

impl Clock for RecordingClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.delays.lock().expect("lock").push(duration);
        Box::pin(async {})
    }
}

impl RecordingClock {
    fn delays(&self) -> Vec<Duration> {
        self.delays.lock().expect("lock").clone()
    }
}

struct NoopApi;

#[async_trait]
impl SubscriptionApi for NoopApi {
    async fn create(
        &self,
        _credential: &Credential,
        session_id: &SessionId,
        category: EventCategory,
    ) -> Result<SubscriptionId, SubscriptionError> {
        Ok(SubscriptionId(format!("{session_id}/{}", category.as_str())))
    }

    async fn remove(
        &self,
        _credential: &Credential,
        _id: &SubscriptionId,
    ) -> Result<(), SubscriptionError> {
        Ok(())
    }
}

/// Registers slowly so a migration can land first; records removals.
#[derive(Default)]
struct SlowApi {
    created: AtomicUsize,
    removed: StdMutex<Vec<SubscriptionId>>,
}

#[async_trait]
impl SubscriptionApi for SlowApi {
    async fn create(
        &self,
        _credential: &Credential,
        session_id: &SessionId,
        category: EventCategory,
    ) -> Result<SubscriptionId, SubscriptionError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SubscriptionId(format!("{session_id}/{}", category.as_str())))
    }

    async fn remove(
        &self,
        _credential: &Credential,
        id: &SubscriptionId,
    ) -> Result<(), SubscriptionError> {
        self.removed.lock().expect("lock").push(id.clone());
        Ok(())
    }
}

async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<FeedEvent>, mut matches: F) -> FeedEvent
where
    F: FnMut(&FeedEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("feed driver stopped");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for feed event")
}

fn is_notification(event: &FeedEvent) -> bool {
    matches!(event, FeedEvent::Notification(_))
}

fn notification_user(event: &FeedEvent) -> String {
    match event {
        FeedEvent::Notification(notification) => notification.event["user_name"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        other => panic!("expected notification, got {other:?}"),
    }
}

fn spawn_client(addr: SocketAddr, clock: Arc<dyn Clock>) -> (FeedClient, mpsc::UnboundedReceiver<FeedEvent>) {
    FeedClient::spawn(
        FeedConfig {
            endpoint: format!("ws://{addr}/ws"),
            ..FeedConfig::default()
        },
        Arc::new(HttpSubscriptionApi::new(format!("http://{addr}"))),
        clock,
    )
}

#[tokio::test]
async fn welcome_subscribes_every_category_and_delivers_notifications() {
    let (addr, feed) = spawn_mock_feed().await;
    feed.script(
        "ws",
        vec![vec![
            welcome("s1"),
            Step::AwaitSubscriptions(3),
            Step::Send("{this is not a frame".into()),
            cheer("alice", 100),
        ]],
    );
    let clock = Arc::new(RecordingClock::default());
    let (client, mut events) = spawn_client(addr, clock.clone());

    client.connect(credential());
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Connected)).await;
    let delivered = wait_for(&mut events, is_notification).await;

    assert_eq!(notification_user(&delivered), "alice");
    assert_eq!(feed.created.load(Ordering::SeqCst), 3);
    assert_eq!(client.status(), ConnectionStatus::Connected);

    tokio::time::sleep(Duration::from_millis(200)).await;
    client.disconnect().await;

    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    let mut removed = feed.removed.lock().expect("lock").clone();
    removed.sort();
    assert_eq!(removed, vec!["sub-1", "sub-2", "sub-3"]);
    assert!(clock.delays().is_empty(), "user close must not reconnect");
}

#[tokio::test]
async fn migration_keeps_subscriptions_and_switches_connection() {
    let (addr, feed) = spawn_mock_feed().await;
    feed.script(
        "ws",
        vec![vec![
            welcome("s1"),
            Step::AwaitSubscriptions(3),
            cheer("before", 1),
            migrate_to(format!("ws://{addr}/ws2")),
        ]],
    );
    feed.script("ws2", vec![vec![welcome("s2"), cheer("after", 2)]]);
    let clock = Arc::new(RecordingClock::default());
    let (client, mut events) = spawn_client(addr, clock.clone());

    client.connect(credential());
    let first = wait_for(&mut events, is_notification).await;
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Migrating)).await;
    let second = wait_for(&mut events, is_notification).await;

    assert_eq!(notification_user(&first), "before");
    assert_eq!(notification_user(&second), "after");
    assert_eq!(feed.connection_count("ws2"), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(feed.created.load(Ordering::SeqCst), 3, "migration must not resubscribe");
    assert_eq!(client.status(), ConnectionStatus::Connected);
    assert_eq!(feed.connection_count("ws"), 1);
    assert!(clock.delays().is_empty());

    client.disconnect().await;
}

#[tokio::test]
async fn unrequested_close_reconnects_after_first_backoff_step() {
    let (addr, feed) = spawn_mock_feed().await;
    feed.script("ws", vec![vec![welcome("s1"), Step::Close], vec![welcome("s2")]]);
    let clock = Arc::new(RecordingClock::default());
    let (client, mut events) = FeedClient::spawn(
        FeedConfig {
            endpoint: format!("ws://{addr}/ws"),
            ..FeedConfig::default()
        },
        Arc::new(NoopApi),
        clock.clone(),
    );

    client.connect(credential());
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Connected)).await;
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Disconnected)).await;
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Connected)).await;

    assert_eq!(clock.delays(), vec![Duration::from_secs(1)]);
    assert_eq!(feed.connection_count("ws"), 2);

    client.disconnect().await;
    assert_eq!(clock.delays().len(), 1);
}

#[tokio::test]
async fn unreachable_feed_exhausts_retry_budget() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr")
    };
    let clock = Arc::new(RecordingClock::default());
    let (client, mut events) = FeedClient::spawn(
        FeedConfig {
            endpoint: format!("ws://{addr}/ws"),
            ..FeedConfig::default()
        },
        Arc::new(NoopApi),
        clock.clone(),
    );

    client.connect(credential());
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Exhausted)).await;

    assert_eq!(
        clock.delays(),
        [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
    );
    assert_eq!(client.status(), ConnectionStatus::Exhausted);
}

#[tokio::test]
async fn late_notification_on_retired_connection_is_delivered() {
    let (addr, feed) = spawn_mock_feed().await;
    feed.script(
        "ws",
        vec![vec![
            welcome("s1"),
            Step::AwaitSubscriptions(3),
            migrate_to(format!("ws://{addr}/ws2")),
            Step::Pause(Duration::from_millis(400)),
            cheer("late-on-old", 5),
        ]],
    );
    feed.script("ws2", vec![vec![welcome("s2")]]);
    let clock = Arc::new(RecordingClock::default());
    let (client, mut events) = spawn_client(addr, clock.clone());

    client.connect(credential());
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Migrating)).await;
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Connected)).await;
    let late = wait_for(&mut events, is_notification).await;

    assert_eq!(notification_user(&late), "late-on-old");
    assert_eq!(feed.connection_count("ws2"), 1);
    assert_eq!(client.status(), ConnectionStatus::Connected);
    assert!(clock.delays().is_empty());

    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_does_not_hang_on_stalled_subscription_removal() {
    let (addr, feed) = spawn_mock_feed().await;
    feed.stall_removals.store(true, Ordering::SeqCst);
    feed.script("ws", vec![vec![welcome("s1"), Step::AwaitSubscriptions(3)]]);
    let clock = Arc::new(RecordingClock::default());
    let (client, mut events) = FeedClient::spawn(
        FeedConfig {
            endpoint: format!("ws://{addr}/ws"),
            teardown_budget: Duration::from_millis(300),
            ..FeedConfig::default()
        },
        Arc::new(HttpSubscriptionApi::new(format!("http://{addr}"))),
        clock.clone(),
    );

    client.connect(credential());
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Connected)).await;
    eventually(|| feed.created.load(Ordering::SeqCst) == 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), client.disconnect())
        .await
        .expect("disconnect must finish while removals are stalled");

    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(feed.removed.lock().expect("lock").len(), 3);
    assert!(clock.delays().is_empty());
}

#[tokio::test]
async fn registration_finishing_after_migration_is_removed_at_logout() {
    let (addr, feed) = spawn_mock_feed().await;
    feed.script(
        "ws",
        vec![vec![welcome("s1"), migrate_to(format!("ws://{addr}/ws2"))]],
    );
    feed.script("ws2", vec![vec![welcome("s2")]]);
    let api = Arc::new(SlowApi::default());
    let clock = Arc::new(RecordingClock::default());
    let (client, mut events) = FeedClient::spawn(
        FeedConfig {
            endpoint: format!("ws://{addr}/ws"),
            ..FeedConfig::default()
        },
        api.clone(),
        clock.clone(),
    );

    client.connect(credential());
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Migrating)).await;
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Connected)).await;
    assert!(api.created.load(Ordering::SeqCst) < 3, "migration should beat registration");
    eventually(|| api.created.load(Ordering::SeqCst) == 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.disconnect().await;

    let mut removed: Vec<String> = api
        .removed
        .lock()
        .expect("lock")
        .iter()
        .map(ToString::to_string)
        .collect();
    removed.sort();
    assert_eq!(
        removed,
        vec![
            "s1/channel.cheer",
            "s1/channel.subscribe",
            "s1/channel.subscription.gift",
        ]
    );
}

#[tokio::test]
async fn silent_feed_trips_keepalive_watchdog_and_reconnects() {
    let (addr, feed) = spawn_mock_feed().await;
    feed.script(
        "ws",
        vec![vec![welcome_with_keepalive("s1", 1)], vec![welcome("s2")]],
    );
    let clock = Arc::new(RecordingClock::default());
    let (client, mut events) = FeedClient::spawn(
        FeedConfig {
            endpoint: format!("ws://{addr}/ws"),
            keepalive_grace: Duration::ZERO,
            ..FeedConfig::default()
        },
        Arc::new(NoopApi),
        clock.clone(),
    );

    client.connect(credential());
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Connected)).await;
    let welcomed = tokio::time::Instant::now();
    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Disconnected)).await;

    assert!(welcomed.elapsed() >= Duration::from_millis(900));
    assert_eq!(clock.delays(), vec![Duration::from_secs(1)]);

    wait_for(&mut events, |e| *e == FeedEvent::Status(ConnectionStatus::Connected)).await;
    assert_eq!(feed.connection_count("ws"), 2);

    client.disconnect().await;
}
