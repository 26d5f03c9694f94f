use super::*;
use serde_json::Value;

fn hub(last_timer: Option<TimerState>) -> (BroadcastHub, Storage, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open(dir.path()).expect("storage");
    (
        BroadcastHub::new(storage.clone(), ThemeSettings::default(), last_timer),
        storage,
        dir,
    )
}

fn timer(remaining: u64, running: bool) -> TimerState {
    TimerState {
        total_seconds: 600,
        remaining_seconds: remaining,
        is_running: running,
        last_updated: 1_700_000_000_000,
    }
}

fn parse(text: &str) -> Value {
    serde_json::from_str(text).expect("json frame")
}

#[tokio::test]
async fn late_joiner_receives_snapshot_before_next_mutation() {
    let (hub, _storage, _dir) = hub(Some(timer(300, false)));

    let (_id, mut rx) = hub.register().await;
    hub.broadcast_timer(timer(299, true)).await;

    let first = parse(&rx.recv().await.expect("snapshot"));
    assert_eq!(first["remainingSeconds"], 300);
    assert_eq!(first["isRunning"], false);
    let second = parse(&rx.recv().await.expect("update"));
    assert_eq!(second["remainingSeconds"], 299);
}

#[tokio::test]
async fn newcomer_without_snapshot_gets_nothing_until_a_mutation() {
    let (hub, _storage, _dir) = hub(None);

    let (_id, mut rx) = hub.register().await;
    assert!(rx.try_recv().is_err());

    hub.broadcast_timer(timer(10, false)).await;
    assert_eq!(parse(&rx.recv().await.expect("update"))["remainingSeconds"], 10);
    assert_eq!(hub.last_timer().await, Some(timer(10, false)));
}

#[tokio::test]
async fn closed_and_stalled_clients_are_pruned() {
    let (hub, _storage, _dir) = hub(None);

    let (_closed, closed_rx) = hub.register().await;
    drop(closed_rx);
    let (_stalled, _stalled_rx) = hub.register().await;
    let (_healthy, mut healthy_rx) = hub.register().await;
    assert_eq!(hub.client_count().await, 3);

    for remaining in (1..=CLIENT_QUEUE as u64 + 1).rev() {
        hub.broadcast_timer(timer(remaining, true)).await;
        while healthy_rx.try_recv().is_ok() {}
    }

    assert_eq!(hub.client_count().await, 1);
}

#[tokio::test]
async fn get_theme_is_answered_to_the_requester_only() {
    let (hub, _storage, _dir) = hub(None);
    let (asker, mut asker_rx) = hub.register().await;
    let (_other, mut other_rx) = hub.register().await;

    hub.handle_request(asker, r#"{"type":"getTheme"}"#).await;
    hub.handle_request(asker, r#"{"type":"somethingElse"}"#).await;

    let reply = parse(&asker_rx.recv().await.expect("theme"));
    assert_eq!(reply["type"], "theme");
    assert_eq!(reply["settings"]["font"], "Courier New");
    assert_eq!(reply["settings"]["fontSize"], "48px");
    assert!(asker_rx.try_recv().is_err());
    assert!(other_rx.try_recv().is_err());
}

#[tokio::test]
async fn theme_update_persists_and_reaches_every_client() {
    let (hub, storage, _dir) = hub(None);
    let (_a, mut a_rx) = hub.register().await;
    let (_b, mut b_rx) = hub.register().await;

    let applied = hub
        .update_theme(ThemeSettings {
            background: "#000000".into(),
            text: "#00ff00".into(),
            font: String::new(),
            font_size: "64px".into(),
        })
        .await;

    assert_eq!(applied.font, "Courier New");
    for rx in [&mut a_rx, &mut b_rx] {
        let frame = parse(&rx.recv().await.expect("theme"));
        assert_eq!(frame["type"], "theme");
        assert_eq!(frame["settings"]["text"], "#00ff00");
    }
    assert_eq!(storage.load_theme().expect("load"), Some(applied.clone()));
    assert_eq!(hub.theme().await, applied);
}

#[tokio::test]
async fn occupied_port_is_a_bind_error() {
    let taken = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = taken.local_addr().expect("addr").port();

    let err = listen("127.0.0.1", port).await.expect_err("port is taken");
    assert_eq!(err.addr, format!("127.0.0.1:{port}"));
}
