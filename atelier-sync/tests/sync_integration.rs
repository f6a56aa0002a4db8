//! Integration tests for end-to-end workspace synchronization.
//!
//! These tests start a real in-process WebSocket server and connect real
//! sessions, verifying the full pipeline: handshake token, join/leave,
//! rejoin after connection loss, auth rejection, and event dispatch into
//! the presence tracker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use atelier_sync::{
    EventCategory, EventRouter, PresenceTracker, ServerEvent, Session, SessionConfig,
    SessionEvent, SessionState,
};

/// In-process workspace server: records inbound frames and handshake
/// tokens, pushes scripted frames to every client, and can kick all
/// connections to simulate transport loss.
struct TestServer {
    url: String,
    received: Arc<Mutex<Vec<String>>>,
    tokens: Arc<Mutex<Vec<String>>>,
    push_tx: broadcast::Sender<String>,
    kick_tx: broadcast::Sender<()>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/sync", listener.local_addr().unwrap());

        let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let tokens: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let (push_tx, _) = broadcast::channel::<String>(64);
        let (kick_tx, _) = broadcast::channel::<()>(4);

        {
            let received = received.clone();
            let tokens = tokens.clone();
            let push_tx = push_tx.clone();
            let kick_tx = kick_tx.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };

                    let token_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
                    let slot = token_slot.clone();
                    let ws = tokio_tungstenite::accept_hdr_async(
                        stream,
                        move |req: &Request, resp: Response| {
                            let token = req
                                .uri()
                                .query()
                                .and_then(|q| {
                                    q.split('&').find_map(|p| p.strip_prefix("token="))
                                })
                                .unwrap_or_default()
                                .to_string();
                            *slot.lock().unwrap() = Some(token);
                            Ok(resp)
                        },
                    )
                    .await;
                    let Ok(ws) = ws else { continue };

                    if let Some(token) = token_slot.lock().unwrap().take() {
                        tokens.lock().unwrap().push(token);
                    }

                    let received = received.clone();
                    let mut push_rx = push_tx.subscribe();
                    let mut kick_rx = kick_tx.subscribe();
                    tokio::spawn(async move {
                        let (mut sink, mut stream) = ws.split();
                        loop {
                            tokio::select! {
                                frame = stream.next() => match frame {
                                    Some(Ok(Message::Text(text))) => {
                                        received.lock().unwrap().push(text.as_str().to_string());
                                    }
                                    Some(Ok(Message::Close(_))) | None => break,
                                    Some(Err(_)) => break,
                                    _ => {}
                                },
                                frame = push_rx.recv() => {
                                    if let Ok(frame) = frame {
                                        if sink.send(Message::Text(frame.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                },
                                _ = kick_rx.recv() => {
                                    let _ = sink.send(Message::Close(None)).await;
                                    break;
                                },
                            }
                        }
                    });
                }
            });
        }

        Self {
            url,
            received,
            tokens,
            push_tx,
            kick_tx,
        }
    }

    /// Push a frame to every connected client, waiting for at least one
    /// connection to be ready first.
    async fn push(&self, frame: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while self.push_tx.receiver_count() == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no client connected to push to"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.push_tx.send(frame.to_string()).unwrap();
    }

    fn kick_all(&self) {
        let _ = self.kick_tx.send(());
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

fn test_config(url: &str) -> SessionConfig {
    SessionConfig {
        server_url: url.to_string(),
        connect_timeout: Duration::from_secs(2),
        max_attempts: 5,
        retry_delay: Duration::from_millis(50),
    }
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until<F: FnMut() -> bool>(what: &str, mut predicate: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_state(session: &Session, expected: SessionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while session.state().await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for state {expected:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_connect_presents_token() {
    let server = TestServer::start().await;
    let session = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));

    session.connect("tok-abc").await.unwrap();
    assert!(session.is_connected().await);
    assert!(session.connection_id().await.is_some());

    wait_until("handshake token recorded", || {
        server.tokens() == vec!["tok-abc".to_string()]
    })
    .await;
}

#[tokio::test]
async fn test_connect_when_connected_is_noop() {
    let server = TestServer::start().await;
    let session = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));

    session.connect("tok-1").await.unwrap();
    let id = session.connection_id().await;
    session.connect("tok-2").await.unwrap();

    // Same connection, no second handshake.
    assert_eq!(session.connection_id().await, id);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.tokens().len(), 1);
}

#[tokio::test]
async fn test_join_emits_and_tracks() {
    let server = TestServer::start().await;
    let session = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));

    session.connect("tok").await.unwrap();
    session.join_project("p1").await;

    assert_eq!(session.current_project().await.as_deref(), Some("p1"));
    wait_until("join frame received", || {
        server
            .received()
            .iter()
            .any(|f| f.contains("project:join") && f.contains("p1"))
    })
    .await;
}

#[tokio::test]
async fn test_leave_non_current_project_is_noop() {
    let server = TestServer::start().await;
    let session = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));

    session.connect("tok").await.unwrap();
    session.join_project("p1").await;
    session.leave_project("p2").await;

    // Still joined to p1, and no leave frame went out.
    assert_eq!(session.current_project().await.as_deref(), Some("p1"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!server.received().iter().any(|f| f.contains("project:leave")));
}

#[tokio::test]
async fn test_leave_current_project() {
    let server = TestServer::start().await;
    let session = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));

    session.connect("tok").await.unwrap();
    session.join_project("p1").await;
    session.leave_project("p1").await;

    assert!(session.current_project().await.is_none());
    wait_until("leave frame received", || {
        server
            .received()
            .iter()
            .any(|f| f.contains("project:leave") && f.contains("p1"))
    })
    .await;
}

#[tokio::test]
async fn test_rejoin_after_connection_loss() {
    let server = TestServer::start().await;
    let session = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));

    session.connect("tok").await.unwrap();
    session.join_project("p1").await;
    wait_until("initial join", || {
        server.received().iter().any(|f| f.contains("project:join"))
    })
    .await;

    server.kick_all();
    wait_for_state(&session, SessionState::Connected).await;

    // The session rejoined p1 on its own.
    assert_eq!(session.current_project().await.as_deref(), Some("p1"));
    wait_until("second join frame", || {
        server
            .received()
            .iter()
            .filter(|f| f.contains("project:join") && f.contains("p1"))
            .count()
            >= 2
    })
    .await;
}

#[tokio::test]
async fn test_auth_error_is_terminal() {
    let server = TestServer::start().await;
    let mut session = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));
    let mut events = session.take_events().unwrap();

    session.connect("tok").await.unwrap();
    session.join_project("p1").await;

    server.push(r#"{"type":"auth_error","message":"token expired"}"#).await;
    wait_for_state(&session, SessionState::AuthRejected).await;

    // Membership is gone and no reconnection is attempted.
    assert!(session.current_project().await.is_none());
    assert!(session.connection_id().await.is_none());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state().await, SessionState::AuthRejected);
    assert_eq!(server.tokens().len(), 1);

    // The navigation signal is observable on the event channel.
    let mut saw_auth_rejected = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        if event == SessionEvent::AuthRejected {
            saw_auth_rejected = true;
        }
    }
    assert!(saw_auth_rejected);
}

#[tokio::test]
async fn test_fresh_connect_leaves_auth_rejected() {
    let server = TestServer::start().await;
    let session = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));

    session.connect("expired").await.unwrap();
    server.push(r#"{"type":"auth_error"}"#).await;
    wait_for_state(&session, SessionState::AuthRejected).await;

    session.connect("fresh").await.unwrap();
    assert!(session.is_connected().await);
    wait_until("fresh token presented", || {
        server.tokens().last().map(String::as_str) == Some("fresh")
    })
    .await;
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() {
    // Bind a port, then drop the listener so dialing it is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let session = Session::new(
        SessionConfig {
            server_url: url,
            connect_timeout: Duration::from_secs(1),
            max_attempts: 5,
            retry_delay: Duration::from_millis(20),
        },
        Arc::new(EventRouter::new()),
    );

    assert!(session.connect("tok").await.is_err());
    wait_for_state(&session, SessionState::Disconnected).await;
    assert_eq!(session.attempts().await, 5);

    // No sixth attempt after the terminal transition.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.attempts().await, 5);
}

#[tokio::test]
async fn test_disconnect_clears_membership() {
    let server = TestServer::start().await;
    let session = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));

    session.connect("tok").await.unwrap();
    session.join_project("p1").await;
    session.disconnect().await;

    assert_eq!(session.state().await, SessionState::Disconnected);
    assert!(session.current_project().await.is_none());
    assert!(session.connection_id().await.is_none());

    // Idempotent.
    session.disconnect().await;
    assert_eq!(session.state().await, SessionState::Disconnected);
}

#[tokio::test]
async fn test_presence_flow_end_to_end() {
    // Connect, join "p1", observe user:joined for "u2": the presence map
    // ends up with exactly one non-typing entry for "u2".
    let server = TestServer::start().await;
    let router = Arc::new(EventRouter::new());
    let session = Session::new(test_config(&server.url), router.clone());

    let (_id, mut presence_rx) = router.subscribe(EventCategory::Presence).await;
    let (_cid, mut cursor_rx) = router.subscribe(EventCategory::Cursor).await;
    let mut tracker = PresenceTracker::new();

    session.connect("tok").await.unwrap();
    session.join_project("p1").await;

    server.push(r#"{"type":"user:joined","id":"u2","username":"bob"}"#).await;
    let event = timeout(Duration::from_secs(2), presence_rx.recv())
        .await
        .expect("presence event within timeout")
        .unwrap();
    tracker.apply(&event);

    assert_eq!(tracker.participant_count(), 1);
    let entry = tracker.participant("u2").unwrap();
    assert_eq!(entry.username, "bob");
    assert!(!entry.is_typing);

    // A cursor move for a known user lands on the entry.
    server
        .push(
            r#"{"type":"cursor:move","projectId":"p1","fileId":"f1",
            "position":{"line":3,"column":9},"userId":"u2","username":"bob"}"#,
        )
        .await;
    let event = timeout(Duration::from_secs(2), cursor_rx.recv())
        .await
        .expect("cursor event within timeout")
        .unwrap();
    tracker.apply(&event);

    let cursor = tracker.participant("u2").unwrap().cursor.clone().unwrap();
    assert_eq!(cursor.file_id, "f1");
    assert_eq!(cursor.line, 3);
}

#[tokio::test]
async fn test_dispatch_preserves_per_category_order() {
    let server = TestServer::start().await;
    let router = Arc::new(EventRouter::new());
    let session = Session::new(test_config(&server.url), router.clone());

    let (_id, mut file_rx) = router.subscribe(EventCategory::File).await;
    session.connect("tok").await.unwrap();

    for i in 0..5 {
        server.push(&format!(r#"{{"type":"file:deleted","fileId":"f{i}"}}"#)).await;
    }

    for i in 0..5 {
        let event = timeout(Duration::from_secs(2), file_rx.recv())
            .await
            .expect("file event within timeout")
            .unwrap();
        match event {
            ServerEvent::FileDeleted { file_id } => assert_eq!(file_id, format!("f{i}")),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_two_sessions_are_independent() {
    let server = TestServer::start().await;
    let session_a = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));
    let session_b = Session::new(test_config(&server.url), Arc::new(EventRouter::new()));

    session_a.connect("tok-a").await.unwrap();
    session_b.connect("tok-b").await.unwrap();

    session_a.join_project("p1").await;
    session_b.join_project("p2").await;

    assert_eq!(session_a.current_project().await.as_deref(), Some("p1"));
    assert_eq!(session_b.current_project().await.as_deref(), Some("p2"));

    session_a.disconnect().await;
    assert!(!session_a.is_connected().await);
    assert!(session_b.is_connected().await);
}
