use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use siglink::{
    ClientEvent, CloseReason, Dispatcher, DispatcherPool, Envelope, FrameCodec, NetworkConfig,
    SessionId, SessionRegistry, SignalDocument, SignalHandler, TransportFront, TransportServer,
    UnroutedHandler,
};

const MAX_FRAME_SIZE: usize = 64 * 1024;

struct TestServer {
    registry: Arc<SessionRegistry>,
    port: u16,
    _notify_shutdown: broadcast::Sender<()>,
}

async fn start_server<H: SignalHandler>(handler: Arc<H>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let network = NetworkConfig {
        ip: "127.0.0.1".to_string(),
        port,
        max_connection: 16,
        max_frame_size: MAX_FRAME_SIZE,
        conn_read_buffer_size: 4 * 1024,
    };
    let codec = FrameCodec::new(network.max_frame_size);
    let registry = Arc::new(SessionRegistry::new(codec));

    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, _shutdown_complete_rx) = mpsc::channel(1);
    let pool = DispatcherPool {
        channel_capacity: 64,
        num_channels: 2,
        monitor_interval: 30,
        worker_check_timeout: 10,
    };
    let dispatcher = Arc::new(Dispatcher::new(
        handler,
        registry.clone(),
        &pool,
        notify_shutdown.clone(),
    ));

    let server = TransportServer::new(
        listener,
        network,
        registry.clone(),
        dispatcher,
        notify_shutdown.clone(),
        shutdown_complete_tx,
    );
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestServer {
        registry,
        port,
        _notify_shutdown: notify_shutdown,
    }
}

async fn connect_client(
    server: &TestServer,
    identity: &str,
) -> (TransportFront, mpsc::UnboundedReceiver<ClientEvent>) {
    let (front, mut events) = TransportFront::new(identity, FrameCodec::new(MAX_FRAME_SIZE), 4096);
    front.connect("127.0.0.1", server.port).unwrap();
    match next_event(&mut events).await {
        ClientEvent::Connected => {}
        other => panic!("expected Connected, got {:?}", other),
    }
    (front, events)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("event channel closed")
}

async fn wait_for_sessions(registry: &SessionRegistry, count: usize) {
    timeout(Duration::from_secs(5), async {
        while registry.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("registry never reached {} sessions", count));
}

fn request(target: &str) -> Value {
    json!({
        "target": target,
        "sender": "/client",
        "receiver": "/server",
    })
}

/// Scenario A: no handler is registered for the target; the dispatcher
/// answers with exactly one correlated rejection reply echoing the
/// original sender/receiver, and the connection survives.
#[tokio::test(flavor = "multi_thread")]
async fn test_unrouted_target_gets_one_correlated_rejection() {
    let server = start_server(Arc::new(UnroutedHandler)).await;
    let (front, mut events) = connect_client(&server, "sig://front/a").await;

    front.send(vec![request("ping")]).unwrap();

    let doc = match next_event(&mut events).await {
        ClientEvent::Frame(doc) => doc,
        other => panic!("expected a reply frame, got {:?}", other),
    };
    let reply = doc.find_reply(0).expect("reply sibling missing");
    assert_eq!(reply["target"], "ping");
    assert_eq!(reply["sender"], "/client");
    assert_eq!(reply["receiver"], "/server");
    assert!(!reply["reason"].as_str().unwrap().is_empty());

    // exactly one reply frame and the connection is still up
    assert!(
        timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err(),
        "received more than one frame for a single request"
    );
    assert_eq!(server.registry.len(), 1);

    front.disconnect(true);
}

/// Scenario B: broadcast excluding client 1 reaches only client 2.
#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_excludes_one_session() {
    let server = start_server(Arc::new(UnroutedHandler)).await;

    let (_front1, mut events1) = connect_client(&server, "sig://front/1").await;
    wait_for_sessions(&server.registry, 1).await;
    let first_id = server.registry.session_ids()[0];

    let (_front2, mut events2) = connect_client(&server, "sig://front/2").await;
    wait_for_sessions(&server.registry, 2).await;

    let doc = SignalDocument::new(vec![json!({
        "target": "announce",
        "sender": "/server",
        "receiver": "/clients",
    })])
    .unwrap();
    server.registry.broadcast(&doc, Some(first_id)).unwrap();

    match next_event(&mut events2).await {
        ClientEvent::Frame(doc) => assert_eq!(doc.nodes()[0]["target"], "announce"),
        other => panic!("expected the broadcast frame, got {:?}", other),
    }
    assert!(
        timeout(Duration::from_millis(300), events1.recv())
            .await
            .is_err(),
        "excluded session received the broadcast"
    );
}

struct RecordingHandler {
    seen: Mutex<Vec<(SessionId, Value)>>,
}

impl SignalHandler for RecordingHandler {
    async fn handle_signal(
        &self,
        session_id: SessionId,
        envelope: Envelope,
    ) -> Result<Value, String> {
        self.seen
            .lock()
            .unwrap()
            .push((session_id, envelope.args.unwrap_or(Value::Null)));
        Ok(json!({"ok": true}))
    }
}

/// Scenario C: three payloads sent back-to-back come out of the
/// dispatcher exactly once each, in order, under the same session id.
#[tokio::test(flavor = "multi_thread")]
async fn test_back_to_back_payloads_dispatch_in_order() {
    let handler = Arc::new(RecordingHandler {
        seen: Mutex::new(Vec::new()),
    });
    let server = start_server(handler.clone()).await;
    let (front, mut events) = connect_client(&server, "sig://front/c").await;

    for seq in 0..3 {
        let mut node = request("tree/list");
        node["args"] = json!(seq);
        front.send(vec![node]).unwrap();
    }

    for _ in 0..3 {
        match next_event(&mut events).await {
            ClientEvent::Frame(doc) => {
                let reply = doc.find_reply(0).expect("reply sibling missing");
                assert_eq!(reply["result"]["ok"], json!(true));
            }
            other => panic!("expected a reply frame, got {:?}", other),
        }
    }

    let seen = handler.seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    let session = seen[0].0;
    for (seq, (id, args)) in seen.iter().enumerate() {
        assert_eq!(*id, session, "all frames belong to one session");
        assert_eq!(*args, json!(seq), "frames dispatched out of order");
    }
}

/// The handler result comes back stamped with the registry's identity,
/// not whatever the client claimed.
#[tokio::test(flavor = "multi_thread")]
async fn test_inbound_clientid_claims_are_overwritten() {
    struct EchoClientId;
    impl SignalHandler for EchoClientId {
        async fn handle_signal(
            &self,
            _session_id: SessionId,
            envelope: Envelope,
        ) -> Result<Value, String> {
            Ok(json!({"clientid": envelope.clientid}))
        }
    }

    let server = start_server(Arc::new(EchoClientId)).await;
    let (front, mut events) = connect_client(&server, "sig://front/honest").await;
    wait_for_sessions(&server.registry, 1).await;
    let session_id = server.registry.session_ids()[0];

    let mut node = request("whoami");
    node["clientid"] = json!("somebody-else");
    front.send(vec![node]).unwrap();

    let doc = match next_event(&mut events).await {
        ClientEvent::Frame(doc) => doc,
        other => panic!("expected a reply frame, got {:?}", other),
    };
    let reply = doc.find_reply(0).unwrap();
    assert_eq!(
        reply["result"]["clientid"],
        json!(format!("client-{}", session_id.raw()))
    );
}

/// A payload that decodes but lacks a target is rejected with a reason
/// while the connection stays open; a later valid signal still works.
#[tokio::test(flavor = "multi_thread")]
async fn test_missing_target_keeps_the_connection_open() {
    let server = start_server(Arc::new(UnroutedHandler)).await;
    let (front, mut events) = connect_client(&server, "sig://front/p").await;

    front
        .send(vec![json!({"sender": "/client", "receiver": "/server"})])
        .unwrap();

    let doc = match next_event(&mut events).await {
        ClientEvent::Frame(doc) => doc,
        other => panic!("expected a rejection frame, got {:?}", other),
    };
    let reply = doc.find_reply(0).unwrap();
    assert!(reply["reason"].as_str().unwrap().contains("target"));

    // still connected and routable
    front.send(vec![request("ping")]).unwrap();
    match next_event(&mut events).await {
        ClientEvent::Frame(_) => {}
        other => panic!("expected a reply frame, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_disconnect_reports_local_close() {
    let server = start_server(Arc::new(UnroutedHandler)).await;
    let (front, mut events) = connect_client(&server, "sig://front/l").await;
    wait_for_sessions(&server.registry, 1).await;

    front.disconnect(true);
    match next_event(&mut events).await {
        ClientEvent::Closed(reason) => assert_eq!(reason, CloseReason::LocalClose),
        other => panic!("expected Closed, got {:?}", other),
    }

    // the server notices and the session dies exactly once
    wait_for_sessions(&server.registry, 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_drop_is_not_reported_as_local() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (front, mut events) =
        TransportFront::new("sig://front/r", FrameCodec::new(MAX_FRAME_SIZE), 4096);
    front.connect("127.0.0.1", port).unwrap();
    let (server_side, _) = listener.accept().await.unwrap();
    match next_event(&mut events).await {
        ClientEvent::Connected => {}
        other => panic!("expected Connected, got {:?}", other),
    }

    drop(server_side);
    match next_event(&mut events).await {
        ClientEvent::Closed(reason) => {
            assert_ne!(reason, CloseReason::LocalClose, "peer drop reported as local");
        }
        other => panic!("expected Closed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_second_connect_attempt_is_refused() {
    // current-thread runtime: the worker cannot run between the two calls,
    // so the first attempt is still in flight
    let (front, _events) =
        TransportFront::new("sig://front/d", FrameCodec::new(MAX_FRAME_SIZE), 4096);
    front.connect("127.0.0.1", 9).unwrap();
    assert!(matches!(
        front.connect("127.0.0.1", 9),
        Err(siglink::AppError::AlreadyConnecting)
    ));
}

#[tokio::test]
async fn test_send_without_transport_is_refused() {
    let (front, _events) =
        TransportFront::new("sig://front/n", FrameCodec::new(MAX_FRAME_SIZE), 4096);
    assert!(matches!(
        front.send(vec![request("ping")]),
        Err(siglink::AppError::NotConnected)
    ));
}

/// A session that disconnects never gets its id handed to a later peer.
#[tokio::test(flavor = "multi_thread")]
async fn test_session_identity_is_never_recycled() {
    let server = start_server(Arc::new(UnroutedHandler)).await;

    let (front1, mut events1) = connect_client(&server, "sig://front/old").await;
    wait_for_sessions(&server.registry, 1).await;
    let first_id = server.registry.session_ids()[0];

    front1.disconnect(true);
    match next_event(&mut events1).await {
        ClientEvent::Closed(_) => {}
        other => panic!("expected Closed, got {:?}", other),
    }
    wait_for_sessions(&server.registry, 0).await;

    let (_front2, _events2) = connect_client(&server, "sig://front/new").await;
    wait_for_sessions(&server.registry, 1).await;
    let second_id = server.registry.session_ids()[0];

    assert_ne!(first_id, second_id);
    assert!(second_id > first_id);
}
