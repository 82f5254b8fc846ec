use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleece_network::{
    ConnectionState, HandlerFault, HandlerRegistry, MemoryNetwork, NetworkError, Peer,
    PeerConfig, Response,
};
use fleece_road::{serve, AppState, RoadConfig};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn start_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let config = RoadConfig {
        listen_addr: addr,
        ..RoadConfig::default()
    };
    let state = Arc::new(AppState::new(&config, None));
    tokio::spawn(serve(listener, state, std::future::pending()));
    addr
}

/// Relay that can be stopped and later brought back on the same address.
struct StoppableRelay {
    stop: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
}

impl StoppableRelay {
    async fn start(addr: SocketAddr) -> Self {
        let listener = loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        let config = RoadConfig {
            listen_addr: addr,
            ..RoadConfig::default()
        };
        let state = Arc::new(AppState::new(&config, None));
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, state, async move {
            let _ = stopped.await;
        }));
        Self { stop, server }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.server.await.expect("join").expect("serve");
    }
}

async fn wait_unregistered(peer: &Peer) {
    let mut registered = peer.registered();
    registered
        .wait_for(|registered| !*registered)
        .await
        .expect("peer alive");
}

#[derive(Debug, Serialize, Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Sum {
    total: i64,
}

fn handlers(stalled: Arc<AtomicUsize>) -> HandlerRegistry {
    HandlerRegistry::builder()
        .sync_handler("ping", |_payload: Bytes| Ok::<_, HandlerFault>("pong"))
        .json_handler("add", |args: Add| async move {
            Response::json(&Sum {
                total: args.a + args.b,
            })
            .map_err(|err| HandlerFault::internal(err.to_string()))
        })
        .async_handler("forbidden", |_payload: Bytes| async {
            Err::<(), _>(HandlerFault::new(403, "workers only"))
        })
        .async_handler("stall", move |_payload: Bytes| {
            let stalled = Arc::clone(&stalled);
            async move {
                stalled.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
                Ok::<_, HandlerFault>(())
            }
        })
        .build()
}

fn config(relay: SocketAddr, worker_id: &str) -> PeerConfig {
    PeerConfig::new(worker_id, format!("ws://{relay}"))
        .with_ice_servers(Vec::new())
        .with_reconnect_backoff(Duration::from_millis(50))
}

async fn spawn_peer(network: &MemoryNetwork, relay: SocketAddr, worker_id: &str) -> Peer {
    let peer = Peer::new(
        config(relay, worker_id),
        handlers(Arc::new(AtomicUsize::new(0))),
        network.provider(),
    );
    peer.wait_registered().await;
    peer
}

async fn wait_state(peer: &Peer, target: &str, wanted: ConnectionState) {
    let connection = peer.connection(target).expect("connection exists");
    let mut states = connection.subscribe();
    states
        .wait_for(|state| *state == wanted)
        .await
        .expect("connection alive");
}

#[test_timeout::tokio_timeout_test(15)]
async fn workers_call_each_other() {
    init_tracing();
    let relay = start_relay().await;
    let network = MemoryNetwork::new();
    let a = spawn_peer(&network, relay, "a").await;
    let b = spawn_peer(&network, relay, "b").await;

    let to_b = a.connect("b").await.expect("connect");
    let reply = to_b.send("ping", Bytes::new()).await.expect("ping");
    assert_eq!(reply, Response::ok("pong"));

    let sum = to_b
        .send("add", Bytes::from_static(br#"{"a":40,"b":2}"#))
        .await
        .expect("add");
    assert_eq!(sum.decode_json::<Sum>().expect("sum"), Sum { total: 42 });

    // The reverse direction reuses the link `a` negotiated.
    wait_state(&b, "a", ConnectionState::Connected).await;
    let to_a = b.connect("a").await.expect("connect back");
    assert_eq!(
        to_a.send("ping", Bytes::new()).await.expect("ping back"),
        Response::ok("pong")
    );
    assert_eq!(network.transports_created(), 2);
    assert_eq!(network.open_links(), 1);
}

#[test_timeout::tokio_timeout_test(15)]
async fn simultaneous_connects_converge_on_one_link() {
    init_tracing();
    let relay = start_relay().await;
    let network = MemoryNetwork::new();
    let a = spawn_peer(&network, relay, "a").await;
    let b = spawn_peer(&network, relay, "b").await;

    let (to_b, to_a) = tokio::join!(a.connect("b"), b.connect("a"));
    let (to_b, to_a) = (to_b.expect("a connects"), to_a.expect("b connects"));

    let (from_a, from_b) = tokio::join!(
        to_b.send("ping", Bytes::new()),
        to_a.send("ping", Bytes::new())
    );
    assert_eq!(from_a.expect("a pings"), Response::ok("pong"));
    assert_eq!(from_b.expect("b pings"), Response::ok("pong"));

    wait_state(&a, "b", ConnectionState::Connected).await;
    wait_state(&b, "a", ConnectionState::Connected).await;
    assert_eq!(network.open_links(), 1);
    assert!(network.transports_created() <= 3);
}

#[test_timeout::tokio_timeout_test(15)]
async fn repeated_connects_reuse_the_link() {
    init_tracing();
    let relay = start_relay().await;
    let network = MemoryNetwork::new();
    let a = spawn_peer(&network, relay, "a").await;
    let _b = spawn_peer(&network, relay, "b").await;

    let first = a.connect("b").await.expect("connect");
    first.send("ping", Bytes::new()).await.expect("ping");
    let created = network.transports_created();

    for _ in 0..5 {
        let again = a.connect("b").await.expect("connect again");
        again.send("ping", Bytes::new()).await.expect("ping again");
    }
    assert_eq!(network.transports_created(), created);
    assert_eq!(a.connected_peers(), vec!["b".to_string()]);
}

#[test_timeout::tokio_timeout_test(15)]
async fn unregistered_target_is_unreachable() {
    init_tracing();
    let relay = start_relay().await;
    let network = MemoryNetwork::new();
    let a = spawn_peer(&network, relay, "a").await;

    let ghost = a.connect("ghost").await.expect("offer sent");
    assert_eq!(
        ghost.send("ping", Bytes::new()).await,
        Err(NetworkError::PeerUnreachable {
            peer: "ghost".into()
        })
    );
    assert_eq!(
        a.connection("ghost").expect("connection").state(),
        ConnectionState::Dead
    );
}

#[test_timeout::tokio_timeout_test(15)]
async fn self_calls_stay_in_process() {
    init_tracing();
    let network = MemoryNetwork::new();
    // Nothing listens here, so the worker never registers.
    let unused = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let relay = unused.local_addr().expect("addr");
    drop(unused);

    let a = Peer::new(
        config(relay, "a"),
        handlers(Arc::new(AtomicUsize::new(0))),
        network.provider(),
    );
    let me = a.connect("a").await.expect("loopback");
    assert_eq!(
        me.send("ping", Bytes::new()).await.expect("ping"),
        Response::ok("pong")
    );
    let unknown = me.send("missing", Bytes::new()).await.expect("reply");
    assert_eq!(unknown.status, Response::NOT_FOUND);
    assert_eq!(network.transports_created(), 0);

    assert_eq!(
        a.connect("b").await.err(),
        Some(NetworkError::SignalingUnavailable)
    );
    assert_eq!(network.transports_created(), 0);
}

#[test_timeout::tokio_timeout_test(15)]
async fn faults_and_unknown_operations_come_back_as_replies() {
    init_tracing();
    let relay = start_relay().await;
    let network = MemoryNetwork::new();
    let a = spawn_peer(&network, relay, "a").await;
    let _b = spawn_peer(&network, relay, "b").await;
    let to_b = a.connect("b").await.expect("connect");

    let forbidden = to_b.send("forbidden", Bytes::new()).await.expect("reply");
    assert_eq!(forbidden, Response::new(403, "workers only"));

    let unknown = to_b.send("missing", Bytes::new()).await.expect("reply");
    assert_eq!(unknown.status, Response::NOT_FOUND);

    let invalid = to_b
        .send("add", Bytes::from_static(b"not json"))
        .await
        .expect("reply");
    assert_eq!(invalid.status, Response::UNPROCESSABLE);

    // Faults leave the link alone.
    assert_eq!(
        to_b.send("ping", Bytes::new()).await.expect("ping"),
        Response::ok("pong")
    );
}

#[test_timeout::tokio_timeout_test(15)]
async fn lost_link_fails_pending_calls_and_recovers() {
    init_tracing();
    let relay = start_relay().await;
    let network = MemoryNetwork::new();
    let stalled = Arc::new(AtomicUsize::new(0));
    let a = spawn_peer(&network, relay, "a").await;
    let b = Peer::new(
        config(relay, "b"),
        handlers(Arc::clone(&stalled)),
        network.provider(),
    );
    b.wait_registered().await;

    let to_b = a.connect("b").await.expect("connect");
    to_b.send("ping", Bytes::new()).await.expect("ping");

    const PENDING: usize = 5;
    let calls = join_all((0..PENDING).map(|_| to_b.send("stall", Bytes::new())));
    let sever = async {
        while stalled.load(Ordering::SeqCst) < PENDING {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        network.sever_all();
    };
    let (results, ()) = tokio::join!(calls, sever);
    for result in results {
        assert!(
            matches!(result, Err(NetworkError::ConnectionLost { .. })),
            "unexpected {result:?}"
        );
    }

    wait_state(&a, "b", ConnectionState::Dead).await;
    assert!(matches!(
        to_b.send("ping", Bytes::new()).await,
        Err(NetworkError::ConnectionDead { .. })
    ));

    let to_b = a.connect("b").await.expect("reconnect");
    assert_eq!(
        to_b.send("ping", Bytes::new()).await.expect("ping after reconnect"),
        Response::ok("pong")
    );
    assert_eq!(network.open_links(), 1);
}

#[test_timeout::tokio_timeout_test(15)]
async fn shutdown_tears_down_links() {
    init_tracing();
    let relay = start_relay().await;
    let network = MemoryNetwork::new();
    let a = spawn_peer(&network, relay, "a").await;
    let b = spawn_peer(&network, relay, "b").await;
    let to_b = a.connect("b").await.expect("connect");
    to_b.send("ping", Bytes::new()).await.expect("ping");

    a.shutdown().await;
    assert!(!*a.registered().borrow());
    assert_eq!(
        a.connection("b").expect("connection").state(),
        ConnectionState::Dead
    );
    wait_state(&b, "a", ConnectionState::Dead).await;
    assert_eq!(network.open_links(), 0);
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn links_survive_a_relay_restart() {
    init_tracing();
    let addr = {
        let reserved = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        reserved.local_addr().expect("addr")
    };
    let relay = StoppableRelay::start(addr).await;
    let network = MemoryNetwork::new();
    let a = spawn_peer(&network, addr, "a").await;
    let b = spawn_peer(&network, addr, "b").await;
    let to_b = a.connect("b").await.expect("connect");
    to_b.send("ping", Bytes::new()).await.expect("ping");

    relay.stop().await;
    wait_unregistered(&a).await;
    wait_unregistered(&b).await;

    // Established links do not depend on the relay session.
    assert_eq!(
        a.connection("b").expect("connection").state(),
        ConnectionState::Connected
    );
    assert_eq!(
        to_b.send("ping", Bytes::new()).await.expect("ping without relay"),
        Response::ok("pong")
    );
    assert_eq!(
        a.connect("c").await.err(),
        Some(NetworkError::SignalingUnavailable)
    );

    let _relay = StoppableRelay::start(addr).await;
    a.wait_registered().await;
    b.wait_registered().await;
    let c = spawn_peer(&network, addr, "c").await;

    let to_c = a.connect("c").await.expect("connect after restart");
    assert_eq!(
        to_c.send("ping", Bytes::new()).await.expect("ping c"),
        Response::ok("pong")
    );
    wait_state(&c, "a", ConnectionState::Connected).await;
    assert_eq!(
        a.connection("b").expect("connection").state(),
        ConnectionState::Connected
    );
    assert_eq!(network.open_links(), 2);
}
