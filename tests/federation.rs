// tests/federation.rs
// End-to-end scenarios over real sockets: one or two home servers, library
// clients, and raw WebSocket peers where the test needs to misbehave.

use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use olaf_chat::client::{self, ClientConfig, Command, Event, ReceivedMessage, RemoteUser, Scope};
use olaf_chat::config::ServerConfig;
use olaf_chat::crypto::Identity;
use olaf_chat::protocol::{self, Hello, PublicChat, ServerHello};
use olaf_chat::serve;

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Reserve several distinct ports at once so one release cannot be handed
/// back for the next request.
fn free_ports<const N: usize>() -> [u16; N] {
    let listeners: Vec<StdTcpListener> = (0..N)
        .map(|_| StdTcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let mut ports = [0u16; N];
    for (slot, listener) in ports.iter_mut().zip(&listeners) {
        *slot = listener.local_addr().unwrap().port();
    }
    ports
}

fn config(port: u16, peer_ports: &[u16], files: &TempDir) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
        public_addr: format!("127.0.0.1:{}", port),
        peers: peer_ports
            .iter()
            .map(|p| format!("127.0.0.1:{}", p))
            .collect(),
        files_dir: files.path().to_path_buf(),
    }
}

struct TestClient {
    fingerprint: String,
    commands: mpsc::Sender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    _task: JoinHandle<anyhow::Result<()>>,
}

async fn attach(server: &str) -> TestClient {
    let identity = Identity::generate().unwrap();
    let fingerprint = identity.fingerprint.clone();
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(client::run_client(
        ClientConfig {
            server_addr: server.to_string(),
        },
        identity,
        cmd_rx,
        event_tx,
    ));
    let mut attached = TestClient {
        fingerprint,
        commands: cmd_tx,
        events: event_rx,
        _task: task,
    };
    attached.wait_ready().await;
    attached
}

impl TestClient {
    async fn wait_ready(&mut self) {
        timeout(Duration::from_secs(5), async {
            while let Some(event) = self.events.recv().await {
                if matches!(event, Event::Ready) {
                    return;
                }
            }
            panic!("client event stream ended before Ready");
        })
        .await
        .expect("client did not become ready");
    }

    async fn next_message(&mut self, wait: Duration) -> Option<ReceivedMessage> {
        timeout(wait, async {
            while let Some(event) = self.events.recv().await {
                if let Event::Message(msg) = event {
                    return Some(msg);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    async fn users(&mut self) -> Vec<RemoteUser> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::ListUsers(tx)).await.unwrap();
        rx.await.unwrap()
    }

    /// Re-request the directory until the predicate holds. Directory gossip
    /// between servers takes a dial round trip, so this polls.
    async fn refresh_until(&mut self, pred: impl Fn(&[RemoteUser]) -> bool) -> Vec<RemoteUser> {
        for _ in 0..60 {
            self.commands
                .send(Command::RefreshDirectory)
                .await
                .unwrap();
            sleep(Duration::from_millis(200)).await;
            let users = self.users().await;
            if pred(&users) {
                return users;
            }
        }
        panic!("directory never reached the expected state");
    }
}

type RawWs = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn raw_connect(server: &str) -> RawWs {
    let url = format!("ws://{}/", server);
    let (ws, _) = connect_async(url.as_str()).await.unwrap();
    ws
}

async fn send_text(ws: &mut RawWs, text: String) {
    ws.send(WsMessage::Text(text)).await.unwrap();
}

async fn expect_closed(ws: &mut RawWs) {
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(_))) | None => return true,
                Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.unwrap_or(false), "server did not close the session");
}

fn sealed_hello(id: &Identity, counter: u64) -> String {
    protocol::seal_signed(&Hello::new(&id.public_b64), counter, &id.private).unwrap()
}

fn sealed_public(id: &Identity, counter: u64, text: &str) -> String {
    protocol::seal_signed(&PublicChat::new(&id.fingerprint, text), counter, &id.private).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn public_broadcast_and_replay_drop() {
    let files = TempDir::new().unwrap();
    let port = free_port();
    let handle = serve(config(port, &[], &files)).await.unwrap();
    let addr = format!("127.0.0.1:{}", port);

    // the sender is a raw peer so the test controls its counters
    let alice = Identity::generate().unwrap();
    let mut raw = raw_connect(&addr).await;
    send_text(&mut raw, sealed_hello(&alice, 1)).await;

    let mut bob = attach(&addr).await;
    let mut carol = attach(&addr).await;
    bob.refresh_until(|users| users.iter().any(|u| u.fingerprint == alice.fingerprint))
        .await;
    carol
        .refresh_until(|users| users.iter().any(|u| u.fingerprint == alice.fingerprint))
        .await;

    let frame = sealed_public(&alice, 2, "hi");
    send_text(&mut raw, frame.clone()).await;

    for receiver in [&mut bob, &mut carol] {
        let msg = receiver
            .next_message(Duration::from_secs(5))
            .await
            .expect("broadcast not delivered");
        assert_eq!(msg.sender, alice.fingerprint);
        assert_eq!(msg.scope, Scope::Public);
        assert_eq!(msg.text, "hi");
    }

    // byte-identical replay: equal counter, must be dropped
    send_text(&mut raw, frame).await;
    assert!(bob.next_message(Duration::from_secs(2)).await.is_none());

    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_type_dropped_session_survives() {
    let files = TempDir::new().unwrap();
    let port = free_port();
    let handle = serve(config(port, &[], &files)).await.unwrap();
    let addr = format!("127.0.0.1:{}", port);

    let alice = Identity::generate().unwrap();
    let mut raw = raw_connect(&addr).await;
    send_text(&mut raw, sealed_hello(&alice, 1)).await;

    let mut bob = attach(&addr).await;
    bob.refresh_until(|users| users.iter().any(|u| u.fingerprint == alice.fingerprint))
        .await;

    send_text(&mut raw, r#"{"type":"ping"}"#.to_string()).await;
    // the session must still route after the bad frame
    send_text(&mut raw, sealed_public(&alice, 2, "still here")).await;

    let msg = bob
        .next_message(Duration::from_secs(5))
        .await
        .expect("session died on unknown type");
    assert_eq!(msg.text, "still here");

    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unverified_session_is_closed_on_non_hello() {
    let files = TempDir::new().unwrap();
    let port = free_port();
    let handle = serve(config(port, &[], &files)).await.unwrap();
    let addr = format!("127.0.0.1:{}", port);

    let alice = Identity::generate().unwrap();
    let mut raw = raw_connect(&addr).await;
    // signed and well-formed, but not a hello
    send_text(&mut raw, sealed_public(&alice, 1, "too soon")).await;
    expect_closed(&mut raw).await;

    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_hello_outside_neighbourhood_is_closed() {
    let files = TempDir::new().unwrap();
    let port = free_port();
    let handle = serve(config(port, &[], &files)).await.unwrap();
    let addr = format!("127.0.0.1:{}", port);

    let imposter = Identity::generate().unwrap();
    let frame =
        protocol::seal_signed(&ServerHello::new("10.9.9.9:9999"), 1, &imposter.private).unwrap();

    let mut raw = raw_connect(&addr).await;
    send_text(&mut raw, frame).await;
    expect_closed(&mut raw).await;

    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn directory_update_crosses_servers_on_disconnect() {
    let files1 = TempDir::new().unwrap();
    let files2 = TempDir::new().unwrap();
    let [p1, p2] = free_ports::<2>();
    let s1 = serve(config(p1, &[p2], &files1)).await.unwrap();
    let s2 = serve(config(p2, &[p1], &files2)).await.unwrap();

    let mut alice = attach(&format!("127.0.0.1:{}", p1)).await;
    let bob = attach(&format!("127.0.0.1:{}", p2)).await;
    let bob_fp = bob.fingerprint.clone();

    alice
        .refresh_until(|users| users.iter().any(|u| u.fingerprint == bob_fp))
        .await;

    bob.commands.send(Command::Quit).await.unwrap();
    alice
        .refresh_until(|users| users.iter().all(|u| u.fingerprint != bob_fp))
        .await;

    s1.shutdown();
    s2.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn private_chat_crosses_servers_and_non_recipients_drop() {
    let files1 = TempDir::new().unwrap();
    let files2 = TempDir::new().unwrap();
    let [p1, p2] = free_ports::<2>();
    let s1 = serve(config(p1, &[p2], &files1)).await.unwrap();
    let s2 = serve(config(p2, &[p1], &files2)).await.unwrap();

    let mut alice = attach(&format!("127.0.0.1:{}", p1)).await;
    let mut bob = attach(&format!("127.0.0.1:{}", p2)).await;
    let mut carol = attach(&format!("127.0.0.1:{}", p2)).await;

    let bob_fp = bob.fingerprint.clone();
    let alice_fp = alice.fingerprint.clone();
    alice
        .refresh_until(|users| users.iter().any(|u| u.fingerprint == bob_fp))
        .await;
    // bob must know alice's key to verify her signature
    bob.refresh_until(|users| users.iter().any(|u| u.fingerprint == alice_fp))
        .await;
    carol
        .refresh_until(|users| users.iter().any(|u| u.fingerprint == alice_fp))
        .await;

    alice
        .commands
        .send(Command::SendPrivate {
            recipients: vec![bob_fp.clone()],
            text: "meet at the docks".into(),
        })
        .await
        .unwrap();

    let msg = bob
        .next_message(Duration::from_secs(5))
        .await
        .expect("private chat not delivered");
    assert_eq!(msg.sender, alice.fingerprint);
    assert_eq!(msg.scope, Scope::Private);
    assert_eq!(msg.text, "meet at the docks");

    // carol receives the envelope but cannot decrypt it
    assert!(carol.next_message(Duration::from_secs(2)).await.is_none());

    s1.shutdown();
    s2.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_upload_download_round_trip() {
    let files = TempDir::new().unwrap();
    let port = free_port();
    let handle = serve(config(port, &[], &files)).await.unwrap();
    let base = format!("http://127.0.0.1:{}", port);

    let blob: Vec<u8> = (0..10 * 1024u32).map(|i| (i % 251) as u8).collect();
    let http = reqwest::Client::new();

    let response: serde_json::Value = http
        .post(format!("{}/api/upload", base))
        .query(&[("name", "blob.bin")])
        .body(blob.clone())
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap()
        .json()
        .await
        .unwrap();
    let url = response["file_url"].as_str().expect("file_url in response");
    assert!(url.contains("/downloads/"));

    let first = http.get(url).send().await.unwrap().bytes().await.unwrap();
    assert_eq!(first.as_ref(), blob.as_slice());
    // idempotent second read
    let second = http.get(url).send().await.unwrap().bytes().await.unwrap();
    assert_eq!(second.as_ref(), blob.as_slice());

    // unknown names are a 404
    let missing = http
        .get(format!("{}/downloads/no-such-file.bin", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    handle.shutdown();
}
