// src/network.rs
// Per-session server state machine and routing.
pub mod neighbourhood;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::crypto::{self, Identity};
use crate::directory::{Directory, FrameSender};
use crate::protocol::{self, Chat, ClientList, Message, Payload, ServerHello, SignedEnvelope};

/// Outbound frame queue depth per session.
const SESSION_QUEUE: usize = 64;
/// Envelopes already routed are remembered this long so meshed peers
/// forwarding the same frame to each other cannot loop it forever.
const DEDUPE_TTL: Duration = Duration::from_secs(300);

/// Everything the session tasks share.
pub struct ServerState {
    pub config: ServerConfig,
    pub identity: Identity,
    pub directory: Directory,
    pub shutdown: broadcast::Sender<()>,
    counter: AtomicU64,
    routed: Mutex<HashMap<String, Instant>>,
}

pub type SharedState = Arc<ServerState>;

impl ServerState {
    pub fn new(config: ServerConfig, identity: Identity) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let directory = Directory::new(config.public_addr.clone());
        Self {
            config,
            identity,
            directory,
            shutdown,
            counter: AtomicU64::new(0),
            routed: Mutex::new(HashMap::new()),
        }
    }

    /// Next value of our own outbound envelope counter (server_hello).
    pub fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Remember a routed frame; false means we already routed it recently.
    fn first_sighting(&self, raw: &str) -> bool {
        let id = BASE64.encode(Sha256::digest(raw.as_bytes()));
        let mut routed = self.routed.lock();
        let now = Instant::now();
        if let Some(expiry) = routed.get(&id) {
            if *expiry > now {
                return false;
            }
        }
        routed.insert(id, now + DEDUPE_TTL);
        true
    }
}

/// Periodically drop expired dedupe entries. Runs until shutdown.
pub async fn prune_routed_task(state: SharedState) {
    let mut shutdown = state.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                let now = Instant::now();
                state.routed.lock().retain(|_, expiry| *expiry > now);
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Where a frame arrived from, for fan-out exclusion.
#[derive(Clone, Copy)]
enum Origin<'a> {
    Client(&'a FrameSender),
    Server(&'a str),
}

enum Role {
    Client { fingerprint: String },
    Server { addr: String },
}

/// Service one inbound WebSocket session until it closes.
///
/// The first signed envelope classifies the peer (hello -> client,
/// server_hello -> neighbourhood server); anything else closes the session.
pub async fn handle_session(state: SharedState, socket: WebSocket, remote: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(SESSION_QUEUE);

    // writer: drain the session queue into the socket
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut shutdown = state.shutdown.subscribe();
    let mut role: Option<Role> = None;

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = shutdown.recv() => break,
        };
        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(%remote, "session read error: {}", e);
                break;
            }
        };

        match &role {
            None => match classify_first(&state, &tx, &text, remote) {
                Some(accepted) => {
                    if let Role::Client { fingerprint } = &accepted {
                        info!(%remote, fingerprint = %fingerprint, "client attached");
                        push_client_list_to_peers(&state);
                    }
                    role = Some(accepted);
                }
                None => break,
            },
            Some(Role::Client { fingerprint }) => {
                handle_client_frame(&state, fingerprint, &tx, &text)
            }
            Some(Role::Server { addr }) => handle_server_frame(&state, addr, &tx, &text),
        }
    }

    match role {
        Some(Role::Client { fingerprint }) => {
            if state.directory.remove_client(&fingerprint, &tx) {
                info!(%remote, fingerprint = %fingerprint, "client detached");
                push_client_list_to_peers(&state);
            }
        }
        Some(Role::Server { addr }) => {
            if state.directory.remove_peer(&addr, &tx) {
                info!(%remote, peer = %addr, "inbound peer session ended");
            }
        }
        None => {}
    }
    drop(tx);
    let _ = writer.await;
}

/// First-frame classification. Returns None when the session must close.
fn classify_first(
    state: &SharedState,
    tx: &FrameSender,
    text: &str,
    remote: SocketAddr,
) -> Option<Role> {
    let env = match protocol::decode(text) {
        Ok(Message::SignedData(env)) => env,
        Ok(_) => {
            warn!(%remote, "non-hello message on unverified session, closing");
            return None;
        }
        Err(e) => {
            warn!(%remote, "unreadable first frame, closing: {}", e);
            return None;
        }
    };

    match protocol::parse_payload(&env.data) {
        Ok(Payload::Hello(hello)) => {
            let public = match crypto::import_public_b64(&hello.public_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!(%remote, "hello with unusable public key, closing: {}", e);
                    return None;
                }
            };
            if !crypto::verify(&public, &env.signing_bytes(), env.counter, &env.signature) {
                warn!(%remote, "hello signature invalid, closing");
                return None;
            }
            let fingerprint = match crypto::fingerprint(&public) {
                Ok(fp) => fp,
                Err(e) => {
                    warn!(%remote, "fingerprint derivation failed, closing: {}", e);
                    return None;
                }
            };
            if !state.directory.insert_client(
                &fingerprint,
                &hello.public_key,
                env.counter,
                tx.clone(),
            ) {
                warn!(%remote, fingerprint = %fingerprint,
                    "hello counter not past stored floor, closing");
                return None;
            }
            Some(Role::Client { fingerprint })
        }
        Ok(Payload::ServerHello(ServerHello { sender, .. })) => {
            if !state.config.peers.iter().any(|p| *p == sender) {
                warn!(%remote, sender = %sender, "server_hello from outside the neighbourhood, closing");
                return None;
            }
            state.directory.insert_peer(&sender, tx.clone());
            info!(%remote, peer = %sender, "inbound peer session verified");
            // let the new peer know who we host
            queue(tx, protocol::encode_client_list(&state.directory.own_client_list()));
            Some(Role::Server { addr: sender })
        }
        Ok(other) => {
            warn!(%remote, payload = other.type_name(),
                "payload not allowed on unverified session, closing");
            None
        }
        Err(e) => {
            warn!(%remote, "unreadable payload on unverified session, closing: {}", e);
            None
        }
    }
}

/// Steady-state handling for a verified client session. Parse and policy
/// failures drop the frame and keep the session.
fn handle_client_frame(state: &SharedState, fingerprint: &str, tx: &FrameSender, text: &str) {
    match protocol::decode(text) {
        Ok(Message::ClientListRequest) => {
            queue(tx, protocol::encode_client_list(&state.directory.full_client_list()));
        }
        Ok(Message::ClientList(_)) => {
            warn!(fingerprint = %fingerprint, "client_list from a client, dropping");
        }
        Ok(Message::SignedData(env)) => match protocol::parse_payload(&env.data) {
            Ok(Payload::PublicChat(_)) => {
                if verify_client_envelope(state, fingerprint, &env) {
                    route_public(state, text, Origin::Client(tx));
                }
            }
            Ok(Payload::Chat(chat)) => {
                if verify_client_envelope(state, fingerprint, &env) {
                    route_chat(state, text, &chat, Origin::Client(tx));
                }
            }
            Ok(other) => {
                warn!(fingerprint = %fingerprint, payload = other.type_name(),
                    "payload not allowed from a client, dropping");
            }
            Err(e) => warn!(fingerprint = %fingerprint, "bad payload, dropping: {}", e),
        },
        Err(e) => warn!(fingerprint = %fingerprint, "unreadable frame, dropping: {}", e),
    }
}

/// Signature then counter, in that order; the counter floor moves before any
/// forwarding happens.
fn verify_client_envelope(state: &SharedState, fingerprint: &str, env: &SignedEnvelope) -> bool {
    let public_b64 = match state.directory.client_public_key(fingerprint) {
        Some(key) => key,
        None => return false,
    };
    let public = match crypto::import_public_b64(&public_b64) {
        Ok(key) => key,
        Err(_) => return false,
    };
    if !crypto::verify(&public, &env.signing_bytes(), env.counter, &env.signature) {
        warn!(fingerprint = %fingerprint, "envelope signature invalid, dropping");
        return false;
    }
    if !state.directory.check_and_update_counter(fingerprint, env.counter) {
        warn!(fingerprint = %fingerprint, counter = env.counter,
            "stale counter, dropping");
        return false;
    }
    true
}

/// Steady-state handling for a neighbourhood server session, shared by
/// inbound sessions and outbound dials.
pub(crate) fn handle_server_frame(state: &SharedState, addr: &str, tx: &FrameSender, text: &str) {
    match protocol::decode(text) {
        Ok(Message::ClientListRequest) => {
            queue(tx, protocol::encode_client_list(&state.directory.own_client_list()));
        }
        Ok(Message::ClientList(list)) => {
            state
                .directory
                .set_advertised(addr, advertised_clients(&list, state.directory.public_addr()));
            debug!(peer = %addr, "advertised client list updated");
        }
        Ok(Message::SignedData(env)) => match protocol::parse_payload(&env.data) {
            Ok(Payload::ServerHello(_)) => debug!(peer = %addr, "idempotent re-hello"),
            Ok(Payload::PublicChat(_)) => route_public(state, text, Origin::Server(addr)),
            Ok(Payload::Chat(chat)) => route_chat(state, text, &chat, Origin::Server(addr)),
            Ok(other) => {
                warn!(peer = %addr, payload = other.type_name(),
                    "payload not allowed from a server, dropping");
            }
            Err(e) => warn!(peer = %addr, "bad payload, dropping: {}", e),
        },
        Err(e) => warn!(peer = %addr, "unreadable frame, dropping: {}", e),
    }
}

/// What a peer's client_list tells us about its clients. Entries for our own
/// address are skipped so a stale echo cannot shadow the live local set.
fn advertised_clients(list: &ClientList, own_addr: &str) -> Vec<String> {
    let mut clients = Vec::new();
    for entry in &list.servers {
        if entry.address == own_addr {
            continue;
        }
        clients.extend(entry.clients.iter().cloned());
    }
    clients
}

/// Broadcast to every local client and every peer server, skipping the
/// session the frame arrived on. The frame is forwarded verbatim.
fn route_public(state: &SharedState, raw: &str, origin: Origin<'_>) {
    if !state.first_sighting(raw) {
        debug!("public_chat already routed, dropping");
        return;
    }
    for sender in state.directory.client_senders() {
        if let Origin::Client(arrival) = origin {
            if sender.same_channel(arrival) {
                continue;
            }
        }
        queue(&sender, raw.to_string());
    }
    for (addr, sender) in state.directory.peer_entries() {
        if let Origin::Server(arrival) = origin {
            if addr == arrival {
                continue;
            }
        }
        queue(&sender, raw.to_string());
    }
}

/// Deliver a private chat. Destinations naming this server get a copy to
/// every local client (recipients self-filter by decrypting); other known
/// destinations get exactly one forwarded copy; unknown ones are dropped.
fn route_chat(state: &SharedState, raw: &str, chat: &Chat, origin: Origin<'_>) {
    if !state.first_sighting(raw) {
        debug!("chat already routed, dropping");
        return;
    }
    let mut seen = HashSet::new();
    for dest in &chat.destination_servers {
        if !seen.insert(dest.as_str()) {
            continue;
        }
        if dest == state.directory.public_addr() {
            for sender in state.directory.client_senders() {
                queue(&sender, raw.to_string());
            }
        } else if let Some(sender) = state.directory.peer_sender(dest) {
            if let Origin::Server(arrival) = origin {
                if *dest == *arrival {
                    continue;
                }
            }
            queue(&sender, raw.to_string());
        } else {
            warn!(destination = %dest, "chat for unknown destination server, dropping");
        }
    }
}

/// Advertise our local client set to every neighbourhood peer.
pub(crate) fn push_client_list_to_peers(state: &SharedState) {
    let text = protocol::encode_client_list(&state.directory.own_client_list());
    for sender in state.directory.peer_senders() {
        queue(&sender, text.clone());
    }
}

/// Non-blocking enqueue. A full or closed session queue drops the frame;
/// blocking here could deadlock two sessions routing into each other.
fn queue(sender: &FrameSender, text: String) {
    if let Err(e) = sender.try_send(text) {
        warn!("session queue rejected frame: {}", e);
    }
}
