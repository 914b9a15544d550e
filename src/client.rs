// src/client.rs
// Client-side protocol engine. The CLI talks to this over channels; all
// signing, verification, and decryption happens here.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::crypto::{self, Identity};
use crate::protocol::{
    self, Chat, ChatBody, ClientList, Hello, Message, Payload, PublicChat, SignedEnvelope,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// host:port of the home server.
    pub server_addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    AwaitingDirectory,
    Ready,
    Closed,
}

/// A client somewhere in the neighbourhood, as learned from client_list.
#[derive(Debug, Clone)]
pub struct RemoteUser {
    pub fingerprint: String,
    pub public_key_b64: String,
    pub server: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Public,
    Private,
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub sender: String,
    pub scope: Scope,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Commands the CLI submits.
pub enum Command {
    SendPublic(String),
    SendPrivate {
        recipients: Vec<String>,
        text: String,
    },
    /// Ask the home server for a fresh client_list; lands as DirectoryUpdated.
    RefreshDirectory,
    ListUsers(oneshot::Sender<Vec<RemoteUser>>),
    History(oneshot::Sender<Vec<ReceivedMessage>>),
    Quit,
}

/// Notifications pushed back to the CLI.
#[derive(Debug, Clone)]
pub enum Event {
    Ready,
    DirectoryUpdated(usize),
    Message(ReceivedMessage),
    Closed,
}

struct ClientTask {
    identity: Identity,
    counter: u64,
    state: ClientState,
    users: HashMap<String, RemoteUser>,
    // per-sender replay floors, kept across directory refreshes
    counters: HashMap<String, u64>,
    history: Vec<ReceivedMessage>,
    events: mpsc::UnboundedSender<Event>,
}

impl ClientTask {
    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn merge_directory(&mut self, list: ClientList) {
        self.users.clear();
        for server in &list.servers {
            for key_b64 in &server.clients {
                let public = match crypto::import_public_b64(key_b64) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(server = %server.address, "directory entry with bad key: {}", e);
                        continue;
                    }
                };
                let fingerprint = match crypto::fingerprint(&public) {
                    Ok(fp) => fp,
                    Err(e) => {
                        warn!(server = %server.address, "fingerprint failed: {}", e);
                        continue;
                    }
                };
                self.users.insert(
                    fingerprint.clone(),
                    RemoteUser {
                        fingerprint,
                        public_key_b64: key_b64.clone(),
                        server: server.address.clone(),
                    },
                );
            }
        }
        self.emit(Event::DirectoryUpdated(self.users.len()));
    }

    /// Verify an envelope against a known sender and advance that sender's
    /// replay floor. Our own echoes are exempt from the floor (the server
    /// already enforced it and we signed them ourselves).
    fn verify_from(&mut self, sender_fp: &str, env: &SignedEnvelope) -> bool {
        let user = match self.users.get(sender_fp) {
            Some(user) => user,
            None => {
                debug!(sender = %sender_fp, "envelope from unknown fingerprint, dropping");
                return false;
            }
        };
        let public = match crypto::import_public_b64(&user.public_key_b64) {
            Ok(key) => key,
            Err(_) => return false,
        };
        if !crypto::verify(&public, &env.signing_bytes(), env.counter, &env.signature) {
            debug!(sender = %sender_fp, "bad signature, dropping");
            return false;
        }
        if *sender_fp == self.identity.fingerprint {
            return true;
        }
        let floor = self.counters.entry(sender_fp.to_string()).or_insert(0);
        if env.counter <= *floor {
            debug!(sender = %sender_fp, counter = env.counter, "stale counter, dropping");
            return false;
        }
        *floor = env.counter;
        true
    }

    fn store(&mut self, sender: &str, scope: Scope, text: &str) {
        let msg = ReceivedMessage {
            sender: sender.to_string(),
            scope,
            text: text.to_string(),
            received_at: Utc::now(),
        };
        self.history.push(msg.clone());
        self.emit(Event::Message(msg));
    }

    fn handle_public_chat(&mut self, env: &SignedEnvelope, chat: PublicChat) {
        if self.verify_from(&chat.sender, env) {
            let sender = chat.sender.clone();
            self.store(&sender, Scope::Public, &chat.message);
        }
    }

    /// Private chat: decrypt first (the outer payload names no sender), then
    /// verify under participants[0]. Every failure is a silent drop.
    fn handle_chat(&mut self, env: &SignedEnvelope, chat: Chat) {
        let plaintext = match crypto::hybrid_decrypt(
            &self.identity.private,
            &chat.iv,
            &chat.chat,
            &chat.symm_keys,
        ) {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!("chat not addressed to us, dropping");
                return;
            }
        };
        let body: ChatBody = match serde_json::from_slice(&plaintext) {
            Ok(body) => body,
            Err(e) => {
                debug!("chat body unreadable, dropping: {}", e);
                return;
            }
        };
        if !body
            .participants
            .iter()
            .any(|p| *p == self.identity.fingerprint)
        {
            debug!("decrypted chat does not list us, dropping");
            return;
        }
        let sender_fp = match body.participants.first() {
            Some(fp) => fp.clone(),
            None => return,
        };
        if self.verify_from(&sender_fp, env) {
            self.store(&sender_fp, Scope::Private, &body.message);
        }
    }

    fn build_private(&mut self, recipients: &[String], text: &str) -> Result<String> {
        let mut participants = vec![self.identity.fingerprint.clone()];
        let mut keys = vec![self.identity.public.clone()];
        let mut destinations = Vec::new();
        for fp in recipients {
            let user = self
                .users
                .get(fp)
                .ok_or_else(|| anyhow!("unknown recipient {}", fp))?;
            participants.push(user.fingerprint.clone());
            keys.push(crypto::import_public_b64(&user.public_key_b64)?);
            if !destinations.contains(&user.server) {
                destinations.push(user.server.clone());
            }
        }

        let body = ChatBody {
            participants,
            message: text.to_string(),
        };
        let sealed = crypto::hybrid_encrypt(&keys, &serde_json::to_vec(&body)?)?;
        let payload = Chat {
            typ: "chat".into(),
            destination_servers: destinations,
            iv: sealed.iv,
            symm_keys: sealed.symm_keys,
            chat: sealed.ciphertext,
        };
        self.counter += 1;
        Ok(protocol::seal_signed(
            &payload,
            self.counter,
            &self.identity.private,
        )?)
    }

    fn build_public(&mut self, text: &str) -> Result<String> {
        self.counter += 1;
        Ok(protocol::seal_signed(
            &PublicChat::new(&self.identity.fingerprint, text),
            self.counter,
            &self.identity.private,
        )?)
    }
}

/// Connect to the home server and run the session until Quit or close.
pub async fn run_client(
    config: ClientConfig,
    identity: Identity,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<Event>,
) -> Result<()> {
    let url = format!("ws://{}/", config.server_addr);
    let mut task = ClientTask {
        identity,
        counter: 0,
        state: ClientState::Connecting,
        users: HashMap::new(),
        counters: HashMap::new(),
        history: Vec::new(),
        events,
    };

    let (ws, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("connecting to {}", config.server_addr))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // hello, then ask for the directory
    task.counter += 1;
    let hello = protocol::seal_signed(
        &Hello::new(&task.identity.public_b64),
        task.counter,
        &task.identity.private,
    )?;
    ws_tx.send(WsMessage::Text(hello)).await?;
    task.state = ClientState::AwaitingDirectory;
    ws_tx
        .send(WsMessage::Text(protocol::encode_client_list_request()))
        .await?;
    info!(server = %config.server_addr, fingerprint = %task.identity.fingerprint, "connected");

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("session read error: {}", e);
                        break;
                    }
                };
                handle_frame(&mut task, &text);
            }
            command = commands.recv() => {
                match command {
                    Some(Command::SendPublic(text)) => {
                        if task.state != ClientState::Ready {
                            warn!("not ready, dropping public send");
                            continue;
                        }
                        let frame = task.build_public(&text)?;
                        ws_tx.send(WsMessage::Text(frame)).await?;
                    }
                    Some(Command::SendPrivate { recipients, text }) => {
                        if task.state != ClientState::Ready {
                            warn!("not ready, dropping private send");
                            continue;
                        }
                        match task.build_private(&recipients, &text) {
                            Ok(frame) => ws_tx.send(WsMessage::Text(frame)).await?,
                            Err(e) => warn!("private send failed: {}", e),
                        }
                    }
                    Some(Command::RefreshDirectory) => {
                        ws_tx
                            .send(WsMessage::Text(protocol::encode_client_list_request()))
                            .await?;
                    }
                    Some(Command::ListUsers(reply)) => {
                        let mut users: Vec<RemoteUser> = task.users.values().cloned().collect();
                        users.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
                        let _ = reply.send(users);
                    }
                    Some(Command::History(reply)) => {
                        let _ = reply.send(task.history.clone());
                    }
                    Some(Command::Quit) | None => break,
                }
            }
        }
    }

    task.state = ClientState::Closed;
    task.emit(Event::Closed);
    Ok(())
}

/// Inbound dispatch per state: only client_list moves AwaitingDirectory to
/// Ready; in Ready only client_list, public_chat, and chat are accepted.
fn handle_frame(task: &mut ClientTask, text: &str) {
    let message = match protocol::decode(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("unreadable frame, dropping: {}", e);
            return;
        }
    };
    match (task.state, message) {
        (ClientState::AwaitingDirectory, Message::ClientList(list)) => {
            task.merge_directory(list);
            task.state = ClientState::Ready;
            task.emit(Event::Ready);
        }
        (ClientState::Ready, Message::ClientList(list)) => task.merge_directory(list),
        (ClientState::Ready, Message::SignedData(env)) => {
            match protocol::parse_payload(&env.data) {
                Ok(Payload::PublicChat(chat)) => task.handle_public_chat(&env, chat),
                Ok(Payload::Chat(chat)) => task.handle_chat(&env, chat),
                Ok(other) => {
                    warn!(payload = other.type_name(), "unexpected payload, dropping");
                }
                Err(e) => warn!("bad payload, dropping: {}", e),
            }
        }
        (state, _) => {
            warn!(?state, "message not accepted in this state, dropping");
        }
    }
}

/// Upload a local file through the home server's HTTP surface; returns the
/// minted download URL.
pub async fn upload_file(server_addr: &str, path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.bin");

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/upload", server_addr))
        .query(&[("name", name)])
        .body(bytes)
        .send()
        .await?
        .error_for_status()?;
    let body: serde_json::Value = response.json().await?;
    body.get("file_url")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("upload response missing file_url"))
}

/// Fetch a download URL to a local path; returns the byte count.
pub async fn download_file(url: &str, dest: &Path) -> Result<usize> {
    let response = reqwest::get(url).await?.error_for_status()?;
    let bytes = response.bytes().await?;
    tokio::fs::write(dest, &bytes)
        .await
        .with_context(|| format!("writing {}", dest.display()))?;
    Ok(bytes.len())
}
