// src/network/neighbourhood.rs
// Outbound dialling of the configured peer servers. Each endpoint gets its
// own task that redials with bounded exponential backoff; inbound peer
// connections are never redialled from here.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use super::{handle_server_frame, SharedState, SESSION_QUEUE};
use crate::protocol::{self, ServerHello};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Spawn one dial task per configured peer.
pub fn start(state: SharedState) {
    for peer in &state.config.peers {
        if *peer == state.config.public_addr {
            continue;
        }
        tokio::spawn(dial_loop(state.clone(), peer.clone()));
    }
}

async fn dial_loop(state: SharedState, addr: String) {
    let mut shutdown = state.shutdown.subscribe();
    let mut delay = BACKOFF_START;
    let url = format!("ws://{}/", addr);

    loop {
        let dialled = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = shutdown.recv() => return,
        };
        match dialled {
            Ok((ws, _)) => {
                info!(peer = %addr, "peer session established");
                delay = BACKOFF_START;
                run_peer_session(&state, &addr, ws).await;
                warn!(peer = %addr, "peer session lost, will redial");
            }
            Err(e) => {
                warn!(peer = %addr, "dial failed: {}", e);
            }
        }

        // bounded exponential backoff with jitter
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        tokio::select! {
            _ = sleep(delay + jitter) => {}
            _ = shutdown.recv() => return,
        }
        delay = (delay * 2).min(BACKOFF_CAP);
    }
}

/// Drive one dialled peer session: announce ourselves, ask for its
/// directory, then service frames until the socket dies.
async fn run_peer_session(
    state: &SharedState,
    addr: &str,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<String>(SESSION_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    state.directory.insert_peer(addr, tx.clone());

    let hello = protocol::seal_signed(
        &ServerHello::new(&state.config.public_addr),
        state.next_counter(),
        &state.identity.private,
    );
    match hello {
        Ok(text) => {
            let _ = tx.send(text).await;
        }
        Err(e) => {
            warn!(peer = %addr, "could not sign server_hello: {}", e);
            state.directory.remove_peer(addr, &tx);
            drop(tx);
            let _ = writer.await;
            return;
        }
    }
    let _ = tx.send(protocol::encode_client_list_request()).await;
    let _ = tx
        .send(protocol::encode_client_list(&state.directory.own_client_list()))
        .await;

    let mut shutdown = state.shutdown.subscribe();
    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = shutdown.recv() => break,
        };
        match frame {
            Some(Ok(WsMessage::Text(text))) => handle_server_frame(state, addr, &tx, &text),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(peer = %addr, "peer read error: {}", e);
                break;
            }
        }
    }

    state.directory.remove_peer(addr, &tx);
    drop(tx);
    let _ = writer.await;
}
