// src/directory.rs
// The server's authoritative view: locally-attached clients keyed by
// fingerprint and neighbourhood peer sessions keyed by host:port.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{ClientList, ServerClients};

/// Outbound frame queue of a session task. One text frame per message.
pub type FrameSender = mpsc::Sender<String>;

pub struct LocalClient {
    pub public_key_b64: String,
    pub last_counter: u64,
    pub sender: FrameSender,
}

pub struct PeerServer {
    pub sender: FrameSender,
    pub advertised_clients: Vec<String>,
}

#[derive(Default)]
struct DirInner {
    local_clients: HashMap<String, LocalClient>,
    peer_servers: HashMap<String, PeerServer>,
}

/// Shared directory. Routing reads take the read lock and snapshot what they
/// need; membership changes and counter updates go through the write lock so
/// a counter check-and-set is one critical section.
pub struct Directory {
    public_addr: String,
    inner: RwLock<DirInner>,
}

impl Directory {
    pub fn new(public_addr: String) -> Self {
        Self {
            public_addr,
            inner: RwLock::new(DirInner::default()),
        }
    }

    pub fn public_addr(&self) -> &str {
        &self.public_addr
    }

    /// Register a client after its hello verified. The hello's counter
    /// becomes the replay floor. If the fingerprint is already attached,
    /// the new hello must outrun the stored counter, otherwise the caller
    /// rejects the session.
    pub fn insert_client(
        &self,
        fingerprint: &str,
        public_key_b64: &str,
        hello_counter: u64,
        sender: FrameSender,
    ) -> bool {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.local_clients.get(fingerprint) {
            if hello_counter <= existing.last_counter {
                return false;
            }
        }
        inner.local_clients.insert(
            fingerprint.to_string(),
            LocalClient {
                public_key_b64: public_key_b64.to_string(),
                last_counter: hello_counter,
                sender,
            },
        );
        true
    }

    /// Drop a client session, but only if `sender` still owns the entry (a
    /// newer session under the same key must not be clobbered by the old
    /// task unwinding).
    pub fn remove_client(&self, fingerprint: &str, sender: &FrameSender) -> bool {
        let mut inner = self.inner.write();
        match inner.local_clients.get(fingerprint) {
            Some(entry) if entry.sender.same_channel(sender) => {
                inner.local_clients.remove(fingerprint);
                true
            }
            _ => false,
        }
    }

    pub fn client_public_key(&self, fingerprint: &str) -> Option<String> {
        self.inner
            .read()
            .local_clients
            .get(fingerprint)
            .map(|c| c.public_key_b64.clone())
    }

    /// Accept `counter` for this client only if it is strictly greater than
    /// the last accepted one, updating the floor in the same critical
    /// section. Replays racing through parallel sessions cannot both pass.
    pub fn check_and_update_counter(&self, fingerprint: &str, counter: u64) -> bool {
        let mut inner = self.inner.write();
        match inner.local_clients.get_mut(fingerprint) {
            Some(client) if counter > client.last_counter => {
                client.last_counter = counter;
                true
            }
            _ => false,
        }
    }

    /// Register (or replace) a peer-server session.
    pub fn insert_peer(&self, addr: &str, sender: FrameSender) {
        let mut inner = self.inner.write();
        let advertised = inner
            .peer_servers
            .remove(addr)
            .map(|p| p.advertised_clients)
            .unwrap_or_default();
        inner.peer_servers.insert(
            addr.to_string(),
            PeerServer {
                sender,
                advertised_clients: advertised,
            },
        );
    }

    pub fn remove_peer(&self, addr: &str, sender: &FrameSender) -> bool {
        let mut inner = self.inner.write();
        match inner.peer_servers.get(addr) {
            Some(entry) if entry.sender.same_channel(sender) => {
                inner.peer_servers.remove(addr);
                true
            }
            _ => false,
        }
    }

    pub fn has_peer(&self, addr: &str) -> bool {
        self.inner.read().peer_servers.contains_key(addr)
    }

    pub fn peer_sender(&self, addr: &str) -> Option<FrameSender> {
        self.inner
            .read()
            .peer_servers
            .get(addr)
            .map(|p| p.sender.clone())
    }

    /// Replace what a peer most recently advertised about its clients.
    pub fn set_advertised(&self, addr: &str, clients: Vec<String>) {
        let mut inner = self.inner.write();
        if let Some(peer) = inner.peer_servers.get_mut(addr) {
            peer.advertised_clients = clients;
        }
    }

    /// Snapshot every local client sender, for fan-out.
    pub fn client_senders(&self) -> Vec<FrameSender> {
        self.inner
            .read()
            .local_clients
            .values()
            .map(|c| c.sender.clone())
            .collect()
    }

    /// Snapshot every peer-server sender, for fan-out.
    pub fn peer_senders(&self) -> Vec<FrameSender> {
        self.inner
            .read()
            .peer_servers
            .values()
            .map(|p| p.sender.clone())
            .collect()
    }

    /// Peer senders with their addresses, for fan-out that excludes the
    /// arrival peer.
    pub fn peer_entries(&self) -> Vec<(String, FrameSender)> {
        self.inner
            .read()
            .peer_servers
            .iter()
            .map(|(addr, p)| (addr.clone(), p.sender.clone()))
            .collect()
    }

    /// Just our own clients, the form pushed to neighbourhood peers.
    pub fn own_client_list(&self) -> ClientList {
        let inner = self.inner.read();
        ClientList {
            servers: vec![ServerClients {
                address: self.public_addr.clone(),
                clients: inner
                    .local_clients
                    .values()
                    .map(|c| c.public_key_b64.clone())
                    .collect(),
            }],
        }
    }

    /// The aggregate view disclosed to clients: our clients plus the most
    /// recent list each peer advertised.
    pub fn full_client_list(&self) -> ClientList {
        let inner = self.inner.read();
        let mut servers = vec![ServerClients {
            address: self.public_addr.clone(),
            clients: inner
                .local_clients
                .values()
                .map(|c| c.public_key_b64.clone())
                .collect(),
        }];
        let mut peer_addrs: Vec<&String> = inner.peer_servers.keys().collect();
        peer_addrs.sort();
        for addr in peer_addrs {
            let peer = &inner.peer_servers[addr];
            servers.push(ServerClients {
                address: addr.clone(),
                clients: peer.advertised_clients.clone(),
            });
        }
        ClientList { servers }
    }

    pub fn local_client_count(&self) -> usize {
        self.inner.read().local_clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> FrameSender {
        mpsc::channel(8).0
    }

    fn dir() -> Directory {
        Directory::new("127.0.0.1:9000".into())
    }

    #[test]
    fn counter_must_strictly_increase() {
        let d = dir();
        assert!(d.insert_client("fp-a", "key-a", 1, sender()));

        assert!(d.check_and_update_counter("fp-a", 2));
        assert!(d.check_and_update_counter("fp-a", 3));
        // equal replay
        assert!(!d.check_and_update_counter("fp-a", 3));
        // stale replay
        assert!(!d.check_and_update_counter("fp-a", 2));
        // unknown sender
        assert!(!d.check_and_update_counter("fp-b", 10));
    }

    #[test]
    fn rehello_with_stale_counter_is_rejected() {
        let d = dir();
        assert!(d.insert_client("fp-a", "key-a", 1, sender()));
        assert!(d.check_and_update_counter("fp-a", 5));

        assert!(!d.insert_client("fp-a", "key-a", 5, sender()));
        assert!(d.insert_client("fp-a", "key-a", 6, sender()));
    }

    #[test]
    fn remove_client_only_for_owning_session() {
        let d = dir();
        let first = sender();
        d.insert_client("fp-a", "key-a", 1, first.clone());

        let second = sender();
        assert!(d.insert_client("fp-a", "key-a", 2, second.clone()));

        // the old session unwinding must not evict the new one
        assert!(!d.remove_client("fp-a", &first));
        assert_eq!(d.local_client_count(), 1);
        assert!(d.remove_client("fp-a", &second));
        assert_eq!(d.local_client_count(), 0);
    }

    #[test]
    fn full_list_aggregates_local_and_advertised() {
        let d = dir();
        d.insert_client("fp-a", "key-a", 1, sender());
        d.insert_peer("10.0.0.2:9000", sender());
        d.set_advertised("10.0.0.2:9000", vec!["key-b".into(), "key-c".into()]);

        let list = d.full_client_list();
        assert_eq!(list.servers.len(), 2);
        assert_eq!(list.servers[0].address, "127.0.0.1:9000");
        assert_eq!(list.servers[0].clients, vec!["key-a".to_string()]);
        assert_eq!(list.servers[1].address, "10.0.0.2:9000");
        assert_eq!(list.servers[1].clients.len(), 2);
    }

    #[test]
    fn own_list_excludes_peers() {
        let d = dir();
        d.insert_peer("10.0.0.2:9000", sender());
        d.set_advertised("10.0.0.2:9000", vec!["key-b".into()]);

        let own = d.own_client_list();
        assert_eq!(own.servers.len(), 1);
        assert!(own.servers[0].clients.is_empty());
    }

    #[test]
    fn peer_replacement_keeps_advertised_set() {
        let d = dir();
        d.insert_peer("10.0.0.2:9000", sender());
        d.set_advertised("10.0.0.2:9000", vec!["key-b".into()]);

        // redial replaces the session
        d.insert_peer("10.0.0.2:9000", sender());
        let list = d.full_client_list();
        assert_eq!(list.servers[1].clients, vec!["key-b".to_string()]);
    }
}
