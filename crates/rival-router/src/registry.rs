//! Session bookkeeping.
//!
//! Every socket is in exactly one of three places: `pending` until it
//! verifies, `active` once it owns its identifier, or `on_hold` when it
//! presented an identifier some other socket already owns. An identifier is
//! never in `active` and `on_hold` through the same socket. Held sockets
//! queue per identifier in arrival order and are never closed by the router,
//! so duplicates with reconnect enabled cannot evict each other.

use rival_core::MessagePayload;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Sending half of a connected socket.
#[derive(Debug, Clone)]
pub(crate) struct Peer {
    pub(crate) addr: SocketAddr,
    tx: mpsc::UnboundedSender<MessagePayload>,
}

impl Peer {
    pub(crate) fn new(addr: SocketAddr, tx: mpsc::UnboundedSender<MessagePayload>) -> Self {
        Self { addr, tx }
    }

    /// Queue a frame. Returns false once the socket is gone.
    pub(crate) fn send(&self, frame: MessagePayload) -> bool {
        self.tx.send(frame).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Role {
    Pending,
    Active(String),
    Held(String),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Admitted,
    /// The identifier is taken; `position` counts from 1 at the head of the
    /// hold queue.
    OnHold { position: usize },
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    active: HashMap<String, Peer>,
    pending: HashMap<SocketAddr, Peer>,
    on_hold: HashMap<String, VecDeque<Peer>>,
}

impl Registry {
    pub(crate) fn insert_pending(&mut self, peer: Peer) {
        self.pending.insert(peer.addr, peer);
    }

    pub(crate) fn role(&self, addr: SocketAddr) -> Option<Role> {
        if self.pending.contains_key(&addr) {
            return Some(Role::Pending);
        }
        if let Some((id, _)) = self.active.iter().find(|(_, peer)| peer.addr == addr) {
            return Some(Role::Active(id.clone()));
        }
        self.on_hold
            .iter()
            .find(|(_, queue)| queue.iter().any(|peer| peer.addr == addr))
            .map(|(id, _)| Role::Held(id.clone()))
    }

    /// Bind a pending socket to `id`.
    pub(crate) fn verify(&mut self, addr: SocketAddr, id: &str) -> Option<Admission> {
        let peer = self.pending.remove(&addr)?;
        if self.active.contains_key(id) {
            let queue = self.on_hold.entry(id.to_string()).or_default();
            queue.push_back(peer);
            return Some(Admission::OnHold {
                position: queue.len(),
            });
        }
        self.active.insert(id.to_string(), peer);
        Some(Admission::Admitted)
    }

    /// Forget the socket at `addr`. When it was the active holder of an
    /// identifier with sockets on hold, the longest waiting one takes over
    /// and is returned.
    pub(crate) fn disconnect(&mut self, addr: SocketAddr) -> Option<(String, Peer)> {
        match self.role(addr)? {
            Role::Pending => {
                self.pending.remove(&addr);
                None
            }
            Role::Held(id) => {
                if let Some(queue) = self.on_hold.get_mut(&id) {
                    queue.retain(|peer| peer.addr != addr);
                    if queue.is_empty() {
                        self.on_hold.remove(&id);
                    }
                }
                None
            }
            Role::Active(id) => {
                self.active.remove(&id);
                let queue = self.on_hold.get_mut(&id)?;
                let held = queue.pop_front();
                if queue.is_empty() {
                    self.on_hold.remove(&id);
                }
                let held = held?;
                self.active.insert(id.clone(), held.clone());
                Some((id, held))
            }
        }
    }

    pub(crate) fn active(&self, id: &str) -> Option<&Peer> {
        self.active.get(id)
    }

    pub(crate) fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    /// Active identifiers, sorted.
    pub(crate) fn client_list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Recipients of an information frame from `sender`.
    ///
    /// An explicit list selects its active members, each once. No list, or an
    /// empty one, selects every active peer except the sender.
    pub(crate) fn information_targets(
        &self,
        sender: &str,
        destinations: Option<&[String]>,
    ) -> Vec<(String, Peer)> {
        match destinations {
            Some(list) if !list.is_empty() => {
                let mut seen = HashSet::new();
                list.iter()
                    .filter(|id| seen.insert(id.as_str()))
                    .filter_map(|id| self.active.get(id).map(|peer| (id.clone(), peer.clone())))
                    .collect()
            }
            _ => self
                .active
                .iter()
                .filter(|(id, _)| id.as_str() != sender)
                .map(|(id, peer)| (id.clone(), peer.clone()))
                .collect(),
        }
    }
}
