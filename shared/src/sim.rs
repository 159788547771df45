//! In-process datagram network for deterministic testing.
//!
//! Real networks drop packets and peers stop answering. To exercise
//! retransmission and eviction without depending on real network conditions,
//! [`SimNetwork`] routes datagrams between [`SimSocket`]s through per-address
//! mailboxes and applies a scripted fault model:
//!
//! | Fault            | Description                                          |
//! |------------------|------------------------------------------------------|
//! | Counted loss     | Drop the next `n` datagrams matching `from` / `to`.  |
//! | Silenced address | Every datagram from or to the address is lost.       |
//!
//! Every datagram handed to the network is recorded, delivered or not, so
//! tests can inspect exactly what went on the wire.

use crate::transport::Transport;
use log::trace;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

type Mailbox = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
    pub delivered: bool,
}

#[derive(Debug)]
struct DropRule {
    from: Option<SocketAddr>,
    to: Option<SocketAddr>,
    remaining: usize,
}

impl DropRule {
    fn matches(&self, from: SocketAddr, to: SocketAddr) -> bool {
        self.remaining > 0
            && self.from.map_or(true, |addr| addr == from)
            && self.to.map_or(true, |addr| addr == to)
    }
}

#[derive(Debug, Default)]
struct NetState {
    mailboxes: HashMap<SocketAddr, Mailbox>,
    silenced: HashSet<SocketAddr>,
    drop_rules: Vec<DropRule>,
    history: Vec<Datagram>,
    next_port: u16,
}

impl NetState {
    fn take_drop(&mut self, from: SocketAddr, to: SocketAddr) -> bool {
        match self.drop_rules.iter_mut().find(|rule| rule.matches(from, to)) {
            Some(rule) => {
                rule.remaining -= 1;
                true
            }
            None => false,
        }
    }

    fn is_bound(&self, addr: &SocketAddr) -> bool {
        self.mailboxes
            .get(addr)
            .map_or(false, |mailbox| !mailbox.is_closed())
    }
}

#[derive(Debug, Default)]
pub struct SimNetwork {
    state: Mutex<NetState>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Binds a socket. Port 0 picks a free port on the given IP.
    pub async fn bind(self: &Arc<Self>, addr: SocketAddr) -> io::Result<SimSocket> {
        let mut state = self.state.lock().await;

        let mut addr = addr;
        if addr.port() == 0 {
            loop {
                let port = FIRST_EPHEMERAL_PORT.wrapping_add(state.next_port);
                state.next_port = state.next_port.wrapping_add(1);
                addr.set_port(port);
                if port != 0 && !state.is_bound(&addr) {
                    break;
                }
            }
        } else if state.is_bound(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is already bound", addr),
            ));
        }

        let (mailbox, inbox) = mpsc::unbounded_channel();
        state.mailboxes.insert(addr, mailbox);

        Ok(SimSocket {
            addr,
            network: Arc::clone(self),
            inbox: Mutex::new(inbox),
        })
    }

    /// Loses every datagram sent from or to `addr` until restored.
    pub async fn silence(&self, addr: SocketAddr) {
        self.state.lock().await.silenced.insert(addr);
    }

    pub async fn restore(&self, addr: SocketAddr) {
        self.state.lock().await.silenced.remove(&addr);
    }

    /// Loses the next `count` datagrams matching the filter. `None` matches
    /// any address.
    pub async fn drop_next(&self, from: Option<SocketAddr>, to: Option<SocketAddr>, count: usize) {
        self.state.lock().await.drop_rules.push(DropRule {
            from,
            to,
            remaining: count,
        });
    }

    pub async fn history(&self) -> Vec<Datagram> {
        self.state.lock().await.history.clone()
    }

    pub async fn sent_to(&self, to: SocketAddr) -> Vec<Datagram> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .filter(|datagram| datagram.to == to)
            .cloned()
            .collect()
    }

    async fn route(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        let mut state = self.state.lock().await;

        let lost = state.silenced.contains(&from)
            || state.silenced.contains(&to)
            || state.take_drop(from, to);

        let delivered = !lost
            && match state.mailboxes.get(&to) {
                Some(mailbox) => mailbox.send((bytes.to_vec(), from)).is_ok(),
                None => false,
            };

        trace!(
            "sim {} -> {} ({} bytes){}",
            from,
            to,
            bytes.len(),
            if delivered { "" } else { " lost" }
        );

        state.history.push(Datagram {
            from,
            to,
            bytes: bytes.to_vec(),
            delivered,
        });
    }
}

/// A socket attached to a [`SimNetwork`]. Dropping it frees the address.
#[derive(Debug)]
pub struct SimSocket {
    addr: SocketAddr,
    network: Arc<SimNetwork>,
    inbox: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

impl Transport for SimSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.network.route(self.addr, target, buf).await;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((bytes, from)) => {
                // Oversized datagrams are truncated, as with a real socket.
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok((len, from))
            }
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "simulated network detached",
            )),
        }
    }
}
