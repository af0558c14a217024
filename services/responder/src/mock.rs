//! In-process kernel and transport for tests and development.
//!
//! [`MockKernel`] answers link and route lookups from a table the caller
//! fills in. [`MockDialer`] hands out [`MockTransport`]s whose other end, a
//! [`MockPeer`], lets a test play the guest: send solicitations, inject socket
//! errors and read back every advertisement the tap sent.

use std::collections::HashMap;
use std::io;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tapra_networking::ndp::{
    RouterAdvertisement, ICMPV6_ROUTER_SOLICITATION, NDP_HOP_LIMIT,
};
use tapra_networking::{Ipv6Prefix, NetworkError, RouteSet};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TapError;
use crate::kernel::{LinkInfo, LinkResolver, RouteInspector};
use crate::transport::{Datagram, Dialer, Transport};

// =============================================================================
// Kernel
// =============================================================================

/// Mock link table and routing table.
#[derive(Default)]
pub struct MockKernel {
    links: Mutex<HashMap<u32, (LinkInfo, RouteSet)>>,
    fail_inspect: AtomicBool,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link and the route destinations leaving through it.
    pub fn add_link<I, S>(&self, link: LinkInfo, routes: I) -> Result<(), NetworkError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let routes = routes
            .into_iter()
            .map(|r| Ipv6Prefix::from_cidr(r.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.state()
            .insert(link.index, (link, RouteSet::classify(routes)));
        Ok(())
    }

    /// Forget a link, as if it was deleted.
    pub fn remove_link(&self, if_index: u32) {
        self.state().remove(&if_index);
    }

    /// Make every route dump fail.
    pub fn set_fail_inspect(&self, fail: bool) {
        self.fail_inspect.store(fail, Ordering::SeqCst);
    }

    fn state(&self) -> MutexGuard<'_, HashMap<u32, (LinkInfo, RouteSet)>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LinkResolver for MockKernel {
    async fn resolve(&self, if_index: u32) -> Result<LinkInfo, TapError> {
        self.state()
            .get(&if_index)
            .map(|(link, _)| link.clone())
            .ok_or_else(|| TapError::Resolve {
                if_index,
                reason: "no such interface".to_string(),
            })
    }
}

#[async_trait]
impl RouteInspector for MockKernel {
    async fn inspect(&self, if_index: u32) -> Result<RouteSet, TapError> {
        if self.fail_inspect.load(Ordering::SeqCst) {
            return Err(TapError::Inspect {
                if_index,
                reason: "mock route dump configured to fail".to_string(),
            });
        }
        Ok(self
            .state()
            .get(&if_index)
            .map(|(_, routes)| routes.clone())
            .unwrap_or_default())
    }
}

// =============================================================================
// Transport
// =============================================================================

/// A datagram a [`MockTransport`] sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub dst: Ipv6Addr,
    pub bytes: Vec<u8>,
}

impl SentPacket {
    /// Decode the packet as a router advertisement.
    pub fn advertisement(&self) -> Result<RouterAdvertisement, NetworkError> {
        RouterAdvertisement::parse(&self.bytes)
    }
}

type Inbound = io::Result<(Vec<u8>, Ipv6Addr, Option<u8>)>;

/// Test side of a [`MockTransport`].
pub struct MockPeer {
    /// Interface the transport was dialed on.
    pub if_index: u32,
    inbound: mpsc::UnboundedSender<Inbound>,
    sent: mpsc::UnboundedReceiver<SentPacket>,
    filtered: Arc<AtomicBool>,
    joined: Arc<AtomicBool>,
}

impl MockPeer {
    /// Deliver a minimal router solicitation from `from`.
    pub fn solicit(&self, from: Ipv6Addr) {
        self.inject(vec![ICMPV6_ROUTER_SOLICITATION, 0, 0, 0, 0, 0, 0, 0], from);
    }

    /// Deliver an arbitrary datagram from an on-link sender (hop limit 255).
    pub fn inject(&self, bytes: Vec<u8>, from: Ipv6Addr) {
        self.inject_with_hop_limit(bytes, from, Some(NDP_HOP_LIMIT));
    }

    /// Deliver a datagram carrying `hop_limit` as ancillary data.
    pub fn inject_with_hop_limit(&self, bytes: Vec<u8>, from: Ipv6Addr, hop_limit: Option<u8>) {
        let _ = self.inbound.send(Ok((bytes, from, hop_limit)));
    }

    /// Make the next receive fail.
    pub fn fail(&self, kind: io::ErrorKind) {
        let _ = self
            .inbound
            .send(Err(io::Error::new(kind, "mock socket failure")));
    }

    /// Next packet the tap sent, `None` once the transport is dropped.
    pub async fn next_sent(&mut self) -> Option<SentPacket> {
        self.sent.recv().await
    }

    /// A packet already sent, without waiting.
    pub fn try_next_sent(&mut self) -> Option<SentPacket> {
        self.sent.try_recv().ok()
    }

    /// Whether the solicitation-only filter was installed.
    pub fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }

    /// Whether the all-routers group was joined.
    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }
}

/// Transport backed by channels to a [`MockPeer`].
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    sent: mpsc::UnboundedSender<SentPacket>,
    filtered: Arc<AtomicBool>,
    joined: Arc<AtomicBool>,
    fail_filter: bool,
    fail_join: bool,
}

#[async_trait]
impl Transport for MockTransport {
    fn accept_only_solicitations(&mut self) -> Result<(), TapError> {
        if self.fail_filter {
            return Err(TapError::Filter(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }
        self.filtered.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn join_all_routers(&mut self) -> Result<(), TapError> {
        if self.fail_join {
            return Err(TapError::Multicast(io::Error::from(
                io::ErrorKind::AddrNotAvailable,
            )));
        }
        self.joined.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Datagram> {
        match self.inbound.recv().await {
            Some(Ok((bytes, source, hop_limit))) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(Datagram {
                    len,
                    source,
                    hop_limit,
                })
            }
            Some(Err(e)) => Err(e),
            // Peer gone: behave like an idle socket.
            None => std::future::pending().await,
        }
    }

    async fn send(&mut self, packet: &[u8], dst: Ipv6Addr) -> io::Result<()> {
        let _ = self.sent.send(SentPacket {
            dst,
            bytes: packet.to_vec(),
        });
        Ok(())
    }
}

/// Dialer handing out [`MockTransport`]s.
pub struct MockDialer {
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
    fail_filter: bool,
    fail_join: bool,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockPeer>>,
}

impl MockDialer {
    /// A dialer that always connects.
    pub fn new() -> Self {
        Self::failing_first(0)
    }

    /// A dialer whose first `failures` dials fail like a tentative link-local.
    pub fn failing_first(failures: u32) -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            failures_remaining: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            fail_filter: false,
            fail_join: false,
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        }
    }

    /// A dialer that never connects.
    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    /// Transports fail to install the ICMPv6 filter.
    pub fn with_filter_failure(mut self) -> Self {
        self.fail_filter = true;
        self
    }

    /// Transports fail to join the all-routers group.
    pub fn with_join_failure(mut self) -> Self {
        self.fail_join = true;
        self
    }

    /// Number of dial attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next successful dial and return its peer.
    pub async fn connected(&self) -> Option<MockPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

impl Default for MockDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, link: &LinkInfo) -> Result<Box<dyn Transport>, TapError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let tentative = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if tentative {
            return Err(TapError::Dial {
                interface: link.name.clone(),
                reason: "[MOCK] link-local address is tentative".to_string(),
            });
        }

        debug!(interface = %link.name, attempt, "[MOCK] Dialed link-local");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let filtered = Arc::new(AtomicBool::new(false));
        let joined = Arc::new(AtomicBool::new(false));

        let _ = self.peers_tx.send(MockPeer {
            if_index: link.index,
            inbound: inbound_tx,
            sent: sent_rx,
            filtered: Arc::clone(&filtered),
            joined: Arc::clone(&joined),
        });

        Ok(Box::new(MockTransport {
            inbound: inbound_rx,
            sent: sent_tx,
            filtered,
            joined,
            fail_filter: self.fail_filter,
            fail_join: self.fail_join,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(index: u32) -> LinkInfo {
        LinkInfo {
            index,
            name: format!("tap{}", index),
            hardware_addr: vec![2, 0, 0, 0, 0, index as u8],
        }
    }

    #[tokio::test]
    async fn test_kernel_classifies_routes() {
        let kernel = MockKernel::new();
        kernel
            .add_link(link(3), ["2001:db8::3/128", "2001:db8::/64"])
            .unwrap();

        let routes = kernel.inspect(3).await.unwrap();
        assert_eq!(routes.host_routes.len(), 1);
        assert_eq!(routes.subnet_routes.len(), 1);

        assert!(kernel.inspect(4).await.unwrap().is_empty());
        assert!(kernel.add_link(link(5), ["not-a-route"]).is_err());
    }

    #[tokio::test]
    async fn test_dialer_fails_first_attempts() {
        let dialer = MockDialer::failing_first(2);

        assert!(dialer.dial(&link(1)).await.is_err());
        assert!(dialer.dial(&link(1)).await.is_err());
        assert!(dialer.dial(&link(1)).await.is_ok());
        assert_eq!(dialer.attempts(), 3);
    }

    #[tokio::test]
    async fn test_transport_round_trip() {
        let dialer = MockDialer::new();
        let mut transport = dialer.dial(&link(1)).await.unwrap();
        let mut peer = dialer.connected().await.unwrap();

        let from: Ipv6Addr = "fe80::1".parse().unwrap();
        peer.solicit(from);
        let mut buf = [0u8; 64];
        let datagram = transport.recv(&mut buf).await.unwrap();
        assert_eq!(
            datagram,
            Datagram {
                len: 8,
                source: from,
                hop_limit: Some(NDP_HOP_LIMIT),
            }
        );
        assert_eq!(buf[0], ICMPV6_ROUTER_SOLICITATION);

        peer.inject_with_hop_limit(vec![0; 4], from, Some(64));
        assert_eq!(
            transport.recv(&mut buf).await.unwrap().hop_limit,
            Some(64)
        );

        transport.send(&[1, 2, 3], from).await.unwrap();
        let sent = peer.next_sent().await.unwrap();
        assert_eq!(sent.dst, from);
        assert_eq!(sent.bytes, vec![1, 2, 3]);
    }
}
