//! ICMPv6 transport for Neighbor Discovery on one tap.
//!
//! A [`Dialer`] opens a [`Transport`] bound to a link. The production pair is
//! [`SocketDialer`] / [`IcmpSocket`]: a raw ICMPv6 socket bound to the tap's
//! link-local address, with the hop limit fixed at 255 as ND requires.
//!
//! Freshly created taps often have no usable link-local address for several
//! seconds (duplicate address detection keeps it tentative), so dialing fails
//! with [`TapError::Dial`] until the kernel releases it. Callers retry.

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::fd::{AsRawFd, RawFd};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tapra_networking::ndp::{ALL_ROUTERS, ICMPV6_ROUTER_SOLICITATION, NDP_HOP_LIMIT};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::TapError;
use crate::kernel::LinkInfo;
use crate::netlink::Netlink;

/// Metadata of one received message; the payload is in the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    pub len: usize,
    pub source: Ipv6Addr,
    /// IPv6 hop limit the message arrived with, if the socket reported it.
    pub hop_limit: Option<u8>,
}

/// Opens transports for links.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a link-local ICMPv6 transport on `link`.
    async fn dial(&self, link: &LinkInfo) -> Result<Box<dyn Transport>, TapError>;
}

/// A connected ND transport owned by one tap task.
#[async_trait]
pub trait Transport: Send {
    /// Drop every inbound ICMPv6 type except Router Solicitation.
    fn accept_only_solicitations(&mut self) -> Result<(), TapError>;

    /// Join ff02::2 on the bound interface.
    fn join_all_routers(&mut self) -> Result<(), TapError>;

    /// Receive one ICMPv6 message into `buf`.
    ///
    /// Must be cancel safe: dropping the future loses no datagram.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Datagram>;

    /// Send one ICMPv6 message to `dst` on the bound interface.
    async fn send(&mut self, packet: &[u8], dst: Ipv6Addr) -> io::Result<()>;
}

// =============================================================================
// Raw socket
// =============================================================================

/// `ICMP6_FILTER` socket option (linux/icmpv6.h).
const ICMP6_FILTER: libc::c_int = 1;

/// Room for one `IPV6_HOPLIMIT` control message, 8-byte aligned.
const CONTROL_WORDS: usize = 8;

/// `struct icmp6_filter`: one bit per ICMPv6 type, a set bit blocks the type.
#[repr(C)]
struct Icmp6Filter {
    data: [u32; 8],
}

/// Filter that blocks everything but Router Solicitation.
fn solicitation_only_filter() -> Icmp6Filter {
    let mut data = [u32::MAX; 8];
    let kind = usize::from(ICMPV6_ROUTER_SOLICITATION);
    data[kind >> 5] &= !(1 << (kind & 31));
    Icmp6Filter { data }
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    // SAFETY: `value` points to a live `T` for the duration of the call and
    // the length passed is its size.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One `recvmsg` on a nonblocking raw ICMPv6 socket, keeping the hop limit
/// from ancillary data.
fn recv_datagram(fd: RawFd, buf: &mut [u8]) -> io::Result<Datagram> {
    // SAFETY: all-zero is a valid sockaddr_in6 and msghdr.
    let mut source: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    let mut control = [0u64; CONTROL_WORDS];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    msg.msg_name = (&mut source as *mut libc::sockaddr_in6).cast();
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = std::mem::size_of_val(&control) as _;

    // SAFETY: every pointer in `msg` refers to a local that outlives the call.
    let len = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut hop_limit = None;
    // SAFETY: the kernel filled `msg_controllen` bytes of `control`; the
    // CMSG_* macros stay within that range.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IPV6 && (*cmsg).cmsg_type == libc::IPV6_HOPLIMIT
            {
                let value =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::c_int);
                hop_limit = u8::try_from(value).ok();
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Datagram {
        len: len as usize,
        source: Ipv6Addr::from(source.sin6_addr.s6_addr),
        hop_limit,
    })
}

/// Raw ICMPv6 socket bound to one interface's link-local address.
#[derive(Debug)]
pub struct IcmpSocket {
    socket: UdpSocket,
    if_index: u32,
}

impl IcmpSocket {
    /// Open and bind the socket. Must run inside a tokio runtime.
    pub fn open(link: &LinkInfo, local: Ipv6Addr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        socket.set_nonblocking(true)?;
        socket.set_multicast_hops_v6(u32::from(NDP_HOP_LIMIT))?;
        socket.set_unicast_hops_v6(u32::from(NDP_HOP_LIMIT))?;
        setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVHOPLIMIT,
            &(1 as libc::c_int),
        )?;
        socket.set_multicast_if_v6(link.index)?;
        socket.set_multicast_loop_v6(false)?;

        #[cfg(target_os = "linux")]
        socket.bind_device(Some(link.name.as_bytes()))?;

        socket.bind(&SockAddr::from(SocketAddrV6::new(local, 0, 0, link.index)))?;

        // Datagram semantics are all tokio needs to drive the raw fd.
        let socket = UdpSocket::from_std(socket.into())?;

        Ok(Self {
            socket,
            if_index: link.index,
        })
    }
}

#[async_trait]
impl Transport for IcmpSocket {
    fn accept_only_solicitations(&mut self) -> Result<(), TapError> {
        setsockopt(
            self.socket.as_raw_fd(),
            libc::IPPROTO_ICMPV6,
            ICMP6_FILTER,
            &solicitation_only_filter(),
        )
        .map_err(TapError::Filter)
    }

    fn join_all_routers(&mut self) -> Result<(), TapError> {
        self.socket
            .join_multicast_v6(&ALL_ROUTERS, self.if_index)
            .map_err(TapError::Multicast)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Datagram> {
        let fd = self.socket.as_raw_fd();
        self.socket
            .async_io(Interest::READABLE, || recv_datagram(fd, buf))
            .await
    }

    async fn send(&mut self, packet: &[u8], dst: Ipv6Addr) -> io::Result<()> {
        let dst = SocketAddrV6::new(dst, 0, 0, self.if_index);
        self.socket.send_to(packet, SocketAddr::V6(dst)).await?;
        Ok(())
    }
}

/// Dials [`IcmpSocket`]s, looking up the link-local address over netlink.
#[derive(Clone)]
pub struct SocketDialer {
    netlink: Netlink,
}

impl SocketDialer {
    pub fn new(netlink: Netlink) -> Self {
        Self { netlink }
    }
}

#[async_trait]
impl Dialer for SocketDialer {
    async fn dial(&self, link: &LinkInfo) -> Result<Box<dyn Transport>, TapError> {
        let dial_error = |reason: String| TapError::Dial {
            interface: link.name.clone(),
            reason,
        };

        let local = self
            .netlink
            .link_local_address(link.index)
            .await
            .map_err(|e| dial_error(e.to_string()))?
            .ok_or_else(|| dial_error("no link-local address".to_string()))?;

        let socket = IcmpSocket::open(link, local)
            .map_err(|e| dial_error(format!("bind [{}%{}]: {}", local, link.name, e)))?;

        debug!(interface = %link.name, local = %local, "Dialed link-local");

        Ok(Box::new(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(filter: &Icmp6Filter, kind: u8) -> bool {
        let kind = usize::from(kind);
        filter.data[kind >> 5] & (1 << (kind & 31)) != 0
    }

    #[test]
    fn test_filter_passes_only_router_solicitation() {
        let filter = solicitation_only_filter();

        assert!(!blocks(&filter, ICMPV6_ROUTER_SOLICITATION));
        for kind in (0..=u8::MAX).filter(|k| *k != ICMPV6_ROUTER_SOLICITATION) {
            assert!(blocks(&filter, kind), "type {} should be blocked", kind);
        }
    }

    #[test]
    fn test_filter_layout_matches_kernel_struct() {
        assert_eq!(std::mem::size_of::<Icmp6Filter>(), 32);
    }
}
