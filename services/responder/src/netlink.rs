//! rtnetlink-backed kernel lookups.
//!
//! Resolves links, dumps the IPv6 main routing table for the route inspector,
//! and finds the link-local address a tap's ND socket binds to.

use std::io;
use std::net::{IpAddr, Ipv6Addr};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteHeader, RouteMessage};
use netlink_packet_route::AddressFamily;
use rtnetlink::{Handle, IpVersion};
use tapra_networking::{Ipv6Prefix, RouteSet};
use tracing::debug;

use crate::error::TapError;
use crate::kernel::{LinkInfo, LinkResolver, RouteInspector};

/// Shared rtnetlink request handle.
#[derive(Clone)]
pub struct Netlink {
    handle: Handle,
}

impl Netlink {
    /// Open a netlink connection and drive it on the current runtime.
    pub fn connect() -> io::Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Dump every link the kernel knows about.
    pub async fn links(&self) -> Result<Vec<LinkInfo>, rtnetlink::Error> {
        let mut stream = self.handle.link().get().execute();
        let mut links = Vec::new();
        while let Some(msg) = stream.try_next().await? {
            if let Some(link) = link_info(&msg) {
                links.push(link);
            }
        }
        Ok(links)
    }

    /// First unicast link-local address configured on `if_index`, if any.
    pub async fn link_local_address(
        &self,
        if_index: u32,
    ) -> Result<Option<Ipv6Addr>, rtnetlink::Error> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(if_index)
            .execute();

        while let Some(msg) = stream.try_next().await? {
            if msg.header.family != AddressFamily::Inet6 {
                continue;
            }
            let found = msg.attributes.iter().find_map(|attr| match attr {
                AddressAttribute::Address(IpAddr::V6(addr)) if addr.is_unicast_link_local() => {
                    Some(*addr)
                }
                _ => None,
            });
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl LinkResolver for Netlink {
    async fn resolve(&self, if_index: u32) -> Result<LinkInfo, TapError> {
        let resolve_error = |reason: String| TapError::Resolve { if_index, reason };

        let mut stream = self.handle.link().get().match_index(if_index).execute();
        match stream.try_next().await {
            Ok(Some(msg)) => {
                link_info(&msg).ok_or_else(|| resolve_error("link has no name".to_string()))
            }
            Ok(None) => Err(resolve_error("no such interface".to_string())),
            Err(e) => Err(resolve_error(e.to_string())),
        }
    }
}

#[async_trait]
impl RouteInspector for Netlink {
    async fn inspect(&self, if_index: u32) -> Result<RouteSet, TapError> {
        let mut stream = self.handle.route().get(IpVersion::V6).execute();
        let mut routes = RouteSet::default();

        while let Some(msg) = stream.try_next().await.map_err(|e| TapError::Inspect {
            if_index,
            reason: e.to_string(),
        })? {
            if let Some(destination) = route_destination(&msg, if_index) {
                routes.push(destination);
            }
        }

        debug!(
            if_index,
            host_routes = routes.host_routes.len(),
            subnet_routes = routes.subnet_routes.len(),
            "Inspected routes"
        );

        Ok(routes)
    }
}

/// Extract index, name and hardware address from a link message.
pub(crate) fn link_info(msg: &LinkMessage) -> Option<LinkInfo> {
    let mut name = None;
    let mut hardware_addr = Vec::new();
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = Some(n.clone()),
            LinkAttribute::Address(addr) => hardware_addr = addr.clone(),
            _ => {}
        }
    }
    Some(LinkInfo {
        index: msg.header.index,
        name: name?,
        hardware_addr,
    })
}

/// Destination of an IPv6 main-table route leaving through `if_index`.
///
/// The kernel omits the destination attribute for the default route, which
/// then comes back as `::/0`.
pub(crate) fn route_destination(msg: &RouteMessage, if_index: u32) -> Option<Ipv6Prefix> {
    if msg.header.address_family != AddressFamily::Inet6 {
        return None;
    }

    let mut table = u32::from(msg.header.table);
    let mut oif = None;
    let mut destination = Ipv6Addr::UNSPECIFIED;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Table(t) => table = *t,
            RouteAttribute::Oif(idx) => oif = Some(*idx),
            RouteAttribute::Destination(RouteAddress::Inet6(addr)) => destination = *addr,
            _ => {}
        }
    }

    if table != u32::from(RouteHeader::RT_TABLE_MAIN) || oif != Some(if_index) {
        return None;
    }

    Ipv6Prefix::new(destination, msg.header.destination_prefix_length).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(destination: Option<&str>, prefix_len: u8, oif: u32) -> RouteMessage {
        let mut msg = RouteMessage::default();
        msg.header.address_family = AddressFamily::Inet6;
        msg.header.destination_prefix_length = prefix_len;
        msg.header.table = RouteHeader::RT_TABLE_MAIN;
        if let Some(destination) = destination {
            msg.attributes.push(RouteAttribute::Destination(RouteAddress::Inet6(
                destination.parse().unwrap(),
            )));
        }
        msg.attributes.push(RouteAttribute::Oif(oif));
        msg
    }

    #[test]
    fn test_host_route_destination() {
        let msg = route(Some("2001:db8:1:1::5"), 128, 12);
        assert_eq!(
            route_destination(&msg, 12),
            Some("2001:db8:1:1::5/128".parse().unwrap())
        );
    }

    #[test]
    fn test_default_route_without_destination_attribute() {
        let msg = route(None, 0, 12);
        assert_eq!(route_destination(&msg, 12), Some("::/0".parse().unwrap()));
    }

    #[test]
    fn test_other_interface_is_skipped() {
        let msg = route(Some("2001:db8::"), 64, 3);
        assert_eq!(route_destination(&msg, 12), None);
    }

    #[test]
    fn test_local_table_is_skipped() {
        let mut msg = route(Some("fe80::1"), 128, 12);
        msg.header.table = 255; // RT_TABLE_LOCAL
        assert_eq!(route_destination(&msg, 12), None);
    }

    #[test]
    fn test_table_attribute_overrides_header() {
        let mut msg = route(Some("2001:db8::"), 64, 12);
        msg.header.table = 0;
        msg.attributes.push(RouteAttribute::Table(1000));
        assert_eq!(route_destination(&msg, 12), None);

        let mut msg = route(Some("2001:db8::"), 64, 12);
        msg.header.table = 0;
        msg.attributes
            .push(RouteAttribute::Table(u32::from(RouteHeader::RT_TABLE_MAIN)));
        assert!(route_destination(&msg, 12).is_some());
    }

    #[test]
    fn test_ipv4_route_is_skipped() {
        let mut msg = route(None, 0, 12);
        msg.header.address_family = AddressFamily::Inet;
        assert_eq!(route_destination(&msg, 12), None);
    }

    #[test]
    fn test_link_info() {
        let mut msg = LinkMessage::default();
        msg.header.index = 42;
        msg.attributes
            .push(LinkAttribute::IfName("tap-42".to_string()));
        msg.attributes
            .push(LinkAttribute::Address(vec![2, 0, 0, 0, 0, 42]));

        let link = link_info(&msg).unwrap();
        assert_eq!(link.index, 42);
        assert_eq!(link.name, "tap-42");
        assert_eq!(link.hardware_addr, vec![2, 0, 0, 0, 0, 42]);
    }

    #[test]
    fn test_link_info_requires_name() {
        let mut msg = LinkMessage::default();
        msg.header.index = 42;
        assert!(link_info(&msg).is_none());
    }
}
