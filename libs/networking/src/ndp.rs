//! Router-side Neighbor Discovery messages (RFC 4861).
//!
//! The wire format is smoltcp's [`NdiscRepr`]; this module only maps the
//! responder's view of an advertisement onto it and back. The ICMPv6
//! checksum is left zero on encode; the kernel fills it in for raw ICMPv6
//! sockets.

use std::net::Ipv6Addr;

use smoltcp::time::Duration;
use smoltcp::wire::{
    Icmpv6Packet, NdiscPrefixInfoFlags, NdiscPrefixInformation, NdiscRepr, NdiscRouterFlags,
    RawHardwareAddress,
};

use crate::{Ipv6Prefix, NetworkError};

/// ICMPv6 type of a Router Solicitation.
pub const ICMPV6_ROUTER_SOLICITATION: u8 = 133;

/// ICMPv6 type of a Router Advertisement.
pub const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;

/// All-nodes link-local multicast group, destination of unsolicited RAs.
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// All-routers link-local multicast group a router joins.
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// Hop limit every ND message must be sent and received with.
pub const NDP_HOP_LIMIT: u8 = 255;

/// Length of the only link-layer address advertised, a MAC.
pub const ETHERNET_ADDR_LEN: usize = 6;

/// Prefix Information option (type 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixInformation {
    pub prefix: Ipv6Prefix,
    /// L flag.
    pub on_link: bool,
    /// A flag (SLAAC).
    pub autonomous: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
}

impl PrefixInformation {
    fn to_repr(&self) -> NdiscPrefixInformation {
        let mut flags = NdiscPrefixInfoFlags::empty();
        if self.on_link {
            flags |= NdiscPrefixInfoFlags::ON_LINK;
        }
        if self.autonomous {
            flags |= NdiscPrefixInfoFlags::ADDRCONF;
        }
        NdiscPrefixInformation {
            prefix_len: self.prefix.prefix_len,
            flags,
            valid_lifetime: Duration::from_secs(u64::from(self.valid_lifetime)),
            preferred_lifetime: Duration::from_secs(u64::from(self.preferred_lifetime)),
            prefix: self.prefix.address,
        }
    }

    fn from_repr(info: &NdiscPrefixInformation) -> Result<Self, NetworkError> {
        Ok(Self {
            prefix: Ipv6Prefix::new(info.prefix, info.prefix_len)?,
            on_link: info.flags.contains(NdiscPrefixInfoFlags::ON_LINK),
            autonomous: info.flags.contains(NdiscPrefixInfoFlags::ADDRCONF),
            valid_lifetime: lifetime_secs(info.valid_lifetime)?,
            preferred_lifetime: lifetime_secs(info.preferred_lifetime)?,
        })
    }
}

/// A Router Advertisement as this responder sends it.
///
/// Managed/other flags, reachable time and retransmit timer are always zero
/// ("unspecified").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAdvertisement {
    pub cur_hop_limit: u8,
    pub router_lifetime: u16,
    pub source_link_layer_address: Option<Vec<u8>>,
    pub prefix_information: Option<PrefixInformation>,
    pub mtu: Option<u32>,
}

impl RouterAdvertisement {
    pub fn new(cur_hop_limit: u8, router_lifetime: u16) -> Self {
        Self {
            cur_hop_limit,
            router_lifetime,
            source_link_layer_address: None,
            prefix_information: None,
            mtu: None,
        }
    }

    /// Attach an SLLA option. Anything but a MAC is left out.
    pub fn with_source_link_layer_address(mut self, addr: &[u8]) -> Self {
        self.source_link_layer_address = (addr.len() == ETHERNET_ADDR_LEN).then(|| addr.to_vec());
        self
    }

    pub fn with_prefix_information(mut self, info: PrefixInformation) -> Self {
        self.prefix_information = Some(info);
        self
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    fn to_repr(&self) -> NdiscRepr<'static> {
        NdiscRepr::RouterAdvert {
            hop_limit: self.cur_hop_limit,
            flags: NdiscRouterFlags::empty(),
            router_lifetime: Duration::from_secs(u64::from(self.router_lifetime)),
            reachable_time: Duration::from_millis(0),
            retrans_time: Duration::from_millis(0),
            lladdr: self
                .source_link_layer_address
                .as_deref()
                .filter(|addr| addr.len() == ETHERNET_ADDR_LEN)
                .map(RawHardwareAddress::from_bytes),
            mtu: self.mtu,
            prefix_info: self.prefix_information.as_ref().map(PrefixInformation::to_repr),
        }
    }

    /// Serialize to an ICMPv6 message with a zero checksum.
    pub fn encode(&self) -> Vec<u8> {
        let repr = self.to_repr();
        let mut buf = vec![0u8; repr.buffer_len()];
        repr.emit(&mut Icmpv6Packet::new_unchecked(&mut buf[..]));
        buf
    }

    /// Parse an RA. Used to inspect what was sent.
    pub fn parse(bytes: &[u8]) -> Result<Self, NetworkError> {
        match parse_ndisc(bytes)? {
            NdiscRepr::RouterAdvert {
                hop_limit,
                router_lifetime,
                lladdr,
                mtu,
                prefix_info,
                ..
            } => Ok(Self {
                cur_hop_limit: hop_limit,
                router_lifetime: u16::try_from(router_lifetime.secs()).map_err(|_| {
                    NetworkError::Malformed("router lifetime out of range".to_string())
                })?,
                source_link_layer_address: lladdr.map(|addr| addr.as_bytes().to_vec()),
                prefix_information: prefix_info
                    .as_ref()
                    .map(PrefixInformation::from_repr)
                    .transpose()?,
                mtu,
            }),
            _ => Err(NetworkError::Malformed(
                "not a router advertisement".to_string(),
            )),
        }
    }
}

/// A received Router Solicitation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouterSolicitation {
    pub source_link_layer_address: Option<Vec<u8>>,
}

impl RouterSolicitation {
    /// Validate and decode an RS: type 133, code 0, well-formed options.
    pub fn parse(bytes: &[u8]) -> Result<Self, NetworkError> {
        match parse_ndisc(bytes)? {
            NdiscRepr::RouterSolicit { lladdr } => Ok(Self {
                source_link_layer_address: lladdr.map(|addr| addr.as_bytes().to_vec()),
            }),
            _ => Err(NetworkError::Malformed(
                "not a router solicitation".to_string(),
            )),
        }
    }
}

fn parse_ndisc(bytes: &[u8]) -> Result<NdiscRepr<'_>, NetworkError> {
    let packet = Icmpv6Packet::new_checked(bytes).map_err(|_| {
        NetworkError::Malformed(format!("truncated ICMPv6 message of {} bytes", bytes.len()))
    })?;
    if packet.msg_code() != 0 {
        return Err(NetworkError::Malformed(format!(
            "ICMPv6 code {}",
            packet.msg_code()
        )));
    }
    NdiscRepr::parse(&packet)
        .map_err(|_| NetworkError::Malformed("invalid neighbor discovery message".to_string()))
}

fn lifetime_secs(lifetime: Duration) -> Result<u32, NetworkError> {
    u32::try_from(lifetime.secs())
        .map_err(|_| NetworkError::Malformed("prefix lifetime out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 5];

    fn full_advertisement() -> RouterAdvertisement {
        RouterAdvertisement::new(64, 1800)
            .with_source_link_layer_address(&MAC)
            .with_prefix_information(PrefixInformation {
                prefix: "2001:db8:1:1::/64".parse().unwrap(),
                on_link: true,
                autonomous: true,
                valid_lifetime: 2_592_000,
                preferred_lifetime: 604_800,
            })
            .with_mtu(1500)
    }

    /// Options as (type, body) pairs, walked without the codec.
    fn options(packet: &[u8]) -> Vec<(u8, &[u8])> {
        let mut found = Vec::new();
        let mut rest = &packet[16..];
        while !rest.is_empty() {
            let len = usize::from(rest[1]) * 8;
            found.push((rest[0], &rest[2..len]));
            rest = &rest[len..];
        }
        found
    }

    #[test]
    fn test_ra_wire_layout() {
        let packet = full_advertisement().encode();

        assert_eq!(packet[0], ICMPV6_ROUTER_ADVERTISEMENT);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[2..4], &[0, 0], "checksum left to the kernel");
        assert_eq!(packet[4], 64);
        assert_eq!(packet[5], 0, "M and O flags clear");
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 1800);
        assert_eq!(&packet[8..16], &[0; 8], "reachable and retrans unspecified");

        let options = options(&packet);
        assert_eq!(options.len(), 3);

        let (_, slla) = options.iter().find(|(kind, _)| *kind == 1).unwrap();
        assert_eq!(*slla, &MAC[..]);

        let (_, pio) = options.iter().find(|(kind, _)| *kind == 3).unwrap();
        assert_eq!(pio.len(), 30);
        assert_eq!(pio[0], 64);
        assert_eq!(pio[1], 0xc0, "L and A set");
        assert_eq!(u32::from_be_bytes(pio[2..6].try_into().unwrap()), 2_592_000);
        assert_eq!(u32::from_be_bytes(pio[6..10].try_into().unwrap()), 604_800);
        assert_eq!(
            Ipv6Addr::from(<[u8; 16]>::try_from(&pio[14..30]).unwrap()),
            "2001:db8:1:1::".parse::<Ipv6Addr>().unwrap()
        );

        let (_, mtu) = options.iter().find(|(kind, _)| *kind == 5).unwrap();
        assert_eq!(u32::from_be_bytes(mtu[2..6].try_into().unwrap()), 1500);
    }

    #[test]
    fn test_ra_parse_recovers_fields() {
        let ra = full_advertisement();
        assert_eq!(RouterAdvertisement::parse(&ra.encode()).unwrap(), ra);
    }

    #[test]
    fn test_minimal_ra_is_header_only() {
        let packet = RouterAdvertisement::new(64, 0).encode();
        assert_eq!(packet.len(), 16);
    }

    #[test]
    fn test_slla_omitted_without_mac() {
        let ra = RouterAdvertisement::new(64, 1800).with_source_link_layer_address(&[]);
        assert_eq!(ra.source_link_layer_address, None);

        let packet = ra.encode();
        assert!(options(&packet).iter().all(|(kind, _)| *kind != 1));
    }

    #[test]
    fn test_rs_parse() {
        let bare = [ICMPV6_ROUTER_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            RouterSolicitation::parse(&bare).unwrap(),
            RouterSolicitation::default()
        );

        let mut with_slla = bare.to_vec();
        with_slla.extend_from_slice(&[1, 1]);
        with_slla.extend_from_slice(&MAC);
        let rs = RouterSolicitation::parse(&with_slla).unwrap();
        assert_eq!(rs.source_link_layer_address.as_deref(), Some(&MAC[..]));
    }

    #[test]
    fn test_rs_rejects_other_messages() {
        // Truncated.
        assert!(RouterSolicitation::parse(&[ICMPV6_ROUTER_SOLICITATION, 0, 0]).is_err());
        // Nonzero code.
        assert!(
            RouterSolicitation::parse(&[ICMPV6_ROUTER_SOLICITATION, 1, 0, 0, 0, 0, 0, 0]).is_err()
        );
        // An advertisement from another router.
        assert!(RouterSolicitation::parse(&RouterAdvertisement::new(64, 1800).encode()).is_err());
        assert!(RouterSolicitation::parse(&[1, 2, 3]).is_err());
    }
}
