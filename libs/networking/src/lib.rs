//! Networking primitives for the RA responder.
//!
//! This library provides helpers for:
//! - IPv6 prefixes and masking
//! - Classifying kernel routes into host routes and subnet routes
//! - MTU validation for the advertised link MTU
//! - The ICMPv6 Neighbor Discovery wire codec (see [`ndp`])

use std::net::Ipv6Addr;
use std::str::FromStr;

use thiserror::Error;

pub mod ndp;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid MTU value.
    #[error("invalid MTU: {value} (must be between {min} and {max})")]
    InvalidMtu { value: u32, min: u32, max: u32 },

    /// Packet could not be decoded.
    #[error("malformed packet: {0}")]
    Malformed(String),
}

// ============================================================================
// Prefixes
// ============================================================================

/// Prefix length advertised for SLAAC.
pub const SLAAC_PREFIX_LEN: u8 = 64;

/// Prefix length of a host route.
pub const HOST_ROUTE_PREFIX_LEN: u8 = 128;

/// An IPv6 prefix with its host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Prefix {
    /// Base address of the prefix.
    pub address: Ipv6Addr,

    /// Prefix length (e.g., 64 for /64).
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    /// Create a new prefix.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 128 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv6(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "2001:db8::/32").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv6Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Whether this prefix names a single address.
    pub fn is_host_route(&self) -> bool {
        self.prefix_len == HOST_ROUTE_PREFIX_LEN
    }

    /// Shorten the prefix to `prefix_len` bits, clearing everything after.
    ///
    /// A length longer than the current one leaves the prefix unchanged.
    pub fn truncate(&self, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(self.prefix_len);
        Self {
            address: mask_ipv6(self.address, prefix_len),
            prefix_len,
        }
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        mask_ipv6(addr, self.prefix_len) == self.address
    }
}

impl FromStr for Ipv6Prefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl std::fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

// ============================================================================
// Route classification
// ============================================================================

/// Routes pointing out of one interface, split by kind.
///
/// Both sequences keep the order in which the kernel reported them; nothing
/// is sorted or deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
    /// /128 destinations.
    pub host_routes: Vec<Ipv6Prefix>,

    /// Every other destination, the default route `::/0` included.
    pub subnet_routes: Vec<Ipv6Prefix>,
}

impl RouteSet {
    /// Classify a sequence of route destinations.
    pub fn classify<I>(routes: I) -> Self
    where
        I: IntoIterator<Item = Ipv6Prefix>,
    {
        let mut set = Self::default();
        for route in routes {
            set.push(route);
        }
        set
    }

    /// Add one route to the matching sequence.
    pub fn push(&mut self, route: Ipv6Prefix) {
        if route.is_host_route() {
            self.host_routes.push(route);
        } else {
            self.subnet_routes.push(route);
        }
    }

    /// True when neither host nor subnet routes exist.
    pub fn is_empty(&self) -> bool {
        self.host_routes.is_empty() && self.subnet_routes.is_empty()
    }

    /// The /64 to advertise for SLAAC: the first host route with bits 65-128 cleared.
    ///
    /// Nothing checks that the guest will actually derive the host route's
    /// address from this prefix and its MAC.
    pub fn slaac_prefix(&self) -> Option<Ipv6Prefix> {
        self.host_routes
            .first()
            .map(|route| route.truncate(SLAAC_PREFIX_LEN))
    }
}

// ============================================================================
// MTU Configuration
// ============================================================================

/// Minimum MTU for IPv6.
pub const MTU_MIN_IPV6: u32 = 1280;

/// Maximum MTU for jumbo frames.
pub const MTU_MAX_JUMBO: u32 = 9000;

/// Validate an MTU value.
pub fn validate_mtu(mtu: u32) -> Result<u32, NetworkError> {
    if !(MTU_MIN_IPV6..=MTU_MAX_JUMBO).contains(&mtu) {
        return Err(NetworkError::InvalidMtu {
            value: mtu,
            min: MTU_MIN_IPV6,
            max: MTU_MAX_JUMBO,
        });
    }
    Ok(mtu)
}
