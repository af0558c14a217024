//! Kernel lookups the responder depends on.
//!
//! The traits here are the seam between tap handling and the host: the
//! production implementation talks rtnetlink (see [`crate::netlink`]), tests
//! use [`crate::mock::MockKernel`].

use async_trait::async_trait;
use tapra_networking::RouteSet;

use crate::error::TapError;

/// Snapshot of a link taken when a tap is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Kernel interface index.
    pub index: u32,

    /// Interface name (e.g. `tap-1a2b3c4d`).
    pub name: String,

    /// Hardware address, advertised as the source link-layer address.
    pub hardware_addr: Vec<u8>,
}

impl LinkInfo {
    /// Hardware address in the usual colon-separated hex form.
    pub fn hardware_addr_string(&self) -> String {
        self.hardware_addr
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Resolves an interface index to its current name and hardware address.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Fails with [`TapError::Resolve`] when the index no longer exists.
    async fn resolve(&self, if_index: u32) -> Result<LinkInfo, TapError>;
}

/// Reads the IPv6 routes leaving through an interface.
#[async_trait]
pub trait RouteInspector: Send + Sync {
    /// Classify every IPv6 route whose egress interface is `if_index`.
    ///
    /// An empty [`RouteSet`] is a valid answer; only a failed kernel query is
    /// an error ([`TapError::Inspect`]).
    async fn inspect(&self, if_index: u32) -> Result<RouteSet, TapError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_addr_string() {
        let link = LinkInfo {
            index: 7,
            name: "tap7".to_string(),
            hardware_addr: vec![0x02, 0x00, 0x5e, 0x0a, 0xbc, 0x01],
        };
        assert_eq!(link.hardware_addr_string(), "02:00:5e:0a:bc:01");
    }
}
