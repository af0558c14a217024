//! One managed tap interface.
//!
//! A [`TapHandle`] is built from a kernel snapshot ([`TapHandle::construct`])
//! and then driven by [`TapHandle::listen`], which runs until the handle is
//! canceled or the socket fails:
//!
//! ```text
//! Connecting --dial ok--> Active --cancel / fatal error--> Closed
//!     ^   |
//!     +---+ dial failed, sleep CONNECT_BACKOFF
//! ```

use std::net::Ipv6Addr;
use std::time::Duration;

use tapra_networking::ndp::{
    PrefixInformation, RouterAdvertisement, RouterSolicitation, ALL_NODES, NDP_HOP_LIMIT,
};
use tapra_networking::{Ipv6Prefix, RouteSet};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::AdvertisementConfig;
use crate::error::TapError;
use crate::kernel::{LinkInfo, LinkResolver, RouteInspector};
use crate::transport::{Datagram, Dialer, Transport};

/// Wait between failed dial attempts.
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Large enough for any RS on a 9000-byte link.
const RECV_BUFFER_SIZE: usize = 9000;

/// How a tap's run loop ended.
#[derive(Debug)]
pub enum TapExit {
    /// The handle was canceled. Not an error.
    Canceled,

    /// The transport failed during setup or while advertising.
    Failed(TapError),
}

impl TapExit {
    pub fn is_canceled(&self) -> bool {
        matches!(self, TapExit::Canceled)
    }
}

/// A tap interface and what it advertises.
///
/// The route snapshot is taken once at construction and never refreshed.
#[derive(Debug)]
pub struct TapHandle {
    link: LinkInfo,
    prefix: Option<Ipv6Prefix>,
    routes: RouteSet,
    cancel: watch::Sender<bool>,
}

impl TapHandle {
    /// Resolve `if_index` and decide what to advertise on it.
    ///
    /// Fails with [`TapError::Ineligible`] when no route at all points at the
    /// interface. The run loop is not started.
    pub async fn construct(
        if_index: u32,
        resolver: &dyn LinkResolver,
        inspector: &dyn RouteInspector,
    ) -> Result<Self, TapError> {
        let link = resolver.resolve(if_index).await?;
        let routes = inspector.inspect(if_index).await?;

        for route in &routes.host_routes {
            debug!(interface = %link.name, route = %route, "Host route");
        }
        for route in &routes.subnet_routes {
            debug!(interface = %link.name, route = %route, "Subnet route");
        }

        if routes.is_empty() {
            return Err(TapError::Ineligible {
                interface: link.name,
            });
        }

        let prefix = routes.slaac_prefix();
        match prefix {
            Some(prefix) => debug!(interface = %link.name, prefix = %prefix, "Chose SLAAC prefix"),
            None => warn!(
                interface = %link.name,
                "No host route, sending router advertisements without a prefix"
            ),
        }

        let (cancel, _) = watch::channel(false);

        Ok(Self {
            link,
            prefix,
            routes,
            cancel,
        })
    }

    pub fn index(&self) -> u32 {
        self.link.index
    }

    pub fn name(&self) -> &str {
        &self.link.name
    }

    pub fn hardware_addr(&self) -> &[u8] {
        &self.link.hardware_addr
    }

    pub fn link(&self) -> &LinkInfo {
        &self.link
    }

    /// The advertised /64, absent when the interface has no host route.
    pub fn prefix(&self) -> Option<Ipv6Prefix> {
        self.prefix
    }

    pub fn routes(&self) -> &RouteSet {
        &self.routes
    }

    /// Signal the run loop to stop. Idempotent.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// The RA this tap sends, periodic and solicited alike.
    pub fn advertisement(&self, config: &AdvertisementConfig) -> RouterAdvertisement {
        // Links without a MAC (tun, point-to-point) get no SLLA option.
        let mut ra = RouterAdvertisement::new(config.hop_limit, config.router_lifetime)
            .with_source_link_layer_address(&self.link.hardware_addr);

        if let Some(prefix) = self.prefix {
            ra = ra.with_prefix_information(PrefixInformation {
                prefix,
                on_link: true,
                autonomous: true,
                valid_lifetime: config.valid_lifetime,
                preferred_lifetime: config.preferred_lifetime,
            });
        }

        if let Some(mtu) = config.mtu {
            ra = ra.with_mtu(mtu);
        }

        ra
    }

    /// Run the tap until it is canceled or its transport fails.
    pub async fn listen(&self, dialer: &dyn Dialer, config: &AdvertisementConfig) -> TapExit {
        let mut cancel = self.cancel.subscribe();

        let Some(mut transport) = self.connect(dialer, &mut cancel).await else {
            return TapExit::Canceled;
        };

        match self
            .advertise(transport.as_mut(), config, &mut cancel)
            .await
        {
            Ok(()) => TapExit::Canceled,
            Err(e) => TapExit::Failed(e),
        }
    }

    /// Dial until it succeeds. `None` means canceled.
    async fn connect(
        &self,
        dialer: &dyn Dialer,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn Transport>> {
        let mut attempt: u32 = 0;
        loop {
            if *cancel.borrow() {
                return None;
            }
            attempt += 1;

            tokio::select! {
                biased;
                _ = canceled(cancel) => return None,
                dialed = dialer.dial(&self.link) => match dialed {
                    Ok(transport) => {
                        if attempt > 1 {
                            info!(interface = %self.link.name, attempt, "Link-local became available");
                        }
                        return Some(transport);
                    }
                    // New taps hold their link-local tentative for a while.
                    Err(e) if attempt == 1 => {
                        warn!(interface = %self.link.name, error = %e, "Link-local not ready, retrying");
                    }
                    Err(e) => {
                        debug!(interface = %self.link.name, attempt, error = %e, "Dial failed, retrying");
                    }
                },
            }

            tokio::select! {
                biased;
                _ = canceled(cancel) => return None,
                _ = tokio::time::sleep(CONNECT_BACKOFF) => {}
            }
        }
    }

    /// Active state. `Ok` means canceled.
    async fn advertise(
        &self,
        transport: &mut dyn Transport,
        config: &AdvertisementConfig,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), TapError> {
        transport.accept_only_solicitations()?;
        transport.join_all_routers()?;

        let packet = self.advertisement(config).encode();
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        info!(
            interface = %self.link.name,
            prefix = ?self.prefix.map(|p| p.to_string()),
            "Advertising"
        );

        loop {
            tokio::select! {
                biased;
                _ = canceled(cancel) => return Ok(()),
                _ = ticker.tick() => {
                    transport.send(&packet, ALL_NODES).await?;
                    debug!(interface = %self.link.name, "Sent unsolicited router advertisement");
                }
                received = transport.recv(&mut buf) => {
                    let datagram = received?;
                    if let Err(reason) = validate_solicitation(&datagram, &buf[..datagram.len]) {
                        debug!(
                            interface = %self.link.name,
                            from = %datagram.source,
                            reason = %reason,
                            "Ignoring datagram"
                        );
                        continue;
                    }
                    let dst = solicited_destination(datagram.source);
                    transport.send(&packet, dst).await?;
                    debug!(interface = %self.link.name, to = %dst, "Sent solicited router advertisement");
                }
            }
        }
    }
}

/// RFC 4861 section 6.1.1 checks on a received solicitation.
fn validate_solicitation(datagram: &Datagram, payload: &[u8]) -> Result<(), String> {
    // Anything forwarded by a router arrives below 255.
    if datagram.hop_limit != Some(NDP_HOP_LIMIT) {
        return Err(match datagram.hop_limit {
            Some(hop_limit) => format!("hop limit {}", hop_limit),
            None => "hop limit unknown".to_string(),
        });
    }

    let rs = RouterSolicitation::parse(payload).map_err(|e| e.to_string())?;
    if datagram.source.is_unspecified() && rs.source_link_layer_address.is_some() {
        return Err("link-layer address option from unspecified source".to_string());
    }
    Ok(())
}

/// Solicitors without an address yet are answered on all-nodes.
fn solicited_destination(from: Ipv6Addr) -> Ipv6Addr {
    if from.is_unspecified() {
        ALL_NODES
    } else {
        from
    }
}

async fn canceled(cancel: &mut watch::Receiver<bool>) {
    // A dropped sender means the handle is gone; treat that as canceled too.
    let _ = cancel.wait_for(|canceled| *canceled).await;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::mock::MockKernel;

    fn link() -> LinkInfo {
        LinkInfo {
            index: 5,
            name: "tap5".to_string(),
            hardware_addr: vec![0x02, 0, 0, 0, 0, 5],
        }
    }

    #[tokio::test]
    async fn test_construct_picks_first_host_route() {
        let kernel = MockKernel::new();
        kernel
            .add_link(
                link(),
                ["2001:db8:1:1::5/128", "2001:db8:2:2::7/128", "::/0"],
            )
            .unwrap();

        let tap = TapHandle::construct(5, &kernel, &kernel).await.unwrap();

        assert_eq!(tap.name(), "tap5");
        assert_eq!(tap.prefix(), Some("2001:db8:1:1::/64".parse().unwrap()));
        assert_eq!(tap.routes().host_routes.len(), 2);
        assert_eq!(tap.routes().subnet_routes.len(), 1);
        assert!(!tap.is_canceled());
    }

    #[tokio::test]
    async fn test_construct_without_host_route_has_no_prefix() {
        let kernel = MockKernel::new();
        kernel.add_link(link(), ["::/0"]).unwrap();

        let tap = TapHandle::construct(5, &kernel, &kernel).await.unwrap();
        assert_eq!(tap.prefix(), None);
    }

    #[tokio::test]
    async fn test_construct_ineligible() {
        let kernel = MockKernel::new();
        kernel.add_link(link(), Vec::<&str>::new()).unwrap();

        let err = TapHandle::construct(5, &kernel, &kernel).await.unwrap_err();
        assert!(err.is_ineligible());
    }

    #[tokio::test]
    async fn test_construct_unknown_index() {
        let kernel = MockKernel::new();

        let err = TapHandle::construct(9, &kernel, &kernel).await.unwrap_err();
        assert!(matches!(err, TapError::Resolve { if_index: 9, .. }));
    }

    #[tokio::test]
    async fn test_advertisement_with_prefix() {
        let kernel = MockKernel::new();
        kernel
            .add_link(link(), ["2001:db8:1:1::5/128"])
            .unwrap();
        let tap = TapHandle::construct(5, &kernel, &kernel).await.unwrap();

        let config = AdvertisementConfig {
            mtu: Some(1500),
            ..AdvertisementConfig::default()
        };
        let ra = tap.advertisement(&config);

        assert_eq!(ra.router_lifetime, config.router_lifetime);
        assert_eq!(
            ra.source_link_layer_address.as_deref(),
            Some(tap.hardware_addr())
        );
        let pio = ra.prefix_information.unwrap();
        assert_eq!(pio.prefix, "2001:db8:1:1::/64".parse().unwrap());
        assert!(pio.on_link && pio.autonomous);
        assert_eq!(ra.mtu, Some(1500));
    }

    #[tokio::test]
    async fn test_advertisement_without_hardware_address_has_no_slla() {
        let kernel = MockKernel::new();
        kernel
            .add_link(
                LinkInfo {
                    index: 9,
                    name: "tun9".to_string(),
                    hardware_addr: Vec::new(),
                },
                ["2001:db8:9::1/128"],
            )
            .unwrap();
        let tap = TapHandle::construct(9, &kernel, &kernel).await.unwrap();

        let ra = tap.advertisement(&AdvertisementConfig::default());
        assert_eq!(ra.source_link_layer_address, None);

        let parsed = RouterAdvertisement::parse(&ra.encode()).unwrap();
        assert_eq!(parsed.source_link_layer_address, None);
        assert!(parsed.prefix_information.is_some());
    }

    fn datagram(source: &str, hop_limit: Option<u8>) -> Datagram {
        Datagram {
            len: 8,
            source: source.parse().unwrap(),
            hop_limit,
        }
    }

    const BARE_RS: [u8; 8] = [133, 0, 0, 0, 0, 0, 0, 0];

    #[rstest]
    #[case::link_local(datagram("fe80::5", Some(255)), true)]
    #[case::unspecified(datagram("::", Some(255)), true)]
    #[case::forwarded(datagram("fe80::5", Some(64)), false)]
    #[case::one_hop_short(datagram("fe80::5", Some(254)), false)]
    #[case::hop_limit_unknown(datagram("fe80::5", None), false)]
    fn test_validate_solicitation_hop_limit(#[case] datagram: Datagram, #[case] accepted: bool) {
        assert_eq!(validate_solicitation(&datagram, &BARE_RS).is_ok(), accepted);
    }

    #[test]
    fn test_unspecified_source_with_slla_is_rejected() {
        let mut rs = BARE_RS.to_vec();
        rs.extend_from_slice(&[1, 1, 2, 0, 0, 0, 0, 5]);
        let mut from = datagram("::", Some(255));
        from.len = rs.len();

        assert!(validate_solicitation(&from, &rs).is_err());
        from.source = "fe80::5".parse().unwrap();
        assert!(validate_solicitation(&from, &rs).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let kernel = MockKernel::new();
        kernel.add_link(link(), ["::/0"]).unwrap();
        let tap = TapHandle::construct(5, &kernel, &kernel).await.unwrap();

        tap.cancel();
        tap.cancel();
        assert!(tap.is_canceled());
    }

    #[test]
    fn test_solicited_destination() {
        let solicitor: Ipv6Addr = "fe80::5".parse().unwrap();
        assert_eq!(solicited_destination(solicitor), solicitor);
        assert_eq!(solicited_destination(Ipv6Addr::UNSPECIFIED), ALL_NODES);
    }
}
