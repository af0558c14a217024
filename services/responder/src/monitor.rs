//! Netlink link monitor feeding the engine.
//!
//! Subscribes to RTMGRP_LINK, then dumps the current link table so taps that
//! existed before startup are rediscovered. Links whose name matches the
//! configured regex are added on RTM_NEWLINK and closed on RTM_DELLINK.

use anyhow::{bail, Context, Result};
use futures_util::{Stream, StreamExt};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{AsyncSocket, SocketAddr};
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::netlink::{link_info, Netlink};

/// A link appearing or disappearing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Appeared { index: u32, name: String },
    Disappeared { index: u32, name: String },
}

impl LinkEvent {
    pub fn index(&self) -> u32 {
        match self {
            LinkEvent::Appeared { index, .. } | LinkEvent::Disappeared { index, .. } => *index,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            LinkEvent::Appeared { name, .. } | LinkEvent::Disappeared { name, .. } => name,
        }
    }
}

/// Translate a netlink message into a link event.
///
/// RTM_NEWLINK is also sent for state changes of existing links; those show
/// up as `Appeared` again and are deduplicated by [`handle_event`].
pub fn link_event(msg: &RouteNetlinkMessage) -> Option<LinkEvent> {
    match msg {
        RouteNetlinkMessage::NewLink(link) => link_info(link).map(|l| LinkEvent::Appeared {
            index: l.index,
            name: l.name,
        }),
        RouteNetlinkMessage::DelLink(link) => link_info(link).map(|l| LinkEvent::Disappeared {
            index: l.index,
            name: l.name,
        }),
        _ => None,
    }
}

/// Apply one link event to the engine.
pub async fn handle_event(engine: &Engine, filter: &Regex, event: LinkEvent) {
    if !filter.is_match(event.name()) {
        debug!(interface = %event.name(), "Interface does not match filter, ignoring");
        return;
    }

    match event {
        LinkEvent::Appeared { index, name } => {
            if engine.check(index).await {
                debug!(if_index = index, interface = %name, "Tap already registered");
                return;
            }
            // Failures are logged by the engine; a later event may retry.
            let _ = engine.add(index).await;
        }
        LinkEvent::Disappeared { index, name } => {
            debug!(if_index = index, interface = %name, "Interface removed");
            engine.close(index).await;
        }
    }
}

/// Spawn the monitor. Abort the returned handle to stop it.
///
/// The task only finishes on its own when the netlink socket fails or the
/// event stream ends; both come back as an error.
pub fn spawn_link_monitor(
    engine: Engine,
    netlink: Netlink,
    filter: Regex,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move { run_link_monitor(&engine, &netlink, &filter).await })
}

async fn run_link_monitor(engine: &Engine, netlink: &Netlink, filter: &Regex) -> Result<()> {
    let (mut connection, _handle, mut messages) =
        rtnetlink::new_connection().context("failed to open netlink monitor socket")?;

    connection
        .socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(0, rtnetlink::constants::RTMGRP_LINK))
        .context("failed to subscribe to link events")?;

    tokio::spawn(connection);

    // Subscribed first so no link created during the dump is missed.
    let links = netlink
        .links()
        .await
        .context("failed to dump existing links")?;
    info!(count = links.len(), filter = %filter, "Link monitor started");

    for link in links {
        handle_event(
            engine,
            filter,
            LinkEvent::Appeared {
                index: link.index,
                name: link.name,
            },
        )
        .await;
    }

    event_loop(engine, filter, &mut messages).await
}

/// Dispatch link messages until the stream ends, which is always an error.
async fn event_loop<S>(engine: &Engine, filter: &Regex, messages: &mut S) -> Result<()>
where
    S: Stream<Item = (NetlinkMessage<RouteNetlinkMessage>, SocketAddr)> + Unpin,
{
    while let Some((message, _)) = messages.next().await {
        match message.payload {
            NetlinkPayload::InnerMessage(msg) => {
                if let Some(event) = link_event(&msg) {
                    handle_event(engine, filter, event).await;
                }
            }
            NetlinkPayload::Error(e) => {
                warn!(error = %e, "Netlink error on link monitor socket");
            }
            _ => {}
        }
    }

    bail!("netlink event stream closed")
}
