//! tapra responder library
//!
//! Advertises IPv6 routers on unnumbered tap interfaces. Each tap whose name
//! matches the configured filter gets its own task that answers router
//! solicitations and sends periodic router advertisements, derived purely
//! from the kernel routes pointing at the tap.
//!
//! ## Architecture
//!
//! ```text
//! monitor (RTMGRP_LINK) ──add/close──> Engine (registry)
//!                                        └── TapHandle(if_index)  (one task each)
//!                                              ├── LinkResolver / RouteInspector
//!                                              └── Dialer -> Transport (ICMPv6)
//! ```
//!
//! ## Modules
//!
//! - `engine`: Tap registry and task supervision
//! - `tap`: Per-interface construction and RA/RS state machine
//! - `kernel`, `netlink`: Link and route lookups
//! - `transport`: Raw ICMPv6 socket
//! - `monitor`: Netlink link event source
//! - `mock`: In-process kernel and transport for tests

pub mod config;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod mock;
pub mod monitor;
pub mod netlink;
pub mod tap;
pub mod transport;

pub use engine::Engine;
pub use error::TapError;
pub use tap::{TapExit, TapHandle};
