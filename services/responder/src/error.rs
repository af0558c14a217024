//! Error types for tap handling.

use thiserror::Error;

/// Errors from constructing or running a tap handler.
#[derive(Debug, Error)]
pub enum TapError {
    /// The interface index no longer resolves to a link.
    #[error("unable to get interface {if_index}: {reason}")]
    Resolve { if_index: u32, reason: String },

    /// The kernel route dump failed.
    #[error("failed getting routes for interface {if_index}: {reason}")]
    Inspect { if_index: u32, reason: String },

    /// Neither host nor subnet routes point at the interface.
    #[error("no host or subnet routes to {interface}, possibly a private vlan interface")]
    Ineligible { interface: String },

    /// Opening the link-local ICMPv6 socket failed. Retried while connecting.
    #[error("unable to dial link-local on {interface}: {reason}")]
    Dial { interface: String, reason: String },

    /// The ICMPv6 type filter could not be installed.
    #[error("failed to apply ICMPv6 type filter: {0}")]
    Filter(#[source] std::io::Error),

    /// Joining the all-routers group failed.
    #[error("failed to join multicast group: {0}")]
    Multicast(#[source] std::io::Error),

    /// Socket I/O failed while advertising.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl TapError {
    /// Whether this error only means the interface has nothing to advertise.
    pub fn is_ineligible(&self) -> bool {
        matches!(self, TapError::Ineligible { .. })
    }
}
