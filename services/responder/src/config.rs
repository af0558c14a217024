//! Configuration for the responder.
//!
//! Every flag can also be set through a `TAPRA_*` environment variable.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};
use regex::Regex;
use tapra_networking::validate_mtu;

/// Default interval between unsolicited RAs.
pub const DEFAULT_INTERVAL_SECS: u64 = 10;

/// Default router lifetime (RFC 4861 AdvDefaultLifetime, 3 x MaxRtrAdvInterval).
pub const DEFAULT_ROUTER_LIFETIME_SECS: u16 = 1800;

/// Default prefix valid lifetime (RFC 4861 AdvValidLifetime, 30 days).
pub const DEFAULT_VALID_LIFETIME_SECS: u32 = 2_592_000;

/// Default prefix preferred lifetime (RFC 4861 AdvPreferredLifetime, 7 days).
pub const DEFAULT_PREFERRED_LIFETIME_SECS: u32 = 604_800;

/// Largest router lifetime RFC 4861 allows.
const MAX_ROUTER_LIFETIME_SECS: u16 = 9000;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// tapra - answer router solicitations on unnumbered tap interfaces.
#[derive(Debug, Clone, Parser)]
#[command(name = "tapra")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Regular expression an interface name must match to be handled.
    #[arg(long, env = "TAPRA_INTERFACE_REGEX", default_value = "^tap")]
    pub interface_regex: String,

    /// Seconds between unsolicited router advertisements.
    #[arg(long, env = "TAPRA_INTERVAL_SECS", default_value_t = DEFAULT_INTERVAL_SECS)]
    pub interval_secs: u64,

    /// Router lifetime advertised to guests, in seconds.
    #[arg(long, env = "TAPRA_ROUTER_LIFETIME_SECS", default_value_t = DEFAULT_ROUTER_LIFETIME_SECS)]
    pub router_lifetime_secs: u16,

    /// Valid lifetime of the advertised prefix, in seconds.
    #[arg(long, env = "TAPRA_VALID_LIFETIME_SECS", default_value_t = DEFAULT_VALID_LIFETIME_SECS)]
    pub valid_lifetime_secs: u32,

    /// Preferred lifetime of the advertised prefix, in seconds.
    #[arg(long, env = "TAPRA_PREFERRED_LIFETIME_SECS", default_value_t = DEFAULT_PREFERRED_LIFETIME_SECS)]
    pub preferred_lifetime_secs: u32,

    /// Current hop limit advertised to guests.
    #[arg(long, env = "TAPRA_HOP_LIMIT", default_value_t = 64)]
    pub hop_limit: u8,

    /// Link MTU to advertise. No MTU option is sent when unset.
    #[arg(long, env = "TAPRA_MTU")]
    pub mtu: Option<u32>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "TAPRA_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "TAPRA_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// What a tap advertises and how often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementConfig {
    /// Interval between unsolicited RAs.
    pub interval: Duration,

    /// Router lifetime in seconds. Always non-zero.
    pub router_lifetime: u16,

    /// Prefix valid lifetime in seconds.
    pub valid_lifetime: u32,

    /// Prefix preferred lifetime in seconds.
    pub preferred_lifetime: u32,

    /// Current hop limit field of the RA.
    pub hop_limit: u8,

    /// Optional MTU option.
    pub mtu: Option<u32>,
}

impl Default for AdvertisementConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            router_lifetime: DEFAULT_ROUTER_LIFETIME_SECS,
            valid_lifetime: DEFAULT_VALID_LIFETIME_SECS,
            preferred_lifetime: DEFAULT_PREFERRED_LIFETIME_SECS,
            hop_limit: 64,
            mtu: None,
        }
    }
}

impl Config {
    /// Compile the interface name filter.
    pub fn interface_filter(&self) -> Result<Regex> {
        Regex::new(&self.interface_regex)
            .with_context(|| format!("invalid --interface-regex '{}'", self.interface_regex))
    }

    /// Validate the advertisement flags.
    pub fn advertisement(&self) -> Result<AdvertisementConfig> {
        ensure!(self.interval_secs >= 1, "--interval-secs must be at least 1");
        ensure!(
            (1..=MAX_ROUTER_LIFETIME_SECS).contains(&self.router_lifetime_secs),
            "--router-lifetime-secs must be between 1 and {}",
            MAX_ROUTER_LIFETIME_SECS
        );
        ensure!(
            self.preferred_lifetime_secs <= self.valid_lifetime_secs,
            "--preferred-lifetime-secs ({}) exceeds --valid-lifetime-secs ({})",
            self.preferred_lifetime_secs,
            self.valid_lifetime_secs
        );
        let mtu = self
            .mtu
            .map(validate_mtu)
            .transpose()
            .context("--mtu out of range")?;

        Ok(AdvertisementConfig {
            interval: Duration::from_secs(self.interval_secs),
            router_lifetime: self.router_lifetime_secs,
            valid_lifetime: self.valid_lifetime_secs,
            preferred_lifetime: self.preferred_lifetime_secs,
            hop_limit: self.hop_limit,
            mtu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("tapra").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.interface_regex, "^tap");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.advertisement().unwrap(), AdvertisementConfig::default());
    }

    #[test]
    fn test_interface_filter() {
        let config = parse(&["--interface-regex", "^tap[0-9]+$"]);
        let filter = config.interface_filter().unwrap();
        assert!(filter.is_match("tap12"));
        assert!(!filter.is_match("eth0"));

        let config = parse(&["--interface-regex", "tap("]);
        assert!(config.interface_filter().is_err());
    }

    #[test]
    fn test_zero_router_lifetime_rejected() {
        let config = parse(&["--router-lifetime-secs", "0"]);
        assert!(config.advertisement().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = parse(&["--interval-secs", "0"]);
        assert!(config.advertisement().is_err());
    }

    #[test]
    fn test_preferred_longer_than_valid_rejected() {
        let config = parse(&[
            "--valid-lifetime-secs",
            "600",
            "--preferred-lifetime-secs",
            "900",
        ]);
        assert!(config.advertisement().is_err());
    }

    #[test]
    fn test_mtu() {
        let config = parse(&["--mtu", "1420"]);
        assert_eq!(config.advertisement().unwrap().mtu, Some(1420));

        let config = parse(&["--mtu", "576"]);
        assert!(config.advertisement().is_err());
    }
}
