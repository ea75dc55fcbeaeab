//! Netsnare - On-Path Traffic Interception Engine
//!
//! Netsnare implements the packet and proxy layers of a LAN
//! man-in-the-middle toolkit: DNS spoofing against redirected victims,
//! transparent HTTP/HTTPS proxying with on-the-fly certificate forging,
//! and SSL stripping with counter-spoofed DNS.
//!
//! ## Features
//!
//! - **DNS Spoofing**: forged Ethernet/IP/UDP/DNS replies for captured
//!   queries, with exact/suffix/glob domain matching, hosts-file loading,
//!   answer-all mode and a proxy-DNS mode that answers every name
//! - **Transparent MITM Proxy**: NAT-redirected HTTP and HTTPS flows,
//!   SNI-based certificate forging backed by a persistent CA, allow/deny
//!   host filtering, HTML injection and script hooks
//! - **SSL Stripping**: HTTPS link and redirect downgrading, downgraded-host
//!   tracking with unwind on the upstream side, cookie expiry gating and a
//!   counter-spoof DNS sniffer
//! - **Injected capabilities**: packet capture, firewall/NAT control and
//!   endpoint naming are traits supplied by the surrounding framework
//!
//! ## Usage
//!
//! ```rust
//! use netsnare::dns::DomainTable;
//!
//! let mut table = DomainTable::new();
//! table.push("*.corp.example.com", "10.0.0.5".parse()?);
//!
//! assert_eq!(table.resolve("git.corp.example.com"), Some("10.0.0.5".parse()?));
//! assert_eq!(table.resolve("example.com"), None);
//! # Ok::<(), std::net::AddrParseError>(())
//! ```
//!
//! ## Architecture
//!
//! Netsnare is a library embedded in a larger attack framework:
//!
//! - `dns` - domain table, forged-reply builder, spoofing decision loop
//! - `proxy` - transparent proxy, CA, certificate cache, filter pipeline
//! - `strip` - SSL stripper, host/cookie trackers, rewrite helpers
//! - `capture` / `firewall` / `script` / `context` - injected capabilities

pub mod capture;
pub mod context;
pub mod dns;
pub mod firewall;
pub mod proxy;
pub mod script;
pub mod strip;

pub use context::{InterceptContext, InterfaceInfo};
pub use dns::{DnsSpoofOptions, DnsSpoofer, DomainTable};
pub use proxy::{MitmProxy, ProxyOptions};
pub use strip::SslStripper;
