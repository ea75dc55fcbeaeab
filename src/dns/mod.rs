//! Packet-level DNS spoofing
//!
//! This module contains the domain-matching table, the forged-reply builder
//! and the per-packet spoofing decision loop. The reply builder is shared
//! with the SSL stripper's counter-spoof sniffer.

pub mod responder;
pub mod spoofer;
pub mod table;

#[cfg(test)]
pub(crate) mod testutil;

pub use responder::{DnsResponder, ReplyError, SpoofAnswer};
pub use spoofer::{DnsSpoofOptions, DnsSpoofer, SpoofConfigError, UpstreamLookup};
pub use table::{DomainEntry, DomainTable, HostsFileError};
