//! Transparent MITM proxy
//!
//! Accepts redirected victim TCP flows, optionally terminates TLS with
//! on-the-fly forged certificates, runs every exchange through the filter
//! pipeline and forwards it upstream over plain TCP or verified TLS.

pub mod ca;
pub mod cert_cache;
pub mod config;
pub mod filters;
pub mod server;
pub mod sni;

pub use ca::{CaAuthority, TlsIdentity};
pub use cert_cache::CertCache;
pub use config::{ProxyOptions, ProxyRuntimeConfig, TlsOptions};
pub use filters::{Pipeline, RequestVerdict};
pub use server::MitmProxy;
