//! Firewall/NAT control capability
//!
//! Transparent interception needs the host firewall to redirect victim
//! traffic from the real HTTP/HTTPS port to the proxy's bound port. The
//! redirection helper itself lives outside this crate; the proxy only drives
//! it through this interface.

use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("redirection not supported on this platform")]
    Unsupported,

    #[error("firewall command failed: {0}")]
    CommandFailed(String),
}

/// A single TCP port redirection rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectSpec {
    pub interface: String,
    pub protocol: String,
    pub src_port: u16,
    pub dst_address: IpAddr,
    pub dst_port: u16,
}

impl RedirectSpec {
    pub fn tcp(interface: &str, src_port: u16, dst_address: IpAddr, dst_port: u16) -> Self {
        Self {
            interface: interface.to_string(),
            protocol: "tcp".to_string(),
            src_port,
            dst_address,
            dst_port,
        }
    }
}

/// Host firewall control, implemented by the surrounding framework.
pub trait Firewall: Send + Sync {
    fn is_forwarding_enabled(&self) -> bool;

    fn enable_forwarding(&self, enabled: bool) -> Result<(), FirewallError>;

    /// Install (`enabled = true`) or remove (`enabled = false`) a redirection
    /// rule. Removing a rule that was never installed is a no-op.
    fn enable_redirection(&self, spec: &RedirectSpec, enabled: bool) -> Result<(), FirewallError>;
}

/// Firewall stub for platforms without a supported backend. Redirection
/// requests fail, forwarding queries report the truth (disabled).
#[derive(Debug, Default)]
pub struct NoopFirewall;

impl Firewall for NoopFirewall {
    fn is_forwarding_enabled(&self) -> bool {
        false
    }

    fn enable_forwarding(&self, _enabled: bool) -> Result<(), FirewallError> {
        Ok(())
    }

    fn enable_redirection(&self, _spec: &RedirectSpec, _enabled: bool) -> Result<(), FirewallError> {
        Err(FirewallError::Unsupported)
    }
}
