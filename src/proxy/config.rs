//! Proxy configuration
//!
//! `ProxyOptions` is the surface the module framework fills in;
//! `ProxyRuntimeConfig` is the compiled, immutable form published to every
//! connection handler. Reconfiguration replaces the whole runtime config,
//! it never mutates one in place.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dns::table::compile_glob;
use crate::firewall::RedirectSpec;

/// TLS interception settings (HTTPS mode only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsOptions {
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
}

/// Configuration surface exposed to the module framework.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOptions {
    pub address: IpAddr,
    pub port: u16,

    /// Install a NAT redirection from this port (the real HTTP/HTTPS port)
    /// to the proxy's bound port.
    pub redirect_port: Option<u16>,

    /// Hostname globs. A non-empty allow-list takes precedence over the
    /// deny-list.
    pub allow: Vec<String>,
    pub deny: Vec<String>,

    /// Snippet injected before `</head>` of HTML responses.
    pub inject_html: Option<String>,

    /// Run the SSL stripper hooks in the filter pipeline.
    pub ssl_strip: bool,

    /// Terminate TLS with forged certificates.
    pub tls: Option<TlsOptions>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 8080,
            redirect_port: None,
            allow: Vec::new(),
            deny: Vec::new(),
            inject_html: None,
            ssl_strip: false,
            tls: None,
        }
    }
}

/// A list of hostname patterns (exact names or globs).
#[derive(Debug, Default, Clone)]
pub struct HostList {
    patterns: Vec<(String, Option<Regex>)>,
}

impl HostList {
    pub fn compile(patterns: &[String]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| {
                    let p = p.trim().to_lowercase();
                    let glob = compile_glob(&p);
                    (p, glob)
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.patterns.iter().any(|(pattern, glob)| {
            host == *pattern || glob.as_ref().map_or(false, |re| re.is_match(&host))
        })
    }
}

/// Immutable runtime view of one configured proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyRuntimeConfig {
    pub bind: SocketAddr,
    pub redirect: Option<RedirectSpec>,
    pub allow: HostList,
    pub deny: HostList,
    pub inject_html: Option<String>,
    pub ssl_strip: bool,
    pub tls: bool,
}

impl ProxyRuntimeConfig {
    pub fn from_options(options: &ProxyOptions, interface_name: &str) -> Self {
        let bind = SocketAddr::new(options.address, options.port);
        let redirect = options
            .redirect_port
            .map(|from| RedirectSpec::tcp(interface_name, from, options.address, options.port));

        Self {
            bind,
            redirect,
            allow: HostList::compile(&options.allow),
            deny: HostList::compile(&options.deny),
            inject_html: options.inject_html.clone(),
            ssl_strip: options.ssl_strip,
            tls: options.tls.is_some(),
        }
    }

    /// Default scheme of victim-side requests for this instance.
    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }
}
