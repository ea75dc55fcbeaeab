//! DNS spoofing decision layer
//!
//! Consumes a captured packet stream and decides, per query, whether to
//! answer from the domain table, answer through a live upstream lookup
//! (proxy-DNS mode), answer NXDOMAIN, or stay silent. At most one forged
//! reply is sent per captured query packet.

use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use trust_dns_proto::op::OpCode;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::Resolver;

use crate::capture::{CaptureError, PacketSource};
use crate::context::InterceptContext;
use crate::dns::responder::{decode_dns_frame, DnsResponder, SpoofAnswer};
use crate::dns::table::{DomainTable, HostsFileError};

const CAPTURE_POLL: Duration = Duration::from_millis(200);
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Configuration surface exposed to the module framework.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSpoofOptions {
    /// Domains/globs answered from the static table.
    pub domains: Vec<String>,

    /// Address the static domains map to.
    pub address: IpAddr,

    /// Optional hosts file with additional `<ip> <domain>` entries.
    pub hosts_file: Option<PathBuf>,

    /// Answer every captured query, not only those addressed to this host.
    pub answer_all: bool,

    /// Resolve unmapped names through a real upstream server.
    pub proxy_dns: bool,

    /// Upstream server for proxy-DNS mode: a literal IP, or empty to use the
    /// system resolver from /etc/resolv.conf.
    pub upstream: String,
}

impl Default for DnsSpoofOptions {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            address: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            hosts_file: None,
            answer_all: false,
            proxy_dns: false,
            upstream: String::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SpoofConfigError {
    #[error("no domains configured: provide a domain list or a hosts file")]
    NoEntries,

    #[error(transparent)]
    HostsFile(#[from] HostsFileError),

    #[error("invalid upstream DNS server {0:?}")]
    InvalidUpstream(String),

    #[error("cannot discover system resolver: {0}")]
    ResolverDiscovery(String),

    #[error("already running")]
    AlreadyRunning,
}

/// Live upstream resolution used in proxy-DNS mode. A trait seam so the
/// decision logic is testable without network access.
pub trait UpstreamLookup: Send + Sync {
    fn lookup(&self, name: &str) -> anyhow::Result<Vec<IpAddr>>;
}

/// trust-dns blocking resolver pinned to the configured upstream server.
struct TrustDnsLookup {
    resolver: Resolver,
}

impl TrustDnsLookup {
    fn new(server: IpAddr) -> Result<Self, SpoofConfigError> {
        let group = NameServerConfigGroup::from_ips_clear(&[server], 53, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(3);
        opts.attempts = 1;

        let resolver = Resolver::new(config, opts)
            .map_err(|e| SpoofConfigError::ResolverDiscovery(e.to_string()))?;
        Ok(Self { resolver })
    }
}

impl UpstreamLookup for TrustDnsLookup {
    fn lookup(&self, name: &str) -> anyhow::Result<Vec<IpAddr>> {
        let lookup = self.resolver.lookup_ip(name)?;
        Ok(lookup.iter().collect())
    }
}

struct ProxyDns {
    server: IpAddr,
    lookup: Box<dyn UpstreamLookup>,
}

/// Immutable per-packet decision engine shared with the capture thread.
pub(crate) struct SpooferEngine {
    ctx: InterceptContext,
    responder: DnsResponder,
    table: DomainTable,
    answer_all: bool,
    proxy: Option<ProxyDns>,
}

impl SpooferEngine {
    /// Run the full decision state machine for one captured frame.
    pub(crate) fn handle_frame(&self, frame: &[u8]) {
        let Some(captured) = decode_dns_frame(frame) else {
            return;
        };

        // Proxy-DNS bypass filter: never re-process our own resolution
        // traffic or anything we generated ourselves.
        if let Some(proxy) = &self.proxy {
            if captured.src_ip == proxy.server || captured.dst_ip == proxy.server {
                return;
            }
            if captured.src_mac == self.ctx.interface.mac
                || self.ctx.interface.owns_ip(&captured.src_ip)
            {
                return;
            }
        }

        // Scope filter: only queries addressed to this host, unless the
        // operator asked to answer everyone.
        if !self.answer_all && captured.dst_mac != self.ctx.interface.mac {
            return;
        }

        // Shape filter: actual queries only; anything carrying answers is a
        // real response and gets blackholed.
        let message = &captured.message;
        if message.op_code() != OpCode::Query
            || message.queries().is_empty()
            || !message.answers().is_empty()
        {
            return;
        }

        for question in message.queries() {
            let name = question.name().to_utf8();
            let name = name.trim_end_matches('.');

            if let Some(address) = self.table.resolve(name) {
                info!(
                    client = %self.ctx.who(captured.src_mac),
                    domain = %name,
                    address = %address,
                    "Spoofing DNS reply"
                );
                self.send(frame, SpoofAnswer::Address(address));
                return;
            }

            if let Some(proxy) = &self.proxy {
                let answer = match proxy.lookup.lookup(name) {
                    Ok(ips) if !ips.is_empty() => SpoofAnswer::Address(ips[0]),
                    Ok(_) => SpoofAnswer::NxDomain,
                    Err(e) => {
                        debug!(domain = %name, error = %e, "Upstream lookup failed, answering NXDOMAIN");
                        SpoofAnswer::NxDomain
                    }
                };
                if let SpoofAnswer::Address(address) = answer {
                    info!(
                        client = %self.ctx.who(captured.src_mac),
                        domain = %name,
                        address = %address,
                        "Proxying DNS reply"
                    );
                }
                self.send(frame, answer);
                return;
            }

            // Unmapped and no proxy mode: leave this question alone.
        }
    }

    fn send(&self, query_frame: &[u8], answer: SpoofAnswer) {
        if let Err(e) = self.responder.respond(query_frame, answer) {
            debug!(error = %e, "Dropping unanswerable query");
        }
    }
}

/// Extract the first `nameserver` address from resolv.conf-style text.
fn parse_resolv_conf(text: &str) -> Option<IpAddr> {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("nameserver") {
            if let Ok(ip) = rest.trim().parse() {
                return Some(ip);
            }
        }
    }
    None
}

fn discover_upstream(upstream: &str) -> Result<IpAddr, SpoofConfigError> {
    let upstream = upstream.trim();
    if upstream.is_empty() {
        let text = fs::read_to_string(RESOLV_CONF)
            .map_err(|e| SpoofConfigError::ResolverDiscovery(e.to_string()))?;
        return parse_resolv_conf(&text).ok_or_else(|| {
            SpoofConfigError::ResolverDiscovery(format!("no nameserver line in {}", RESOLV_CONF))
        });
    }
    upstream
        .parse()
        .map_err(|_| SpoofConfigError::InvalidUpstream(upstream.to_string()))
}

/// The DNS spoofing component: configure, then start a dedicated capture
/// thread, then stop.
pub struct DnsSpoofer {
    ctx: InterceptContext,
    engine: Option<Arc<SpooferEngine>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DnsSpoofer {
    pub fn new(ctx: InterceptContext) -> Self {
        Self {
            ctx,
            engine: None,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn configure(&mut self, options: DnsSpoofOptions) -> Result<(), SpoofConfigError> {
        let lookup = if options.proxy_dns {
            let server = discover_upstream(&options.upstream)?;
            Some((server, Box::new(TrustDnsLookup::new(server)?) as Box<dyn UpstreamLookup>))
        } else {
            None
        };
        self.configure_with_lookup(options, lookup)
    }

    /// Configuration seam with an injectable upstream lookup.
    pub fn configure_with_lookup(
        &mut self,
        options: DnsSpoofOptions,
        lookup: Option<(IpAddr, Box<dyn UpstreamLookup>)>,
    ) -> Result<(), SpoofConfigError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SpoofConfigError::AlreadyRunning);
        }

        let mut table = DomainTable::new();
        for domain in &options.domains {
            if !domain.trim().is_empty() {
                table.push(domain, options.address);
            }
        }
        if let Some(path) = &options.hosts_file {
            table.load_hosts_file(path, options.address)?;
        }

        let proxy = lookup.map(|(server, lookup)| ProxyDns { server, lookup });
        // Proxy-DNS mode answers unmapped names itself, so an empty table is
        // only a configuration error without it.
        if table.is_empty() && proxy.is_none() {
            return Err(SpoofConfigError::NoEntries);
        }
        info!(
            entries = table.len(),
            answer_all = options.answer_all,
            proxy_dns = proxy.is_some(),
            "DNS spoofer configured"
        );

        self.engine = Some(Arc::new(SpooferEngine {
            ctx: self.ctx.clone(),
            responder: DnsResponder::new(self.ctx.interface.clone(), self.ctx.packet_sink.clone()),
            table,
            answer_all: options.answer_all,
            proxy,
        }));
        Ok(())
    }

    /// Start the capture loop on its dedicated thread. `source` is a capture
    /// handle already filtered to DNS traffic (`"udp and port 53"`).
    pub fn start(&mut self, mut source: Box<dyn PacketSource>) -> Result<(), SpoofConfigError> {
        let engine = self.engine.clone().ok_or(SpoofConfigError::NoEntries)?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SpoofConfigError::AlreadyRunning);
        }

        let running = Arc::clone(&self.running);
        self.handle = Some(std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match source.next_frame(CAPTURE_POLL) {
                    Ok(Some(frame)) => engine.handle_frame(&frame),
                    Ok(None) => continue,
                    Err(CaptureError::Closed) => break,
                    Err(e) => {
                        warn!(error = %e, "Capture read failed, stopping DNS spoofer");
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            debug!("DNS spoofer capture loop exited");
        }));
        Ok(())
    }

    /// Signal the capture loop to exit and wait for it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for DnsSpoofer {
    fn drop(&mut self) {
        self.stop();
    }
}
