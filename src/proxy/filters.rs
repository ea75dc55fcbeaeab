//! Filter pipeline
//!
//! Every proxied exchange runs through one inbound and one outbound pass.
//! Inbound: reachability guard, allow/deny host check, header normalization,
//! stripper preprocess, script hook. Outbound: stripper rewrite, script hook,
//! HTML injection. Order matters and is fixed.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, PRAGMA,
};
use http::{Request, Response, StatusCode};
use tracing::{debug, info};

use crate::proxy::config::ProxyRuntimeConfig;
use crate::script::{ScriptHook, ScriptVerdict};
use crate::strip::SslStripper;

/// Outcome of the inbound pass.
pub enum RequestVerdict {
    /// Forward the (possibly rewritten) request upstream.
    Forward(Request<Bytes>),

    /// Answer the victim directly; nothing goes upstream.
    ShortCircuit(Response<Bytes>),
}

pub struct Pipeline {
    config: Arc<ProxyRuntimeConfig>,
    script: Arc<dyn ScriptHook>,
    stripper: Option<Arc<SslStripper>>,
}

impl Pipeline {
    pub fn new(
        config: Arc<ProxyRuntimeConfig>,
        script: Arc<dyn ScriptHook>,
        stripper: Option<Arc<SslStripper>>,
    ) -> Self {
        Self {
            config,
            script,
            stripper,
        }
    }

    /// Run the inbound pass over a victim request.
    pub fn inbound(&self, mut req: Request<Bytes>, client: IpAddr) -> RequestVerdict {
        let Some(host) = request_host(&req) else {
            debug!(client = %client, "Request without a host, rejecting");
            return RequestVerdict::ShortCircuit(blocked(StatusCode::BAD_GATEWAY));
        };
        if is_unreachable_target(&host) {
            debug!(host = %host, "Refusing to proxy to a local target");
            return RequestVerdict::ShortCircuit(blocked(StatusCode::BAD_GATEWAY));
        }

        if !self.host_permitted(&host) {
            info!(host = %host, client = %client, "Host filtered, dropping request");
            return RequestVerdict::ShortCircuit(blocked(StatusCode::SERVICE_UNAVAILABLE));
        }

        normalize_headers(&mut req);

        if let Some(stripper) = &self.stripper {
            if let Some(response) = stripper.preprocess_request(&mut req, client) {
                return RequestVerdict::ShortCircuit(response);
            }
        }

        match self.script.on_request(&req) {
            Some(ScriptVerdict::Replace(replaced)) => RequestVerdict::Forward(replaced),
            Some(ScriptVerdict::Respond(response)) => RequestVerdict::ShortCircuit(response),
            None => RequestVerdict::Forward(req),
        }
    }

    /// Run the outbound pass over the upstream response.
    pub fn outbound(&self, req: &Request<Bytes>, mut res: Response<Bytes>) -> Response<Bytes> {
        if let Some(stripper) = &self.stripper {
            stripper.process_response(req, &mut res);
        }

        if let Some(replacement) = self.script.on_response(req, &res) {
            res = replacement;
        }

        if let Some(snippet) = &self.config.inject_html {
            inject_html(&mut res, snippet);
        }

        res
    }

    /// A non-empty allow-list wins over the deny-list.
    fn host_permitted(&self, host: &str) -> bool {
        if !self.config.allow.is_empty() {
            return self.config.allow.matches(host);
        }
        !self.config.deny.matches(host)
    }
}

/// Hostname the request addresses, without any port.
fn request_host(req: &Request<Bytes>) -> Option<String> {
    let host = match req.uri().host() {
        Some(host) => host.to_lowercase(),
        None => req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_lowercase())?,
    };
    if host.is_empty() {
        return None;
    }
    Some(host)
}

/// Targets the proxy must never forward to: itself and loopback.
fn is_unreachable_target(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    host.trim_matches(['[', ']'])
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback() || ip.is_unspecified())
        .unwrap_or(false)
}

/// Strip caching and compression negotiation so bodies arrive complete and
/// in cleartext, and drop the header that asks servers to re-upgrade.
fn normalize_headers(req: &mut Request<Bytes>) {
    let headers = req.headers_mut();
    headers.remove(ACCEPT_ENCODING);
    headers.remove(IF_NONE_MATCH);
    headers.remove(IF_MODIFIED_SINCE);
    headers.remove(HeaderName::from_static("upgrade-insecure-requests"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
}

fn blocked(status: StatusCode) -> Response<Bytes> {
    let mut res = Response::new(Bytes::new());
    *res.status_mut() = status;
    res.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    res
}

/// Insert `snippet` once, before the first `</head>` of an HTML body.
fn inject_html(res: &mut Response<Bytes>, snippet: &str) {
    let is_html = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/html"))
        .unwrap_or(false);
    if !is_html {
        return;
    }

    let body = String::from_utf8_lossy(res.body());
    let Some(head_end) = body.find("</head>") else {
        return;
    };

    debug!(bytes = snippet.len(), "Injecting HTML snippet");
    let mut injected = String::with_capacity(body.len() + snippet.len());
    injected.push_str(&body[..head_end]);
    injected.push_str(snippet);
    injected.push_str(&body[head_end..]);

    *res.body_mut() = Bytes::from(injected);
    let length = res.body().len();
    res.headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(length));
}
