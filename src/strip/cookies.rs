//! Cookie session tracking
//!
//! Remembers which (client, domain) pairs already went through a forced
//! cookie expiry, so each victim gets exactly one clean-slate redirect per
//! site. The set grows for the lifetime of the engagement.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::RwLock;

#[derive(Default)]
pub struct CookieTracker {
    seen: RwLock<HashSet<(IpAddr, String)>>,
}

impl CookieTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_clean(&self, client: IpAddr, domain: &str) -> bool {
        !self
            .seen
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(client, domain.to_lowercase()))
    }

    pub fn track(&self, client: IpAddr, domain: &str) {
        self.seen
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((client, domain.to_lowercase()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn pair_is_clean_until_tracked() {
        let tracker = CookieTracker::new();
        assert!(tracker.is_clean(ip("192.168.1.10"), "example.com"));

        tracker.track(ip("192.168.1.10"), "example.com");
        assert!(!tracker.is_clean(ip("192.168.1.10"), "example.com"));
        assert!(!tracker.is_clean(ip("192.168.1.10"), "EXAMPLE.com"));
    }

    #[test]
    fn tracking_is_per_client_and_per_domain() {
        let tracker = CookieTracker::new();
        tracker.track(ip("192.168.1.10"), "example.com");

        assert!(tracker.is_clean(ip("192.168.1.11"), "example.com"));
        assert!(tracker.is_clean(ip("192.168.1.10"), "other.com"));
    }
}
