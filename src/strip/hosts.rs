//! Downgraded-host tracking
//!
//! Every hostname whose `https://` link was rewritten to `http://` is
//! remembered together with its punycode (ASCII) form, so a later plain-HTTP
//! request for the downgraded name can be unwound back to the original HTTPS
//! origin. Each tracked host is resolved in the background; the counter-spoof
//! sniffer reads the resolved address without blocking.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// One tracked hostname and its background DNS resolution.
///
/// The watch channel holds `None` while resolution is in flight and
/// `Some(result)` once it completed, where the inner `None` means the name
/// resolved to no usable address.
pub struct HostRecord {
    original: String,
    downgraded: String,
    resolution: watch::Receiver<Option<Option<IpAddr>>>,
}

impl HostRecord {
    /// Track `original`, resolving it on the current tokio runtime. Outside
    /// a runtime the record completes immediately with no address; the
    /// counter-spoof sniffer then leaves queries for it alone.
    pub fn track(original: &str, downgraded: &str) -> Arc<Self> {
        let (tx, rx) = watch::channel(None);
        let record = Arc::new(Self {
            original: original.to_string(),
            downgraded: downgraded.to_string(),
            resolution: rx,
        });

        let name = original.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let resolved = resolve_first(&name).await;
                    debug!(host = %name, address = ?resolved, "Downgraded host resolved");
                    let _ = tx.send(Some(resolved));
                });
            }
            Err(_) => {
                debug!(host = %name, "No async runtime, tracking without resolution");
                let _ = tx.send(Some(None));
            }
        }

        record
    }

    /// Build a record whose resolution already completed. Used when the
    /// address is known without a lookup.
    pub fn resolved(original: &str, downgraded: &str, address: Option<IpAddr>) -> Arc<Self> {
        // The receiver keeps the last value after the sender drops.
        let (_tx, rx) = watch::channel(Some(address));
        Arc::new(Self {
            original: original.to_string(),
            downgraded: downgraded.to_string(),
            resolution: rx,
        })
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn downgraded(&self) -> &str {
        &self.downgraded
    }

    /// Resolved address, or `None` while resolution is pending or when the
    /// name had no usable address.
    pub fn current_addr(&self) -> Option<IpAddr> {
        (*self.resolution.borrow()).flatten()
    }

    /// Wait for the background resolution to complete, bounded by `timeout`.
    pub async fn wait_addr(&self, timeout: Duration) -> Option<IpAddr> {
        let mut rx = self.resolution.clone();
        let wait = async {
            loop {
                if let Some(resolved) = *rx.borrow() {
                    return resolved;
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(None)
    }
}

async fn resolve_first(name: &str) -> Option<IpAddr> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
        TokioAsyncResolver::tokio(ResolverConfig::google(), ResolverOpts::default())
    });
    match resolver.lookup_ip(name).await {
        Ok(addresses) => addresses.iter().next(),
        Err(e) => {
            debug!(host = %name, error = %e, "Lookup of downgraded host failed");
            None
        }
    }
}

/// Both directions of the index, always updated together.
#[derive(Default)]
struct HostMaps {
    by_original: HashMap<String, Arc<HostRecord>>,
    by_downgraded: HashMap<String, Arc<HostRecord>>,
}

/// Bidirectional index over tracked hosts: original name to record and
/// downgraded name to record. One lock guards both maps so they can never
/// disagree. Grows for the lifetime of the engagement.
#[derive(Default)]
pub struct HostTracker {
    maps: RwLock<HostMaps>,
}

impl HostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a downgraded host, spawning its resolution on first sight.
    /// Re-tracking an already known host is a no-op.
    pub fn track(&self, original: &str, downgraded: &str) {
        let original = original.to_lowercase();
        let downgraded = downgraded.to_lowercase();

        {
            let maps = self.maps.read().unwrap_or_else(|e| e.into_inner());
            if maps.by_original.contains_key(&original) {
                return;
            }
        }

        let record = HostRecord::track(&original, &downgraded);
        self.insert(record);
    }

    /// Insert a pre-built record, replacing nothing that already exists.
    pub fn insert(&self, record: Arc<HostRecord>) {
        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        if maps.by_original.contains_key(record.original()) {
            return;
        }
        maps.by_downgraded
            .insert(record.downgraded().to_string(), Arc::clone(&record));
        maps.by_original
            .insert(record.original().to_string(), record);
    }

    pub fn find_by_original(&self, name: &str) -> Option<Arc<HostRecord>> {
        let name = name.trim_end_matches('.').to_lowercase();
        self.maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_original
            .get(&name)
            .cloned()
    }

    pub fn find_by_downgraded(&self, name: &str) -> Option<Arc<HostRecord>> {
        let name = name.trim_end_matches('.').to_lowercase();
        self.maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_downgraded
            .get(&name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_original
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn tracker_is_bidirectional() {
        let tracker = HostTracker::new();
        tracker.insert(HostRecord::resolved(
            "secure.example.com",
            "xn--secure.example.com",
            Some(ip("93.184.216.34")),
        ));

        let by_down = tracker.find_by_downgraded("xn--secure.example.com").unwrap();
        assert_eq!(by_down.original(), "secure.example.com");

        let by_orig = tracker.find_by_original("secure.example.com").unwrap();
        assert_eq!(by_orig.downgraded(), "xn--secure.example.com");
    }

    #[test]
    fn lookups_ignore_case_and_trailing_dot() {
        let tracker = HostTracker::new();
        tracker.insert(HostRecord::resolved("a.com", "a.com", None));

        assert!(tracker.find_by_downgraded("A.COM.").is_some());
        assert!(tracker.find_by_original("a.com.").is_some());
        assert!(tracker.find_by_downgraded("b.com").is_none());
    }

    #[test]
    fn tracking_without_a_runtime_completes_empty() {
        // Plain thread, no tokio runtime anywhere.
        let tracker = HostTracker::new();
        tracker.track("secure.example.com", "secure.example.com");

        let record = tracker.find_by_downgraded("secure.example.com").unwrap();
        assert_eq!(record.current_addr(), None);
    }

    #[test]
    fn reinsert_keeps_first_record() {
        let tracker = HostTracker::new();
        tracker.insert(HostRecord::resolved("a.com", "a.com", Some(ip("1.1.1.1"))));
        tracker.insert(HostRecord::resolved("a.com", "a.com", Some(ip("2.2.2.2"))));

        assert_eq!(tracker.len(), 1);
        assert_eq!(
            tracker.find_by_original("a.com").unwrap().current_addr(),
            Some(ip("1.1.1.1"))
        );
    }

    #[tokio::test]
    async fn wait_addr_returns_completed_resolution() {
        let record = HostRecord::resolved(
            "a.com",
            "a.com",
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
        );
        let addr = record.wait_addr(Duration::from_millis(50)).await;
        assert_eq!(addr, Some(ip("10.0.0.1")));
    }

    #[tokio::test]
    async fn wait_addr_times_out_while_pending() {
        // A channel that never completes stands in for a stuck lookup.
        let (_tx, rx) = watch::channel(None);
        let record = HostRecord {
            original: "a.com".to_string(),
            downgraded: "a.com".to_string(),
            resolution: rx,
        };

        let addr = record.wait_addr(Duration::from_millis(10)).await;
        assert_eq!(addr, None);
        assert_eq!(record.current_addr(), None);
    }
}
