//! Forged-certificate cache
//!
//! Process-wide cache of spoofed leaf certificates keyed by `host:port`.
//! Lookup and insert happen under one lock so concurrent handshakes for the
//! same host never sign twice; entries live for the whole process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::proxy::ca::{CaAuthority, SignError, SignFn, TlsIdentity};

pub struct CertCache {
    ca: Arc<CaAuthority>,
    sign_fn: SignFn,
    certs: Mutex<HashMap<String, Arc<TlsIdentity>>>,
}

impl CertCache {
    pub fn new(ca: Arc<CaAuthority>, sign_fn: SignFn) -> Self {
        Self {
            ca,
            sign_fn,
            certs: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached identity for `host:port`, signing a new leaf on the
    /// first request. The same key always yields the same `Arc`.
    pub async fn get_or_create(&self, host: &str, port: u16) -> Result<Arc<TlsIdentity>, SignError> {
        let key = format!("{}:{}", host, port);
        let mut certs = self.certs.lock().await;

        if let Some(identity) = certs.get(&key) {
            debug!(key = %key, "Certificate cache hit");
            return Ok(Arc::clone(identity));
        }

        debug!(key = %key, "Signing spoofed certificate");
        let identity = Arc::new((self.sign_fn)(&self.ca, host, port)?);
        certs.insert(key, Arc::clone(&identity));
        Ok(identity)
    }

    pub async fn len(&self) -> usize {
        self.certs.lock().await.len()
    }
}
