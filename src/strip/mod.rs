//! SSL stripping
//!
//! Downgrades HTTPS references to HTTP in proxied traffic while keeping the
//! upstream side on HTTPS, tracks which hostnames were downgraded, defeats
//! cookie-based session fixation, and runs a counter-spoof DNS sniffer so
//! the victim's resolver stays consistent with the rewritten links.

pub mod cookies;
pub mod hosts;
pub mod rewrite;
pub mod stripper;

pub use cookies::CookieTracker;
pub use hosts::{HostRecord, HostTracker};
pub use stripper::SslStripper;
