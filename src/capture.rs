//! Packet capture and injection capabilities
//!
//! The engine never owns a raw socket itself. The surrounding framework opens
//! capture handles (filtered with a BPF-style expression such as
//! `"udp and port 53"`) and hands them in as [`PacketSource`] values, and
//! publishes one process-wide [`PacketSink`] for transmitting forged frames.

use std::time::Duration;

use thiserror::Error;

/// Capture/injection errors surfaced by the transport.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture handle closed")]
    Closed,

    #[error("transmit failed: {0}")]
    TransmitFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live, filtered sequence of decoded link-layer frames.
///
/// `next_frame` blocks for at most `timeout` and returns `Ok(None)` when no
/// frame arrived in that window, so a capture loop can poll its stop flag
/// between reads. Returning `Err(CaptureError::Closed)` ends the loop.
pub trait PacketSource: Send {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, CaptureError>;
}

/// Thread-safe "transmit this raw frame now" sink, shared process-wide.
pub trait PacketSink: Send + Sync {
    fn transmit(&self, frame: &[u8]) -> Result<(), CaptureError>;
}
