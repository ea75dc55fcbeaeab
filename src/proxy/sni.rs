//! ClientHello sniffing
//!
//! Transparent HTTPS interception receives raw TCP, not CONNECT: the proxy
//! reads the first TLS record off the accepted socket, extracts the SNI
//! hostname without handshaking, then replays the buffered bytes into rustls
//! through a rewind stream so the handshake proceeds as if nothing was read.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use thiserror::Error;
use tls_parser::{SNIType, TlsExtension, TlsMessage, TlsMessageHandshake};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::debug;

/// TLS record header plus the largest allowed handshake record.
const MAX_RECORD: usize = 5 + 16384;

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("connection closed before a full ClientHello")]
    Truncated,

    #[error("not a TLS handshake record")]
    NotTls,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Read the first TLS record from `stream` and extract the SNI hostname.
/// Returns the hostname (if the ClientHello carried one) together with every
/// byte consumed, which the caller must replay to the TLS acceptor.
pub async fn sniff_client_hello<S>(stream: &mut S) -> Result<(Option<String>, Vec<u8>), SniffError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        if buf.len() >= 5 {
            // Content type 22 = handshake
            if buf[0] != 0x16 {
                return Err(SniffError::NotTls);
            }
            let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            let needed = 5 + record_len;
            if needed > MAX_RECORD {
                return Err(SniffError::NotTls);
            }
            if buf.len() >= needed {
                let sni = parse_sni(&buf[..needed]);
                if sni.is_none() {
                    debug!("ClientHello without SNI");
                }
                return Ok((sni, buf));
            }
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SniffError::Truncated);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Extract the SNI hostname from one TLS plaintext record.
pub(crate) fn parse_sni(record: &[u8]) -> Option<String> {
    let (_, plaintext) = tls_parser::parse_tls_plaintext(record).ok()?;
    for message in plaintext.msg {
        let TlsMessage::Handshake(handshake) = message else {
            return None;
        };
        let TlsMessageHandshake::ClientHello(hello) = handshake else {
            continue;
        };
        let Some(raw_extensions) = hello.ext else {
            continue;
        };
        let (_, extensions) = tls_parser::parse_tls_extensions(raw_extensions).ok()?;
        for extension in extensions {
            let TlsExtension::SNI(names) = extension else {
                continue;
            };
            let (name_type, name) = names.first()?;
            if *name_type != SNIType::HostName {
                continue;
            }
            return String::from_utf8(name.to_vec()).ok();
        }
    }
    None
}

/// Stream adapter replaying sniffed bytes before reading from the socket.
pub struct RewindStream<S> {
    prefix: Bytes,
    stream: S,
}

impl<S> RewindStream<S> {
    pub fn new(prefix: Vec<u8>, stream: S) -> Self {
        Self {
            prefix: Bytes::from(prefix),
            stream,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = buf.remaining().min(this.prefix.len());
            let chunk = this.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Minimal but valid ClientHello record carrying one SNI entry.
    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let name = host.as_bytes();

        // server_name extension body
        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list length
        sni.push(0x00); // host_name
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0u16.to_be_bytes()); // type: server_name
        extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version TLS 1.2
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0x00); // session_id length
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01]; // client_hello
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]); // u24 length
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01]; // handshake, TLS 1.0 record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn sni_is_extracted_from_client_hello() {
        let record = client_hello_with_sni("secure.example.com");
        assert_eq!(parse_sni(&record), Some("secure.example.com".to_string()));
    }

    #[test]
    fn garbage_has_no_sni() {
        assert_eq!(parse_sni(b"GET / HTTP/1.1\r\n\r\n"), None);
    }

    #[tokio::test]
    async fn sniff_returns_hostname_and_consumed_bytes() {
        let record = client_hello_with_sni("mail.example.com");
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&record).await.unwrap();

        let (sni, consumed) = sniff_client_hello(&mut server).await.unwrap();
        assert_eq!(sni.as_deref(), Some("mail.example.com"));
        assert_eq!(consumed, record);
    }

    #[tokio::test]
    async fn plain_http_is_not_tls() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let err = sniff_client_hello(&mut server).await.unwrap_err();
        assert!(matches!(err, SniffError::NotTls));
    }

    #[tokio::test]
    async fn rewind_stream_replays_prefix_first() {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(b" world").await.unwrap();

        let mut stream = RewindStream::new(b"hello".to_vec(), server);
        let mut out = vec![0u8; 11];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }
}
