//! Proxy server lifecycle and connection handling
//!
//! One `MitmProxy` instance serves one scheme: plain HTTP, or HTTPS with
//! forged certificates. Victim flows arrive through a NAT redirection the
//! proxy installs at start and removes at stop. Each accepted socket gets
//! its own task; every exchange is fully buffered, run through the filter
//! pipeline, and re-issued upstream on a fresh connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use http::header::HOST;
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::context::InterceptContext;
use crate::firewall::FirewallError;
use crate::proxy::ca::{default_signer, CaAuthority};
use crate::proxy::cert_cache::CertCache;
use crate::proxy::config::{ProxyOptions, ProxyRuntimeConfig};
use crate::proxy::filters::{Pipeline, RequestVerdict};
use crate::proxy::sni::{sniff_client_hello, RewindStream};
use crate::script::{NoopScript, ScriptHook};
use crate::strip::SslStripper;

/// How long in-flight exchanges may drain after stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy is not configured")]
    NotConfigured,

    #[error("proxy is already running")]
    AlreadyRunning,

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("CA setup failed: {0}")]
    Ca(String),

    #[error(transparent)]
    Firewall(#[from] FirewallError),
}

struct Configured {
    config: Arc<ProxyRuntimeConfig>,
    pipeline: Arc<Pipeline>,
    cert_cache: Option<Arc<CertCache>>,
    stripper: Option<Arc<SslStripper>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    bound: SocketAddr,
}

/// Everything a connection task needs, published once at start.
struct Shared {
    config: Arc<ProxyRuntimeConfig>,
    pipeline: Arc<Pipeline>,
    cert_cache: Option<Arc<CertCache>>,
}

pub struct MitmProxy {
    ctx: InterceptContext,
    configured: Option<Configured>,
    running: Option<Running>,
}

impl MitmProxy {
    pub fn new(ctx: InterceptContext) -> Self {
        Self {
            ctx,
            configured: None,
            running: None,
        }
    }

    /// Compile options into the immutable runtime config. TLS mode loads or
    /// creates the CA material here, so a bad CA path fails configuration
    /// rather than the first handshake.
    pub fn configure(
        &mut self,
        options: &ProxyOptions,
        script: Arc<dyn ScriptHook>,
        stripper: Option<Arc<SslStripper>>,
    ) -> Result<(), ProxyError> {
        if self.running.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        let config = Arc::new(ProxyRuntimeConfig::from_options(
            options,
            &self.ctx.interface.name,
        ));

        let cert_cache = match &options.tls {
            Some(tls) => {
                let ca = CaAuthority::load_or_create(&tls.ca_cert, &tls.ca_key)
                    .map_err(|e| ProxyError::Ca(format!("{e:#}")))?;
                Some(Arc::new(CertCache::new(Arc::new(ca), default_signer())))
            }
            None => None,
        };

        let stripper = if config.ssl_strip { stripper } else { None };
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&config),
            script,
            stripper.clone(),
        ));

        self.configured = Some(Configured {
            config,
            pipeline,
            cert_cache,
            stripper,
        });
        Ok(())
    }

    /// Bind the listener, install the NAT redirection and start accepting.
    pub async fn start(&mut self) -> Result<(), ProxyError> {
        if self.running.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }
        let configured = self.configured.as_ref().ok_or(ProxyError::NotConfigured)?;

        if let Some(redirect) = &configured.config.redirect {
            if !self.ctx.firewall.is_forwarding_enabled() {
                self.ctx.firewall.enable_forwarding(true)?;
            }
            self.ctx.firewall.enable_redirection(redirect, true)?;
            info!(
                from = redirect.src_port,
                to = redirect.dst_port,
                "Installed port redirection"
            );
        }

        let listener = TcpListener::bind(configured.config.bind)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: configured.config.bind,
                source,
            })?;
        let bound = listener.local_addr().map_err(|source| ProxyError::Bind {
            addr: configured.config.bind,
            source,
        })?;

        info!(
            addr = %bound,
            scheme = configured.config.scheme(),
            "Proxy listening"
        );

        let shared = Arc::new(Shared {
            config: Arc::clone(&configured.config),
            pipeline: Arc::clone(&configured.pipeline),
            cert_cache: configured.cert_cache.clone(),
        });

        let (shutdown, rx) = watch::channel(false);
        let acceptor = tokio::spawn(accept_loop(listener, shared, rx));

        self.running = Some(Running {
            shutdown,
            acceptor,
            bound,
        });
        Ok(())
    }

    /// Stop accepting, drain in-flight exchanges for a bounded grace period
    /// and remove the NAT redirection. Stopping a stopped proxy is a no-op.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.acceptor.await {
            warn!(error = %e, "Acceptor task did not shut down cleanly");
        }

        if let Some(configured) = &mut self.configured {
            if let Some(redirect) = &configured.config.redirect {
                // Removal is idempotent; an already-absent rule is fine.
                if let Err(e) = self.ctx.firewall.enable_redirection(redirect, false) {
                    warn!(error = %e, "Could not remove port redirection");
                }
            }
            // Script hooks do not survive a stop; the next start runs with
            // whatever the next configure installs.
            configured.pipeline = Arc::new(Pipeline::new(
                Arc::clone(&configured.config),
                Arc::new(NoopScript),
                configured.stripper.clone(),
            ));
        }

        info!(addr = %running.bound, "Proxy stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.bound)
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let shared = Arc::clone(&shared);
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(socket, peer, shared).await {
                            debug!(peer = %peer, error = %e, "Connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    drop(listener);
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Draining timed out, aborting in-flight connections");
        connections.abort_all();
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
) -> anyhow::Result<()> {
    match shared.cert_cache.clone() {
        Some(cache) => {
            let (sni, consumed) = sniff_client_hello(&mut socket)
                .await
                .context("sniffing ClientHello")?;
            let Some(host) = sni else {
                // Without SNI there is no name to forge a certificate for.
                debug!(peer = %peer, "ClientHello without SNI, dropping connection");
                return Ok(());
            };

            let identity = cache
                .get_or_create(&host, 443)
                .await
                .context("forging certificate")?;
            let acceptor = forged_acceptor(identity.cert_der.clone(), identity.key_der.clone())
                .context("building TLS acceptor")?;

            let tls = acceptor
                .accept(RewindStream::new(consumed, socket))
                .await
                .context("victim TLS handshake")?;
            serve(tls, peer, shared, Some(host)).await
        }
        None => serve(socket, peer, shared, None).await,
    }
}

fn forged_acceptor(cert_der: Vec<u8>, key_der: Vec<u8>) -> anyhow::Result<TlsAcceptor> {
    let certs = vec![CertificateDer::from(cert_der)];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("assembling server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn serve<S>(
    stream: S,
    peer: SocketAddr,
    shared: Arc<Shared>,
    sni: Option<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client = peer.ip();
    let sni = sni.map(Arc::new);

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        let sni = sni.clone();
        async move { handle_exchange(req, shared, client, sni.as_deref().map(String::as_str)).await }
    });

    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
        .context("serving connection")
}

async fn handle_exchange(
    req: Request<Incoming>,
    shared: Arc<Shared>,
    client: IpAddr,
    sni: Option<&str>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let mut req = Request::from_parts(parts, body);
    absolutize(&mut req, shared.config.scheme(), sni);

    let forwarded = match shared.pipeline.inbound(req, client) {
        RequestVerdict::ShortCircuit(res) => return Ok(to_full(res)),
        RequestVerdict::Forward(req) => req,
    };

    let response = match forward_upstream(&forwarded).await {
        Ok(res) => res,
        Err(e) => {
            let reason = format!("{e:#}");
            warn!(
                uri = %forwarded.uri(),
                client = %client,
                error = %reason,
                "Upstream request failed"
            );
            bad_gateway()
        }
    };

    Ok(to_full(shared.pipeline.outbound(&forwarded, response)))
}

/// Transparent interception delivers origin-form requests; rebuild the
/// absolute URI from the Host header (or the sniffed SNI) and the instance
/// scheme so the rest of the pipeline sees where the request goes.
fn absolutize(req: &mut Request<Bytes>, scheme: &str, sni: Option<&str>) {
    if req.uri().authority().is_some() {
        return;
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| sni.map(str::to_string));
    let Some(host) = host else {
        return;
    };
    let Ok(authority) = Authority::try_from(host.as_str()) else {
        debug!(host = %host, "Unusable Host header");
        return;
    };
    let Ok(scheme) = Scheme::try_from(scheme) else {
        return;
    };

    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(scheme);
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
}

/// Issue `req` upstream on a fresh connection, plain or TLS according to the
/// request's (possibly rewritten) scheme, and buffer the whole response.
async fn forward_upstream(req: &Request<Bytes>) -> anyhow::Result<Response<Bytes>> {
    let uri = req.uri();
    let https = uri.scheme_str() == Some("https");
    let host = uri.host().context("forward target has no host")?.to_string();
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;

    let outgoing = build_upstream_request(req)?;
    let response = if https {
        let server_name =
            ServerName::try_from(host.clone()).context("invalid upstream server name")?;
        let connector = TlsConnector::from(upstream_tls_config());
        let tls = connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with {host}"))?;
        send_on(tls, outgoing).await?
    } else {
        send_on(tcp, outgoing).await?
    };

    let (parts, body) = response.into_parts();
    let body = body.collect().await.context("reading upstream body")?.to_bytes();
    Ok(Response::from_parts(parts, body))
}

async fn send_on<S>(stream: S, req: Request<Full<Bytes>>) -> anyhow::Result<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("upstream handshake")?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Upstream connection closed with error");
        }
    });
    sender.send_request(req).await.context("upstream request")
}

/// Re-target the buffered request at the upstream server: origin-form URI,
/// explicit Host header, untouched method and remaining headers.
fn build_upstream_request(req: &Request<Bytes>) -> anyhow::Result<Request<Full<Bytes>>> {
    let path = req
        .uri()
        .path_and_query()
        .map(PathAndQuery::as_str)
        .unwrap_or("/");
    let authority = req
        .uri()
        .authority()
        .context("forward target has no authority")?;

    let mut builder = Request::builder().method(req.method()).uri(path);
    for (name, value) in req.headers() {
        if name != HOST {
            builder = builder.header(name, value);
        }
    }
    builder = builder.header(
        HOST,
        HeaderValue::from_str(authority.as_str()).context("authority is not a valid header")?,
    );

    builder
        .body(Full::new(req.body().clone()))
        .context("assembling upstream request")
}

/// Root store for verifying real upstream certificates, built once.
fn upstream_tls_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    Arc::clone(CONFIG.get_or_init(|| {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }))
}

fn to_full(res: Response<Bytes>) -> Response<Full<Bytes>> {
    res.map(Full::new)
}

fn bad_gateway() -> Response<Bytes> {
    let mut res = Response::new(Bytes::new());
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res
}
