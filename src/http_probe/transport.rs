use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::client::conn::http1;
use hyper::header::{CACHE_CONTROL, CONNECTION, HOST, PRAGMA, USER_AGENT};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use openssl::ssl::{
    ErrorCode, SslConnector, SslMethod, SslRef, SslVerifyMode, SslVersion,
};
use openssl::x509::X509VerifyResult;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_openssl::SslStream;
use trust_dns_resolver::TokioAsyncResolver;
use url::{Host, Url};

use super::classify::*;
use super::result::SecurityState;
use crate::config::probe_config::{ProbeConfig, TlsVersion};
use crate::error::RequestError;
use crate::prefs::TlsSettings;

const USER_AGENT_VALUE: &str = concat!("middlebox-probe/", env!("CARGO_PKG_VERSION"));

/// One HTTPS GET, resolved against the TLS window in force when it was built.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub url: Url,
    pub host: String,
    pub port: u16,
    /// `Host` header value.
    pub authority: String,
    pub settings: TlsSettings,
    /// Where the transport publishes the session once the handshake ends.
    pub session: SessionWatch,
}

impl ProbeRequest {
    pub fn new(config: &ProbeConfig, settings: TlsSettings) -> Result<Self, RequestError> {
        let target = format!("https://{}", config.host.trim());
        let url = Url::parse(&target).map_err(|source| RequestError::InvalidTarget {
            target: config.host.clone(),
            source,
        })?;

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(RequestError::MissingHost(config.host.clone())),
        };
        let port = url.port_or_known_default().unwrap_or(443);
        let host_str = url.host_str().unwrap_or(&host).to_string();
        let authority = match url.port() {
            Some(port) => format!("{host_str}:{port}"),
            None => host_str,
        };

        Ok(ProbeRequest {
            url,
            host,
            port,
            authority,
            settings,
            session: SessionWatch::default(),
        })
    }
}

/// The latest TLS session seen for a request, readable after the request
/// itself was cut short.
#[derive(Debug, Clone)]
pub struct SessionWatch(Arc<watch::Sender<Option<SessionInfo>>>);

impl SessionWatch {
    pub fn publish(&self, session: &SessionInfo) {
        self.0.send_replace(Some(session.clone()));
    }

    pub fn latest(&self) -> Option<SessionInfo> {
        self.0.borrow().clone()
    }
}

impl Default for SessionWatch {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        SessionWatch(Arc::new(tx))
    }
}

/// What the TLS layer exposed about a connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub handshake_completed: bool,
    pub negotiated_version: Option<TlsVersion>,
    /// DER certificates, leaf first. The verified chain when verification
    /// succeeded, otherwise whatever the server presented.
    pub chain: Vec<Vec<u8>>,
    /// Set when certificate verification failed.
    pub verify_status: Option<StatusCode>,
    pub diagnostic: Option<String>,
}

impl SessionInfo {
    fn capture(ssl: &SslRef, handshake_completed: bool) -> Self {
        let verify = ssl.verify_result();
        let verify_status = (handshake_completed && verify != X509VerifyResult::OK)
            .then(|| status_for_verify(verify.as_raw()));

        let stack = if handshake_completed && verify_status.is_none() {
            ssl.verified_chain().or_else(|| ssl.peer_cert_chain())
        } else {
            ssl.peer_cert_chain()
        };

        let mut chain = Vec::new();
        let mut diagnostic = None;
        for cert in stack.into_iter().flatten() {
            match cert.to_der() {
                Ok(der) => chain.push(der),
                Err(e) => {
                    diagnostic = Some(format!("failed to encode peer certificate: {e}"));
                    break;
                }
            }
        }

        SessionInfo {
            handshake_completed,
            negotiated_version: ssl.version2().and_then(tls_version),
            chain,
            verify_status,
            diagnostic,
        }
    }

    pub fn security_state(&self) -> SecurityState {
        if !self.handshake_completed {
            SecurityState::INSECURE
        } else if self.verify_status.is_some() {
            SecurityState::BROKEN
        } else {
            SecurityState::SECURE
        }
    }
}

/// A request that produced an HTTP response.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub http_status: u16,
    pub session: SessionInfo,
}

/// A request that did not.
#[derive(Debug, Clone)]
pub struct Failure {
    pub status: StatusCode,
    pub message: String,
    pub session: Option<SessionInfo>,
}

impl Failure {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Failure {
            status,
            message: message.into(),
            session: None,
        }
    }

    pub fn with_session(mut self, session: SessionInfo) -> Self {
        self.session = Some(session);
        self
    }
}

/// The terminal event of a request.
#[derive(Debug, Clone)]
pub enum Delivery {
    Loaded(Exchange),
    Failed(Failure),
    Aborted(Failure),
}

/// Anything that can fetch `https://{host}/` and report what the TLS layer saw.
///
/// `Err` means the request could not even be issued; every network or TLS
/// failure is a `Delivery`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &ProbeRequest) -> Result<Delivery, RequestError>;
}

/// OpenSSL handshake plus a single HTTP/1.1 request over hyper.
///
/// Certificate verification runs but never aborts the handshake, so a failed
/// verification still yields the presented chain. No cookies, no cache, and
/// a fresh TLS context per request.
pub struct OpenSslTransport {
    resolver: TokioAsyncResolver,
    ca_bundle: Option<PathBuf>,
}

impl OpenSslTransport {
    pub fn new(resolver: TokioAsyncResolver, ca_bundle: Option<PathBuf>) -> Self {
        OpenSslTransport {
            resolver,
            ca_bundle,
        }
    }

    pub(crate) fn connector(&self, settings: &TlsSettings) -> Result<SslConnector, RequestError> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;
        builder.set_verify(SslVerifyMode::NONE);
        if let Some(path) = &self.ca_bundle {
            builder.set_ca_file(path)?;
        }
        builder.set_min_proto_version(Some(ssl_version(settings.fallback_limit)))?;
        builder.set_max_proto_version(Some(ssl_version(settings.max_version)))?;
        if settings.fallback_limit < TlsVersion::Tls12 {
            // TLS 1.0/1.1 need the legacy signature algorithms
            builder.set_security_level(0);
        }
        Ok(builder.build())
    }

    async fn get(
        &self,
        stream: SslStream<TcpStream>,
        request: &ProbeRequest,
        session: SessionInfo,
    ) -> Result<Delivery, RequestError> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(request.url.path())
            .header(HOST, request.authority.as_str())
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .header(CONNECTION, "close")
            .body(Empty::<Bytes>::new())?;

        let (mut sender, conn) = match http1::handshake(TokioIo::new(stream)).await {
            Ok(parts) => parts,
            Err(e) => {
                return Ok(Delivery::Failed(
                    Failure::new(status_for_hyper(&e), e.to_string()).with_session(session),
                ));
            }
        };
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                log::debug!("HTTP connection closed with error: {e}");
            }
        });

        match sender.send_request(req).await {
            Ok(response) => Ok(Delivery::Loaded(Exchange {
                http_status: response.status().as_u16(),
                session,
            })),
            Err(e) if e.is_canceled() => Ok(Delivery::Aborted(
                Failure::new(BINDING_ABORTED, e.to_string()).with_session(session),
            )),
            Err(e) => Ok(Delivery::Failed(
                Failure::new(status_for_hyper(&e), e.to_string()).with_session(session),
            )),
        }
    }
}

#[async_trait]
impl Transport for OpenSslTransport {
    async fn fetch(&self, request: &ProbeRequest) -> Result<Delivery, RequestError> {
        let connector = self.connector(&request.settings)?;
        let ssl = connector.configure()?.into_ssl(&request.host)?;

        let ip = match self.resolver.lookup_ip(request.host.as_str()).await {
            Ok(lookup) => match lookup.iter().next() {
                Some(ip) => ip,
                None => {
                    let message = format!("no addresses for {}", request.host);
                    return Ok(Delivery::Failed(Failure::new(UNKNOWN_HOST, message)));
                }
            },
            Err(e) => return Ok(Delivery::Failed(Failure::new(UNKNOWN_HOST, e.to_string()))),
        };

        let tcp = match TcpStream::connect(SocketAddr::new(ip, request.port)).await {
            Ok(tcp) => tcp,
            Err(e) => {
                return Ok(Delivery::Failed(Failure::new(
                    status_for_io(&e),
                    e.to_string(),
                )));
            }
        };

        let mut stream = SslStream::new(ssl, tcp)?;
        let handshake = Pin::new(&mut stream).connect().await;
        let session = SessionInfo::capture(stream.ssl(), handshake.is_ok());
        request.session.publish(&session);

        if let Err(e) = handshake {
            let failure = Failure::new(status_for_handshake(&e), e.to_string());
            return Ok(Delivery::Failed(failure.with_session(session)));
        }
        if let Some(status) = session.verify_status {
            let message = stream.ssl().verify_result().error_string().to_string();
            return Ok(Delivery::Failed(
                Failure::new(status, message).with_session(session),
            ));
        }

        self.get(stream, request, session).await
    }
}

fn ssl_version(version: TlsVersion) -> SslVersion {
    match version {
        TlsVersion::Tls10 => SslVersion::TLS1,
        TlsVersion::Tls11 => SslVersion::TLS1_1,
        TlsVersion::Tls12 => SslVersion::TLS1_2,
        TlsVersion::Tls13 => SslVersion::TLS1_3,
    }
}

fn tls_version(version: SslVersion) -> Option<TlsVersion> {
    TlsVersion::ALL
        .into_iter()
        .find(|v| ssl_version(*v) == version)
}

pub fn status_for_io(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => CONNECTION_REFUSED,
        io::ErrorKind::TimedOut => NET_TIMEOUT,
        io::ErrorKind::ConnectionReset => NET_RESET,
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe => NET_INTERRUPT,
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => OFFLINE,
        _ => GENERIC_NETWORK_FAILURE,
    }
}

/// Maps an OpenSSL `X509_V_ERR_*` value.
pub fn status_for_verify(raw: i32) -> StatusCode {
    match raw {
        2 | 20 | 21 | 19 => UNKNOWN_ISSUER,
        7 | 8 => BAD_SIGNATURE,
        9 => NOT_YET_VALID_CERTIFICATE,
        10 => EXPIRED_CERTIFICATE,
        18 => SELF_SIGNED_CERT,
        23 => REVOKED_CERTIFICATE,
        24 => CA_CERT_INVALID,
        26 => INADEQUATE_KEY_USAGE,
        27 | 28 => UNTRUSTED_CERT,
        62 | 64 => BAD_CERT_DOMAIN,
        _ => GENERIC_CERT_FAILURE,
    }
}

/// Maps an OpenSSL error reason string from a failed handshake.
pub fn status_for_ssl_reason(reason: &str) -> Option<StatusCode> {
    let reason = reason.to_ascii_lowercase();
    let table: &[(&str, StatusCode)] = &[
        ("inappropriate fallback", INAPPROPRIATE_FALLBACK_ALERT),
        ("protocol version", PROTOCOL_VERSION_ALERT),
        ("unsupported protocol", UNSUPPORTED_VERSION),
        ("no protocols available", UNSUPPORTED_VERSION),
        ("wrong version number", RX_RECORD_TOO_LONG),
        ("record layer failure", RX_RECORD_TOO_LONG),
        ("packet length too long", RX_RECORD_TOO_LONG),
        ("no shared cipher", NO_CYPHER_OVERLAP),
        ("no ciphers available", NO_CYPHER_OVERLAP),
        ("handshake failure", HANDSHAKE_FAILURE_ALERT),
        ("bad record mac", BAD_MAC_READ),
        ("decryption failed", BAD_MAC_READ),
        ("unexpected eof", NET_INTERRUPT),
        ("unexpected message", RX_MALFORMED_SERVER_HELLO),
    ];
    table
        .iter()
        .find(|(needle, _)| reason.contains(needle))
        .map(|(_, code)| *code)
}

fn status_for_handshake(err: &openssl::ssl::Error) -> StatusCode {
    if let Some(io_err) = err.io_error() {
        return status_for_io(io_err);
    }
    if let Some(stack) = err.ssl_error() {
        return stack
            .errors()
            .iter()
            .filter_map(|e| e.reason())
            .find_map(status_for_ssl_reason)
            .unwrap_or(GENERIC_SSL_FAILURE);
    }
    match err.code() {
        ErrorCode::ZERO_RETURN | ErrorCode::SYSCALL => NET_INTERRUPT,
        _ => GENERIC_SSL_FAILURE,
    }
}

fn status_for_hyper(err: &hyper::Error) -> StatusCode {
    if err.is_incomplete_message() {
        return NET_PARTIAL_TRANSFER;
    }
    std::error::Error::source(err)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .map_or(GENERIC_NETWORK_FAILURE, status_for_io)
}
