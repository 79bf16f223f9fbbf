//! Protocol probes: a single check of a single target, classified into a
//! service status.
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::Serialize;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::db::enums::{ServiceKind, ServiceStatus};

/// Certificates expiring in fewer days than this are a problem.
pub const CERT_PROBLEM_DAYS: i64 = 7;
/// Certificates expiring in fewer days than this are a warning.
pub const CERT_WARNING_DAYS: i64 = 30;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Invalid probe target '{0}'")]
    InvalidTarget(String),
    #[error("Could not retrieve certificate for {host}: {reason}")]
    CertificateUnavailable { host: String, reason: String },
    #[error("TLS setup failed: {0}")]
    TlsSetup(#[from] rustls::Error),
    #[error("HTTP client setup failed: {0}")]
    ClientSetup(#[from] reqwest::Error),
}

/// Per-request phase durations in milliseconds. Phases that did not happen
/// (TLS on plain HTTP) or could not be measured are `None`.
///
/// `dns_ms`, `connect_ms` and `tls_handshake_ms` come from a separate tracing
/// connection opened just before the request, so they describe the path to
/// the target rather than the probed request itself. `first_byte_ms` and
/// `total_ms` are measured on the probed request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseTimings {
    pub dns_ms: Option<f64>,
    pub connect_ms: Option<f64>,
    pub tls_handshake_ms: Option<f64>,
    pub first_byte_ms: Option<f64>,
    pub total_ms: Option<f64>,
    pub response_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: ServiceStatus,
    pub message: String,
    pub timings: Option<PhaseTimings>,
}

impl ProbeOutcome {
    pub fn new(status: ServiceStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            timings: None,
        }
    }
}

#[async_trait]
pub trait ServiceProber: Send + Sync {
    /// Runs one check. Network failures of HTTP probes are reported as a
    /// `Problem` outcome; only certificate retrieval and setup failures are
    /// returned as errors.
    async fn probe(&self, kind: ServiceKind, target: &str) -> Result<ProbeOutcome, ProbeError>;
}

/// Network prober for HTTP, HTTPS and TLS certificate checks.
pub struct Prober {
    client: reqwest::Client,
    tls: Arc<ClientConfig>,
    timeout: Duration,
    trace_phases: bool,
}

impl Prober {
    pub fn new(probe_timeout: Duration) -> Result<Self, ProbeError> {
        let probe_timeout = probe_timeout.max(Duration::from_secs(1));
        let client = reqwest::Client::builder().timeout(probe_timeout).build()?;
        Ok(Self {
            client,
            tls: Arc::new(inspecting_tls_config()?),
            timeout: probe_timeout,
            trace_phases: false,
        })
    }

    /// Measure DNS, connect and TLS phases on a separate connection before
    /// each HTTP request, for latency archival. Each traced probe opens two
    /// connections to the target.
    pub fn with_phase_tracing(mut self, enabled: bool) -> Self {
        self.trace_phases = enabled;
        self
    }

    async fn probe_http(&self, url: &str) -> ProbeOutcome {
        let mut timings = PhaseTimings::default();
        if self.trace_phases {
            self.trace_connection(url, &mut timings).await;
        }

        let started = Instant::now();
        let (status, message) = match self.client.get(url).send().await {
            Ok(response) => {
                timings.first_byte_ms = Some(millis(started.elapsed()));
                let code = response.status();
                timings.response_status = Some(code.as_u16());
                if let Err(e) = response.bytes().await {
                    debug!(url = %url, error = %e, "Failed to drain response body.");
                }
                if code.is_success() {
                    (ServiceStatus::Healthy, code.to_string())
                } else {
                    (ServiceStatus::Problem, code.to_string())
                }
            }
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("request timed out after {}s", self.timeout.as_secs())
                } else {
                    e.to_string()
                };
                (ServiceStatus::Problem, message)
            }
        };
        timings.total_ms = Some(millis(started.elapsed()));

        ProbeOutcome {
            status,
            message,
            timings: Some(timings),
        }
    }

    async fn trace_connection(&self, url: &str, timings: &mut PhaseTimings) {
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return;
        };
        let (Some(host), Some(port)) = (parsed.host_str(), parsed.port_or_known_default()) else {
            return;
        };
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        let started = Instant::now();
        let addr = match timeout(self.timeout, lookup_host((host.as_str(), port))).await {
            Ok(Ok(mut addrs)) => addrs.next(),
            _ => None,
        };
        timings.dns_ms = Some(millis(started.elapsed()));
        let Some(addr) = addr else {
            debug!(host = %host, "DNS resolution failed while tracing.");
            return;
        };

        let started = Instant::now();
        let Ok(Ok(stream)) = timeout(self.timeout, TcpStream::connect(addr)).await else {
            debug!(%addr, "Connect failed while tracing.");
            return;
        };
        timings.connect_ms = Some(millis(started.elapsed()));

        if parsed.scheme() != "https" {
            return;
        }
        let Ok(server_name) = ServerName::try_from(host) else {
            return;
        };
        let connector = TlsConnector::from(self.tls.clone());
        let started = Instant::now();
        if let Ok(Ok(_)) = timeout(self.timeout, connector.connect(server_name, stream)).await {
            timings.tls_handshake_ms = Some(millis(started.elapsed()));
        }
    }

    async fn probe_certificate(&self, target: &str) -> Result<ProbeOutcome, ProbeError> {
        let (host, port) = certificate_target(target)?;
        let unavailable = |reason: String| ProbeError::CertificateUnavailable {
            host: host.clone(),
            reason,
        };

        let server_name =
            ServerName::try_from(host.clone()).map_err(|e| unavailable(e.to_string()))?;
        let connector = TlsConnector::from(self.tls.clone());
        let handshake = async {
            let tcp = TcpStream::connect((host.as_str(), port)).await?;
            connector.connect(server_name, tcp).await
        };
        let stream = timeout(self.timeout, handshake)
            .await
            .map_err(|_| unavailable(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| unavailable(e.to_string()))?;

        let (_, connection) = stream.get_ref();
        let leaf = connection
            .peer_certificates()
            .and_then(|chain| chain.first())
            .ok_or_else(|| unavailable("server presented no certificate".to_string()))?;
        let (_, certificate) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| unavailable(format!("unparseable certificate: {e}")))?;

        let days = days_until(certificate.validity().not_after.timestamp(), Utc::now());
        let (status, message) = classify_certificate(&host, days);
        Ok(ProbeOutcome::new(status, message))
    }
}

#[async_trait]
impl ServiceProber for Prober {
    async fn probe(&self, kind: ServiceKind, target: &str) -> Result<ProbeOutcome, ProbeError> {
        match kind {
            ServiceKind::Http | ServiceKind::Https => {
                let url = normalize_http_target(kind, target);
                Ok(self.probe_http(&url).await)
            }
            ServiceKind::TlsCertificate => self.probe_certificate(target).await,
        }
    }
}

/// Strips trailing slashes and forces the scheme that matches `kind`.
pub fn normalize_http_target(kind: ServiceKind, target: &str) -> String {
    let trimmed = target.trim().trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    format!("{}://{}", kind.scheme(), rest)
}

/// Host and port to fetch a certificate from. Scheme and path are dropped;
/// the port defaults to 443.
pub fn certificate_target(target: &str) -> Result<(String, u16), ProbeError> {
    let trimmed = target.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();

    let invalid = || ProbeError::InvalidTarget(target.to_string());
    let parse_port = |port: &str| port.parse::<u16>().map_err(|_| invalid());

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, rest) = bracketed.split_once(']').ok_or_else(invalid)?;
        match rest {
            "" => (host, 443),
            _ => (host, parse_port(rest.strip_prefix(':').ok_or_else(invalid)?)?),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, parse_port(port)?),
            _ => (authority, 443),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Whole days from `now` until `not_after` (unix seconds), truncated.
pub fn days_until(not_after: i64, now: DateTime<Utc>) -> i64 {
    (not_after - now.timestamp()) / SECONDS_PER_DAY
}

pub fn classify_certificate(host: &str, days: i64) -> (ServiceStatus, String) {
    let status = if days < CERT_PROBLEM_DAYS {
        ServiceStatus::Problem
    } else if days < CERT_WARNING_DAYS {
        ServiceStatus::Warning
    } else {
        ServiceStatus::Healthy
    };
    (status, format!("{host} expiring in {days} days"))
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// TLS client configuration that completes handshakes with any certificate so
/// that expired or self-signed certificates can still be inspected.
fn inspecting_tls_config() -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InspectOnlyVerifier { provider }))
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct InspectOnlyVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InspectOnlyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
