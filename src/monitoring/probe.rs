//! Active checks for health monitors: HTTP(S), TCP, ICMP ping and TLS certificate
//! expiry. Every probe carries its own timeout.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use rand::random;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::db::entities::health_monitor;
use crate::db::enums::MonitorType;

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub success: bool,
    pub response_time_ms: Option<i32>,
    pub status_code: Option<i32>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn up(response_time_ms: i32) -> Self {
        Self {
            success: true,
            response_time_ms: Some(response_time_ms),
            status_code: None,
            error: None,
        }
    }

    pub fn down(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response_time_ms: None,
            status_code: None,
            error: Some(error.into()),
        }
    }

    fn with_status(mut self, code: i32) -> Self {
        self.status_code = Some(code);
        self
    }
}

fn elapsed_ms(start: Instant) -> i32 {
    i32::try_from(start.elapsed().as_millis()).unwrap_or(i32::MAX)
}

/// Runs the active check configured on `monitor`. Heartbeat monitors are passive
/// and are evaluated from their last ping instead.
pub async fn run_probe(monitor: &health_monitor::Model) -> ProbeResult {
    let timeout = Duration::from_secs(monitor.timeout_seconds.max(1) as u64);
    match monitor.monitor_type {
        MonitorType::Http | MonitorType::Https => {
            let url = normalize_url(&monitor.check_target, monitor.monitor_type);
            http_probe(
                &url,
                &monitor.http_method,
                monitor.expected_status,
                monitor.expected_content.as_deref(),
                timeout,
            )
            .await
        }
        MonitorType::Tcp => tcp_probe(&monitor.check_target, timeout).await,
        MonitorType::Ping => ping_probe(&monitor.check_target, timeout).await,
        MonitorType::SslExpiry => {
            ssl_expiry_probe(&monitor.check_target, monitor.ssl_expiry_days_warning, timeout, Utc::now()).await
        }
        MonitorType::Heartbeat => ProbeResult::down("heartbeat monitors are not actively probed"),
    }
}

fn normalize_url(target: &str, monitor_type: MonitorType) -> String {
    if target.contains("://") {
        return target.to_string();
    }
    match monitor_type {
        MonitorType::Https => format!("https://{target}"),
        _ => format!("http://{target}"),
    }
}

static HTTP_CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

/// Shared client for outbound probes. Timeouts are set per request and probes
/// never go through a proxy, so they measure the target itself.
pub fn http_client() -> Result<&'static reqwest::Client, reqwest::Error> {
    HTTP_CLIENT.get_or_try_init(|| {
        reqwest::Client::builder()
            .use_rustls_tls()
            .no_proxy()
            .user_agent(concat!("fleet-control/", env!("CARGO_PKG_VERSION")))
            .build()
    })
}

/// Whether `code` satisfies the monitor's expectation (any 2xx when unset).
pub fn status_matches(expected: Option<i32>, code: u16) -> bool {
    match expected {
        Some(expected) => i32::from(code) == expected,
        None => (200..300).contains(&code),
    }
}

pub async fn http_probe(
    url: &str,
    method: &str,
    expected_status: Option<i32>,
    expected_content: Option<&str>,
    timeout: Duration,
) -> ProbeResult {
    let client = match http_client() {
        Ok(client) => client,
        Err(e) => return ProbeResult::down(format!("Error: HTTP client unavailable: {e}")),
    };
    let method = reqwest::Method::from_bytes(method.trim().to_uppercase().as_bytes()).unwrap_or(reqwest::Method::GET);

    let start = Instant::now();
    let response = match client.request(method, url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => return ProbeResult::down("Error: Request timed out"),
        Err(e) => return ProbeResult::down(format!("Error: {e}")),
    };
    let status = response.status();
    let code = i32::from(status.as_u16());

    if !status_matches(expected_status, status.as_u16()) {
        let expected = expected_status.map_or_else(|| "2xx".to_string(), |s| s.to_string());
        return ProbeResult::down(format!("Unexpected status {status} (expected {expected})")).with_status(code);
    }

    if let Some(needle) = expected_content.filter(|c| !c.is_empty()) {
        let remaining = timeout.saturating_sub(start.elapsed());
        let body = match tokio::time::timeout(remaining, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return ProbeResult::down(format!("Error reading body: {e}")).with_status(code),
            Err(_) => return ProbeResult::down("Error: Request timed out").with_status(code),
        };
        if !body.contains(needle) {
            return ProbeResult::down(format!("Expected content '{needle}' not found")).with_status(code);
        }
    }

    ProbeResult::up(elapsed_ms(start)).with_status(code)
}

pub async fn tcp_probe(target: &str, timeout: Duration) -> ProbeResult {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => ProbeResult::up(elapsed_ms(start)),
        Ok(Err(e)) => ProbeResult::down(format!("Error: {e}")),
        Err(_) => ProbeResult::down("Error: Connection timed out"),
    }
}

async fn resolve_ip(host: &str, timeout: Duration) -> Result<IpAddr, String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = match tokio::time::timeout(timeout, tokio::net::lookup_host(format!("{host}:0"))).await {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(e)) => return Err(format!("Error: DNS resolution failed: {e}")),
        Err(_) => return Err("Error: DNS resolution timed out".to_string()),
    };
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| "Error: DNS resolution returned no addresses".to_string())
}

/// ICMP echo. Without raw-socket permission the probe falls back to a TCP
/// connect on 443, then 80.
pub async fn ping_probe(host: &str, timeout: Duration) -> ProbeResult {
    let host = host.trim();
    let start = Instant::now();
    let ip = match resolve_ip(host, timeout).await {
        Ok(ip) => ip,
        Err(e) => return ProbeResult::down(e),
    };
    // Resolution and the echo share one budget.
    let timeout = timeout.saturating_sub(start.elapsed());

    let config = match ip {
        IpAddr::V4(_) => surge_ping::Config::default(),
        IpAddr::V6(_) => surge_ping::Config::builder().kind(surge_ping::ICMP::V6).build(),
    };

    let client = match surge_ping::Client::new(&config) {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "ICMP socket unavailable, falling back to TCP reachability.");
            return tcp_fallback(ip, timeout, &e.to_string()).await;
        }
    };

    let mut pinger = client.pinger(ip, surge_ping::PingIdentifier(random())).await;
    pinger.timeout(timeout);
    match pinger.ping(surge_ping::PingSequence(0), &[0; 16]).await {
        Ok((_reply, rtt)) => ProbeResult::up(i32::try_from(rtt.as_millis()).unwrap_or(i32::MAX)),
        Err(surge_ping::SurgeError::Timeout { .. }) => ProbeResult::down("Error: Ping timed out"),
        Err(e) => ProbeResult::down(format!("Error: {e}")),
    }
}

async fn tcp_fallback(ip: IpAddr, timeout: Duration, icmp_error: &str) -> ProbeResult {
    let mut last_error = String::new();
    for port in [443u16, 80] {
        let result = tcp_probe(&SocketAddr::new(ip, port).to_string(), timeout).await;
        if result.success {
            return result;
        }
        last_error = result.error.unwrap_or_default();
    }
    ProbeResult::down(format!(
        "ICMP unavailable ({icmp_error}); TCP fallback on 443/80 failed: {last_error}"
    ))
}

/// Splits `host[:port]`, `[v6]:port` or a URL into host and port.
pub fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    let without_scheme = target.split_once("://").map_or(target, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme).trim();

    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            (host.to_string(), port.parse().unwrap_or(default_port))
        }
        _ => (authority.to_string(), default_port),
    }
}

/// Judges a certificate's `notAfter` against the warning window.
pub fn evaluate_certificate_expiry(not_after: DateTime<Utc>, now: DateTime<Utc>, warning_days: i32) -> Result<i64, String> {
    let remaining = not_after - now;
    if remaining.num_seconds() <= 0 {
        return Err(format!("Certificate expired on {}", not_after.format("%Y-%m-%d")));
    }
    let days_left = remaining.num_days();
    if days_left < i64::from(warning_days.max(0)) {
        return Err(format!(
            "Certificate expires in {days_left} days (on {}), inside the {warning_days}-day warning window",
            not_after.format("%Y-%m-%d")
        ));
    }
    Ok(days_left)
}

static TLS_CONFIG: OnceCell<Arc<ClientConfig>> = OnceCell::new();

fn tls_config() -> Result<Arc<ClientConfig>, String> {
    TLS_CONFIG
        .get_or_try_init(|| {
            let mut roots = RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for e in &native.errors {
                warn!(error = %e, "Failed to load a native root certificate.");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!(added, ignored, "Loaded native root certificates.");

            let config = ClientConfig::builder_with_provider(Arc::new(
                tokio_rustls::rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map_err(|e| format!("TLS configuration error: {e}"))?
            .with_root_certificates(roots)
            .with_no_client_auth();
            Ok(Arc::new(config))
        })
        .cloned()
}

/// Completes a verified TLS handshake and checks the leaf certificate's expiry.
pub async fn ssl_expiry_probe(target: &str, warning_days: i32, timeout: Duration, now: DateTime<Utc>) -> ProbeResult {
    let (host, port) = split_host_port(target, 443);
    let config = match tls_config() {
        Ok(config) => config,
        Err(e) => return ProbeResult::down(e),
    };
    let server_name = match host.parse::<IpAddr>() {
        Ok(ip) => ServerName::IpAddress(ip.into()),
        Err(_) => match ServerName::try_from(host.clone()) {
            Ok(name) => name,
            Err(e) => return ProbeResult::down(format!("Invalid host '{host}': {e}")),
        },
    };

    let start = Instant::now();
    let handshake = async {
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| format!("Error: {e}"))?;
        TlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(|e| format!("TLS handshake failed: {e}"))
    };
    let tls_stream = match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return ProbeResult::down(e),
        Err(_) => return ProbeResult::down("Error: TLS handshake timed out"),
    };
    let response_time_ms = elapsed_ms(start);

    let (_, connection) = tls_stream.get_ref();
    let Some(leaf) = connection.peer_certificates().and_then(|certs| certs.first()) else {
        return ProbeResult::down("Server presented no certificate");
    };
    let not_after = match x509_parser::parse_x509_certificate(leaf.as_ref()) {
        Ok((_, cert)) => DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0),
        Err(e) => return ProbeResult::down(format!("Unparseable certificate: {e}")),
    };
    let Some(not_after) = not_after else {
        return ProbeResult::down("Certificate expiry is out of range");
    };

    match evaluate_certificate_expiry(not_after, now, warning_days) {
        Ok(days_left) => {
            debug!(host = %host, days_left, "Certificate is valid.");
            ProbeResult::up(response_time_ms)
        }
        Err(e) => ProbeResult {
            response_time_ms: Some(response_time_ms),
            ..ProbeResult::down(e)
        },
    }
}
