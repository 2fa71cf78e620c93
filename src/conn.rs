//! Connection handler. Per-client state machine: classify the first chunk,
//! then either relay plaintext HTTP or mediate a MITM HTTPS tunnel.
//! Grounded in `examples/Distracted-E421-nixos-cursor`'s
//! `handle_connection`/`handle_stream` split (one task per accepted
//! socket, classify-then-dispatch) and in
//! `original_source/proxy_tool/proxy_core.py`'s `handle_client`/
//! `handle_https`/`handle_http`/`relay` for the actual state machine.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{RewriteProfile, ShapingProfile};
use crate::doh::DohOutcome;
use crate::error::{ProxyError, ProxyResult};
use crate::mock::MockEngine;
use crate::rewrite;
use crate::shaping;
use crate::state::ProxyState;

const INITIAL_READ_SIZE: usize = 4096;
const RELAY_CHUNK_SIZE: usize = 4096;

/// Handles one accepted client socket end-to-end. Errors are caught and
/// logged here; they never propagate to the listener.
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, state: Arc<ProxyState>) {
    let conn_id = state.next_conn_id();
    if let Err(e) = dispatch(stream, peer_addr, conn_id, &state).await {
        state.logs.warn(format!("[{conn_id}] connection error: {e}"));
    }
}

async fn dispatch(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    conn_id: u64,
    state: &Arc<ProxyState>,
) -> ProxyResult<()> {
    let mut buf = vec![0u8; INITIAL_READ_SIZE];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    buf.truncate(n);

    let text = String::from_utf8_lossy(&buf);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| ProxyError::ClientProtocol("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::ClientProtocol("missing method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::ClientProtocol("missing target".into()))?
        .to_string();

    state
        .logs
        .debug(format!("[{conn_id}] {peer_addr} classified as {method} {target}"));

    if method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(stream, &target, conn_id, state).await
    } else {
        handle_http(stream, &method, &target, &buf, conn_id, state).await
    }
}

/// Splits a raw request-head chunk into a header map and an optional body
/// string, for archival. Best-effort: a malformed header line is skipped
/// rather than failing the request.
fn parse_headers_and_body(text: &str) -> (HashMap<String, String>, Option<String>) {
    let lines: Vec<&str> = text.split("\r\n").collect();
    let header_end = lines.iter().position(|l| l.is_empty());
    let header_lines_end = header_end.unwrap_or(lines.len());

    let mut headers = HashMap::new();
    for line in &lines[1..header_lines_end] {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_string(), v.trim().to_string());
        }
    }

    let body = header_end
        .map(|idx| lines[idx + 1..].join("\r\n"))
        .filter(|b| !b.is_empty());

    (headers, body)
}

fn extract_host_from_headers(text: &str) -> Option<(String, u16)> {
    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        let lower = line.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("host:") {
            let value = line[line.len() - rest.len()..].trim();
            return Some(split_host_port(value, 80));
        }
    }
    None
}

fn split_host_port(value: &str, default_port: u16) -> (String, u16) {
    match value.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            (host.to_string(), port.parse().unwrap())
        }
        _ => (value.to_string(), default_port),
    }
}

async fn resolve_target(host: &str, conn_id: u64, state: &Arc<ProxyState>) -> ProxyResult<IpAddr> {
    if let Some(doh) = &state.doh {
        match doh.resolve_with_outcome(host).await {
            Ok((ips, DohOutcome::Resolved)) => {
                if !state.config.privacy_mode {
                    state
                        .logs
                        .info(format!("[{conn_id}] DoH resolved {host} -> {}", ips[0]));
                }
                return Ok(IpAddr::V4(ips[0]));
            }
            Ok((ips, DohOutcome::FellBackToSystem)) => {
                if state.config.privacy_mode {
                    state.logs.warn(format!("[{conn_id}] DoH resolution failed, used system resolver"));
                } else {
                    state.logs.warn(format!(
                        "[{conn_id}] DoH resolution failed for {host}, used system resolver"
                    ));
                }
                return Ok(IpAddr::V4(ips[0]));
            }
            Err(e) => return Err(e),
        }
    }

    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|_| ProxyError::ResolutionFailed(host.to_string()))?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| ProxyError::ResolutionFailed(host.to_string()))
}

/// Forward-HTTP path: plain (non-`CONNECT`) absolute-URI requests.
async fn handle_http(
    mut client: TcpStream,
    method: &str,
    target: &str,
    initial_chunk: &[u8],
    conn_id: u64,
    state: &Arc<ProxyState>,
) -> ProxyResult<()> {
    let text = String::from_utf8_lossy(initial_chunk);

    let (host, port) = parse_target_uri(target)
        .or_else(|| extract_host_from_headers(&text))
        .ok_or_else(|| ProxyError::ClientProtocol("no Host available".into()))?;

    if state.config.privacy_mode {
        state.logs.info(format!("[{conn_id}] HTTP request to {host}"));
    } else {
        state
            .logs
            .info(format!("[{conn_id}] HTTP request to {host}:{port} - {target}"));
    }

    if let Some(store) = &state.store {
        let (headers, body) = parse_headers_and_body(&text);
        if let Err(e) = store
            .save(chrono::Utc::now(), method, target, &headers, body.as_deref())
            .await
        {
            state.logs.warn(format!("[{conn_id}] failed to archive request: {e}"));
        }
    }

    if let Some(response) = state.mock.match_url(target) {
        state.logs.info(format!("[{conn_id}] mock hit for {target}"));
        let bytes = MockEngine::render(response);
        client.write_all(&bytes).await?;
        client.flush().await?;
        return Ok(());
    }

    let ip = resolve_target(&host, conn_id, state).await?;
    let mut upstream = shaping::connect_upstream(SocketAddr::new(ip, port), &state.config.shaping)
        .await
        .map_err(|source| ProxyError::UpstreamConnectFailed {
            host: host.clone(),
            port,
            source,
        })?;

    let rewritten = rewrite::modify(initial_chunk, &state.config.rewrite);
    shaping::send(&mut upstream, &rewritten, &state.config.shaping).await?;

    let (client_r, client_w) = client.into_split();
    let (upstream_r, upstream_w) = upstream.into_split();
    relay(
        client_r,
        client_w,
        upstream_r,
        upstream_w,
        Some(&state.config.rewrite),
        &state.config.shaping,
    )
    .await;

    Ok(())
}

fn parse_target_uri(target: &str) -> Option<(String, u16)> {
    let url = url::Url::parse(target).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    Some((host, port))
}

/// CONNECT/MITM path: terminate the client's TLS session locally, open a
/// fresh TLS session to the real origin, and relay between the two.
async fn handle_connect(
    mut client: TcpStream,
    target: &str,
    conn_id: u64,
    state: &Arc<ProxyState>,
) -> ProxyResult<()> {
    let (host, port) = target
        .rsplit_once(':')
        .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
        .ok_or_else(|| ProxyError::ClientProtocol(format!("invalid CONNECT target: {target}")))?;

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    client.flush().await?;

    let (cert_path, key_path) = state.ca.get_leaf(&host).await?;
    let server_config = build_server_tls_config(&cert_path, &key_path)
        .await
        .map_err(|e| ProxyError::TlsHandshakeFailed(e.to_string()))?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let client_tls = match acceptor.accept(client).await {
        Ok(s) => s,
        Err(e) => {
            state
                .logs
                .warn(format!("[{conn_id}] client TLS handshake failed for {host}: {e}"));
            return Ok(());
        }
    };

    let ip = resolve_target(&host, conn_id, state).await?;
    let upstream_tcp = shaping::connect_upstream(SocketAddr::new(ip, port), &state.config.shaping)
        .await
        .map_err(|source| ProxyError::UpstreamConnectFailed {
            host: host.clone(),
            port,
            source,
        })?;

    let client_config = build_client_tls_config();
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from(host.clone())
        .map_err(|_| ProxyError::TlsHandshakeFailed(format!("invalid server name {host}")))?;

    let upstream_tls = match connector.connect(server_name, upstream_tcp).await {
        Ok(s) => s,
        Err(e) => {
            state
                .logs
                .warn(format!("[{conn_id}] upstream TLS handshake failed for {host}: {e}"));
            return Ok(());
        }
    };

    let (client_r, client_w) = tokio::io::split(client_tls);
    let (upstream_r, upstream_w) = tokio::io::split(upstream_tls);
    relay(
        client_r,
        client_w,
        upstream_r,
        upstream_w,
        Some(&state.config.rewrite),
        &state.config.shaping,
    )
    .await;

    Ok(())
}

async fn build_server_tls_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> std::io::Result<rustls::ServerConfig> {
    let cert_pem = tokio::fs::read(cert_path).await?;
    let key_pem = tokio::fs::read(key_path).await?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key in PEM"))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn build_client_tls_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Two cooperative pipes. `client -> upstream` is rewritten and shaped per
/// `rewrite`/`shaping`; `upstream -> client` is a straight copy — responses
/// are never mutated.
async fn relay<CR, CW, UR, UW>(
    mut client_r: CR,
    mut client_w: CW,
    mut upstream_r: UR,
    mut upstream_w: UW,
    rewrite_profile: Option<&RewriteProfile>,
    shaping_profile: &ShapingProfile,
) where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let client_to_upstream = async {
        let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
        loop {
            let n = match client_r.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let chunk = match rewrite_profile {
                Some(profile) => rewrite::modify(&buf[..n], profile),
                None => buf[..n].to_vec(),
            };
            if shaping::send(&mut upstream_w, &chunk, shaping_profile)
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = upstream_w.shutdown().await;
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
        loop {
            let n = match upstream_r.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if client_w.write_all(&buf[..n]).await.is_err() || client_w.flush().await.is_err() {
                break;
            }
        }
        let _ = client_w.shutdown().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
}
