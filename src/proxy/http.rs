use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};
use url::Url;

use crate::error::{ProxyPoolError, Result};
use crate::scheduler::Scheduler;
use crate::store::NodeStore;

use super::relay::{dial_upstream, relay};
use super::ConnectTarget;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// A parsed request: the resolved target, whether it was `CONNECT`, and
/// for the non-`CONNECT` case the origin-form request (request line plus
/// headers, with `proxy-*`/`Connection` stripped and `Connection: close`
/// appended) ready to replay to the upstream node.
struct ParsedRequest {
    target: ConnectTarget,
    is_connect: bool,
    rewritten: Option<Vec<u8>>,
}

/// Handles one client connection speaking either `CONNECT` tunneling or
/// plain absolute-form HTTP proxying. Like the SOCKS5 front-end, the
/// upstream leg is a raw TCP relay to the picked node, not a real
/// protocol-aware hop through it.
pub async fn handle(
    mut client: TcpStream,
    store: Arc<NodeStore>,
    scheduler: Arc<dyn Scheduler>,
) -> Result<()> {
    let header_bytes = match read_headers(&mut client).await {
        Ok(bytes) => bytes,
        Err(e) => {
            client.write_all(BAD_REQUEST).await.ok();
            return Err(e);
        }
    };
    let parsed = match parse_target(&header_bytes) {
        Ok(parsed) => parsed,
        Err(e) => {
            client.write_all(BAD_REQUEST).await.ok();
            return Err(e);
        }
    };
    let ParsedRequest {
        target,
        is_connect,
        rewritten,
    } = parsed;

    info!(host = %target.host, port = target.port, is_connect, "http proxy request parsed");

    let node = match scheduler.pick(&store).await {
        Ok(node) => node,
        Err(e) => {
            client.write_all(BAD_GATEWAY).await.ok();
            return Err(e);
        }
    };

    let mut upstream = match dial_upstream(&node.host, node.port).await {
        Ok(stream) => stream,
        Err(e) => {
            client.write_all(BAD_GATEWAY).await.ok();
            scheduler.report_failure(&store, node.id).await.ok();
            return Err(e);
        }
    };

    if is_connect {
        client.write_all(CONNECT_ESTABLISHED).await?;
    } else {
        let rewritten = rewritten.expect("non-CONNECT parse always produces a rewritten request");
        upstream.write_all(&rewritten).await?;
    }

    match relay(client, upstream).await {
        Ok(elapsed_ms) => {
            scheduler.report_success(&store, node.id, elapsed_ms).await?;
            Ok(())
        }
        Err(e) => {
            warn!(node_id = node.id, error = %e, "http proxy relay failed");
            scheduler.report_failure(&store, node.id).await.ok();
            Err(e)
        }
    }
}

/// Reads raw bytes from `client` until the `\r\n\r\n` header terminator,
/// returning everything read (request line + headers, verbatim, ready to
/// be replayed to the upstream node for the plain-HTTP case).
async fn read_headers(client: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyPoolError::ClientProtocol(
                "client closed connection before sending headers".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProxyPoolError::ClientProtocol(
                "request headers exceeded size limit".to_string(),
            ));
        }
    }
    Ok(buf)
}

fn parse_target(header_bytes: &[u8]) -> Result<ParsedRequest> {
    let text = std::str::from_utf8(header_bytes)
        .map_err(|e| ProxyPoolError::ClientProtocol(format!("non-utf8 request line: {e}")))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ProxyPoolError::ClientProtocol("empty request".to_string()))?;
    let header_lines: Vec<&str> = lines.take_while(|l| !l.is_empty()).collect();

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyPoolError::ClientProtocol("missing method".to_string()))?;
    let uri = parts
        .next()
        .ok_or_else(|| ProxyPoolError::ClientProtocol("missing request target".to_string()))?;
    let version = parts
        .next()
        .ok_or_else(|| ProxyPoolError::ClientProtocol("missing http version".to_string()))?;

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = uri
            .split_once(':')
            .ok_or_else(|| ProxyPoolError::ClientProtocol("CONNECT target missing port".to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyPoolError::ClientProtocol("CONNECT target has invalid port".to_string()))?;
        return Ok(ParsedRequest {
            target: ConnectTarget {
                host: host.to_string(),
                port,
            },
            is_connect: true,
            rewritten: None,
        });
    }

    let host_header = header_lines
        .iter()
        .find_map(|line| line.split_once(':'))
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.trim().to_string());

    // Absolute-form target (`GET http://host[:port]/path HTTP/1.1`) carries
    // its own authority; relative-form (`GET /path HTTP/1.1`) falls back to
    // the `Host:` header. Only when both are absent is this a 400.
    let (host, port, path) = if let Ok(url) = Url::parse(uri) {
        let host = url
            .host_str()
            .ok_or_else(|| ProxyPoolError::ClientProtocol("request target missing host".to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        (host, port, path)
    } else {
        let authority = host_header
            .as_deref()
            .ok_or_else(|| ProxyPoolError::ClientProtocol("request missing host".to_string()))?;
        let (host, port) = match authority.split_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse().map_err(|_| {
                    ProxyPoolError::ClientProtocol("Host header has invalid port".to_string())
                })?,
            ),
            None => (authority.to_string(), 80),
        };
        (host, port, uri.to_string())
    };

    let mut rewritten = format!("{method} {path} {version}\r\n").into_bytes();
    for line in &header_lines {
        let Some((name, _)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("connection") || name.to_ascii_lowercase().starts_with("proxy-") {
            continue;
        }
        rewritten.extend_from_slice(line.as_bytes());
        rewritten.extend_from_slice(b"\r\n");
    }
    rewritten.extend_from_slice(b"Connection: close\r\n\r\n");

    Ok(ParsedRequest {
        target: ConnectTarget { host, port },
        is_connect: false,
        rewritten: Some(rewritten),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_target() {
        let req = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let parsed = parse_target(req).unwrap();
        assert!(parsed.is_connect);
        assert_eq!(parsed.target.host, "example.com");
        assert_eq!(parsed.target.port, 443);
        assert!(parsed.rewritten.is_none());
    }

    #[test]
    fn parses_plain_get_target_with_default_port() {
        let req = b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let parsed = parse_target(req).unwrap();
        assert!(!parsed.is_connect);
        assert_eq!(parsed.target.host, "example.com");
        assert_eq!(parsed.target.port, 80);
    }

    #[test]
    fn relative_form_target_falls_back_to_host_header() {
        let req = b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let parsed = parse_target(req).unwrap();
        assert!(!parsed.is_connect);
        assert_eq!(parsed.target.host, "example.com");
        assert_eq!(parsed.target.port, 80);
        let rewritten = String::from_utf8(parsed.rewritten.unwrap()).unwrap();
        assert!(rewritten.starts_with("GET /path HTTP/1.1\r\n"));
    }

    #[test]
    fn missing_absolute_uri_and_host_header_is_rejected() {
        let req = b"GET /path HTTP/1.1\r\n\r\n";
        assert!(parse_target(req).is_err());
    }

    #[test]
    fn rewritten_request_strips_proxy_and_connection_headers() {
        let req = b"GET http://example.com/a?x=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic abc\r\nConnection: keep-alive\r\nAccept: */*\r\n\r\n";
        let parsed = parse_target(req).unwrap();
        let rewritten = String::from_utf8(parsed.rewritten.unwrap()).unwrap();
        assert!(rewritten.starts_with("GET /a?x=1 HTTP/1.1\r\n"));
        assert!(!rewritten.to_ascii_lowercase().contains("proxy-authorization"));
        assert!(!rewritten.to_ascii_lowercase().contains("connection: keep-alive"));
        assert!(rewritten.contains("Connection: close"));
        assert!(rewritten.contains("Accept: */*"));
    }
}
