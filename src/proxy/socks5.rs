use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::error::{ProxyPoolError, Result};
use crate::scheduler::Scheduler;
use crate::store::NodeStore;

use super::relay::{dial_upstream, relay};
use super::ConnectTarget;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// A request-parsing failure tagged with the reply code (if any) the
/// client should receive before the connection closes. `reply_code` is
/// `None` for a bad `VER` byte — RFC 1928 gives no reply frame to send
/// back when the version itself doesn't match.
struct RequestError {
    reply_code: Option<u8>,
    err: ProxyPoolError,
}

/// Handles one client connection speaking the RFC 1928 subset this
/// gateway supports: no-auth negotiation and the `CONNECT` command only
/// (`BIND`/`UDP ASSOCIATE` are rejected with `REP_COMMAND_NOT_SUPPORTED`).
pub async fn handle(
    mut client: TcpStream,
    store: Arc<NodeStore>,
    scheduler: Arc<dyn Scheduler>,
) -> Result<()> {
    negotiate_method(&mut client).await?;
    let target = match read_request(&mut client).await {
        Ok(target) => target,
        Err(req_err) => {
            if let Some(code) = req_err.reply_code {
                reply(&mut client, code).await.ok();
            }
            return Err(req_err.err);
        }
    };

    info!(host = %target.host, port = target.port, "socks5 CONNECT parsed");

    let node = match scheduler.pick(&store).await {
        Ok(node) => node,
        Err(e) => {
            reply(&mut client, REP_GENERAL_FAILURE).await.ok();
            return Err(e);
        }
    };

    let upstream = match dial_upstream(&node.host, node.port).await {
        Ok(stream) => stream,
        Err(e) => {
            reply(&mut client, REP_GENERAL_FAILURE).await.ok();
            scheduler.report_failure(&store, node.id).await.ok();
            return Err(e);
        }
    };

    reply(&mut client, REP_SUCCESS).await?;

    match relay(client, upstream).await {
        Ok(elapsed_ms) => {
            scheduler.report_success(&store, node.id, elapsed_ms).await?;
            Ok(())
        }
        Err(e) => {
            warn!(node_id = node.id, error = %e, "socks5 relay failed");
            scheduler.report_failure(&store, node.id).await.ok();
            Err(e)
        }
    }
}

async fn negotiate_method(client: &mut TcpStream) -> Result<()> {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await?;
    let [version, nmethods] = header;
    if version != VERSION {
        return Err(ProxyPoolError::ClientProtocol(format!(
            "unsupported socks version {version}"
        )));
    }

    let mut methods = vec![0u8; nmethods as usize];
    client.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        client.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    } else {
        client.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        Err(ProxyPoolError::ClientProtocol(
            "client offered no acceptable auth method".to_string(),
        ))
    }
}

async fn read_request(client: &mut TcpStream) -> std::result::Result<ConnectTarget, RequestError> {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).await.map_err(|e| RequestError {
        reply_code: None,
        err: e.into(),
    })?;
    let [version, cmd, _rsv, atyp] = header;

    if version != VERSION {
        return Err(RequestError {
            reply_code: None,
            err: ProxyPoolError::ClientProtocol(format!(
                "unsupported socks version {version} in request"
            )),
        });
    }
    if cmd != CMD_CONNECT {
        return Err(RequestError {
            reply_code: Some(REP_COMMAND_NOT_SUPPORTED),
            err: ProxyPoolError::ClientProtocol(format!("unsupported socks command {cmd}")),
        });
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.map_err(|e| RequestError {
                reply_code: None,
                err: e.into(),
            })?;
            Ipv4Addr::from(buf).to_string()
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            client.read_exact(&mut len_buf).await.map_err(|e| RequestError {
                reply_code: None,
                err: e.into(),
            })?;
            let mut name = vec![0u8; len_buf[0] as usize];
            client.read_exact(&mut name).await.map_err(|e| RequestError {
                reply_code: None,
                err: e.into(),
            })?;
            String::from_utf8(name).map_err(|e| RequestError {
                reply_code: None,
                err: ProxyPoolError::ClientProtocol(format!("invalid domain name: {e}")),
            })?
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            client.read_exact(&mut buf).await.map_err(|e| RequestError {
                reply_code: None,
                err: e.into(),
            })?;
            std::net::Ipv6Addr::from(buf).to_string()
        }
        other => {
            return Err(RequestError {
                reply_code: Some(REP_ADDRESS_TYPE_NOT_SUPPORTED),
                err: ProxyPoolError::ClientProtocol(format!("unsupported socks address type {other}")),
            })
        }
    };

    let mut port_buf = [0u8; 2];
    client.read_exact(&mut port_buf).await.map_err(|e| RequestError {
        reply_code: None,
        err: e.into(),
    })?;
    let port = u16::from_be_bytes(port_buf);

    Ok(ConnectTarget { host, port })
}

async fn reply(client: &mut TcpStream, rep: u8) -> Result<()> {
    let mut response = vec![VERSION, rep, 0x00, ATYP_IPV4];
    response.extend_from_slice(&[0, 0, 0, 0]);
    response.extend_from_slice(&[0, 0]);
    client.write_all(&response).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn reply_bytes_use_ipv4_zero_address() {
        // REP_SUCCESS reply layout: ver, rep, rsv, atyp, 4-byte addr, 2-byte port.
        let mut expected = vec![VERSION, REP_SUCCESS, 0x00, ATYP_IPV4];
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        assert_eq!(expected.len(), 10);
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        (client, accept.await.unwrap())
    }

    #[tokio::test]
    async fn unsupported_cmd_replies_command_not_supported() {
        let (mut client, mut server) = loopback_pair().await;
        client
            .write_all(&[VERSION, 0x02, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert_eq!(err.reply_code, Some(REP_COMMAND_NOT_SUPPORTED));
    }

    #[tokio::test]
    async fn unsupported_atyp_replies_address_type_not_supported() {
        let (mut client, mut server) = loopback_pair().await;
        client
            .write_all(&[VERSION, CMD_CONNECT, 0x00, 0x7F])
            .await
            .unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert_eq!(err.reply_code, Some(REP_ADDRESS_TYPE_NOT_SUPPORTED));
    }

    #[tokio::test]
    async fn bad_version_gets_no_reply_code() {
        let (mut client, mut server) = loopback_pair().await;
        client
            .write_all(&[0x04, CMD_CONNECT, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert_eq!(err.reply_code, None);
    }
}
