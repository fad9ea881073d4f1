//! Exercises the raw-relay simplification end to end: a "client" socket and
//! a dialed "upstream" socket are spliced together with
//! `proxy::relay::relay`, and bytes sent on one side arrive, byte-for-byte,
//! on the other — without either front-end touching a real database.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxypool::proxy::relay::{dial_upstream, relay};

async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if socket.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    });
    addr
}

#[tokio::test]
async fn relay_splices_client_and_upstream_bidirectionally() {
    let upstream_addr = spawn_echo_server().await;

    let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();

    let accept_task = tokio::spawn(async move {
        let (socket, _) = front_listener.accept().await.unwrap();
        socket
    });

    let mut external_client = TcpStream::connect(front_addr).await.unwrap();
    let client_side = accept_task.await.unwrap();

    let upstream_side = dial_upstream(&upstream_addr.ip().to_string(), upstream_addr.port())
        .await
        .unwrap();

    let relay_task = tokio::spawn(relay(client_side, upstream_side));

    external_client.write_all(b"hello upstream").await.unwrap();
    let mut buf = vec![0u8; 32];
    let n = external_client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello upstream");

    drop(external_client);
    let elapsed_ms = relay_task.await.unwrap().unwrap();
    assert!(elapsed_ms >= 0.0);
}
