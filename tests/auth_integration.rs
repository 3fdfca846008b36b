//! Integration tests for the D-Bus SASL handshake.
//!
//! These drive a running broker over real sockets and verify the
//! EXTERNAL dialogue: inline-UID auth, busctl-style challenge-response,
//! rejected mechanisms and the fd-negotiation refusal.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use minibusd::auth::encode_uid;
use minibusd::Broker;

/// Start a broker on a temp-directory Unix socket and connect to it.
async fn connect_to_broker() -> (UnixStream, JoinHandle<()>) {
    let mut broker = Broker::new();
    let address = broker.add_temp_unix_listener().await.expect("bind broker");
    let handle = tokio::spawn(async move {
        let _ = broker.run().await;
    });
    let path = address.strip_prefix("unix:path=").unwrap().to_string();
    let stream = UnixStream::connect(path).await.expect("connect");
    (stream, handle)
}

/// Read one `\r\n`-terminated response line.
async fn read_response(stream: &mut UnixStream) -> String {
    let mut buf = vec![0u8; 256];
    let mut response = String::new();
    loop {
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        if n == 0 {
            panic!("Unexpected EOF while reading response");
        }
        response.push_str(&String::from_utf8_lossy(&buf[..n]));
        if response.contains('\n') {
            break;
        }
    }
    response.trim_end_matches('\n').trim_end_matches('\r').to_string()
}

#[tokio::test]
async fn test_external_auth_success() {
    let (mut stream, _broker) = connect_to_broker().await;

    stream.write_all(&[0u8]).await.unwrap();
    let line = format!("AUTH EXTERNAL {}\r\n", encode_uid(1000));
    stream.write_all(line.as_bytes()).await.unwrap();

    let response = read_response(&mut stream).await;
    assert!(response.starts_with("OK "), "expected OK, got: {}", response);
    let guid = response.strip_prefix("OK ").unwrap();
    assert_eq!(guid.len(), 32);
    assert!(guid.chars().all(|c| c.is_ascii_hexdigit()));

    stream.write_all(b"BEGIN\r\n").await.unwrap();
}

#[tokio::test]
async fn test_external_auth_challenge_response() {
    let (mut stream, _broker) = connect_to_broker().await;

    stream.write_all(&[0u8]).await.unwrap();
    // busctl style: AUTH EXTERNAL without initial response data.
    stream.write_all(b"AUTH EXTERNAL\r\n").await.unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response, "DATA");

    let line = format!("DATA {}\r\n", encode_uid(1000));
    stream.write_all(line.as_bytes()).await.unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("OK "), "expected OK, got: {}", response);

    stream.write_all(b"BEGIN\r\n").await.unwrap();
}

#[tokio::test]
async fn test_unknown_mechanism_rejected() {
    let (mut stream, _broker) = connect_to_broker().await;

    stream.write_all(&[0u8]).await.unwrap();
    stream.write_all(b"AUTH DBUS_COOKIE_SHA1 xyz\r\n").await.unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response, "REJECTED EXTERNAL");

    // The client can retry with a supported mechanism.
    let line = format!("AUTH EXTERNAL {}\r\n", encode_uid(1000));
    stream.write_all(line.as_bytes()).await.unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("OK "));
}

#[tokio::test]
async fn test_fd_negotiation_is_refused() {
    let (mut stream, _broker) = connect_to_broker().await;

    stream.write_all(&[0u8]).await.unwrap();
    let line = format!("AUTH EXTERNAL {}\r\n", encode_uid(1000));
    stream.write_all(line.as_bytes()).await.unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("OK "));

    stream.write_all(b"NEGOTIATE_UNIX_FD\r\n").await.unwrap();
    let response = read_response(&mut stream).await;
    assert!(response.starts_with("ERROR"), "expected ERROR, got: {}", response);

    // BEGIN still completes the handshake afterwards.
    stream.write_all(b"BEGIN\r\n").await.unwrap();
}

#[tokio::test]
async fn test_same_listener_advertises_one_guid() {
    let mut broker = Broker::new();
    let address = broker.add_temp_unix_listener().await.unwrap();
    let _broker = tokio::spawn(async move {
        let _ = broker.run().await;
    });
    let path = address.strip_prefix("unix:path=").unwrap().to_string();

    let mut guids = Vec::new();
    for _ in 0..2 {
        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(&[0u8]).await.unwrap();
        let line = format!("AUTH EXTERNAL {}\r\n", encode_uid(1000));
        stream.write_all(line.as_bytes()).await.unwrap();
        let response = read_response(&mut stream).await;
        guids.push(response.strip_prefix("OK ").unwrap().to_string());
    }
    assert_eq!(guids[0], guids[1]);
}
