
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harness::{credentialed, FailingForwarder, SniffHandle, PASSWORD, TEST_TIMEOUT};
use portshare_ingress::{
    Header, ListenerConfig, ListenerError, MemoryValidator, SniffConfig, SniffingListener,
    HEADER_LEN,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Read from `conn` until the HTTP-style blank line.
async fn read_request<R: AsyncReadExt + Unpin>(conn: &mut R) -> std::io::Result<Vec<u8>> {
    let mut request = Vec::new();
    let mut buf = [0u8; 256];
    while !request.ends_with(b"\r\n\r\n") {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
    }
    Ok(request)
}

#[tokio::test]
async fn credentialed_connection_is_forwarded_with_payload_first() {
    let sniff = SniffHandle::spawn().await.unwrap();

    let response = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(sniff.addr).await?;
        client
            .write_all(&credentialed(PASSWORD, b"hello through the tunnel\n"))
            .await?;

        let mut response = Vec::new();
        client.read_to_end(&mut response).await?;
        Ok::<_, std::io::Error>(response)
    })
    .await
    .expect("timed out")
    .unwrap();

    assert_eq!(response, b"hello through the tunnel\n");

    sniff.wait_settled(1).await;
    let stats = sniff.listener.stats();
    assert_eq!(stats.forwarded.load(Ordering::Relaxed), 1);
    assert_eq!(stats.delivered.load(Ordering::Relaxed), 0);
    assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 25);

    let traffic = sniff
        .validator
        .traffic(&Header::from_password(PASSWORD))
        .unwrap();
    assert_eq!(traffic.read, 25);
    assert_eq!(traffic.written, 25);
}

#[tokio::test]
async fn http_request_is_returned_verbatim_through_accept() {
    let sniff = SniffHandle::spawn().await.unwrap();
    let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";

    let mut client = TcpStream::connect(sniff.addr).await.unwrap();
    client.write_all(request).await.unwrap();

    let mut conn = timeout(TEST_TIMEOUT, sniff.listener.accept())
        .await
        .expect("timed out")
        .unwrap();
    let received = read_request(&mut conn).await.unwrap();
    assert_eq!(received, request);

    conn.write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
        .await
        .unwrap();
    conn.shutdown().await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"HTTP/1.1 204 No Content\r\n\r\n");

    assert!(sniff.forwarder.sessions().is_empty());
    assert_eq!(sniff.listener.stats().delivered.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn invalid_credential_yields_full_prefix_then_payload() {
    let sniff = SniffHandle::spawn().await.unwrap();

    let mut sent = vec![b'a'; HEADER_LEN];
    sent.extend_from_slice(b"\r\nPING");

    let mut client = TcpStream::connect(sniff.addr).await.unwrap();
    client.write_all(&sent).await.unwrap();

    let mut conn = timeout(TEST_TIMEOUT, sniff.listener.accept())
        .await
        .expect("timed out")
        .unwrap();

    let mut received = vec![0u8; 62];
    conn.read_exact(&mut received).await.unwrap();
    assert_eq!(received, sent);

    // Later bytes follow the replayed prefix directly.
    client.write_all(b"PONG").await.unwrap();
    let mut more = [0u8; 4];
    conn.read_exact(&mut more).await.unwrap();
    assert_eq!(&more, b"PONG");
}

#[tokio::test]
async fn peer_hanging_up_mid_header_is_dropped() {
    let sniff = SniffHandle::spawn().await.unwrap();

    let mut client = TcpStream::connect(sniff.addr).await.unwrap();
    client.write_all(b"no newline and then gone").await.unwrap();
    drop(client);

    sniff.wait_settled(1).await;
    assert_eq!(sniff.listener.stats().disconnected.load(Ordering::Relaxed), 1);

    let accepted = timeout(Duration::from_millis(100), sniff.listener.accept()).await;
    assert!(accepted.is_err(), "nothing should be delivered");
}

#[tokio::test]
async fn silent_peer_is_delivered_after_sniff_timeout() {
    let config = ListenerConfig::new()
        .with_sniff(SniffConfig::default().with_timeout(Duration::from_millis(100)));
    let sniff = SniffHandle::spawn_with(config).await.unwrap();

    let mut client = TcpStream::connect(sniff.addr).await.unwrap();
    client.write_all(b"SSH-2.0").await.unwrap();

    let mut conn = timeout(TEST_TIMEOUT, sniff.listener.accept())
        .await
        .expect("timed out")
        .unwrap();

    let mut received = [0u8; 7];
    conn.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"SSH-2.0");
}

#[tokio::test]
async fn unrepresentable_sniff_timeout_still_settles_connections() {
    let config =
        ListenerConfig::new().with_sniff(SniffConfig::default().with_timeout(Duration::MAX));
    let sniff = SniffHandle::spawn_with(config).await.unwrap();
    let request = b"GET / HTTP/1.1\r\n\r\n";

    let mut client = TcpStream::connect(sniff.addr).await.unwrap();
    client.write_all(request).await.unwrap();

    let mut conn = timeout(TEST_TIMEOUT, sniff.listener.accept())
        .await
        .expect("timed out")
        .unwrap();
    let received = read_request(&mut conn).await.unwrap();
    assert_eq!(received, request);
    assert_eq!(sniff.listener.stats().settled(), 1);
}

#[tokio::test]
async fn full_queue_does_not_stall_other_connections() {
    let config = ListenerConfig::new().with_queue_capacity(1);
    let sniff = SniffHandle::spawn_with(config).await.unwrap();

    // Nobody calls accept: one fills the queue, the rest wait on it.
    let mut waiting = Vec::new();
    for i in 0..4 {
        let mut client = TcpStream::connect(sniff.addr).await.unwrap();
        client
            .write_all(format!("GET /{} HTTP/1.1\r\n\r\n", i).as_bytes())
            .await
            .unwrap();
        waiting.push(client);
    }
    let filled = timeout(TEST_TIMEOUT, async {
        while sniff.listener.stats().delivered.load(Ordering::Relaxed) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(filled.is_ok());

    let response = timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(sniff.addr).await?;
        client.write_all(&credentialed(PASSWORD, b"hi\n")).await?;

        let mut response = Vec::new();
        client.read_to_end(&mut response).await?;
        Ok::<_, std::io::Error>(response)
    })
    .await
    .expect("credentialed client stalled behind the full queue")
    .unwrap();
    assert_eq!(response, b"hi\n");

    let stats = sniff.listener.stats();
    assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 5);
    assert_eq!(stats.delivered.load(Ordering::Relaxed), 1);
    drop(waiting);
}

#[tokio::test]
async fn close_is_idempotent_and_final() {
    let sniff = SniffHandle::spawn().await.unwrap();

    sniff.listener.close().unwrap();
    sniff.listener.close().unwrap();

    for _ in 0..3 {
        let err = sniff.listener.accept().await.unwrap_err();
        assert!(matches!(err, ListenerError::Closed));
    }

    // The dispatch loop drops the raw socket once it sees the close.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(sniff.addr).await.is_err());
}

#[tokio::test]
async fn pending_deliveries_are_closed_when_listener_closes() {
    let config = ListenerConfig::new().with_queue_capacity(1);
    let sniff = SniffHandle::spawn_with(config).await.unwrap();

    let mut clients = Vec::new();
    for i in 0..3 {
        let mut client = TcpStream::connect(sniff.addr).await.unwrap();
        client
            .write_all(format!("hello {}\n", i).as_bytes())
            .await
            .unwrap();
        clients.push(client);
    }

    // One fills the queue; the other two wait on it.
    let filled = timeout(TEST_TIMEOUT, async {
        while sniff.listener.stats().delivered.load(Ordering::Relaxed) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(filled.is_ok());
    tokio::time::sleep(Duration::from_millis(50)).await;

    sniff.listener.close().unwrap();
    sniff.wait_settled(3).await;

    let stats = sniff.listener.stats();
    assert_eq!(stats.delivered.load(Ordering::Relaxed), 1);
    assert_eq!(stats.closed_on_shutdown.load(Ordering::Relaxed), 2);

    for mut client in clients {
        let mut rest = Vec::new();
        let read = timeout(TEST_TIMEOUT, client.read_to_end(&mut rest)).await;
        assert!(read.is_ok(), "client should observe the close");
    }
}

#[tokio::test]
async fn forwarder_errors_are_absorbed() {
    harness::init_tracing();
    let listener = SniffingListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(MemoryValidator::with_passwords([PASSWORD])),
        Arc::new(FailingForwarder),
        ListenerConfig::new().with_verbose(true),
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&credentialed(PASSWORD, b"payload\n"))
        .await
        .unwrap();

    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .expect("timed out")
        .unwrap();
    assert!(rest.is_empty());

    harness::wait_settled(&listener, 1).await;
    let stats = listener.stats();
    assert_eq!(stats.forwarded.load(Ordering::Relaxed), 1);
    assert_eq!(stats.forward_errors.load(Ordering::Relaxed), 1);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Kind {
    Valid,
    Invalid,
    HangUp,
}

#[tokio::test]
async fn every_connection_reaches_exactly_one_owner() {
    const CLIENTS: usize = 48;
    let sniff = SniffHandle::spawn().await.unwrap();

    // Serve delivered connections: record the tag, answer, close.
    let delivered_tags = Arc::new(Mutex::new(Vec::new()));
    let server = {
        let listener = Arc::clone(&sniff.listener);
        let tags = Arc::clone(&delivered_tags);
        tokio::spawn(async move {
            while let Ok(mut conn) = listener.accept().await {
                let tags = Arc::clone(&tags);
                tokio::spawn(async move {
                    let request = read_request(&mut conn).await.unwrap();
                    tags.lock().unwrap().push(request);
                    conn.write_all(b"ok").await.unwrap();
                    conn.shutdown().await.unwrap();
                });
            }
        })
    };

    let kinds: Vec<Kind> = (0..CLIENTS)
        .map(|i| match i % 3 {
            0 => Kind::Valid,
            1 => Kind::Invalid,
            _ => Kind::HangUp,
        })
        .collect();

    let mut clients = Vec::new();
    for (i, kind) in kinds.iter().copied().enumerate() {
        let addr = sniff.addr;
        clients.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await?;
            let mut response = Vec::new();
            match kind {
                Kind::Valid => {
                    let payload = format!("tag-{}\n", i);
                    client
                        .write_all(&credentialed(PASSWORD, payload.as_bytes()))
                        .await?;
                    client.read_to_end(&mut response).await?;
                    assert_eq!(response, payload.as_bytes());
                }
                Kind::Invalid => {
                    let request = format!("GET /tag-{} HTTP/1.1\r\n\r\n", i);
                    client.write_all(request.as_bytes()).await?;
                    client.read_to_end(&mut response).await?;
                    assert_eq!(response, b"ok");
                }
                Kind::HangUp => {
                    client.write_all(format!("tag-{}", i).as_bytes()).await?;
                }
            }
            Ok::<_, std::io::Error>(())
        }));
    }

    for client in clients {
        timeout(TEST_TIMEOUT, client)
            .await
            .expect("client timed out")
            .unwrap()
            .unwrap();
    }
    sniff.wait_settled(CLIENTS as u64).await;

    let expected = |want: Kind, render: fn(usize) -> Vec<u8>| -> HashSet<Vec<u8>> {
        kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == want)
            .map(|(i, _)| render(i))
            .collect()
    };

    let forwarded = sniff.forwarder.sessions();
    let forwarded_set: HashSet<_> = forwarded.iter().cloned().collect();
    assert_eq!(forwarded.len(), forwarded_set.len(), "duplicate forward");
    assert_eq!(
        forwarded_set,
        expected(Kind::Valid, |i| format!("tag-{}\n", i).into_bytes())
    );

    let delivered = delivered_tags.lock().unwrap().clone();
    let delivered_set: HashSet<_> = delivered.iter().cloned().collect();
    assert_eq!(delivered.len(), delivered_set.len(), "duplicate delivery");
    assert_eq!(
        delivered_set,
        expected(Kind::Invalid, |i| {
            format!("GET /tag-{} HTTP/1.1\r\n\r\n", i).into_bytes()
        })
    );

    let stats = sniff.listener.stats();
    let hang_ups = kinds.iter().filter(|k| **k == Kind::HangUp).count() as u64;
    assert_eq!(stats.disconnected.load(Ordering::Relaxed), hang_ups);
    assert_eq!(stats.closed_on_shutdown.load(Ordering::Relaxed), 0);
    assert_eq!(
        stats.connections_accepted.load(Ordering::Relaxed),
        CLIENTS as u64
    );
    assert_eq!(stats.settled(), CLIENTS as u64);

    sniff.listener.close().unwrap();
    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
}
