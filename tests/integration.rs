//! End-to-end tests: client and server peers over in-memory connections.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use rsocket_core::transport::Connection;
use rsocket_core::{
    Client, ClientBuilder, DuplexSocket, ErrorCode, Payload, RSocketError, Responder,
    ServerBuilder,
};

/// Wire a client and a server together over an in-memory duplex stream.
async fn pair(server: ServerBuilder, client: ClientBuilder) -> (Client, DuplexSocket) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let server_socket = server.accept(Connection::from_io(b)).unwrap();
    let client = client
        .connection(Connection::from_io(a))
        .connect()
        .await
        .unwrap();
    (client, server_socket)
}

fn echo_server() -> ServerBuilder {
    ServerBuilder::new().acceptor(|_setup, _peer| {
        Ok(Responder::builder()
            .request_response(|payload| async move {
                let text = payload.data_utf8().unwrap_or("").to_string();
                Ok(Payload::builder()
                    .set_data_utf8(&format!("echo:{}", text))
                    .build())
            })
            .build())
    })
}

#[tokio::test]
async fn test_request_response_happy_path() {
    let server = ServerBuilder::new().acceptor(|_setup, _peer| {
        Ok(Responder::builder()
            .request_response(|payload| async move {
                assert_eq!(payload.data_utf8(), Some("ping"));
                assert_eq!(payload.metadata_utf8(), Some("hdr"));
                Ok(Payload::builder().set_data_utf8("pong").build())
            })
            .build())
    });
    let (client, _server_socket) = pair(server, Client::builder()).await;

    let response = client
        .request_response(
            Payload::builder()
                .set_data_utf8("ping")
                .set_metadata_utf8("hdr")
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(response.data_utf8(), Some("pong"));
    assert!(response.metadata().is_none());
    assert_eq!(client.live_streams(), 0);
}

#[tokio::test]
async fn test_request_stream_with_backpressure() {
    // Scenario: initial credit 2, the producer stalls until REQUEST_N.
    let server = ServerBuilder::new().acceptor(|_setup, _peer| {
        Ok(Responder::builder()
            .request_stream(|_payload, sink| async move {
                for word in ["a", "b", "c"] {
                    sink.next(Payload::builder().set_data_utf8(word).build())
                        .await?;
                }
                sink.complete().await
            })
            .build())
    });
    let (client, _server_socket) = pair(server, Client::builder()).await;

    let mut stream = client
        .request_stream_n(Payload::builder().set_data_utf8("go").build(), 2)
        .await
        .unwrap();

    let first = stream.next().await.unwrap().unwrap();
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(first.data_utf8(), Some("a"));
    assert_eq!(second.data_utf8(), Some("b"));

    // Credit exhausted: the third element must not arrive yet.
    let stalled = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
    assert!(stalled.is_err(), "producer must stall at zero credit");

    stream.request(1).await.unwrap();
    let third = stream.next().await.unwrap().unwrap();
    assert_eq!(third.data_utf8(), Some("c"));
    assert!(stream.next().await.is_none(), "stream completes after c");
}

#[tokio::test]
async fn test_cancellation_reaches_producer() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Result<(), String>>();
    let server = ServerBuilder::new().acceptor(move |_setup, _peer| {
        let seen_tx = seen_tx.clone();
        Ok(Responder::builder()
            .request_stream(move |_payload, sink| {
                let seen_tx = seen_tx.clone();
                async move {
                    // First element goes out under the initial credit.
                    sink.next(Payload::builder().set_data_utf8("one").build())
                        .await
                        .map_err(|e| {
                            let _ = seen_tx.send(Err(e.to_string()));
                            e
                        })?;
                    // Keep producing until the cancel lands.
                    loop {
                        match sink.next(Payload::builder().set_data_utf8("more").build()).await
                        {
                            Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
                            Err(e) => {
                                let _ = seen_tx.send(Err(e.to_string()));
                                return Ok(());
                            }
                        }
                    }
                }
            })
            .build())
    });
    let (client, _server_socket) = pair(server, Client::builder()).await;

    let mut stream = client
        .request_stream_n(Payload::builder().set_data_utf8("go").build(), 1)
        .await
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.data_utf8(), Some("one"));

    stream.cancel().await;
    assert_eq!(client.live_streams(), 0);

    // The producer's next() observes the cancellation.
    let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, Err("Canceled".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_timeout_closes_connection() {
    // Scenario: keepalive 500ms, lifetime 1500ms, silent peer.
    let (a, b) = tokio::io::duplex(1024 * 1024);
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel::<bool>();

    let client = Client::builder()
        .connection(Connection::from_io(a))
        .keepalive(Duration::from_millis(500))
        .max_lifetime(Duration::from_millis(1500))
        .on_close(move |reason| {
            let timed_out = matches!(reason, Some(RSocketError::KeepaliveTimeout));
            let _ = closed_tx.send(timed_out);
        })
        .connect()
        .await
        .unwrap();

    // An in-flight request observes the connection error.
    let socket = client.socket();
    let pending = tokio::spawn(async move {
        socket
            .request_response(Payload::builder().set_data_utf8("ping").build())
            .await
    });

    client.closed().await;
    assert!(client.is_closed());
    assert!(closed_rx.await.unwrap(), "close reason is keepalive timeout");

    let result = pending.await.unwrap();
    match result {
        Err(RSocketError::Remote { code, .. }) => assert_eq!(code, ErrorCode::ConnectionError),
        other => panic!("expected connection error, got {:?}", other.map(|_| ())),
    }

    // The silent half stays alive until here.
    drop(b);
}

#[tokio::test]
async fn test_fragmentation_roundtrip() {
    // Scenario: payload split over a FOLLOWS chain arrives as one delivery.
    let big_data = "abcdefgh".repeat(100);
    let expected = big_data.clone();
    let server = ServerBuilder::new().fragment_mtu(64).acceptor(move |_setup, _peer| {
        let big_data = big_data.clone();
        Ok(Responder::builder()
            .request_response(move |payload| {
                let big_data = big_data.clone();
                async move {
                    assert_eq!(payload.data_utf8(), Some("want-big"));
                    Ok(Payload::builder()
                        .set_data_utf8(&big_data)
                        .set_metadata_utf8("m1")
                        .build())
                }
            })
            .build())
    });
    let (client, _server_socket) = pair(server, Client::builder().fragment_mtu(64)).await;

    let response = client
        .request_response(Payload::builder().set_data_utf8("want-big").build())
        .await
        .unwrap();

    assert_eq!(response.data_utf8(), Some(expected.as_str()));
    assert_eq!(response.metadata_utf8(), Some("m1"));
}

#[tokio::test]
async fn test_malformed_cancel_closes_connection() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut a, b) = tokio::io::duplex(64 * 1024);
    let _server_socket = echo_server().accept(Connection::from_io(b)).unwrap();

    // Valid SETUP first.
    let setup = rsocket_core::frame::Frame {
        stream_id: 0,
        body: rsocket_core::frame::FrameBody::Setup {
            version: rsocket_core::frame::VERSION,
            keepalive_millis: 20_000,
            max_lifetime_millis: 90_000,
            lease: false,
            resume_token: None,
            metadata_mime: "application/octet-stream".to_string(),
            data_mime: "application/octet-stream".to_string(),
            payload: Payload::empty(),
        },
    };
    a.write_all(&rsocket_core::frame::encode_prefixed(&setup))
        .await
        .unwrap();

    // CANCEL with a 4-byte body: malformed.
    let header = rsocket_core::frame::FrameHeader::new(1, rsocket_core::frame::FrameType::Cancel, 0);
    let mut bad = Vec::new();
    bad.extend_from_slice(&[0, 0, 10]); // 24-bit length prefix: 6 + 4
    bad.extend_from_slice(&header.encode());
    bad.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
    a.write_all(&bad).await.unwrap();
    a.flush().await.unwrap();

    // The server answers ERROR(CONNECTION_ERROR) on stream 0 and closes.
    let mut buffer = rsocket_core::frame::FrameBuffer::new();
    let mut raw = vec![0u8; 4096];
    let error_frame = loop {
        let n = a.read(&mut raw).await.unwrap();
        assert!(n > 0, "connection ended without an ERROR frame");
        if let Some(frame) = buffer.push(&raw[..n]).unwrap().into_iter().next() {
            break frame;
        }
    };
    assert_eq!(error_frame.stream_id, 0);
    match error_frame.body {
        rsocket_core::frame::FrameBody::Error { code, .. } => {
            assert_eq!(code, ErrorCode::ConnectionError);
        }
        other => panic!("expected ERROR frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fire_and_forget_delivers() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
    let server = ServerBuilder::new().acceptor(move |_setup, _peer| {
        let seen_tx = seen_tx.clone();
        Ok(Responder::builder()
            .fire_and_forget(move |payload| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(payload.data_utf8().unwrap_or("").to_string());
                }
            })
            .build())
    });
    let (client, _server_socket) = pair(server, Client::builder()).await;

    client
        .fire_and_forget(Payload::builder().set_data_utf8("hint").build())
        .await
        .unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, "hint");
    assert_eq!(client.live_streams(), 0);
}

#[tokio::test]
async fn test_metadata_push_delivers() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Bytes>();
    let server = ServerBuilder::new().acceptor(move |_setup, _peer| {
        let seen_tx = seen_tx.clone();
        Ok(Responder::builder()
            .metadata_push(move |metadata| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(metadata);
                }
            })
            .build())
    });
    let (client, _server_socket) = pair(server, Client::builder()).await;

    client
        .metadata_push(Bytes::from_static(b"routing-hint"))
        .await
        .unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&seen[..], b"routing-hint");
}

#[tokio::test]
async fn test_request_channel_echo() {
    let server = ServerBuilder::new().acceptor(|_setup, _peer| {
        Ok(Responder::builder()
            .request_channel(|mut incoming, sink| async move {
                while let Some(item) = incoming.next().await {
                    let payload = item?;
                    let text = payload.data_utf8().unwrap_or("").to_uppercase();
                    sink.next(Payload::builder().set_data_utf8(&text).build())
                        .await?;
                }
                sink.complete().await
            })
            .build())
    });
    let (client, _server_socket) = pair(server, Client::builder()).await;

    let (sink, mut incoming) = client
        .request_channel(Payload::builder().set_data_utf8("one").build())
        .await
        .unwrap();

    sink.next(Payload::builder().set_data_utf8("two").build())
        .await
        .unwrap();
    sink.complete().await.unwrap();

    let first = incoming.next().await.unwrap().unwrap();
    let second = incoming.next().await.unwrap().unwrap();
    assert_eq!(first.data_utf8(), Some("ONE"));
    assert_eq!(second.data_utf8(), Some("TWO"));
    assert!(incoming.next().await.is_none(), "channel completes");
}

#[tokio::test]
async fn test_stream_error_terminates_only_that_stream() {
    let server = ServerBuilder::new().acceptor(|_setup, _peer| {
        Ok(Responder::builder()
            .request_response(|payload| async move {
                match payload.data_utf8() {
                    Some("boom") => Err(RSocketError::Protocol("kaboom".to_string())),
                    _ => Ok(Payload::builder().set_data_utf8("fine").build()),
                }
            })
            .build())
    });
    let (client, _server_socket) = pair(server, Client::builder()).await;

    let failed = client
        .request_response(Payload::builder().set_data_utf8("boom").build())
        .await;
    match failed {
        Err(RSocketError::Remote { code, .. }) => {
            assert_eq!(code, ErrorCode::ApplicationError)
        }
        other => panic!("expected application error, got {:?}", other.map(|_| ())),
    }

    // The connection survives; other requests keep working.
    let ok = client
        .request_response(Payload::builder().set_data_utf8("hello").build())
        .await
        .unwrap();
    assert_eq!(ok.data_utf8(), Some("fine"));
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_unhandled_request_rejected_with_application_error() {
    let server = ServerBuilder::new().acceptor(|_setup, _peer| Ok(Responder::empty()));
    let (client, _server_socket) = pair(server, Client::builder()).await;

    let result = client
        .request_response(Payload::builder().set_data_utf8("anyone?").build())
        .await;
    match result {
        Err(RSocketError::Remote { code, message }) => {
            assert_eq!(code, ErrorCode::ApplicationError);
            assert!(message.contains("unsupported"));
        }
        other => panic!("expected application error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_server_initiated_request_uses_even_ids() {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel::<Payload>();
    let reply_tx = std::sync::Mutex::new(Some(reply_tx));
    let server = ServerBuilder::new().acceptor(move |_setup, peer| {
        if let Some(reply_tx) = reply_tx.lock().unwrap().take() {
            tokio::spawn(async move {
                let reply = peer
                    .request_response(Payload::builder().set_data_utf8("who?").build())
                    .await
                    .unwrap();
                let _ = reply_tx.send(reply);
            });
        }
        Ok(Responder::empty())
    });

    let client = Client::builder();
    let client = client.responder(
        Responder::builder()
            .request_response(|_payload| async move {
                Ok(Payload::builder().set_data_utf8("the-client").build())
            })
            .build(),
    );
    let (_client, _server_socket) = pair(server, client).await;

    let reply = tokio::time::timeout(Duration::from_secs(5), reply_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.data_utf8(), Some("the-client"));
}

#[tokio::test]
async fn test_lease_gates_requests() {
    let server = ServerBuilder::new().acceptor(|setup, peer| {
        assert!(setup.lease, "client declared lease support");
        tokio::spawn(async move {
            peer.send_lease(Duration::from_secs(30), 1, None)
                .await
                .unwrap();
        });
        Ok(Responder::builder()
            .request_response(|payload| async move { Ok(payload) })
            .build())
    });
    let (client, _server_socket) = pair(server, Client::builder().lease()).await;

    // Wait for the LEASE frame to land.
    let payload = Payload::builder().set_data_utf8("x").build();
    let mut granted = None;
    for _ in 0..100 {
        match client.request_response(payload.clone()).await {
            Ok(response) => {
                granted = Some(response);
                break;
            }
            Err(RSocketError::RejectedByLease) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert!(granted.is_some(), "lease arrived and admitted one request");

    // Budget of 1 is spent: the next request fails locally.
    let second = client.request_response(payload).await;
    assert!(matches!(second, Err(RSocketError::RejectedByLease)));
}

#[tokio::test]
async fn test_resume_rejected_by_server_without_session() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let _server_socket = echo_server().accept(Connection::from_io(b)).unwrap();
    let client = Client::builder()
        .connection(Connection::from_io(a))
        .resume_token(Bytes::from_static(b"session-token"))
        .connect()
        .await
        .unwrap();

    // Sanity: the resumable connection works.
    let echo = client
        .request_response(Payload::builder().set_data_utf8("hi").build())
        .await
        .unwrap();
    assert_eq!(echo.data_utf8(), Some("echo:hi"));

    // Attach attempt against a server that keeps no sessions.
    let (c, d) = tokio::io::duplex(64 * 1024);
    let _second_server = echo_server().accept(Connection::from_io(d)).unwrap();
    let result = client.resume_with(Connection::from_io(c)).await;
    match result {
        Err(RSocketError::Remote { code, .. }) => {
            assert_eq!(code, ErrorCode::RejectedResume)
        }
        other => panic!("expected REJECTED_RESUME, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_dropping_stream_cancels_on_wire() {
    let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel::<()>();
    let server = ServerBuilder::new().acceptor(move |_setup, _peer| {
        let cancel_tx = cancel_tx.clone();
        Ok(Responder::builder()
            .request_stream(move |_payload, sink| {
                let cancel_tx = cancel_tx.clone();
                async move {
                    loop {
                        if sink
                            .next(Payload::builder().set_data_utf8("tick").build())
                            .await
                            .is_err()
                        {
                            let _ = cancel_tx.send(());
                            return Ok(());
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            })
            .build())
    });
    let (client, _server_socket) = pair(server, Client::builder()).await;

    let mut stream = client
        .request_stream_n(Payload::builder().set_data_utf8("go").build(), 4)
        .await
        .unwrap();
    let _first = stream.next().await.unwrap().unwrap();
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), cancel_rx.recv())
        .await
        .expect("producer observes cancellation")
        .unwrap();
    assert_eq!(client.live_streams(), 0);
}
