//! End-to-end handshakes against a raw local TCP server.

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
};
use wsboot::{frame::OpCode, ClientConnectionOptions, WebSocket, WebSocketError};

const UPGRADE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

#[derive(Debug)]
enum Event {
    Setup {
        result: Result<WebSocket, String>,
        status: Option<u16>,
        upgrade: Option<Vec<u8>>,
    },
    Begin(OpCode),
    Payload(Vec<u8>),
    Complete(OpCode, bool),
    Shutdown(Option<String>),
}

/// Accepts one connection, answers the request head with `response` and returns the request.
async fn serve(response: Vec<u8>) -> (u16, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up before sending the request");
            request.extend_from_slice(&buf[..n]);
        }

        socket.write_all(&response).await.unwrap();
        // hold the socket until the client lets go
        while let Ok(n) = socket.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }

        String::from_utf8(request).unwrap()
    });

    (port, server)
}

fn options(url: &str, events: mpsc::UnboundedSender<Event>) -> ClientConnectionOptions {
    let (setup, shutdown) = (events.clone(), events.clone());
    let (begin, payload, complete) = (events.clone(), events.clone(), events);

    ClientConnectionOptions::new(url.parse().unwrap())
        .on_setup(move |result, response| {
            let _ = setup.send(Event::Setup {
                result: result.map_err(|err| err.to_string()),
                status: response.status().map(|s| s.as_u16()),
                upgrade: response.header("upgrade").map(<[u8]>::to_vec),
            });
        })
        .on_shutdown(move |_ws, error| {
            let _ = shutdown.send(Event::Shutdown(error.map(|err| err.to_string())));
        })
        .on_frame_begin(move |_ws, frame| {
            let _ = begin.send(Event::Begin(frame.opcode));
            true
        })
        .on_frame_payload(move |_ws, _frame, data| {
            let _ = payload.send(Event::Payload(data.to_vec()));
            true
        })
        .on_frame_complete(move |_ws, frame, error| {
            let _ = complete.send(Event::Complete(frame.opcode, error.is_some()));
            true
        })
}

async fn next(events: &mut mpsc::UnboundedReceiver<Event>) -> Option<Event> {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
}

#[tokio::test]
async fn upgrade_then_frames_then_close() {
    let mut response = UPGRADE.to_vec();
    response.extend_from_slice(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);
    response.extend_from_slice(&[0x88, 0x02, 0x03, 0xE8]);
    let (port, server) = serve(response).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    WebSocket::connect(options(&format!("ws://127.0.0.1:{port}/chat?room=1"), tx)).unwrap();

    match next(&mut rx).await {
        Some(Event::Setup {
            result,
            status,
            upgrade,
        }) => {
            assert!(result.is_ok());
            assert_eq!(status, Some(101));
            assert_eq!(upgrade.as_deref(), Some(&b"websocket"[..]));
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(matches!(next(&mut rx).await, Some(Event::Begin(OpCode::Text))));
    match next(&mut rx).await {
        Some(Event::Payload(data)) => assert_eq!(data, b"hello"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        next(&mut rx).await,
        Some(Event::Complete(OpCode::Text, false))
    ));

    assert!(matches!(next(&mut rx).await, Some(Event::Begin(OpCode::Close))));
    let mut event = next(&mut rx).await;
    while let Some(Event::Payload(_)) = event {
        event = next(&mut rx).await;
    }
    assert!(matches!(event, Some(Event::Complete(OpCode::Close, false))));
    assert!(matches!(next(&mut rx).await, Some(Event::Shutdown(None))));

    let request = server.await.unwrap();
    assert!(request.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
    let lower = request.to_ascii_lowercase();
    assert!(lower.contains("upgrade: websocket\r\n"));
    assert!(lower.contains("sec-websocket-version: 13\r\n"));
    assert!(lower.contains(&format!("host: 127.0.0.1:{port}\r\n")));
}

#[tokio::test]
async fn upgrade_refused() {
    let (port, _server) =
        serve(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Reason: nope\r\n\r\nno".to_vec()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    WebSocket::connect(options(&format!("ws://127.0.0.1:{port}/"), tx)).unwrap();

    match next(&mut rx).await {
        Some(Event::Setup { result, status, .. }) => {
            let err = result.unwrap_err();
            assert_eq!(
                err,
                WebSocketError::UpgradeFailure(Some(hyper::StatusCode::OK)).to_string()
            );
            assert_eq!(status, Some(200));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // no shutdown, no frames, and every callback has been released
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (tx, mut rx) = mpsc::unbounded_channel();
    WebSocket::connect(options(&format!("ws://127.0.0.1:{port}/"), tx)).unwrap();

    match next(&mut rx).await {
        Some(Event::Setup { result, status, .. }) => {
            assert!(result.is_err());
            assert_eq!(status, None);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn manual_read_window() {
    let mut response = UPGRADE.to_vec();
    response.extend_from_slice(&[0x82, 0x05, 1, 2, 3, 4, 5]);
    response.extend_from_slice(&[0x88, 0x00]);
    let (port, _server) = serve(response).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = options(&format!("ws://127.0.0.1:{port}/"), tx)
        .with_initial_window_size(3)
        .with_manual_window_management();
    WebSocket::connect(options).unwrap();

    let ws = match next(&mut rx).await {
        Some(Event::Setup {
            result: Ok(ws), ..
        }) => ws,
        other => panic!("unexpected event {other:?}"),
    };

    assert!(matches!(next(&mut rx).await, Some(Event::Begin(OpCode::Binary))));
    match next(&mut rx).await {
        Some(Event::Payload(data)) => assert_eq!(data, [1, 2, 3]),
        other => panic!("unexpected event {other:?}"),
    }

    // the window is spent, nothing else arrives
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(ws.read_window(), 0);

    ws.increment_read_window(16);
    match next(&mut rx).await {
        Some(Event::Payload(data)) => assert_eq!(data, [4, 5]),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        next(&mut rx).await,
        Some(Event::Complete(OpCode::Binary, false))
    ));
    assert!(matches!(next(&mut rx).await, Some(Event::Begin(OpCode::Close))));
    assert!(matches!(
        next(&mut rx).await,
        Some(Event::Complete(OpCode::Close, false))
    ));
    assert!(matches!(next(&mut rx).await, Some(Event::Shutdown(None))));
    assert_eq!(ws.read_window(), 14);
}

#[tokio::test]
async fn close_from_setup_callback() {
    let (port, _server) = serve(UPGRADE.to_vec()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (setup, shutdown) = (tx.clone(), tx);
    let options = ClientConnectionOptions::new(format!("ws://127.0.0.1:{port}/").parse().unwrap())
        .on_setup(move |result, _response| {
            if let Ok(ws) = &result {
                ws.close();
            }
            let _ = setup.send(Event::Setup {
                result: result.map_err(|err| err.to_string()),
                status: None,
                upgrade: None,
            });
        })
        .on_shutdown(move |_ws, error| {
            let _ = shutdown.send(Event::Shutdown(error.map(|err| err.to_string())));
        });
    WebSocket::connect(options).unwrap();

    assert!(matches!(
        next(&mut rx).await,
        Some(Event::Setup { result: Ok(_), .. })
    ));
    assert!(matches!(next(&mut rx).await, Some(Event::Shutdown(None))));
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn response_headers_are_grouped_by_name() {
    let (port, _server) = serve(
        b"HTTP/1.1 101 Switching Protocols\r\n\
        X-A: 1\r\n\
        Upgrade: websocket\r\n\
        X-A: 3\r\n\
        Connection: Upgrade\r\n\r\n"
            .to_vec(),
    )
    .await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    let options = ClientConnectionOptions::new(format!("ws://127.0.0.1:{port}/").parse().unwrap())
        .on_setup(move |result, response| {
            let headers: Vec<String> = response
                .headers()
                .iter()
                .map(|h| {
                    format!(
                        "{}: {}",
                        String::from_utf8_lossy(h.name),
                        String::from_utf8_lossy(h.value)
                    )
                })
                .collect();
            let _ = tx.send((result.is_ok(), headers));
        });
    WebSocket::connect(options).unwrap();

    let (ok, headers) = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(ok);
    assert_eq!(
        headers,
        ["x-a: 1", "x-a: 3", "upgrade: websocket", "connection: Upgrade"]
    );
}
