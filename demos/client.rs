/// Example client that performs the opening handshake and logs every incoming frame
///
/// Usage: cargo run --example client -- wss://echo.websocket.org/
use std::time::Duration;

use tokio::sync::mpsc;
use wsboot::{ClientConnectionOptions, WebSocket};

enum Event {
    Frame(String),
    Closed(Option<String>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    simple_logger::init_with_level(log::Level::Debug)?;

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org/".to_owned());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (setup_tx, setup_rx) = tokio::sync::oneshot::channel();
    let (payload_tx, shutdown_tx) = (tx.clone(), tx);

    let options = ClientConnectionOptions::new(url.parse()?)
        .with_header("User-Agent", "wsboot-demo")
        .on_setup(move |result, response| {
            log::info!("handshake finished with status {:?}", response.status());
            for header in response.headers() {
                log::debug!(
                    "{}: {}",
                    String::from_utf8_lossy(header.name),
                    String::from_utf8_lossy(header.value)
                );
            }
            let _ = setup_tx.send(result.map_err(|err| err.to_string()));
        })
        .on_shutdown(move |_ws, error| {
            let _ = shutdown_tx.send(Event::Closed(error.map(|err| err.to_string())));
        })
        .on_frame_begin(|_ws, frame| {
            log::debug!("{:?} frame, {} bytes", frame.opcode, frame.payload_length);
            true
        })
        .on_frame_payload(move |_ws, _frame, data| {
            let _ = payload_tx.send(Event::Frame(String::from_utf8_lossy(data).into_owned()));
            true
        })
        .on_frame_complete(|_ws, frame, error| {
            if let Some(err) = error {
                log::warn!("{:?} frame interrupted: {}", frame.opcode, err);
            }
            true
        });

    WebSocket::connect(options)?;

    let ws = match setup_rx.await? {
        Ok(ws) => ws,
        Err(err) => anyhow::bail!("handshake failed: {err}"),
    };
    log::info!("connected: {ws:?}");

    // Close after a while if the server stays quiet
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    let mut closing = false;

    loop {
        tokio::select! {
            _ = &mut deadline, if !closing => {
                log::debug!("closing");
                closing = true;
                ws.close();
            }
            event = rx.recv() => match event {
                Some(Event::Frame(text)) => log::info!("{text}"),
                Some(Event::Closed(error)) => {
                    log::info!("disconnected: {error:?}");
                    break;
                }
                None => break,
            }
        }
    }

    Ok(())
}
