//! TLS configuration failures surface instead of falling back to plaintext.
//!
//! Installs a process-wide crypto provider, so it lives in its own test binary.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio_rustls::rustls::crypto::ring;
use wsboot::{native, ClientConnectionOptions, WebSocket, WebSocketError};

#[tokio::test]
async fn secure_scheme_with_broken_tls_config() {
    let mut provider = ring::default_provider();
    provider.cipher_suites.clear();
    provider.install_default().unwrap();
    assert!(native::tls_connector().is_err());

    let options = ClientConnectionOptions::new("wss://example.com/chat".parse().unwrap());
    assert!(options.tls.is_none());

    let called = Arc::new(AtomicBool::new(false));
    let setup = called.clone();
    let result = WebSocket::connect(options.on_setup(move |_, _| {
        setup.store(true, Ordering::SeqCst);
    }));

    assert!(matches!(result, Err(WebSocketError::Tls(_))));
    assert!(!called.load(Ordering::SeqCst));
}
