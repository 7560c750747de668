//! HTTP request primitives shared by the orchestrator and connection services.

use base64::prelude::*;
use bytes::Bytes;
use hyper::{header, Method};
use url::{Host, Url};

use crate::{stream::StreamListener, Result, WebSocketError};

/// A borrowed HTTP header.
///
/// Names and values are raw bytes: header data received off the wire is not guaranteed to be
/// UTF-8, and the handshake core copies it byte for byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header<'a> {
    pub name: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> Header<'a> {
    pub const fn new(name: &'a [u8], value: &'a [u8]) -> Self {
        Self { name, value }
    }

    /// Returns `true` if this header's name matches `name`, ignoring ASCII case.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }
}

/// An owned HTTP header, as supplied by the caller in the connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: Bytes,
    pub value: Bytes,
}

impl HttpHeader {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn as_header(&self) -> Header<'_> {
        Header::new(&self.name, &self.value)
    }
}

/// A request to be sent over an HTTP connection.
///
/// Path and headers are borrowed: a connection that needs them beyond the call to
/// [`make_request`](crate::connection::HttpConnection::make_request) must copy them.
pub struct HttpRequestOptions<'a> {
    pub method: Method,
    pub path: &'a [u8],
    pub headers: &'a [Header<'a>],
    /// Receives the response callbacks for this request.
    pub listener: Box<dyn StreamListener>,
}

/// Returns the path-and-query component of `url`, which is the request target of the
/// upgrade request. Fragments are never sent.
pub fn path_and_query(url: &Url) -> &str {
    let target = &url[url::Position::BeforePath..url::Position::AfterQuery];
    if target.is_empty() {
        "/"
    } else {
        target
    }
}

/// Returns the host name to dial for `url`, without IPv6 brackets.
pub fn host_name(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Ipv6(addr) => Some(addr.to_string()),
        host => Some(host.to_string()),
    }
}

/// Builds the standard client handshake headers for `url`.
///
/// The handshake core sends headers verbatim and never adds any on its own; this helper produces
/// the set RFC 6455 requires: `Host`, `Upgrade`, `Connection`, `Sec-WebSocket-Key` (16 random
/// bytes, base64) and `Sec-WebSocket-Version: 13`.
///
/// # Errors
/// Returns [`WebSocketError::InvalidArgument`] if `url` has no host.
pub fn handshake_headers(url: &Url) -> Result<Vec<HttpHeader>> {
    let host = url
        .host_str()
        .ok_or(WebSocketError::InvalidArgument("uri has no host"))?;

    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };

    Ok(vec![
        HttpHeader::new(header::HOST.as_str(), host_header),
        HttpHeader::new(header::UPGRADE.as_str(), "websocket"),
        HttpHeader::new(header::CONNECTION.as_str(), "Upgrade"),
        HttpHeader::new(header::SEC_WEBSOCKET_KEY.as_str(), generate_key()),
        HttpHeader::new(header::SEC_WEBSOCKET_VERSION.as_str(), "13"),
    ])
}

fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_and_query() {
        let url: Url = "ws://example.com/chat?room=1#frag".parse().unwrap();
        assert_eq!(path_and_query(&url), "/chat?room=1");

        let url: Url = "wss://example.com".parse().unwrap();
        assert_eq!(path_and_query(&url), "/");
    }

    #[test]
    fn test_host_name() {
        let url: Url = "ws://[::1]:9000/".parse().unwrap();
        assert_eq!(host_name(&url).as_deref(), Some("::1"));

        let url: Url = "ws://example.com/".parse().unwrap();
        assert_eq!(host_name(&url).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_handshake_headers() {
        let url: Url = "ws://example.com:9000/chat".parse().unwrap();
        let headers = handshake_headers(&url).unwrap();

        let find = |name: &str| {
            headers
                .iter()
                .find(|h| h.as_header().is(name))
                .map(|h| h.value.clone())
        };

        assert_eq!(find("host").as_deref(), Some(&b"example.com:9000"[..]));
        assert_eq!(find("upgrade").as_deref(), Some(&b"websocket"[..]));
        assert_eq!(find("sec-websocket-version").as_deref(), Some(&b"13"[..]));

        let key = find("sec-websocket-key").unwrap();
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), 16);
    }

    #[test]
    fn test_handshake_headers_default_port_omitted() {
        let url: Url = "wss://example.com/chat".parse().unwrap();
        let headers = handshake_headers(&url).unwrap();
        assert_eq!(headers[0].value, Bytes::from_static(b"example.com"));
    }
}
