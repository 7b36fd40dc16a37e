//! HTTP upgrade handshake
//!
//! covers both directions of the opening handshake: computing and checking
//! `Sec-WebSocket-Accept`, emitting the switching-protocols response and the
//! client upgrade request, and parsing the peer's side with bounded buffers

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::errors::WsError;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// handshake buffer hard limit, larger heads force-close the socket
pub(crate) const MAX_HANDSHAKE: usize = 5 * 1024;

/// exact length of a base64-encoded 16-byte nonce
pub(crate) const SEC_KEY_LEN: usize = 24;

/// name stamped into the `Server` response header
pub(crate) const SERVER_NAME: &str = "ws-hub";

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Ws,
    Wss,
}

impl Mode {
    pub fn default_port(&self) -> u16 {
        match self {
            Mode::Ws => 80,
            Mode::Wss => 443,
        }
    }
}

/// parsed `ws://` / `wss://` endpoint address
#[derive(Debug)]
pub(crate) struct WsUri {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl WsUri {
    /// parse a websocket uri, path defaults to `/`, query is dropped
    pub fn parse(uri: &str) -> Result<Self, WsError> {
        let uri: http::Uri = uri
            .parse()
            .map_err(|_| WsError::InvalidUri(uri.to_string()))?;
        let mode = match uri.scheme_str() {
            Some("ws") => Mode::Ws,
            Some("wss") => Mode::Wss,
            Some(s) => return Err(WsError::InvalidUri(format!("unknown scheme {s}"))),
            None => return Err(WsError::InvalidUri("missing scheme".into())),
        };
        let host = uri
            .host()
            .ok_or_else(|| WsError::InvalidUri("missing host".into()))?
            .to_string();
        let port = uri.port_u16().unwrap_or_else(|| mode.default_port());
        Ok(Self {
            mode,
            host,
            port,
            path: uri.path().to_string(),
        })
    }
}

/// random 16-byte nonce for `Sec-WebSocket-Key`
pub fn gen_key() -> String {
    let r: [u8; 16] = rand::random();
    BASE64.encode(r)
}

/// `Sec-WebSocket-Accept` for the given key
pub fn cal_accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(GUID);
    BASE64.encode(sha1.finalize())
}

/// index one past the `\r\n\r\n` head terminator
pub(crate) fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// fields extracted from a client's upgrade request
#[derive(Debug)]
pub(crate) struct UpgradeRequest {
    pub sec_key: String,
    /// offered extensions, never negotiated
    pub extensions: Option<String>,
}

/// parse the server-side upgrade request head
pub(crate) fn parse_upgrade_request(head: &[u8]) -> Result<UpgradeRequest, WsError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(head)
        .map_err(|_| WsError::HandShakeFailed("invalid request".to_string()))?;
    let mut sec_key = None;
    let mut extensions = None;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("sec-websocket-key") {
            sec_key = std::str::from_utf8(header.value).ok().map(str::to_string);
        } else if header.name.eq_ignore_ascii_case("sec-websocket-extensions") {
            extensions = std::str::from_utf8(header.value).ok().map(str::to_string);
        }
    }
    match sec_key {
        Some(key) if key.len() == SEC_KEY_LEN => Ok(UpgradeRequest {
            sec_key: key,
            extensions,
        }),
        Some(key) => Err(WsError::HandShakeFailed(format!(
            "sec-websocket-key must be {SEC_KEY_LEN} bytes, got {}",
            key.len()
        ))),
        None => Err(WsError::HandShakeFailed(
            "missing sec-websocket-key".to_string(),
        )),
    }
}

/// check the client-side upgrade response head for upgrade intent
pub(crate) fn check_upgrade_response(head: &[u8]) -> Result<(), WsError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers);
    resp.parse(head)
        .map_err(|_| WsError::HandShakeFailed("invalid response".to_string()))?;
    let upgraded = resp.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("upgrade")
            && std::str::from_utf8(h.value)
                .map(|v| v.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
    });
    if upgraded {
        Ok(())
    } else {
        Err(WsError::HandShakeFailed(
            "missing upgrade header or invalid header value".to_string(),
        ))
    }
}

/// the switching-protocols response, extensions stripped
pub(crate) fn switching_protocols(sec_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Server: {SERVER_NAME}\r\n\r\n",
        cal_accept_key(sec_key.as_bytes())
    )
}

/// the client upgrade request head
pub(crate) fn upgrade_request(path: &str, host: &str, key: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    format!(
        "GET {path} HTTP/1.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Host: {host}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}
