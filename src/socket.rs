//! per-connection record
//!
//! a socket is one arena slot: its I/O object, the per-state data for the
//! HTTP → WebSocket progression, the outbound queue and the group links.
//! the state data is swapped wholesale on every transition so no observer
//! can see a half-initialized connection.

use std::any::Any;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mio::net::TcpListener;
use rustls::ServerConfig;

use crate::codec::FrameDecoder;
use crate::frame::PreparedMessage;
use crate::group::{RoleKind, UserToken};
use crate::transport::Transport;

/// default server handshake timeout, also applied to the close handshake
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// invoked when the message leaves the queue, `true` means cancelled
pub(crate) type SendCallback = Box<dyn FnOnce(bool)>;

/// bytes owned by one queued message
pub(crate) enum MsgBuf {
    /// exclusive buffer, returned to the node pool after the send
    Pooled(Vec<u8>),
    /// broadcast frame shared across recipients
    Prepared(Rc<PreparedMessage>),
}

impl MsgBuf {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            MsgBuf::Pooled(v) => v,
            MsgBuf::Prepared(p) => p.bytes(),
        }
    }
}

pub(crate) struct OutMessage {
    pub buf: MsgBuf,
    /// bytes already on the wire, only meaningful on the queue head
    pub sent: usize,
    pub on_complete: Option<SendCallback>,
}

/// accumulation state while a connection is still HTTP
#[derive(Default)]
pub(crate) struct HttpData {
    /// bounded head buffer, overflow closes the socket
    pub buf: BytesMut,
    pub path: String,
    pub host: String,
    pub token: UserToken,
}

/// state of an established websocket
pub(crate) struct WsData {
    pub decoder: FrameDecoder,
    pub user_data: Option<Box<dyn Any>>,
    pub token: Option<UserToken>,
    /// a close frame went out, no further sends are accepted
    pub close_sent: bool,
    /// close result to report once the echo drains
    pub pending_close: Option<(u16, Vec<u8>)>,
}

impl WsData {
    pub fn new(masked_inbound: bool) -> Self {
        Self {
            decoder: FrameDecoder::new(masked_inbound),
            user_data: None,
            token: None,
            close_sent: false,
            pending_close: None,
        }
    }
}

pub(crate) enum SocketState {
    /// accepting socket owned by a server group
    Listening {
        tls: Option<Arc<ServerConfig>>,
        port: u16,
    },
    /// client TCP (and TLS) connect still in flight
    Connecting(HttpData),
    /// server side waiting for the upgrade request
    HttpServer(HttpData),
    /// client side waiting for the upgrade response
    HttpClient(HttpData),
    /// upgrade complete, frames flowing
    Ws(WsData),
}

pub(crate) enum SocketIo {
    Listener(TcpListener),
    Stream(Transport),
}

impl SocketIo {
    pub fn source(&mut self) -> &mut dyn mio::event::Source {
        match self {
            SocketIo::Listener(l) => l,
            SocketIo::Stream(t) => t.stream_mut(),
        }
    }

    pub fn transport_mut(&mut self) -> Option<&mut Transport> {
        match self {
            SocketIo::Listener(_) => None,
            SocketIo::Stream(t) => Some(t),
        }
    }
}

pub(crate) struct Socket {
    pub io: SocketIo,
    pub state: SocketState,
    pub role: RoleKind,
    /// owning group id
    pub group: usize,
    pub queue: VecDeque<OutMessage>,
    /// tick deadline swept by the node timer
    pub deadline: Option<Instant>,
    /// group member list links
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub in_list: bool,
    /// WRITE interest currently registered
    pub want_write: bool,
    /// terminal, no handlers fire and no writes succeed
    pub closed: bool,
}

impl Socket {
    pub fn new(io: SocketIo, state: SocketState, role: RoleKind, group: usize) -> Self {
        Self {
            io,
            state,
            role,
            group,
            queue: VecDeque::new(),
            deadline: None,
            prev: None,
            next: None,
            in_list: false,
            want_write: false,
            closed: false,
        }
    }

    pub fn ws(&self) -> Option<&WsData> {
        match &self.state {
            SocketState::Ws(ws) => Some(ws),
            _ => None,
        }
    }

    pub fn ws_mut(&mut self) -> Option<&mut WsData> {
        match &mut self.state {
            SocketState::Ws(ws) => Some(ws),
            _ => None,
        }
    }

    pub fn http_mut(&mut self) -> Option<&mut HttpData> {
        match &mut self.state {
            SocketState::Connecting(h) | SocketState::HttpServer(h) | SocketState::HttpClient(h) => {
                Some(h)
            }
            _ => None,
        }
    }

    /// token carried by a not-yet-established client socket
    pub fn pending_token(&self) -> Option<UserToken> {
        match &self.state {
            SocketState::Connecting(h) | SocketState::HttpClient(h) => Some(h.token),
            _ => None,
        }
    }
}
