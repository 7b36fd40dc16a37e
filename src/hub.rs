//! hub: listen, connect, upgrade and the event loop
//!
//! the hub bundles a node with a default server group and a default client
//! group. `run` drives the poller until no registered sockets remain. all
//! handler callbacks execute synchronously on the loop thread; actions a
//! handler takes are applied immediately while the resulting notifications
//! (disconnections) are queued and delivered right after the callback
//! returns, which keeps per-socket ordering exact and dispatch non-reentrant.

use std::any::Any;
use std::io;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::ControlFlow;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream as MioTcpStream};
use rustls::ServerConfig;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};

use crate::codec::Event;
use crate::errors::{ProtocolError, WsError};
use crate::frame::{encode_close_payload, OpCode, PreparedMessage, MAX_CONTROL_PAYLOAD};
use crate::group::{AnyHandler, Client, Group, Handler, Role, RoleKind, Server, UserToken};
use crate::node::{Node, Notice};
use crate::poller::Readiness;
use crate::protocol::{
    check_upgrade_response, find_head_end, gen_key, parse_upgrade_request, switching_protocols,
    upgrade_request, Mode, WsUri, MAX_HANDSHAKE, SEC_KEY_LEN,
};
use crate::socket::{
    HttpData, SendCallback, Socket, SocketIo, SocketState, WsData, HANDSHAKE_TIMEOUT,
};
use crate::transport::{Transfer, Transport};

/// default client connect-and-handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// top-level endpoint object: one loop, a default group per role
pub struct Hub {
    node: Node,
    server_group: Group<Server>,
    client_group: Group<Client>,
}

impl Hub {
    /// create a hub with its own poller and default groups
    pub fn new() -> Result<Self, WsError> {
        let mut node = Node::new()?;
        let server_group = Group::new(node.create_group(RoleKind::Server));
        let client_group = Group::new(node.create_group(RoleKind::Client));
        Ok(Self {
            node,
            server_group,
            client_group,
        })
    }

    /// the default server group
    pub fn server_group(&self) -> Group<Server> {
        self.server_group
    }

    /// the default client group
    pub fn client_group(&self) -> Group<Client> {
        self.client_group
    }

    /// create an additional group sharing this hub's loop
    pub fn create_group<R: Role>(&mut self) -> Group<R> {
        Group::new(self.node.create_group(R::KIND))
    }

    /// install the handler for a group, replacing any previous one
    pub fn set_handler<R: Role>(&mut self, group: Group<R>, handler: impl Handler<R> + 'static) {
        assert_eq!(self.node.groups[group.id].kind, R::KIND);
        self.node.groups[group.id].handler = Some(R::wrap(Box::new(handler)));
    }

    /// install the default server group's handler
    pub fn on_server(&mut self, handler: impl Handler<Server> + 'static) {
        let group = self.server_group;
        self.set_handler(group, handler);
    }

    /// install the default client group's handler
    pub fn on_client(&mut self, handler: impl Handler<Client> + 'static) {
        let group = self.client_group;
        self.set_handler(group, handler);
    }

    /// listen for plain websocket connections on the default server group
    pub fn listen(&mut self, port: u16) -> bool {
        self.listen_with(port, None, None)
    }

    /// listen on `0.0.0.0:port`, optionally terminating TLS
    ///
    /// returns false and fires the group's error handler with the port on
    /// bind or listen failure
    pub fn listen_with(
        &mut self,
        port: u16,
        tls: Option<Arc<ServerConfig>>,
        group: Option<Group<Server>>,
    ) -> bool {
        let gid = group.map(|g| g.id).unwrap_or(self.server_group.id);
        match bind_listener(port) {
            Ok(listener) => {
                let socket = Socket::new(
                    SocketIo::Listener(listener),
                    SocketState::Listening { tls, port },
                    RoleKind::Server,
                    gid,
                );
                match self.node.insert_socket(socket, false) {
                    Ok(sid) => {
                        self.node.groups[gid].listeners.push(sid);
                        tracing::debug!("listening on port {port}");
                        true
                    }
                    Err(e) => {
                        tracing::debug!("failed to register listener on {port}: {e}");
                        self.node.dispatch_server_error(gid, port);
                        false
                    }
                }
            }
            Err(e) => {
                tracing::debug!("listen on port {port} failed: {e}");
                self.node.dispatch_server_error(gid, port);
                false
            }
        }
    }

    /// connect to `ws://host[:port]/path` or `wss://...` with defaults
    pub fn connect(&mut self, uri: &str, token: UserToken) {
        self.connect_with(uri, token, DEFAULT_CONNECT_TIMEOUT_MS, None)
    }

    /// connect with an explicit timeout and target group
    ///
    /// failures before a websocket exists (bad uri, dns, refused, timeout,
    /// non-upgrade response) surface through the group's error handler with
    /// `token`; no connection handler ever fires for them
    pub fn connect_with(
        &mut self,
        uri: &str,
        token: UserToken,
        timeout_ms: u64,
        group: Option<Group<Client>>,
    ) {
        let gid = group.map(|g| g.id).unwrap_or(self.client_group.id);
        let target = match WsUri::parse(uri) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!("connect rejected: {e}");
                return self.node.dispatch_client_error(gid, token);
            }
        };
        let addr = match (target.host.as_str(), target.port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    tracing::debug!("no address for host {}", target.host);
                    return self.node.dispatch_client_error(gid, token);
                }
            },
            Err(e) => {
                tracing::debug!("dns lookup for {} failed: {e}", target.host);
                return self.node.dispatch_client_error(gid, token);
            }
        };
        let stream = match MioTcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("connect to {addr} failed: {e}");
                return self.node.dispatch_client_error(gid, token);
            }
        };
        let transport = match target.mode {
            Mode::Wss => {
                let config = self.node.client_tls();
                match Transport::tls_client(stream, config, &target.host) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::debug!("tls client setup failed: {e}");
                        return self.node.dispatch_client_error(gid, token);
                    }
                }
            }
            Mode::Ws => Transport::plain(stream),
        };
        let data = HttpData {
            path: target.path,
            host: target.host,
            token,
            ..Default::default()
        };
        let mut socket = Socket::new(
            SocketIo::Stream(transport),
            SocketState::Connecting(data),
            RoleKind::Client,
            gid,
        );
        socket.deadline = Some(Instant::now() + Duration::from_millis(timeout_ms));
        if let Err(e) = self.node.insert_socket(socket, true) {
            tracing::debug!("failed to register connecting socket: {e}");
            self.node.dispatch_client_error(gid, token);
        }
    }

    /// adopt a connection whose upgrade request was read elsewhere
    ///
    /// emits the accept response computed from `sec_key` and places the
    /// socket straight into websocket state on the chosen group
    pub fn upgrade(
        &mut self,
        stream: std::net::TcpStream,
        sec_key: &str,
        tls: Option<Arc<ServerConfig>>,
        extensions: &str,
        group: Option<Group<Server>>,
    ) -> bool {
        let gid = group.map(|g| g.id).unwrap_or(self.server_group.id);
        if sec_key.len() != SEC_KEY_LEN {
            return false;
        }
        if !extensions.is_empty() {
            tracing::trace!("ignoring offered extensions: {extensions}");
        }
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let stream = MioTcpStream::from_std(stream);
        let transport = match tls {
            Some(config) => match Transport::tls_server(stream, config) {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!("tls setup for upgraded socket failed: {e}");
                    return false;
                }
            },
            None => Transport::plain(stream),
        };
        let socket = Socket::new(
            SocketIo::Stream(transport),
            SocketState::HttpServer(HttpData::default()),
            RoleKind::Server,
            gid,
        );
        let sid = match self.node.insert_socket(socket, false) {
            Ok(sid) => sid,
            Err(e) => {
                tracing::debug!("failed to register upgraded socket: {e}");
                return false;
            }
        };
        self.node
            .send_raw(sid, switching_protocols(sec_key).into_bytes(), None);
        if !self.node.alive(sid) {
            return false;
        }
        self.node.promote_to_ws(sid, None);
        true
    }

    /// encode once and send to every current member of `group`
    pub fn broadcast<R: Role>(&mut self, group: Group<R>, opcode: OpCode, data: &[u8]) {
        let prepared = Rc::new(PreparedMessage::new(opcode, data));
        self.node.broadcast_group(group.id, prepared);
    }

    /// send a normal closure to every member and close the listeners
    pub fn close_group<R: Role>(&mut self, group: Group<R>) {
        self.node.close_group_inner(group.id);
    }

    /// hard-close every member without a close frame, and the listeners
    pub fn terminate_group<R: Role>(&mut self, group: Group<R>) {
        self.node.terminate_group_inner(group.id);
    }

    /// drive the loop until no registered sockets remain
    pub fn run(&mut self) {
        self.node.run_loop();
    }
}

fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = RawSocket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// borrowed handle to one socket, passed to every handler callback
pub struct WebSocket<'a> {
    node: &'a mut Node,
    sid: usize,
}

impl WebSocket<'_> {
    /// send a single-frame message, masked automatically on client sockets
    pub fn send(&mut self, opcode: OpCode, data: &[u8]) -> Result<(), WsError> {
        self.send_inner(opcode, data, None)
    }

    /// send with a completion callback
    ///
    /// the callback fires with `false` once the frame is fully on the wire
    /// and with `true` if the socket closed before that
    pub fn send_with(
        &mut self,
        opcode: OpCode,
        data: &[u8],
        on_complete: impl FnOnce(bool) + 'static,
    ) -> Result<(), WsError> {
        self.send_inner(opcode, data, Some(Box::new(on_complete)))
    }

    fn send_inner(
        &mut self,
        opcode: OpCode,
        data: &[u8],
        on_complete: Option<SendCallback>,
    ) -> Result<(), WsError> {
        if matches!(opcode, OpCode::Close | OpCode::Continue) {
            return Err(WsError::UnsupportedFrame(opcode));
        }
        if opcode.is_control() && data.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameTooBig(data.len()).into());
        }
        let open = self
            .node
            .sockets
            .get(self.sid)
            .filter(|s| !s.closed)
            .and_then(Socket::ws)
            .map(|ws| !ws.close_sent)
            .unwrap_or(false);
        if !open {
            if let Some(cb) = on_complete {
                cb(true);
            }
            return Err(WsError::SocketClosed);
        }
        self.node.send_frame(self.sid, opcode, data, on_complete);
        Ok(())
    }

    /// begin a graceful close with the given code and reason
    pub fn close(&mut self, code: u16, reason: &str) {
        self.node.close_socket(self.sid, code, reason.as_bytes());
    }

    /// hard-close without a close frame, reported as 1006
    pub fn terminate(&mut self) {
        self.node.terminate_socket(self.sid, Some((1006, Vec::new())));
    }

    /// remote address of the underlying stream
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.node.sockets.get(self.sid)?.io {
            SocketIo::Stream(t) => t.peer_addr().ok(),
            SocketIo::Listener(_) => None,
        }
    }

    /// the connect token, present on client sockets only
    pub fn token(&self) -> Option<UserToken> {
        self.node.sockets.get(self.sid)?.ws()?.token
    }

    /// attach user state to the socket, dropped on disconnection
    pub fn set_user_data<T: Any>(&mut self, value: T) {
        if let Some(ws) = self.node.sockets.get_mut(self.sid).and_then(Socket::ws_mut) {
            ws.user_data = Some(Box::new(value));
        }
    }

    /// read the attached user state
    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.node
            .sockets
            .get(self.sid)?
            .ws()?
            .user_data
            .as_ref()?
            .downcast_ref()
    }

    /// mutate the attached user state
    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.node
            .sockets
            .get_mut(self.sid)?
            .ws_mut()?
            .user_data
            .as_mut()?
            .downcast_mut()
    }

    /// detach and return the user state
    pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> {
        self.node
            .sockets
            .get_mut(self.sid)?
            .ws_mut()?
            .user_data
            .take()
    }

    /// broadcast to every member of this socket's group
    pub fn broadcast(&mut self, opcode: OpCode, data: &[u8]) {
        if let Some(socket) = self.node.sockets.get(self.sid) {
            let gid = socket.group;
            let prepared = Rc::new(PreparedMessage::new(opcode, data));
            self.node.broadcast_group(gid, prepared);
        }
    }

    /// gracefully close this socket's whole group
    pub fn close_group(&mut self) {
        if let Some(socket) = self.node.sockets.get(self.sid) {
            let gid = socket.group;
            self.node.close_group_inner(gid);
        }
    }

    /// hard-close this socket's whole group
    pub fn terminate_group(&mut self) {
        if let Some(socket) = self.node.sockets.get(self.sid) {
            let gid = socket.group;
            self.node.terminate_group_inner(gid);
        }
    }
}

enum StreamEnd {
    Ws(Option<(u16, Vec<u8>)>),
    Http,
    Client(UserToken),
    Ignore,
}

enum ByteState {
    HttpServer,
    HttpClient,
    Ws,
    Other,
}

impl Node {
    pub(crate) fn run_loop(&mut self) {
        let mut events: Vec<Readiness> = Vec::new();
        loop {
            self.drain_notices();
            if self.sockets.is_empty() {
                return;
            }
            let timeout = self
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));
            events.clear();
            if let Err(e) = self.poller.poll(&mut events, timeout) {
                tracing::error!("poll failed: {e}");
                return;
            }
            for i in 0..events.len() {
                self.socket_event(events[i]);
                self.drain_notices();
            }
            self.sweep_timeouts();
        }
    }

    fn drain_notices(&mut self) {
        while let Some(notice) = self.notices.pop_front() {
            match notice {
                Notice::Disconnection { sid, code, reason } => {
                    self.dispatch_disconnection(sid, code, &reason)
                }
            }
        }
    }

    fn socket_event(&mut self, ev: Readiness) {
        let sid = ev.token;
        if !self.alive(sid) {
            return;
        }
        if matches!(self.sockets[sid].state, SocketState::Listening { .. }) {
            if ev.readable {
                self.accept_ready(sid);
            }
            return;
        }
        if ev.writable {
            if matches!(self.sockets[sid].state, SocketState::Connecting(_)) {
                self.finish_connect(sid);
            } else {
                self.socket_writable(sid);
            }
        }
        if ev.readable
            && self.alive(sid)
            && !matches!(self.sockets[sid].state, SocketState::Connecting(_))
        {
            self.socket_readable(sid);
        }
    }

    fn accept_ready(&mut self, sid: usize) {
        loop {
            let accepted = {
                let Some(socket) = self.sockets.get_mut(sid) else {
                    return;
                };
                let SocketIo::Listener(listener) = &mut socket.io else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, addr)) => {
                    let (tls, gid, port) = match &self.sockets[sid].state {
                        SocketState::Listening { tls, port } => {
                            (tls.clone(), self.sockets[sid].group, *port)
                        }
                        _ => return,
                    };
                    tracing::debug!("accepted connection from {addr} on port {port}");
                    let transport = match tls {
                        Some(config) => match Transport::tls_server(stream, config) {
                            Ok(t) => t,
                            Err(e) => {
                                tracing::warn!("tls accept failed: {e}");
                                continue;
                            }
                        },
                        None => Transport::plain(stream),
                    };
                    let mut socket = Socket::new(
                        SocketIo::Stream(transport),
                        SocketState::HttpServer(HttpData::default()),
                        RoleKind::Server,
                        gid,
                    );
                    socket.deadline = Some(Instant::now() + HANDSHAKE_TIMEOUT);
                    if let Err(e) = self.insert_socket(socket, false) {
                        tracing::warn!("failed to register accepted socket: {e}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn finish_connect(&mut self, sid: usize) {
        enum Status {
            Ready,
            Pending,
            Failed(io::Error),
        }
        let status = {
            let Some(socket) = self.sockets.get_mut(sid) else {
                return;
            };
            let Some(transport) = socket.io.transport_mut() else {
                return;
            };
            let stream = transport.stream_mut();
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => Status::Failed(e),
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => Status::Ready,
                    Err(e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.kind() == io::ErrorKind::WouldBlock =>
                    {
                        Status::Pending
                    }
                    Err(e) => Status::Failed(e),
                },
            }
        };
        match status {
            Status::Pending => {}
            Status::Failed(e) => {
                tracing::debug!("connect on socket {sid} failed: {e}");
                let token = self.sockets[sid].pending_token().unwrap_or_default();
                self.client_failed(sid, token);
            }
            Status::Ready => {
                let request = {
                    let socket = &mut self.sockets[sid];
                    let data = match &mut socket.state {
                        SocketState::Connecting(data) => mem::take(data),
                        _ => return,
                    };
                    let request = upgrade_request(&data.path, &data.host, &gen_key());
                    socket.state = SocketState::HttpClient(data);
                    request
                };
                tracing::debug!("tcp connect complete on socket {sid}");
                self.send_raw(sid, request.into_bytes(), None);
                if self.alive(sid) && self.sockets[sid].queue.is_empty() {
                    self.set_want_write(sid, false);
                }
            }
        }
    }

    fn socket_writable(&mut self, sid: usize) {
        let flushed = {
            let Some(socket) = self.sockets.get_mut(sid) else {
                return;
            };
            match socket.io.transport_mut() {
                Some(t) => t.flush(),
                None => return,
            }
        };
        match flushed {
            Transfer::Fatal(e) => {
                self.handle_stream_end(sid, Some(e));
                return;
            }
            Transfer::WantWrite => return,
            _ => {}
        }
        self.drain_queue(sid);
    }

    fn socket_readable(&mut self, sid: usize) {
        loop {
            if !self.alive(sid) {
                return;
            }
            let mut buf = mem::take(&mut self.recv_buf);
            let Some(transport) = self.sockets[sid].io.transport_mut() else {
                self.recv_buf = buf;
                return;
            };
            match transport.read(&mut buf) {
                Transfer::Done(n) => {
                    self.process_bytes(sid, &mut buf[..n]);
                    self.recv_buf = buf;
                }
                Transfer::WantRead => {
                    self.recv_buf = buf;
                    return;
                }
                Transfer::WantWrite => {
                    self.recv_buf = buf;
                    self.set_want_write(sid, true);
                    return;
                }
                Transfer::Eof => {
                    self.recv_buf = buf;
                    self.handle_stream_end(sid, None);
                    return;
                }
                Transfer::Fatal(e) => {
                    self.recv_buf = buf;
                    self.handle_stream_end(sid, Some(e));
                    return;
                }
            }
        }
    }

    fn process_bytes(&mut self, sid: usize, data: &mut [u8]) {
        let state = match self.sockets.get(sid).map(|s| &s.state) {
            Some(SocketState::HttpServer(_)) => ByteState::HttpServer,
            Some(SocketState::HttpClient(_)) => ByteState::HttpClient,
            Some(SocketState::Ws(_)) => ByteState::Ws,
            _ => ByteState::Other,
        };
        match state {
            ByteState::HttpServer => self.http_server_bytes(sid, data),
            ByteState::HttpClient => self.http_client_bytes(sid, data),
            ByteState::Ws => self.ws_bytes(sid, data),
            ByteState::Other => {}
        }
    }

    fn http_server_bytes(&mut self, sid: usize, data: &[u8]) {
        let complete = {
            let Some(http) = self.sockets[sid].http_mut() else {
                return;
            };
            if http.buf.len() + data.len() > MAX_HANDSHAKE {
                tracing::debug!("handshake buffer overflow on socket {sid}");
                None
            } else {
                http.buf.extend_from_slice(data);
                Some(find_head_end(&http.buf).is_some())
            }
        };
        match complete {
            None => self.terminate_socket(sid, None),
            Some(false) => {}
            Some(true) => self.finish_server_handshake(sid),
        }
    }

    fn finish_server_handshake(&mut self, sid: usize) {
        let parsed = {
            let http = self.sockets[sid].http_mut().expect("http state");
            let end = find_head_end(&http.buf).expect("head terminator");
            parse_upgrade_request(&http.buf[..end]).map(|req| (req, http.buf.split_off(end)))
        };
        match parsed {
            Err(e) => {
                tracing::debug!("upgrade handshake failed on socket {sid}: {e}");
                self.terminate_socket(sid, None);
            }
            Ok((req, mut residual)) => {
                if let Some(extensions) = &req.extensions {
                    tracing::trace!("ignoring offered extensions: {extensions}");
                }
                self.send_raw(sid, switching_protocols(&req.sec_key).into_bytes(), None);
                if !self.alive(sid) {
                    return;
                }
                self.promote_to_ws(sid, None);
                if self.alive(sid) && !residual.is_empty() {
                    self.ws_bytes(sid, &mut residual);
                }
            }
        }
    }

    fn http_client_bytes(&mut self, sid: usize, data: &[u8]) {
        let complete = {
            let Some(http) = self.sockets[sid].http_mut() else {
                return;
            };
            if http.buf.len() + data.len() > MAX_HANDSHAKE {
                tracing::debug!("handshake buffer overflow on socket {sid}");
                None
            } else {
                http.buf.extend_from_slice(data);
                Some(find_head_end(&http.buf).is_some())
            }
        };
        match complete {
            None => {
                let token = self.sockets[sid].pending_token().unwrap_or_default();
                self.client_failed(sid, token);
            }
            Some(false) => {}
            Some(true) => self.finish_client_handshake(sid),
        }
    }

    fn finish_client_handshake(&mut self, sid: usize) {
        let checked = {
            let http = self.sockets[sid].http_mut().expect("http state");
            let end = find_head_end(&http.buf).expect("head terminator");
            check_upgrade_response(&http.buf[..end])
                .map(|()| (http.token, http.buf.split_off(end)))
        };
        match checked {
            Err(e) => {
                tracing::debug!("upgrade response rejected on socket {sid}: {e}");
                let token = self.sockets[sid].pending_token().unwrap_or_default();
                self.client_failed(sid, token);
            }
            Ok((token, mut residual)) => {
                self.promote_to_ws(sid, Some(token));
                if self.alive(sid) && !residual.is_empty() {
                    self.ws_bytes(sid, &mut residual);
                }
            }
        }
    }

    /// swap the HTTP state for websocket state, join the group and fire
    /// the connection handler
    pub(crate) fn promote_to_ws(&mut self, sid: usize, token: Option<UserToken>) {
        let socket = &mut self.sockets[sid];
        let mut ws = WsData::new(socket.role == RoleKind::Server);
        ws.token = token;
        socket.state = SocketState::Ws(ws);
        socket.deadline = None;
        self.link_member(sid);
        tracing::debug!("socket {sid} entered websocket state");
        self.dispatch_connection(sid);
    }

    fn ws_bytes(&mut self, sid: usize, data: &mut [u8]) {
        let Some(ws) = self.sockets.get_mut(sid).and_then(|s| s.ws_mut()) else {
            return;
        };
        let mut decoder = mem::take(&mut ws.decoder);
        let result = decoder.consume(data, &mut |event| self.on_ws_event(sid, event));
        if let Some(socket) = self.sockets.get_mut(sid) {
            if !socket.closed {
                if let Some(ws) = socket.ws_mut() {
                    ws.decoder = decoder;
                }
            }
        }
        if let Err(error) = result {
            self.protocol_violation(sid, error);
        }
    }

    fn on_ws_event(&mut self, sid: usize, event: Event<'_>) -> ControlFlow<()> {
        match event {
            Event::Message { opcode, data } => self.dispatch_message(sid, opcode, data),
            Event::Ping(payload) => {
                let closing = self
                    .sockets
                    .get(sid)
                    .and_then(Socket::ws)
                    .map(|ws| ws.close_sent)
                    .unwrap_or(true);
                if !closing {
                    // pong goes out before the handler observes the ping
                    self.send_frame(sid, OpCode::Pong, payload, None);
                    if self.alive(sid) {
                        self.dispatch_ping(sid, payload);
                    }
                }
            }
            Event::Pong(payload) => self.dispatch_pong(sid, payload),
            Event::Close { code, reason } => {
                self.handle_peer_close(sid, code, reason);
                return ControlFlow::Break(());
            }
        }
        let stop = !self.alive(sid)
            || self
                .sockets
                .get(sid)
                .and_then(Socket::ws)
                .map(|ws| ws.close_sent)
                .unwrap_or(true);
        if stop {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn handle_peer_close(&mut self, sid: usize, code: u16, reason: &[u8]) {
        let Some(socket) = self.sockets.get_mut(sid) else {
            return;
        };
        let already_sent = match socket.ws() {
            Some(ws) => ws.close_sent,
            None => return,
        };
        tracing::debug!("close frame received on socket {sid}: code {code}");
        if already_sent {
            // the echo of our close, or both sides closed at once
            if let Some(t) = socket.io.transport_mut() {
                t.shutdown();
            }
            self.terminate_socket(sid, Some((code, reason.to_vec())));
        } else {
            let ws = socket.ws_mut().expect("ws state");
            ws.close_sent = true;
            ws.pending_close = Some((code, reason.to_vec()));
            let echo_code = if code == 1005 { 1000 } else { code };
            let payload = encode_close_payload(echo_code, reason);
            self.send_frame(sid, OpCode::Close, &payload, None);
            self.maybe_finalize(sid);
        }
    }

    /// graceful local close: send the close frame and wait for the echo,
    /// bounded by the close-handshake timeout
    pub(crate) fn close_socket(&mut self, sid: usize, code: u16, reason: &[u8]) {
        let Some(socket) = self.sockets.get_mut(sid) else {
            return;
        };
        if socket.closed {
            return;
        }
        if socket.ws().is_none() {
            self.terminate_socket(sid, None);
            return;
        }
        let socket = &mut self.sockets[sid];
        let ws = socket.ws_mut().expect("ws state");
        if ws.close_sent {
            return;
        }
        ws.close_sent = true;
        socket.deadline = Some(Instant::now() + HANDSHAKE_TIMEOUT);
        let payload = encode_close_payload(code, reason);
        self.send_frame(sid, OpCode::Close, &payload, None);
    }

    fn protocol_violation(&mut self, sid: usize, error: ProtocolError) {
        tracing::debug!("protocol violation on socket {sid}: {error}");
        self.terminate_socket(sid, Some((error.close_code(), Vec::new())));
    }

    fn handle_stream_end(&mut self, sid: usize, error: Option<io::Error>) {
        if let Some(e) = &error {
            tracing::debug!("transport failure on socket {sid}: {e}");
        }
        let Some(socket) = self.sockets.get(sid) else {
            return;
        };
        if socket.closed {
            return;
        }
        let end = match &socket.state {
            SocketState::Ws(ws) => StreamEnd::Ws(ws.pending_close.clone()),
            SocketState::HttpServer(_) => StreamEnd::Http,
            SocketState::Connecting(h) | SocketState::HttpClient(h) => StreamEnd::Client(h.token),
            SocketState::Listening { .. } => StreamEnd::Ignore,
        };
        match end {
            StreamEnd::Ws(pending) => {
                let report = pending.unwrap_or((1006, Vec::new()));
                self.terminate_socket(sid, Some(report));
            }
            StreamEnd::Http => self.terminate_socket(sid, None),
            StreamEnd::Client(token) => self.client_failed(sid, token),
            StreamEnd::Ignore => {}
        }
    }

    fn client_failed(&mut self, sid: usize, token: UserToken) {
        let gid = self.sockets[sid].group;
        self.terminate_socket(sid, None);
        self.dispatch_client_error(gid, token);
    }

    fn sweep_timeouts(&mut self) {
        enum Why {
            ClientHandshake(UserToken),
            ServerHandshake,
            CloseEcho,
        }
        let now = Instant::now();
        for sid in self.expired_sockets(now) {
            if !self.alive(sid) {
                continue;
            }
            let why = match &self.sockets[sid].state {
                SocketState::Connecting(h) | SocketState::HttpClient(h) => {
                    Why::ClientHandshake(h.token)
                }
                SocketState::HttpServer(_) => Why::ServerHandshake,
                SocketState::Ws(_) => Why::CloseEcho,
                SocketState::Listening { .. } => continue,
            };
            tracing::debug!("socket {sid} timed out");
            match why {
                Why::ClientHandshake(token) => self.client_failed(sid, token),
                Why::ServerHandshake => self.terminate_socket(sid, None),
                Why::CloseEcho => self.terminate_socket(sid, Some((1006, Vec::new()))),
            }
        }
        self.drain_notices();
    }

    pub(crate) fn close_group_inner(&mut self, gid: usize) {
        let mut cur = self.groups[gid].head;
        while let Some(sid) = cur {
            // capture the link before the close can unlink the socket
            cur = self.sockets[sid].next;
            self.close_socket(sid, 1000, b"");
        }
        self.drop_listeners(gid);
    }

    pub(crate) fn terminate_group_inner(&mut self, gid: usize) {
        let mut cur = self.groups[gid].head;
        while let Some(sid) = cur {
            cur = self.sockets[sid].next;
            self.terminate_socket(sid, Some((1006, Vec::new())));
        }
        self.drop_listeners(gid);
    }

    fn drop_listeners(&mut self, gid: usize) {
        for lid in mem::take(&mut self.groups[gid].listeners) {
            if self.sockets.contains(lid) {
                let socket = &mut self.sockets[lid];
                if let Err(e) = self.poller.remove(socket.io.source()) {
                    tracing::trace!("deregister failed for listener {lid}: {e}");
                }
                self.remove_socket(lid);
            }
        }
    }

    fn dispatch_connection(&mut self, sid: usize) {
        let gid = self.sockets[sid].group;
        let Some(mut handler) = self.groups[gid].handler.take() else {
            return;
        };
        {
            let mut ws = WebSocket { node: self, sid };
            match &mut handler {
                AnyHandler::Server(h) => h.on_connection(&mut ws),
                AnyHandler::Client(h) => h.on_connection(&mut ws),
            }
        }
        self.groups[gid].handler = Some(handler);
    }

    fn dispatch_message(&mut self, sid: usize, opcode: OpCode, data: &[u8]) {
        let gid = self.sockets[sid].group;
        let Some(mut handler) = self.groups[gid].handler.take() else {
            return;
        };
        {
            let mut ws = WebSocket { node: self, sid };
            match &mut handler {
                AnyHandler::Server(h) => h.on_message(&mut ws, data, opcode),
                AnyHandler::Client(h) => h.on_message(&mut ws, data, opcode),
            }
        }
        self.groups[gid].handler = Some(handler);
    }

    fn dispatch_ping(&mut self, sid: usize, payload: &[u8]) {
        let gid = self.sockets[sid].group;
        let Some(mut handler) = self.groups[gid].handler.take() else {
            return;
        };
        {
            let mut ws = WebSocket { node: self, sid };
            match &mut handler {
                AnyHandler::Server(h) => h.on_ping(&mut ws, payload),
                AnyHandler::Client(h) => h.on_ping(&mut ws, payload),
            }
        }
        self.groups[gid].handler = Some(handler);
    }

    fn dispatch_pong(&mut self, sid: usize, payload: &[u8]) {
        let gid = self.sockets[sid].group;
        let Some(mut handler) = self.groups[gid].handler.take() else {
            return;
        };
        {
            let mut ws = WebSocket { node: self, sid };
            match &mut handler {
                AnyHandler::Server(h) => h.on_pong(&mut ws, payload),
                AnyHandler::Client(h) => h.on_pong(&mut ws, payload),
            }
        }
        self.groups[gid].handler = Some(handler);
    }

    fn dispatch_disconnection(&mut self, sid: usize, code: u16, reason: &[u8]) {
        if !self.sockets.contains(sid) {
            return;
        }
        let gid = self.sockets[sid].group;
        if let Some(mut handler) = self.groups[gid].handler.take() {
            {
                let mut ws = WebSocket { node: self, sid };
                match &mut handler {
                    AnyHandler::Server(h) => h.on_disconnection(&mut ws, code, reason),
                    AnyHandler::Client(h) => h.on_disconnection(&mut ws, code, reason),
                }
            }
            self.groups[gid].handler = Some(handler);
        }
        // the record is released only after the handler returns
        self.remove_socket(sid);
    }

    pub(crate) fn dispatch_server_error(&mut self, gid: usize, port: u16) {
        if let Some(AnyHandler::Server(h)) = &mut self.groups[gid].handler {
            h.on_error(port);
        }
    }

    pub(crate) fn dispatch_client_error(&mut self, gid: usize, token: UserToken) {
        if let Some(AnyHandler::Client(h)) = &mut self.groups[gid].handler {
            h.on_error(token);
        }
    }
}
