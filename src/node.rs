//! loop context
//!
//! the node owns everything one event loop needs: the poller, the socket
//! arena, one shared receive buffer reused across every read, the outbound
//! buffer pool and the lazily-built client TLS config. all sockets created
//! through one hub share its node and therefore its thread.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use mio::Interest;
use rustls::ClientConfig;
use slab::Slab;

use crate::errors::WsError;
use crate::frame::{encode_frame, header_len, OpCode};
use crate::group::{GroupRecord, RoleKind};
use crate::pool::BufferPool;
use crate::poller::Poller;
use crate::socket::{MsgBuf, OutMessage, SendCallback, Socket};
use crate::transport::{client_tls_config, Transfer};

/// shared receive buffer size, every read lands here before parsing
pub(crate) const RECV_BUFFER_LEN: usize = 300 * 1024;

/// deferred notification, delivered when the current callback unwinds
pub(crate) enum Notice {
    Disconnection {
        sid: usize,
        code: u16,
        reason: Vec<u8>,
    },
}

pub(crate) struct Node {
    pub poller: Poller,
    pub sockets: Slab<Socket>,
    pub groups: Slab<GroupRecord>,
    pub recv_buf: Box<[u8]>,
    pub pool: BufferPool,
    pub notices: VecDeque<Notice>,
    client_tls: Option<Arc<ClientConfig>>,
}

impl Node {
    pub fn new() -> Result<Self, WsError> {
        Ok(Self {
            poller: Poller::new()?,
            sockets: Slab::new(),
            groups: Slab::new(),
            recv_buf: vec![0u8; RECV_BUFFER_LEN].into_boxed_slice(),
            pool: BufferPool::new(),
            notices: VecDeque::new(),
            client_tls: None,
        })
    }

    pub fn create_group(&mut self, kind: RoleKind) -> usize {
        self.groups.insert(GroupRecord::new(kind))
    }

    /// client TLS config shared by every outgoing `wss` connection
    pub fn client_tls(&mut self) -> Arc<ClientConfig> {
        self.client_tls
            .get_or_insert_with(client_tls_config)
            .clone()
    }

    fn interest(want_write: bool) -> Interest {
        if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// insert and register a socket, the arena key doubles as poll token
    pub fn insert_socket(&mut self, socket: Socket, want_write: bool) -> Result<usize, WsError> {
        let entry = self.sockets.vacant_entry();
        let sid = entry.key();
        let socket = entry.insert(socket);
        socket.want_write = want_write;
        match self
            .poller
            .add(socket.io.source(), sid, Self::interest(want_write))
        {
            Ok(()) => Ok(sid),
            Err(e) => {
                self.sockets.remove(sid);
                Err(e.into())
            }
        }
    }

    /// drop the record, closing the descriptor
    pub fn remove_socket(&mut self, sid: usize) {
        if self.sockets.contains(sid) {
            self.sockets.remove(sid);
        }
    }

    /// the socket exists and has not been closed
    pub fn alive(&self, sid: usize) -> bool {
        self.sockets.get(sid).map(|s| !s.closed).unwrap_or(false)
    }

    /// toggle WRITE interest, re-registering only on change
    pub fn set_want_write(&mut self, sid: usize, on: bool) {
        let Some(socket) = self.sockets.get_mut(sid) else {
            return;
        };
        if socket.closed || socket.want_write == on {
            return;
        }
        socket.want_write = on;
        if let Err(e) = self
            .poller
            .modify(socket.io.source(), sid, Self::interest(on))
        {
            tracing::warn!("failed to update interest for socket {sid}: {e}");
        }
    }

    /// push the socket onto its group's member list head
    pub fn link_member(&mut self, sid: usize) {
        let gid = self.sockets[sid].group;
        let head = self.groups[gid].head;
        if let Some(h) = head {
            self.sockets[h].prev = Some(sid);
        }
        let socket = &mut self.sockets[sid];
        socket.prev = None;
        socket.next = head;
        socket.in_list = true;
        self.groups[gid].head = Some(sid);
    }

    /// unlink from the member list, done before any user handler runs so
    /// iteration stays safe during removal
    pub fn unlink_member(&mut self, sid: usize) {
        let socket = &self.sockets[sid];
        if !socket.in_list {
            return;
        }
        let (gid, prev, next) = (socket.group, socket.prev, socket.next);
        match prev {
            Some(p) => self.sockets[p].next = next,
            None => self.groups[gid].head = next,
        }
        if let Some(n) = next {
            self.sockets[n].prev = prev;
        }
        let socket = &mut self.sockets[sid];
        socket.prev = None;
        socket.next = None;
        socket.in_list = false;
    }

    /// encode and send one frame, masking when the socket is a client
    pub fn send_frame(
        &mut self,
        sid: usize,
        opcode: OpCode,
        payload: &[u8],
        on_complete: Option<SendCallback>,
    ) {
        let Some(socket) = self.sockets.get(sid) else {
            if let Some(cb) = on_complete {
                cb(true);
            }
            return;
        };
        let mask = match socket.role {
            RoleKind::Server => None,
            RoleKind::Client => Some(rand::random::<[u8; 4]>()),
        };
        let mut buf = self
            .pool
            .alloc(header_len(payload.len(), mask.is_some()) + payload.len());
        encode_frame(&mut buf, opcode, mask, payload);
        self.send_bytes(sid, MsgBuf::Pooled(buf), on_complete);
    }

    /// queue raw pre-encoded bytes (handshake heads, close echoes)
    pub fn send_raw(&mut self, sid: usize, bytes: Vec<u8>, on_complete: Option<SendCallback>) {
        self.send_bytes(sid, MsgBuf::Pooled(bytes), on_complete);
    }

    /// attempt a direct write, parking the remainder on the queue
    pub fn send_bytes(&mut self, sid: usize, buf: MsgBuf, on_complete: Option<SendCallback>) {
        enum Outcome {
            Complete,
            Parked { need_write: bool },
            Fatal,
        }

        let Some(socket) = self.sockets.get_mut(sid) else {
            if let Some(cb) = on_complete {
                cb(true);
            }
            return;
        };
        if socket.closed {
            if let Some(cb) = on_complete {
                cb(true);
            }
            return;
        }
        let Some(transport) = socket.io.transport_mut() else {
            if let Some(cb) = on_complete {
                cb(true);
            }
            return;
        };

        let mut sent = 0;
        let outcome = if socket.queue.is_empty() {
            let data = buf.as_slice();
            loop {
                match transport.write(&data[sent..]) {
                    Transfer::Done(n) => {
                        sent += n;
                        if sent == data.len() {
                            break Outcome::Complete;
                        }
                    }
                    Transfer::WantWrite => break Outcome::Parked { need_write: true },
                    Transfer::WantRead => break Outcome::Parked { need_write: false },
                    Transfer::Eof | Transfer::Fatal(_) => break Outcome::Fatal,
                }
            }
        } else {
            Outcome::Parked { need_write: false }
        };

        match outcome {
            Outcome::Complete => {
                if let MsgBuf::Pooled(v) = buf {
                    self.pool.free(v);
                }
                if let Some(cb) = on_complete {
                    cb(false);
                }
            }
            Outcome::Parked { need_write } => {
                socket.queue.push_back(OutMessage {
                    buf,
                    sent,
                    on_complete,
                });
                if need_write {
                    self.set_want_write(sid, true);
                }
            }
            Outcome::Fatal => {
                if let Some(cb) = on_complete {
                    cb(true);
                }
                self.terminate_socket(sid, Some((1006, Vec::new())));
            }
        }
    }

    /// write-readiness drain: push queued messages head-first, firing
    /// completion callbacks in enqueue order
    pub fn drain_queue(&mut self, sid: usize) {
        loop {
            enum Step {
                Wrote(OutMessage),
                Keep,
                Empty,
                Fatal,
            }
            let step = {
                let Some(socket) = self.sockets.get_mut(sid) else {
                    return;
                };
                if socket.closed {
                    return;
                }
                let Some(transport) = socket.io.transport_mut() else {
                    return;
                };
                match socket.queue.front_mut() {
                    None => Step::Empty,
                    Some(head) => {
                        let data = head.buf.as_slice();
                        match transport.write(&data[head.sent..]) {
                            Transfer::Done(n) => {
                                head.sent += n;
                                if head.sent == data.len() {
                                    Step::Wrote(socket.queue.pop_front().expect("queue head"))
                                } else {
                                    Step::Keep
                                }
                            }
                            Transfer::WantWrite | Transfer::WantRead => Step::Keep,
                            Transfer::Eof | Transfer::Fatal(_) => Step::Fatal,
                        }
                    }
                }
            };
            match step {
                Step::Wrote(msg) => {
                    if let MsgBuf::Pooled(v) = msg.buf {
                        self.pool.free(v);
                    }
                    if let Some(cb) = msg.on_complete {
                        cb(false);
                    }
                }
                Step::Keep => return,
                Step::Fatal => {
                    self.terminate_socket(sid, Some((1006, Vec::new())));
                    return;
                }
                Step::Empty => {
                    self.set_want_write(sid, false);
                    self.maybe_finalize(sid);
                    return;
                }
            }
        }
    }

    /// once the close echo has drained, shut the transport down and report
    /// the stored close result
    pub fn maybe_finalize(&mut self, sid: usize) {
        let Some(socket) = self.sockets.get_mut(sid) else {
            return;
        };
        if socket.closed || !socket.queue.is_empty() {
            return;
        }
        let Some(ws) = socket.ws_mut() else {
            return;
        };
        let Some((code, reason)) = ws.pending_close.take() else {
            return;
        };
        if let Some(t) = socket.io.transport_mut() {
            t.shutdown();
        }
        self.terminate_socket(sid, Some((code, reason)));
    }

    /// cancel queued messages in FIFO order, then release the queue
    pub fn cancel_queue(&mut self, sid: usize) {
        let Some(socket) = self.sockets.get_mut(sid) else {
            return;
        };
        let queue = std::mem::take(&mut socket.queue);
        for msg in queue {
            if let MsgBuf::Pooled(v) = msg.buf {
                self.pool.free(v);
            }
            if let Some(cb) = msg.on_complete {
                cb(true);
            }
        }
    }

    /// hard-stop the socket layer
    ///
    /// cancels pending writes, deregisters and unlinks. `disconnect`
    /// carries the (code, reason) for a deferred disconnection handler,
    /// `None` removes the record immediately for sockets that never became
    /// websockets.
    pub fn terminate_socket(&mut self, sid: usize, disconnect: Option<(u16, Vec<u8>)>) {
        let Some(socket) = self.sockets.get(sid) else {
            return;
        };
        if socket.closed {
            return;
        }
        self.cancel_queue(sid);
        self.unlink_member(sid);
        let socket = &mut self.sockets[sid];
        if let Err(e) = self.poller.remove(socket.io.source()) {
            tracing::trace!("deregister failed for socket {sid}: {e}");
        }
        socket.closed = true;
        socket.deadline = None;
        socket.want_write = false;
        match disconnect {
            Some((code, reason)) => self.notices.push_back(Notice::Disconnection {
                sid,
                code,
                reason,
            }),
            None => self.remove_socket(sid),
        }
    }

    /// earliest pending deadline, bounds the poll timeout
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sockets
            .iter()
            .filter_map(|(_, s)| s.deadline)
            .min()
    }

    pub fn expired_sockets(&self, now: Instant) -> Vec<usize> {
        self.sockets
            .iter()
            .filter(|(_, s)| !s.closed && s.deadline.is_some_and(|d| d <= now))
            .map(|(sid, _)| sid)
            .collect()
    }

    /// share one prepared frame across every current member of a group
    pub fn broadcast_group(&mut self, gid: usize, prepared: Rc<crate::frame::PreparedMessage>) {
        let mut cur = self.groups[gid].head;
        while let Some(sid) = cur {
            // capture the link before any operation on the socket
            cur = self.sockets[sid].next;
            let skip = self.sockets[sid]
                .ws()
                .map(|ws| ws.close_sent)
                .unwrap_or(true);
            if !skip {
                self.send_bytes(sid, MsgBuf::Prepared(prepared.clone()), None);
            }
        }
    }
}
