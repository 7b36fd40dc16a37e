//! socket groups and event handlers
//!
//! a group is a set of websockets sharing one handler, the unit of
//! iteration, broadcast and coordinated shutdown. groups come in a server
//! and a client flavor which differ in masking direction, handshake duties
//! and the payload carried by the error handler.

use std::marker::PhantomData;

use crate::frame::OpCode;
use crate::hub::WebSocket;

/// opaque caller-supplied tag identifying a `connect` attempt
///
/// handed back through the client error handler when the connection could
/// not be established, and readable from the socket afterwards
pub type UserToken = u64;

/// runtime discriminant of a group's role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoleKind {
    Server,
    Client,
}

/// event handler attached to a group, every method defaults to a no-op
///
/// handlers run synchronously on the loop thread and must not block. work
/// done inside a handler is observed before the next event is delivered.
pub trait Handler<R: Role> {
    /// a socket completed the upgrade and joined the group
    fn on_connection(&mut self, ws: &mut WebSocket<'_>) {
        let _ = ws;
    }
    /// a complete message arrived, fragments already reassembled
    fn on_message(&mut self, ws: &mut WebSocket<'_>, data: &[u8], opcode: OpCode) {
        let _ = (ws, data, opcode);
    }
    /// the socket left the group, fired exactly once per connection
    fn on_disconnection(&mut self, ws: &mut WebSocket<'_>, code: u16, reason: &[u8]) {
        let _ = (ws, code, reason);
    }
    /// a ping arrived, the pong was already sent automatically
    fn on_ping(&mut self, ws: &mut WebSocket<'_>, payload: &[u8]) {
        let _ = (ws, payload);
    }
    /// a pong arrived
    fn on_pong(&mut self, ws: &mut WebSocket<'_>, payload: &[u8]) {
        let _ = (ws, payload);
    }
    /// the role-specific failure report: the port that could not be
    /// listened on, or the token of a connect that never produced a socket
    fn on_error(&mut self, payload: R::ErrorPayload) {
        let _ = payload;
    }
}

pub(crate) enum AnyHandler {
    Server(Box<dyn Handler<Server>>),
    Client(Box<dyn Handler<Client>>),
}

pub(crate) mod sealed {
    use super::{AnyHandler, Handler, Role, RoleKind};

    pub trait RoleCore: Sized + 'static {
        const KIND: RoleKind;
        fn wrap(handler: Box<dyn Handler<Self>>) -> AnyHandler
        where
            Self: Role;
    }
}

/// endpoint role marker, implemented by [`Server`] and [`Client`] only
pub trait Role: sealed::RoleCore {
    /// payload of the role's error handler
    type ErrorPayload: std::fmt::Debug + Copy + 'static;
}

/// server role marker
pub enum Server {}

/// client role marker
pub enum Client {}

impl sealed::RoleCore for Server {
    const KIND: RoleKind = RoleKind::Server;
    fn wrap(handler: Box<dyn Handler<Self>>) -> AnyHandler {
        AnyHandler::Server(handler)
    }
}

impl Role for Server {
    /// the port a listen attempt failed on
    type ErrorPayload = u16;
}

impl sealed::RoleCore for Client {
    const KIND: RoleKind = RoleKind::Client;
    fn wrap(handler: Box<dyn Handler<Self>>) -> AnyHandler {
        AnyHandler::Client(handler)
    }
}

impl Role for Client {
    /// the token given to the failed connect attempt
    type ErrorPayload = UserToken;
}

/// typed handle to a group owned by a [`Hub`](crate::hub::Hub)
pub struct Group<R: Role> {
    pub(crate) id: usize,
    _role: PhantomData<R>,
}

impl<R: Role> Group<R> {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            _role: PhantomData,
        }
    }
}

impl<R: Role> Clone for Group<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: Role> Copy for Group<R> {}

impl<R: Role> std::fmt::Debug for Group<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Group").field(&self.id).finish()
    }
}

/// per-group bookkeeping inside the node
pub(crate) struct GroupRecord {
    pub kind: RoleKind,
    /// taken out of the slot for the duration of a callback
    pub handler: Option<AnyHandler>,
    /// head of the member list, threaded through socket prev/next links
    pub head: Option<usize>,
    pub listeners: Vec<usize>,
}

impl GroupRecord {
    pub fn new(kind: RoleKind) -> Self {
        Self {
            kind,
            handler: None,
            head: None,
            listeners: Vec::new(),
        }
    }
}
