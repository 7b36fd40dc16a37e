//! event-loop websocket endpoint library
//!
//! `ws-hub` speaks RFC 6455 in both directions on a single-threaded
//! readiness loop: one [`Hub`] owns the poller, accepts upgrade handshakes,
//! dials out, frames and deframes messages and fans events out to per-group
//! handlers. plain TCP and TLS ride the same transport interface.
//!
//! ```no_run
//! use ws_hub::{Handler, Hub, OpCode, Server, WebSocket};
//!
//! struct Echo;
//!
//! impl Handler<Server> for Echo {
//!     fn on_message(&mut self, ws: &mut WebSocket<'_>, data: &[u8], opcode: OpCode) {
//!         let _ = ws.send(opcode, data);
//!     }
//! }
//!
//! let mut hub = Hub::new().unwrap();
//! hub.on_server(Echo);
//! hub.listen(3000);
//! hub.run();
//! ```

#![warn(missing_docs)]

/// websocket error definitions
pub mod errors;
/// frame primitives: opcodes, encoding, prepared broadcast frames
pub mod frame;
/// handshake: keys, upgrade request/response
pub mod protocol;

/// socket groups, roles and event handlers
pub mod group;
/// the hub, the loop and the per-socket handle
pub mod hub;
/// TLS context construction
pub mod transport;

mod codec;
mod mask;
mod node;
mod pool;
mod poller;
mod socket;
mod utf8;

pub use errors::{ProtocolError, WsError};
pub use frame::{OpCode, PreparedMessage};
pub use group::{Client, Group, Handler, Role, Server, UserToken};
pub use hub::{Hub, WebSocket, DEFAULT_CONNECT_TIMEOUT_MS};
pub use mask::apply_mask;
pub use transport::create_tls_context;
