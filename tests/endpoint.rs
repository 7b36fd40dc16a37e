//! end-to-end scenarios over loopback sockets
//!
//! server and client roles usually share one hub (and so one loop), with a
//! scripted raw TCP peer on a helper thread wherever a misbehaving or
//! frame-level remote is needed.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::thread::JoinHandle;

use ws_hub::{Client, Handler, Hub, OpCode, Server, UserToken, WebSocket};

// distinct ports per test, the harness runs tests in parallel
const PORT_ECHO: u16 = 36101;
const PORT_FRAGMENTS: u16 = 36102;
const PORT_BAD_UTF8: u16 = 36103;
const PORT_OVERSIZE: u16 = 36104;
const PORT_BROADCAST: u16 = 36105;
const PORT_CONFLICT: u16 = 36106;
const PORT_PING: u16 = 36107;
const PORT_CALLBACK: u16 = 36108;

type Log = Rc<RefCell<Vec<String>>>;

fn log(events: &Log, entry: impl Into<String>) {
    events.borrow_mut().push(entry.into());
}

/// perform a plain client upgrade on a raw std stream
fn raw_client_handshake(stream: &mut TcpStream, port: u16) {
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: x3JJHMbDL1EzLkh9GBhXDw==\r\n\
         Host: 127.0.0.1:{port}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");
    assert!(head.contains("Sec-WebSocket-Accept: HSmrc0sMlYUkAGmm5OPpG2HaGWk=\r\n"));
}

/// encode one frame as a client would, masked
fn masked_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let key = [0x37, 0xFA, 0x21, 0x3D];
    let mut out = vec![if fin { 0x80 } else { 0 } | opcode];
    match payload.len() {
        n @ 0..=125 => out.push(0x80 | n as u8),
        n @ 126..=65535 => {
            out.push(0x80 | 126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(0x80 | 127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(&key);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    out
}

/// read one unmasked server frame off a raw std stream
fn read_server_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).unwrap();
    assert_eq!(head[1] & 0x80, 0, "server frames must be unmasked");
    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (head[0], payload)
}

struct ServerSide {
    events: Log,
    on_message: Box<dyn FnMut(&mut WebSocket<'_>, &[u8], OpCode, &Log)>,
}

impl Handler<Server> for ServerSide {
    fn on_connection(&mut self, ws: &mut WebSocket<'_>) {
        assert!(ws.peer_addr().is_some());
        log(&self.events, "server connected");
    }

    fn on_message(&mut self, ws: &mut WebSocket<'_>, data: &[u8], opcode: OpCode) {
        (self.on_message)(ws, data, opcode, &self.events);
    }

    fn on_ping(&mut self, _ws: &mut WebSocket<'_>, payload: &[u8]) {
        log(
            &self.events,
            format!("server ping {}", String::from_utf8_lossy(payload)),
        );
    }

    fn on_disconnection(&mut self, ws: &mut WebSocket<'_>, code: u16, reason: &[u8]) {
        log(
            &self.events,
            format!(
                "server disconnected {code} {}",
                String::from_utf8_lossy(reason)
            ),
        );
        ws.close_group();
    }

    fn on_error(&mut self, port: u16) {
        log(&self.events, format!("server error {port}"));
    }
}

#[test]
fn handshake_echo_and_close() {
    let events: Log = Rc::default();

    struct EchoClient {
        events: Log,
    }
    impl Handler<Client> for EchoClient {
        fn on_connection(&mut self, ws: &mut WebSocket<'_>) {
            log(&self.events, "client connected");
            ws.set_user_data(41u32);
            if let Some(n) = ws.user_data_mut::<u32>() {
                *n += 1;
            }
            ws.send(OpCode::Binary, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        }
        fn on_message(&mut self, ws: &mut WebSocket<'_>, data: &[u8], opcode: OpCode) {
            assert_eq!(opcode, OpCode::Binary);
            assert_eq!(data, [0xDE, 0xAD, 0xBE, 0xEF]);
            log(&self.events, "client echo received");
            ws.close(1000, "I'm closing now");
        }
        fn on_disconnection(&mut self, ws: &mut WebSocket<'_>, code: u16, reason: &[u8]) {
            assert_eq!(ws.user_data::<u32>(), Some(&42));
            log(
                &self.events,
                format!(
                    "client disconnected {code} {}",
                    String::from_utf8_lossy(reason)
                ),
            );
        }
        fn on_error(&mut self, token: UserToken) {
            panic!("unexpected client error for token {token}");
        }
    }

    let mut hub = Hub::new().unwrap();
    hub.on_server(ServerSide {
        events: events.clone(),
        on_message: Box::new(|ws, data, opcode, _| {
            ws.send(opcode, data).unwrap();
        }),
    });
    hub.on_client(EchoClient {
        events: events.clone(),
    });
    assert!(hub.listen(PORT_ECHO));
    hub.connect(&format!("ws://127.0.0.1:{PORT_ECHO}"), 1);
    hub.run();

    let events = events.borrow();
    assert!(events.contains(&"server connected".to_string()));
    assert!(events.contains(&"client connected".to_string()));
    assert!(events.contains(&"client echo received".to_string()));
    assert!(events.contains(&"server disconnected 1000 I'm closing now".to_string()));
    assert!(events.contains(&"client disconnected 1000 I'm closing now".to_string()));
}

fn spawn_raw_peer(port: u16, script: impl FnOnce(&mut TcpStream) + Send + 'static) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        raw_client_handshake(&mut stream, port);
        script(&mut stream);
    })
}

#[test]
fn fragmented_text_is_one_message() {
    let events: Log = Rc::default();
    let mut hub = Hub::new().unwrap();
    hub.on_server(ServerSide {
        events: events.clone(),
        on_message: Box::new(|ws, data, opcode, log_| {
            assert_eq!(opcode, OpCode::Text);
            assert_eq!(data, "Hello \u{1F30D}".as_bytes());
            log(log_, "message");
            ws.close(1000, "done");
        }),
    });
    assert!(hub.listen(PORT_FRAGMENTS));

    let peer = spawn_raw_peer(PORT_FRAGMENTS, |stream| {
        stream.write_all(&masked_frame(false, 1, b"He")).unwrap();
        stream.write_all(&masked_frame(false, 0, b"llo ")).unwrap();
        stream
            .write_all(&masked_frame(true, 0, "\u{1F30D}".as_bytes()))
            .unwrap();
        // server closes with 1000 "done", echo it back
        let (first, payload) = read_server_frame(stream);
        assert_eq!(first, 0x88);
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&payload[2..], b"done");
        stream.write_all(&masked_frame(true, 8, &payload)).unwrap();
    });

    hub.run();
    peer.join().unwrap();

    let events = events.borrow();
    assert_eq!(
        events.iter().filter(|e| e.as_str() == "message").count(),
        1
    );
    assert!(events.contains(&"server disconnected 1000 done".to_string()));
}

#[test]
fn invalid_utf8_terminates_with_1007() {
    let events: Log = Rc::default();
    let mut hub = Hub::new().unwrap();
    hub.on_server(ServerSide {
        events: events.clone(),
        on_message: Box::new(|_, _, _, _| panic!("no message expected")),
    });
    assert!(hub.listen(PORT_BAD_UTF8));

    let peer = spawn_raw_peer(PORT_BAD_UTF8, |stream| {
        stream
            .write_all(&masked_frame(true, 1, &[0xC3, 0x28]))
            .unwrap();
        // abrupt teardown, no close frame comes back
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    });

    hub.run();
    peer.join().unwrap();

    let events = events.borrow();
    assert!(events.contains(&"server disconnected 1007 ".to_string()));
}

#[test]
fn oversize_payload_terminates_immediately() {
    let events: Log = Rc::default();
    let mut hub = Hub::new().unwrap();
    hub.on_server(ServerSide {
        events: events.clone(),
        on_message: Box::new(|_, _, _, _| panic!("no message expected")),
    });
    assert!(hub.listen(PORT_OVERSIZE));

    let peer = spawn_raw_peer(PORT_OVERSIZE, |stream| {
        // header advertising a 17 MiB payload, nothing behind it
        let mut head = vec![0x82, 0x80 | 127];
        head.extend_from_slice(&(17u64 * 1024 * 1024).to_be_bytes());
        stream.write_all(&head).unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    });

    hub.run();
    peer.join().unwrap();

    let events = events.borrow();
    assert!(events.contains(&"server disconnected 1006 ".to_string()));
}

#[test]
fn ping_gets_automatic_pong() {
    let events: Log = Rc::default();
    let mut hub = Hub::new().unwrap();
    hub.on_server(ServerSide {
        events: events.clone(),
        on_message: Box::new(|ws, _, _, _| ws.close(1000, "")),
    });
    assert!(hub.listen(PORT_PING));

    let peer = spawn_raw_peer(PORT_PING, |stream| {
        stream.write_all(&masked_frame(true, 9, b"hi")).unwrap();
        let (first, payload) = read_server_frame(stream);
        assert_eq!(first, 0x8A);
        assert_eq!(payload, b"hi");
        // nudge the server into closing, then echo its close
        stream.write_all(&masked_frame(true, 2, b"x")).unwrap();
        let (first, payload) = read_server_frame(stream);
        assert_eq!(first, 0x88);
        stream.write_all(&masked_frame(true, 8, &payload)).unwrap();
    });

    hub.run();
    peer.join().unwrap();

    let events = events.borrow();
    assert!(events.contains(&"server ping hi".to_string()));
}

#[test]
fn broadcast_reaches_every_member_once() {
    const CLIENTS: u64 = 14;
    let received: Log = Rc::default();
    let codes: Rc<RefCell<Vec<u16>>> = Rc::default();

    struct Collector {
        received: Log,
        codes: Rc<RefCell<Vec<u16>>>,
    }
    impl Handler<Client> for Collector {
        fn on_message(&mut self, ws: &mut WebSocket<'_>, data: &[u8], opcode: OpCode) {
            assert_eq!(opcode, OpCode::Text);
            assert_eq!(data, b"This will be broadcasted!");
            let token = ws.token().unwrap();
            self.received.borrow_mut().push(format!("client {token}"));
        }
        fn on_disconnection(&mut self, _ws: &mut WebSocket<'_>, code: u16, _reason: &[u8]) {
            self.codes.borrow_mut().push(code);
        }
        fn on_error(&mut self, token: UserToken) {
            panic!("unexpected client error for token {token}");
        }
    }

    struct Counter {
        connected: u64,
    }
    impl Handler<Server> for Counter {
        fn on_connection(&mut self, ws: &mut WebSocket<'_>) {
            self.connected += 1;
            if self.connected == CLIENTS {
                ws.broadcast(OpCode::Text, b"This will be broadcasted!");
                ws.close_group();
            }
        }
    }

    let mut hub = Hub::new().unwrap();
    hub.on_server(Counter { connected: 0 });
    hub.on_client(Collector {
        received: received.clone(),
        codes: codes.clone(),
    });
    assert!(hub.listen(PORT_BROADCAST));
    for token in 0..CLIENTS {
        hub.connect(&format!("ws://127.0.0.1:{PORT_BROADCAST}"), token);
    }
    hub.run();

    let received = received.borrow();
    assert_eq!(received.len() as u64, CLIENTS, "one delivery per member");
    let mut unique = received.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len() as u64, CLIENTS, "no member hit twice");
    let codes = codes.borrow();
    assert_eq!(codes.len() as u64, CLIENTS);
    assert!(codes.iter().all(|&c| c == 1000));
}

#[test]
fn listen_conflict_fires_error_handler() {
    let events: Log = Rc::default();
    let mut hub = Hub::new().unwrap();
    hub.on_server(ServerSide {
        events: events.clone(),
        on_message: Box::new(|_, _, _, _| {}),
    });
    assert!(hub.listen(PORT_CONFLICT));
    assert!(!hub.listen(PORT_CONFLICT));
    assert!(events
        .borrow()
        .contains(&format!("server error {PORT_CONFLICT}")));

    let group = hub.server_group();
    hub.close_group(group);
    hub.run();
}

#[test]
fn connect_failures_surface_tokens() {
    let errors: Rc<RefCell<Vec<UserToken>>> = Rc::default();

    struct Failures {
        errors: Rc<RefCell<Vec<UserToken>>>,
    }
    impl Handler<Client> for Failures {
        fn on_connection(&mut self, _ws: &mut WebSocket<'_>) {
            panic!("no connection expected");
        }
        fn on_error(&mut self, token: UserToken) {
            self.errors.borrow_mut().push(token);
        }
    }

    // a listening socket nobody ever accepts from, silent on purpose
    let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let silent_port = silent.local_addr().unwrap().port();

    let mut hub = Hub::new().unwrap();
    hub.on_client(Failures {
        errors: errors.clone(),
    });

    hub.connect("invalid URI", 1);
    assert_eq!(errors.borrow().as_slice(), &[1]);

    hub.connect("ws://nonexistent.invalid", 2);
    assert_eq!(errors.borrow().as_slice(), &[1, 2]);

    hub.connect_with(&format!("ws://127.0.0.1:{silent_port}"), 3, 10, None);
    hub.run();
    assert_eq!(errors.borrow().as_slice(), &[1, 2, 3]);
}

#[test]
fn send_callback_fires_uncancelled() {
    let fired: Rc<RefCell<Vec<bool>>> = Rc::default();

    struct Greeter {
        fired: Rc<RefCell<Vec<bool>>>,
    }
    impl Handler<Server> for Greeter {
        fn on_connection(&mut self, ws: &mut WebSocket<'_>) {
            let fired = self.fired.clone();
            ws.send_with(OpCode::Text, b"hello", move |cancelled| {
                fired.borrow_mut().push(cancelled);
            })
            .unwrap();
        }
        fn on_disconnection(&mut self, ws: &mut WebSocket<'_>, _code: u16, _reason: &[u8]) {
            ws.close_group();
        }
    }

    let mut hub = Hub::new().unwrap();
    hub.on_server(Greeter {
        fired: fired.clone(),
    });
    assert!(hub.listen(PORT_CALLBACK));

    let peer = spawn_raw_peer(PORT_CALLBACK, |stream| {
        let (first, payload) = read_server_frame(stream);
        assert_eq!(first, 0x81);
        assert_eq!(payload, b"hello");
    });

    hub.run();
    peer.join().unwrap();
    assert_eq!(fired.borrow().as_slice(), &[false]);
}

#[test]
fn external_upgrade_enters_websocket_state() {
    let connected: Rc<RefCell<u32>> = Rc::default();
    let events: Log = Rc::default();

    struct Adopted {
        connected: Rc<RefCell<u32>>,
        events: Log,
    }
    impl Handler<Server> for Adopted {
        fn on_connection(&mut self, _ws: &mut WebSocket<'_>) {
            *self.connected.borrow_mut() += 1;
        }
        fn on_disconnection(&mut self, ws: &mut WebSocket<'_>, code: u16, _reason: &[u8]) {
            log(&self.events, format!("closed {code}"));
            ws.close_group();
        }
    }

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // the upgrade request was consumed elsewhere, only the response
        // arrives here
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        assert!(head.starts_with(b"HTTP/1.1 101"));
        let (first, payload) = read_server_frame(&mut stream);
        assert_eq!(first, 0x88);
        stream.write_all(&masked_frame(true, 8, &payload)).unwrap();
    });

    let (stream, _) = listener.accept().unwrap();
    let mut hub = Hub::new().unwrap();
    hub.on_server(Adopted {
        connected: connected.clone(),
        events: events.clone(),
    });
    assert!(hub.upgrade(stream, "x3JJHMbDL1EzLkh9GBhXDw==", None, "", None));
    assert_eq!(*connected.borrow(), 1);

    let group = hub.server_group();
    hub.close_group(group);
    hub.run();
    peer.join().unwrap();

    assert_eq!(events.borrow().as_slice(), &["closed 1000".to_string()]);
}
