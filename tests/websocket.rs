//! WebSocket upgrade, echo, and close-handshake tests over raw sockets.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aeronet::websocket::{
    apply_mask, build_frame, parse_close_payload, parse_frame, CloseCode, FrameParse, Opcode,
};
use aeronet::{
    HttpServerConfig, Server, ServerHandle, WebSocketCallbacks, WebSocketConfig, WebSocketEndpoint,
};

fn start_ws_server() -> (SocketAddr, ServerHandle, JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (ready_tx, ready_rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let config = HttpServerConfig::default()
            .with_bind_addr(Ipv4Addr::LOCALHOST.into())
            .with_port(0);
        let mut server = Server::new(config).expect("bind server");
        server.router_mut().websocket(
            "/ws",
            WebSocketEndpoint {
                config: WebSocketConfig::default(),
                callbacks: std::sync::Arc::new(|_request| WebSocketCallbacks {
                    on_message: Some(Box::new(
                        |payload: &[u8],
                         binary: bool,
                         sender: &mut aeronet::WebSocketSender<'_>| {
                            if binary {
                                sender.send_binary(payload);
                            } else {
                                let text = String::from_utf8_lossy(payload).into_owned();
                                sender.send_text(&text);
                            }
                        },
                    )),
                    ..WebSocketCallbacks::default()
                }),
            },
        );
        ready_tx
            .send((server.local_addr(), server.handle()))
            .expect("report readiness");
        server.run();
    });
    let (addr, handle) = ready_rx.recv().expect("server failed to start");
    (addr, handle, join)
}

fn upgrade(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: h\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    let head = read_until_double_crlf(&mut stream);
    assert!(
        head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "{head}"
    );
    assert!(head.contains("Upgrade: websocket\r\n"), "{head}");
    assert!(head.contains("Connection: Upgrade\r\n"), "{head}");
    // RFC 6455 §4.2.2 sample-nonce test vector.
    assert!(
        head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"),
        "{head}"
    );
    stream
}

fn read_until_double_crlf(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).expect("read");
        assert_ne!(n, 0, "closed before response head completed");
        data.extend_from_slice(&buf[..n]);
        if data.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    assert!(data.ends_with(b"\r\n\r\n"), "trailing bytes after 101");
    String::from_utf8_lossy(&data).into_owned()
}

fn read_one_frame(stream: &mut TcpStream) -> (Opcode, Vec<u8>) {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match parse_frame(&data, 0, false, false) {
            FrameParse::Complete {
                header, payload, ..
            } => return (header.opcode, payload.to_vec()),
            FrameParse::Incomplete => {}
            other => panic!("bad frame from server: {other:?}"),
        }
        let n = stream.read(&mut buf).expect("read frame");
        assert_ne!(n, 0, "closed mid-frame");
        data.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn upgrade_and_echo() {
    let (addr, handle, join) = start_ws_server();
    let mut stream = upgrade(addr);

    // Clients mask with a random key; the server must unmask regardless.
    let key: [u8; 4] = rand::random();
    let mut frame = Vec::new();
    build_frame(
        &mut frame,
        Opcode::Text,
        b"Hello, WebSocket!",
        true,
        Some(key),
        false,
    );
    stream.write_all(&frame).unwrap();

    let (opcode, payload) = read_one_frame(&mut stream);
    assert_eq!(opcode, Opcode::Text);
    assert_eq!(payload, b"Hello, WebSocket!");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn ping_gets_pong() {
    let (addr, handle, join) = start_ws_server();
    let mut stream = upgrade(addr);

    let mut frame = Vec::new();
    build_frame(
        &mut frame,
        Opcode::Ping,
        b"are-you-there",
        true,
        Some([1, 2, 3, 4]),
        false,
    );
    stream.write_all(&frame).unwrap();

    let (opcode, payload) = read_one_frame(&mut stream);
    assert_eq!(opcode, Opcode::Pong);
    assert_eq!(payload, b"are-you-there");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn close_handshake_echoes_code_and_reason() {
    let (addr, handle, join) = start_ws_server();
    let mut stream = upgrade(addr);

    let mut close_payload = Vec::new();
    close_payload.extend_from_slice(&1000u16.to_be_bytes());
    close_payload.extend_from_slice(b"goodbye");
    let mut frame = Vec::new();
    build_frame(
        &mut frame,
        Opcode::Close,
        &close_payload,
        true,
        Some([9, 9, 9, 9]),
        false,
    );
    stream.write_all(&frame).unwrap();

    let (opcode, payload) = read_one_frame(&mut stream);
    assert_eq!(opcode, Opcode::Close);
    let (code, reason) = parse_close_payload(&payload);
    assert_eq!(code, CloseCode::Normal);
    assert_eq!(reason, b"goodbye");

    // The server tears the connection down after the handshake.
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap_or(0), 0);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn fragmented_message_is_reassembled() {
    let (addr, handle, join) = start_ws_server();
    let mut stream = upgrade(addr);

    let key = [5, 6, 7, 8];
    let mut bytes = Vec::new();
    build_frame(&mut bytes, Opcode::Text, b"Hel", false, Some(key), false);
    build_frame(
        &mut bytes,
        Opcode::Continuation,
        b"lo!",
        true,
        Some(key),
        false,
    );
    stream.write_all(&bytes).unwrap();

    let (opcode, payload) = read_one_frame(&mut stream);
    assert_eq!(opcode, Opcode::Text);
    assert_eq!(payload, b"Hello!");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn unmasked_client_frame_is_protocol_error() {
    let (addr, handle, join) = start_ws_server();
    let mut stream = upgrade(addr);

    let mut frame = Vec::new();
    build_frame(&mut frame, Opcode::Text, b"bare", true, None, false);
    stream.write_all(&frame).unwrap();

    let (opcode, payload) = read_one_frame(&mut stream);
    assert_eq!(opcode, Opcode::Close);
    let (code, _) = parse_close_payload(&payload);
    assert_eq!(code, CloseCode::ProtocolError);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn mask_roundtrip_helper() {
    // apply_mask(apply_mask(x)) == x, exercised through the public API.
    let key = [0xDE, 0xAD, 0xBE, 0xEF];
    let original = b"masking sanity".to_vec();
    let mut data = original.clone();
    apply_mask(&mut data, key);
    apply_mask(&mut data, key);
    assert_eq!(data, original);
}
