//! End-to-end HTTP/1.1 tests over real loopback sockets.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aeronet::{HttpResponse, HttpServerConfig, Server, ServerHandle};

fn start_server(
    configure: impl FnOnce(&mut Server) + Send + 'static,
) -> (SocketAddr, ServerHandle, JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (ready_tx, ready_rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let config = HttpServerConfig::default()
            .with_bind_addr(Ipv4Addr::LOCALHOST.into())
            .with_port(0);
        let mut server = Server::new(config).expect("bind server");
        configure(&mut server);
        ready_tx
            .send((server.local_addr(), server.handle()))
            .expect("report readiness");
        server.run();
    });
    let (addr, handle) = ready_rx.recv().expect("server failed to start");
    (addr, handle, join)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Read one response: headers, then a Content-Length-delimited body.
fn read_response(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        match stream.read(&mut buf) {
            Ok(0) => panic!("connection closed before response head"),
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(err) => panic!("read failed: {err}"),
        }
        if let Some(pos) = data.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while data.len() < header_end + content_length {
        match stream.read(&mut buf) {
            Ok(0) => panic!("connection closed mid-body"),
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(err) => panic!("read failed: {err}"),
        }
    }
    String::from_utf8_lossy(&data[..header_end + content_length]).into_owned()
}

#[test]
fn basic_get_echo() {
    let (addr, handle, join) = start_server(|server| {
        server.router_mut().get("/echo", |_request| {
            HttpResponse::with_text(200, "ok")
        });
    });

    let mut client = connect(addr);
    client
        .write_all(b"GET /echo HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Length: 2\r\n"), "{response}");
    assert!(response.ends_with("\r\n\r\nok"), "{response}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn chunked_request_with_trailer() {
    let (addr, handle, join) = start_server(|server| {
        server.router_mut().post("/upload", |request| {
            let trailer = request.trailer_value("X-Trailer").unwrap_or("").to_owned();
            let body = String::from_utf8_lossy(request.body()).into_owned();
            HttpResponse::with_text(200, format!("{body}|{trailer}"))
        });
    });

    let mut client = connect(addr);
    client
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: v\r\n\r\n",
        )
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("hello world|v"), "{response}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn keep_alive_serves_pipelined_requests() {
    let (addr, handle, join) = start_server(|server| {
        server
            .router_mut()
            .get("/a", |_request| HttpResponse::with_text(200, "first"));
        server
            .router_mut()
            .get("/b", |_request| HttpResponse::with_text(200, "second"));
    });

    let mut client = connect(addr);
    client
        .write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let first = read_response(&mut client);
    assert!(first.ends_with("first"), "{first}");
    assert!(!first.contains("Connection: close"), "{first}");

    client
        .write_all(b"GET /b HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let second = read_response(&mut client);
    assert!(second.ends_with("second"), "{second}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn not_found_and_method_not_allowed() {
    let (addr, handle, join) = start_server(|server| {
        server
            .router_mut()
            .get("/only-get", |_request| HttpResponse::with_text(200, "x"));
    });

    let mut client = connect(addr);
    client
        .write_all(b"GET /missing HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    let mut client = connect(addr);
    client
        .write_all(b"POST /only-get HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 405"), "{response}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn transfer_encoding_with_content_length_is_rejected() {
    let (addr, handle, join) = start_server(|server| {
        server
            .router_mut()
            .post("/x", |_request| HttpResponse::with_text(200, "x"));
    });

    let mut client = connect(addr);
    client
        .write_all(
            b"POST /x HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\
              Content-Length: 5\r\n\r\n0\r\n\r\n",
        )
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains("Connection: close"), "{response}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn http10_with_transfer_encoding_is_rejected() {
    let (addr, handle, join) = start_server(|server| {
        server
            .router_mut()
            .post("/x", |_request| HttpResponse::with_text(200, "x"));
    });

    let mut client = connect(addr);
    client
        .write_all(b"POST /x HTTP/1.0\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn forbidden_identity_without_alternative_is_406() {
    let (addr, handle, join) = start_server(|server| {
        server
            .router_mut()
            .get("/x", |_request| HttpResponse::with_text(200, "x"));
    });

    let mut client = connect(addr);
    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\nAccept-Encoding: identity;q=0\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 406"), "{response}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn oversized_headers_get_431() {
    let (addr, handle, join) = start_server(|server| {
        server
            .router_mut()
            .get("/x", |_request| HttpResponse::with_text(200, "x"));
    });

    let mut client = connect(addr);
    let mut request = b"GET /x HTTP/1.1\r\nHost: h\r\nX-Filler: ".to_vec();
    request.extend_from_slice(&vec![b'a'; 10_000]);
    request.extend_from_slice(b"\r\n\r\n");
    client.write_all(&request).unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 431"), "{response}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn expect_100_continue_gets_interim_response() {
    let (addr, handle, join) = start_server(|server| {
        server.router_mut().post("/upload", |request| {
            let len = request.body().len();
            HttpResponse::with_text(200, len.to_string())
        });
    });

    let mut client = connect(addr);
    client
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: h\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n",
        )
        .unwrap();
    // The interim 100 arrives before we send the body.
    let mut interim = [0u8; 25];
    client.read_exact(&mut interim).unwrap();
    assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    client.write_all(b"hello").unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("5"), "{response}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn drain_closes_after_final_response() {
    let (addr, handle, join) = start_server(|server| {
        server
            .router_mut()
            .get("/x", |_request| HttpResponse::with_text(200, "x"));
    });

    // Established keep-alive connection.
    let mut client = connect(addr);
    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let first = read_response(&mut client);
    assert!(!first.contains("Connection: close"), "{first}");

    handle.begin_drain(Some(Duration::from_secs(5)));
    // Give the loop a moment to apply the drain.
    thread::sleep(Duration::from_millis(100));

    // No new connections are accepted once the listener is closed.
    let refused = TcpStream::connect(addr)
        .and_then(|mut stream| {
            stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            stream.write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n")?;
            let mut buf = [0u8; 1];
            let n = stream.read(&mut buf)?;
            Ok(n)
        })
        .map(|n| n == 0)
        .unwrap_or(true);
    assert!(refused, "listener still accepting during drain");

    // The existing connection gets one more exchange, marked close.
    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let last = read_response(&mut client);
    assert!(last.contains("Connection: close"), "{last}");

    // And then the server closes it.
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);

    join.join().unwrap();
}

#[test]
fn global_headers_are_appended() {
    let (addr, handle, join) = start_server(|server| {
        server
            .router_mut()
            .get("/x", |_request| HttpResponse::with_text(200, "x"));
    });
    handle.post_config_update(|config| {
        config
            .global_headers
            .push(("Server".to_owned(), "aeronet-test".to_owned()));
    });
    thread::sleep(Duration::from_millis(100));

    let mut client = connect(addr);
    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.contains("Server: aeronet-test\r\n"), "{response}");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn immutable_config_fields_survive_updates() {
    let (addr, handle, join) = start_server(|server| {
        server
            .router_mut()
            .get("/x", |_request| HttpResponse::with_text(200, "x"));
    });

    // Attempt to rebind at runtime; silently restored.
    handle.post_config_update(|config| {
        config.port = 1;
        config.worker_threads = 64;
    });
    thread::sleep(Duration::from_millis(100));

    // Still serving on the original port.
    let mut client = connect(addr);
    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    handle.stop();
    join.join().unwrap();
}
