//! File responses through the sendfile engine, including the EAGAIN /
//! partial-progress path with a slow reader.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aeronet::{FilePayload, HttpResponse, HttpServerConfig, Server, ServerHandle};

const FILE_SIZE: usize = 128 * 1024;

fn temp_file_with_pattern() -> std::fs::File {
    let mut path = std::env::temp_dir();
    path.push(format!("aeronet-filesend-{}", std::process::id()));
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let _ = std::fs::remove_file(&path);
    let pattern: Vec<u8> = (0..FILE_SIZE).map(|index| (index % 251) as u8).collect();
    file.write_all(&pattern).unwrap();
    file
}

fn start_file_server() -> (SocketAddr, ServerHandle, JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (ready_tx, ready_rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let config = HttpServerConfig::default()
            .with_bind_addr(Ipv4Addr::LOCALHOST.into())
            .with_port(0);
        let mut server = Server::new(config).expect("bind server");
        server.router_mut().get("/big", |_request| {
            let file = temp_file_with_pattern();
            let payload = FilePayload::whole(file).expect("stat file");
            HttpResponse::new(200).file(payload)
        });
        ready_tx
            .send((server.local_addr(), server.handle()))
            .expect("report readiness");
        server.run();
    });
    let (addr, handle) = ready_rx.recv().expect("server failed to start");
    (addr, handle, join)
}

fn fetch_big(addr: SocketAddr, slow: bool) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
        .write_all(b"GET /big HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut data = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(err) => panic!("read failed: {err}"),
        }
        if slow {
            // Let the server hit a full socket buffer and take the
            // deferred-write path.
            thread::sleep(Duration::from_millis(1));
        }
    }
    data
}

fn check_response(data: &[u8]) {
    let head_end = data
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("no header terminator")
        + 4;
    let head = String::from_utf8_lossy(&data[..head_end]);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(
        head.contains(&format!("Content-Length: {}\r\n", FILE_SIZE)),
        "{head}"
    );

    let body = &data[head_end..];
    assert_eq!(body.len(), FILE_SIZE, "body length mismatch");
    for (index, &byte) in body.iter().enumerate() {
        assert_eq!(byte, (index % 251) as u8, "corruption at offset {index}");
    }
}

#[test]
fn serves_large_file_response() {
    let (addr, handle, join) = start_file_server();
    let data = fetch_big(addr, false);
    check_response(&data);
    handle.stop();
    join.join().unwrap();
}

#[test]
fn slow_reader_gets_every_byte() {
    let (addr, handle, join) = start_file_server();
    let data = fetch_big(addr, true);
    check_response(&data);
    handle.stop();
    join.join().unwrap();
}
