//! h2c upgrade and prior-knowledge handoff to an installed protocol
//! handler. A stub stands in for the external HTTP/2 implementation: it
//! emits a SETTINGS frame on creation and records what it receives.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aeronet::protocol::{ProcessResult, ProtocolAction, ProtocolHandler, ProtocolType};
use aeronet::{Http2Config, HttpResponse, HttpServerConfig, Server, ServerHandle};

/// Empty SETTINGS frame: length 0, type 0x4, flags 0, stream 0.
const SETTINGS_FRAME: [u8; 9] = [0, 0, 0, 4, 0, 0, 0, 0, 0];

struct StubH2Handler {
    output: Vec<u8>,
    output_offset: usize,
    consumed: Arc<AtomicUsize>,
}

impl StubH2Handler {
    fn new(consumed: Arc<AtomicUsize>) -> StubH2Handler {
        StubH2Handler {
            output: SETTINGS_FRAME.to_vec(),
            output_offset: 0,
            consumed,
        }
    }
}

impl ProtocolHandler for StubH2Handler {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Http2
    }

    fn process_input(&mut self, data: &[u8]) -> ProcessResult {
        self.consumed.fetch_add(data.len(), Ordering::SeqCst);
        ProcessResult {
            action: ProtocolAction::Continue,
            consumed: data.len(),
        }
    }

    fn has_pending_output(&self) -> bool {
        self.output_offset < self.output.len()
    }

    fn pending_output(&self) -> &[u8] {
        &self.output[self.output_offset..]
    }

    fn on_output_written(&mut self, written: usize) {
        self.output_offset += written;
        if self.output_offset >= self.output.len() {
            self.output.clear();
            self.output_offset = 0;
        }
    }

    fn initiate_close(&mut self) {}

    fn on_transport_closing(&mut self) {}
}

fn start_h2c_server() -> (SocketAddr, ServerHandle, JoinHandle<()>, Arc<AtomicUsize>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let consumed = Arc::new(AtomicUsize::new(0));
    let consumed_for_factory = consumed.clone();
    let (ready_tx, ready_rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let config = HttpServerConfig::default()
            .with_bind_addr(Ipv4Addr::LOCALHOST.into())
            .with_port(0)
            .with_http2(Http2Config {
                enabled: true,
                enable_h2c: true,
            });
        let mut server = Server::new(config).expect("bind server");
        server
            .router_mut()
            .get("/", |_request| HttpResponse::with_text(200, "http/1.1"));
        server.set_http2_handler_factory(Arc::new(move || {
            Box::new(StubH2Handler::new(consumed_for_factory.clone()))
                as Box<dyn ProtocolHandler>
        }));
        ready_tx
            .send((server.local_addr(), server.handle()))
            .expect("report readiness");
        server.run();
    });
    let (addr, handle) = ready_rx.recv().expect("server failed to start");
    (addr, handle, join, consumed)
}

fn read_some(stream: &mut TcpStream, at_least: usize) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    while data.len() < at_least {
        let n = stream.read(&mut buf).expect("read");
        assert_ne!(n, 0, "closed early");
        data.extend_from_slice(&buf[..n]);
    }
    data
}

#[test]
fn h2c_upgrade_emits_101_then_settings() {
    let (addr, handle, join, _consumed) = start_h2c_server();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Host: h\r\n\
              Upgrade: h2c\r\n\
              Connection: Upgrade, HTTP2-Settings\r\n\
              HTTP2-Settings: AAMAAABkAAQAoAAAAAIAAAAA\r\n\r\n",
        )
        .unwrap();

    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    let head_end = loop {
        let n = stream.read(&mut buf).expect("read");
        assert_ne!(n, 0);
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(head.contains("Upgrade: h2c\r\n"), "{head}");
    assert!(head.contains("Connection: Upgrade\r\n"), "{head}");

    // Immediately after the 101, the handler's SETTINGS frame.
    while data.len() < head_end + SETTINGS_FRAME.len() {
        let n = stream.read(&mut buf).expect("read settings");
        assert_ne!(n, 0);
        data.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&data[head_end..head_end + SETTINGS_FRAME.len()], SETTINGS_FRAME);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn prior_knowledge_preface_installs_handler() {
    let (addr, handle, join, consumed) = start_h2c_server();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n")
        .unwrap();

    // Handler consumed the preface and answered with SETTINGS (no 101).
    let data = read_some(&mut stream, SETTINGS_FRAME.len());
    assert_eq!(&data[..SETTINGS_FRAME.len()], SETTINGS_FRAME);
    for _ in 0..50 {
        if consumed.load(Ordering::SeqCst) >= 24 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(consumed.load(Ordering::SeqCst) >= 24);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn invalid_h2c_upgrade_is_400() {
    let (addr, handle, join, _consumed) = start_h2c_server();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // Missing the HTTP2-Settings header entirely.
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: h\r\nUpgrade: h2c\r\nConnection: Upgrade\r\n\r\n")
        .unwrap();

    let data = read_some(&mut stream, 12);
    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("HTTP/1.1 400"), "{text}");

    handle.stop();
    join.join().unwrap();
}
