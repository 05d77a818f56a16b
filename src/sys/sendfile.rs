use std::os::fd::RawFd;

/// Outcome of a single `sendfile(2)` attempt.
#[derive(Debug)]
pub enum SendfileOutcome {
    /// `n` bytes were handed to the socket; the file offset advanced.
    Sent(usize),
    /// The socket cannot take more right now. `enable_writable` is true for
    /// `EAGAIN` (arm EPOLLOUT), false for `EINTR` (retry on the next tick).
    WouldBlock { enable_writable: bool },
    /// Unrecoverable transfer error; the connection should be torn down.
    Error(std::io::Error),
}

/// Transfer up to `max_chunk` bytes from `file_fd` at `offset` straight to
/// `socket_fd`, bypassing user space.
///
/// A zero return on a non-exhausted file is mapped to `WouldBlock` with
/// writable interest: it happens when the socket buffer is momentarily full
/// on some kernels and retrying blindly would spin.
pub fn sendfile_to_socket(
    socket_fd: RawFd,
    file_fd: RawFd,
    offset: u64,
    max_chunk: usize,
) -> SendfileOutcome {
    let mut off = offset as libc::off_t;
    let sent = unsafe { libc::sendfile(socket_fd, file_fd, &mut off, max_chunk) };
    if sent > 0 {
        return SendfileOutcome::Sent(sent as usize);
    }
    if sent == 0 {
        return SendfileOutcome::WouldBlock {
            enable_writable: true,
        };
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => SendfileOutcome::WouldBlock {
            enable_writable: true,
        },
        Some(libc::EINTR) => SendfileOutcome::WouldBlock {
            enable_writable: false,
        },
        _ => SendfileOutcome::Error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    #[test]
    fn transfers_file_bytes() {
        let mut file = tempfile();
        file.write_all(b"hello sendfile").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        match sendfile_to_socket(server.as_raw_fd(), file.as_raw_fd(), 6, 8) {
            SendfileOutcome::Sent(n) => assert_eq!(n, 8),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"sendfile");
    }

    fn tempfile() -> std::fs::File {
        let mut path = std::env::temp_dir();
        path.push(format!("aeronet-sendfile-test-{}", std::process::id()));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }
}
