use std::io;
use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

const LISTEN_BACKLOG: libc::c_int = 1024;

/// A freshly accepted, non-blocking connection socket.
#[derive(Debug)]
pub struct AcceptedSocket {
    pub fd: OwnedFd,
    pub peer: SocketAddr,
    pub local_loopback: bool,
}

/// C-layout socket address, either IPv4 or IPv6.
///
/// Mirrors what libstd does internally: a union-like repr so a single
/// pointer + length pair can be handed to `bind`/`connect`.
#[repr(C)]
union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(addr) => {
            let sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };
            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr,
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sockaddr_in },
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
            };
            (
                SocketAddrCRepr { v6: sockaddr_in6 },
                size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

fn to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: `ss_family` says this is a `sockaddr_in`.
            let addr: &libc::sockaddr_in =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: `ss_family` says this is a `sockaddr_in6`.
            let addr: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unexpected address family: {}", family),
        )),
    }
}

fn set_bool_sockopt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = libc::c_int::from(on);
    syscall!(setsockopt(
        fd,
        level,
        opt,
        &val as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

/// Create a non-blocking listening socket bound to `addr`, returning the
/// socket and the actually bound address (relevant for port 0).
///
/// `reuse_port` opts into kernel load balancing across several listeners
/// bound to the same address (one per worker).
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<(OwnedFd, SocketAddr)> {
    let domain = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))?;
    // SAFETY: `socket(2)` returned a valid owned fd.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    // Set SO_REUSEADDR (mirrors what libstd does).
    set_bool_sockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, true)?;
    if reuse_port {
        set_bool_sockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, true)?;
    }

    let (raw_addr, raw_addr_length) = socket_addr(&addr);
    syscall!(bind(
        fd,
        &raw_addr as *const SocketAddrCRepr as *const libc::sockaddr,
        raw_addr_length,
    ))?;
    syscall!(listen(fd, LISTEN_BACKLOG))?;

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    let bound = to_socket_addr(&storage)?;

    Ok((socket, bound))
}

/// Accept one pending connection. `Ok(None)` means the accept queue is
/// drained (`EAGAIN`); with an edge-triggered listener the caller loops
/// until it sees that.
pub fn accept_connection(listener_fd: RawFd) -> io::Result<Option<AcceptedSocket>> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let res = syscall!(accept4(
        listener_fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ));
    let fd = match res {
        Ok(fd) => fd,
        Err(ref err)
            if err.raw_os_error() == Some(libc::EAGAIN)
                || err.raw_os_error() == Some(libc::ECONNABORTED) =>
        {
            return Ok(None)
        }
        Err(err) => return Err(err),
    };

    // SAFETY: `accept4(2)` returned a valid owned fd.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };
    let peer = to_socket_addr(&storage)?;

    Ok(Some(AcceptedSocket {
        fd: socket,
        local_loopback: peer.ip().is_loopback(),
        peer,
    }))
}

/// Disable Nagle's algorithm; responses are written in as few syscalls as
/// possible so coalescing only adds latency.
pub fn set_nodelay(fd: RawFd) -> io::Result<()> {
    set_bool_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, true)
}

/// Fetch and clear the pending socket error (`SO_ERROR`), if any.
pub fn socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut val: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut val as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ))?;
    if val == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(val)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;
    use std::os::fd::AsRawFd;

    #[test]
    fn bind_ephemeral_and_accept() {
        let (listener, bound) = bind_listener("127.0.0.1:0".parse().unwrap(), false).unwrap();
        assert_ne!(bound.port(), 0);

        // Nothing pending yet.
        assert!(accept_connection(listener.as_raw_fd()).unwrap().is_none());

        let mut client = TcpStream::connect(bound).unwrap();
        client.write_all(b"x").unwrap();

        // The connect may take a moment to land in the accept queue.
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(sock) = accept_connection(listener.as_raw_fd()).unwrap() {
                accepted = Some(sock);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let accepted = accepted.expect("accept timed out");
        assert!(accepted.local_loopback);
        set_nodelay(accepted.fd.as_raw_fd()).unwrap();
        assert!(socket_error(accepted.fd.as_raw_fd()).unwrap().is_none());
    }

    #[test]
    fn reuse_port_allows_second_bind() {
        let (first, bound) = bind_listener("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let second = bind_listener(bound, true);
        drop(first);
        assert!(second.is_ok());
    }
}
