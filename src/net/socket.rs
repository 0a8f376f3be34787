//! Thin wrapper over a non-blocking TCP socket.
//!
//! `nonblock_recv` / `nonblock_send` fold the transient outcomes
//! (`EAGAIN`, `EWOULDBLOCK`, `EINTR`) into "zero bytes of progress" so the
//! connection state machine only has to distinguish progress, no-progress
//! and fatal.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::error;

const LISTEN_BACKLOG: i32 = 1024;

/// An owned TCP socket. Dropping it closes the file descriptor.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    fn new_tcp() -> io::Result<socket2::Socket> {
        socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
    }

    /// Creates a non-blocking listening socket bound to `0.0.0.0:port`
    /// with `SO_REUSEADDR` and `SO_REUSEPORT` set.
    ///
    /// Port 0 binds an ephemeral port; query it with
    /// [`local_addr`](Self::local_addr).
    pub fn create_server(port: u16) -> io::Result<Socket> {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let sock = Self::new_tcp()?;
        sock.set_reuse_address(true)?;
        sock.set_reuse_port(true)?;
        sock.bind(&SockAddr::from(addr))?;
        sock.listen(LISTEN_BACKLOG)?;
        sock.set_nonblocking(true)?;
        Ok(Socket { inner: sock })
    }

    /// Connects to `addr` (blocking), then switches the socket to
    /// non-blocking mode.
    pub fn connect(addr: SocketAddr) -> io::Result<Socket> {
        let sock = Self::new_tcp()?;
        sock.connect(&SockAddr::from(addr))?;
        sock.set_nonblocking(true)?;
        Ok(Socket { inner: sock })
    }

    /// Accepts one pending connection. `Ok(None)` means the accept queue
    /// is drained. The accepted socket is non-blocking.
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        match self.inner.accept() {
            Ok((sock, peer)) => {
                sock.set_nonblocking(true)?;
                let peer = peer
                    .as_socket()
                    .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
                Ok(Some((Socket { inner: sock }, peer)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads once from the socket.
    ///
    /// `Ok(n)` is progress, `Ok(0)` means "nothing available right now",
    /// and `Err` is connection-fatal. A clean end-of-stream is reported as
    /// fatal so the caller takes the drain-close path.
    pub fn nonblock_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(fd = self.fd(), error = %e, "socket recv error");
                    return Err(e);
                }
            }
        }
    }

    /// Writes once to the socket, with the same outcome mapping as
    /// [`nonblock_recv`](Self::nonblock_recv).
    pub fn nonblock_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(fd = self.fd(), error = %e, "socket send error");
                    return Err(e);
                }
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an inet socket"))
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_socket_binds_ephemeral_port() {
        let sock = Socket::create_server(0).unwrap();
        let addr = sock.local_addr().unwrap();
        assert!(addr.port() != 0);
    }

    #[test]
    fn accept_on_idle_listener_would_block() {
        let sock = Socket::create_server(0).unwrap();
        assert!(sock.accept().unwrap().is_none());
    }

    #[test]
    fn transient_recv_reports_zero_bytes() {
        let listener = Socket::create_server(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        let mut client = Socket::connect(addr).unwrap();
        let mut buf = [0u8; 16];
        // Nothing has been sent; a non-blocking read maps EAGAIN to zero.
        assert_eq!(client.nonblock_recv(&mut buf).unwrap(), 0);
    }
}
