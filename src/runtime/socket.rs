//! Socket primitives consumed by the reactors.
//!
//! Reactors never open sockets themselves. They drive whatever implements
//! [`Socket`]: non-blocking accept, receive and send on a raw descriptor.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

/// A non-blocking stream socket.
///
/// `From<OwnedFd>` lets the completion backend wrap descriptors returned by
/// the kernel.
pub trait Socket: From<OwnedFd> + Send + Sync + 'static {
    fn native_handle(&self) -> RawFd;

    /// Accept one pending connection.
    fn accept(&self) -> io::Result<Self>;

    fn recv_into(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn send_from(&self, buf: &[u8]) -> io::Result<usize>;

    fn set_nonblocking(&self) -> io::Result<()>;

    /// Pending socket error (`SO_ERROR`), if any.
    fn last_error(&self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }
}

impl Socket for socket2::Socket {
    fn native_handle(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn accept(&self) -> io::Result<Self> {
        socket2::Socket::accept(self).map(|(socket, _)| socket)
    }

    fn recv_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn send_from(&self, buf: &[u8]) -> io::Result<usize> {
        // socket2 sends with MSG_NOSIGNAL where available
        (&*self).write(buf)
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        socket2::Socket::set_nonblocking(self, true)
    }

    fn last_error(&self) -> io::Result<Option<io::Error>> {
        self.take_error()
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR` and `SO_REUSEPORT`.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket)
}
