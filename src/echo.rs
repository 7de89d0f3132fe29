//! Echo handlers for the demo server.
//!
//! Every accepted connection loops receive -> send until the peer closes or
//! an error occurs. Both handlers are shared behind `Arc`s, so a connection
//! never allocates a handler per operation.

use crate::runtime::{
    AcceptHandler, Driver, ErrorCode, OpKind, Socket, Transfer, TransferHandler,
};
use bytes::{Buf, BytesMut};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Starts the receive loop on each accepted connection.
pub struct EchoAcceptor {
    connection: Arc<EchoConnection>,
}

impl EchoAcceptor {
    /// # Arguments
    ///
    /// * `recv_size` - bytes requested per receive
    pub fn new(recv_size: usize) -> Self {
        Self {
            connection: Arc::new(EchoConnection { recv_size }),
        }
    }
}

impl<S: Socket> AcceptHandler<S> for EchoAcceptor {
    fn on_accept(self: Arc<Self>, driver: &dyn Driver<S>, socket: Option<S>, ec: ErrorCode) {
        let Some(socket) = socket else {
            if ec != ErrorCode::CANCELLED {
                warn!(ec = %ec, "Accept failed");
            }
            return;
        };

        let fd = socket.native_handle();
        debug!(fd, "Connection opened");

        let connection = Arc::clone(&self.connection);
        let recv_size = connection.recv_size;
        if let Err(e) = driver.async_recv(
            Arc::new(socket),
            BytesMut::with_capacity(recv_size),
            recv_size,
            connection,
        ) {
            warn!(fd, error = %e, "Failed to start receiving");
            close(driver, fd);
        }
    }
}

/// Echoes whatever a connection receives.
pub struct EchoConnection {
    recv_size: usize,
}

impl<S: Socket> TransferHandler<S> for EchoConnection {
    fn on_complete(self: Arc<Self>, driver: &dyn Driver<S>, done: Transfer<S>) {
        let fd = done.socket.native_handle();

        if !done.ec.is_success() {
            if done.ec != ErrorCode::CANCELLED {
                debug!(fd, kind = %done.kind, ec = %done.ec, "Connection error");
            }
            close(driver, fd);
            return;
        }

        let Transfer {
            kind,
            socket,
            mut buf,
            bytes,
            ..
        } = done;

        let submitted = match kind {
            OpKind::Recv if bytes == 0 => {
                debug!(fd, "Connection closed by peer");
                close(driver, fd);
                return;
            }
            OpKind::Recv => {
                trace!(fd, bytes, "Echoing");
                driver.async_send(socket, buf, self)
            }
            // Short write: send the rest
            OpKind::Send if bytes < buf.len() => {
                buf.advance(bytes);
                driver.async_send(socket, buf, self)
            }
            OpKind::Send => {
                buf.clear();
                let recv_size = self.recv_size;
                driver.async_recv(socket, buf, recv_size, self)
            }
            OpKind::Accept => {
                warn!(fd, "Accept result delivered to connection handler");
                return;
            }
        };

        if let Err(e) = submitted {
            debug!(fd, error = %e, "Failed to submit follow-up operation");
            close(driver, fd);
        }
    }
}

/// The socket itself closes when its last `Arc` drops.
fn close<S>(driver: &dyn Driver<S>, fd: RawFd) {
    if let Err(e) = driver.unregister_descriptor(fd) {
        trace!(fd, error = %e, "Unregister failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::runtime::{self, bind_listener, ReactorConfig};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn roundtrip(backend: Backend) {
        let reactor = match runtime::build::<socket2::Socket>(backend, &ReactorConfig::default()) {
            Ok(reactor) => reactor,
            Err(e) => {
                eprintln!("skipping {backend} echo test: {e}");
                return;
            }
        };
        reactor.start(2).unwrap();
        let driver = reactor.driver();

        let listener = Arc::new(bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap());
        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        driver.register_descriptor(listener.native_handle()).unwrap();
        driver
            .async_accept(listener, Arc::new(EchoAcceptor::new(64)))
            .unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        for message in [&b"hello"[..], &b"a somewhat longer second message"[..]] {
            client.write_all(message).unwrap();
            let mut echoed = vec![0u8; message.len()];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(echoed, message);
        }

        drop(client);
        reactor.stop(false);
    }

    #[test]
    fn test_echo_over_readiness() {
        roundtrip(Backend::Readiness);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_echo_over_completion() {
        roundtrip(Backend::Completion);
    }
}
