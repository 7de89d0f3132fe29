//! Socket reactor runtime.
//!
//! Two backends implement the same [`Reactor`] / [`Driver`] interface:
//! - Readiness (`readiness`): mio (epoll on Linux, kqueue on macOS), a poll
//!   thread feeding a dispatch queue drained by worker threads
//! - Completion (`completion`, Linux only): io_uring, workers waiting directly
//!   on the completion queue
//!
//! Both share common abstractions:
//! - `ObjectPool`: fixed-slot operation storage, grown one chunk at a time
//! - `Operation`: accept / receive / send with their completion handlers
//! - `Socket`: the socket primitives the reactors drive

pub mod op;
pub mod pool;
pub mod readiness;
pub mod socket;

#[cfg(target_os = "linux")]
pub mod completion;

pub use op::{
    AcceptHandler, AcceptOp, ErrorCode, OpId, OpKind, Operation, RecvOp, SendOp, Transfer,
    TransferHandler,
};
pub use pool::{NullLock, ObjectPool, PoolLock, SlotId, SyncPool, DEFAULT_CHUNK_SLOTS};
pub use readiness::ReadinessReactor;
pub use socket::{bind_listener, Socket};

#[cfg(target_os = "linux")]
pub use completion::CompletionProactor;

use crate::config::Backend;
use bytes::BytesMut;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Settings consumed by both backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Worker threads started when `start` is given zero.
    pub workers: usize,
    /// Upper bound on one poll / completion wait.
    pub poll_timeout: Duration,
    /// Readiness events fetched per poll.
    pub events_capacity: usize,
    /// io_uring submission queue entries.
    pub ring_entries: u32,
    /// Operation slots per pool chunk.
    pub chunk_slots: usize,
    /// Allocate the first pool chunk up front.
    pub preallocate: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus(),
            poll_timeout: Duration::from_millis(10),
            events_capacity: 128,
            ring_entries: 256,
            chunk_slots: DEFAULT_CHUNK_SLOTS,
            preallocate: true,
        }
    }
}

/// Registration and submission interface shared by both backends.
///
/// Handlers receive a `&dyn Driver` so they can submit follow-up operations.
pub trait Driver<S>: Send + Sync {
    /// Make `fd` eligible for operations.
    fn register_descriptor(&self, fd: RawFd) -> io::Result<()>;

    /// Forget `fd`. Operations still armed on it complete with `ECANCELED`.
    fn unregister_descriptor(&self, fd: RawFd) -> io::Result<()>;

    /// Store an operation in the reactor's pool without submitting it.
    fn alloc_op(&self, op: Operation<S>) -> OpId;

    /// Arm an operation. On failure the operation is released.
    fn submit(&self, op: OpId) -> io::Result<()>;

    /// Discard an operation that was never submitted.
    fn release(&self, op: OpId) -> bool;

    fn make_accept_op(&self, listener: Arc<S>, handler: Arc<dyn AcceptHandler<S>>) -> OpId {
        self.alloc_op(Operation::Accept(AcceptOp::new(listener, handler)))
    }

    /// Receive up to `len` bytes appended to `buf`.
    fn make_recv_op(
        &self,
        socket: Arc<S>,
        buf: BytesMut,
        len: usize,
        handler: Arc<dyn TransferHandler<S>>,
    ) -> OpId {
        self.alloc_op(Operation::Recv(RecvOp::new(socket, buf, len, handler)))
    }

    fn make_send_op(
        &self,
        socket: Arc<S>,
        buf: BytesMut,
        handler: Arc<dyn TransferHandler<S>>,
    ) -> OpId {
        self.alloc_op(Operation::Send(SendOp::new(socket, buf, handler)))
    }

    /// Accept connections until shutdown; `handler` runs once per connection.
    fn async_accept(&self, listener: Arc<S>, handler: Arc<dyn AcceptHandler<S>>) -> io::Result<()> {
        let op = self.make_accept_op(listener, handler);
        self.submit(op)
    }

    fn async_recv(
        &self,
        socket: Arc<S>,
        buf: BytesMut,
        len: usize,
        handler: Arc<dyn TransferHandler<S>>,
    ) -> io::Result<()> {
        let op = self.make_recv_op(socket, buf, len, handler);
        self.submit(op)
    }

    fn async_send(
        &self,
        socket: Arc<S>,
        buf: BytesMut,
        handler: Arc<dyn TransferHandler<S>>,
    ) -> io::Result<()> {
        let op = self.make_send_op(socket, buf, handler);
        self.submit(op)
    }
}

/// Thread lifecycle of a reactor.
pub trait Reactor<S>: Send + Sync {
    fn driver(&self) -> Arc<dyn Driver<S>>;

    /// Spawn the reactor threads. Zero workers means the configured count.
    fn start(&self, workers: usize) -> io::Result<()>;

    /// Stop dispatching. Unless `force` is set, also waits as `wait_all` does.
    fn stop(&self, force: bool);

    /// Join every reactor thread. Once stopped, operations still pending
    /// complete with `ECANCELED` before this returns.
    fn wait_all(&self);

    fn is_running(&self) -> bool;
}

/// Build the reactor for `backend`.
///
/// # Arguments
///
/// * `backend` - readiness (mio) or completion (io_uring)
/// * `config` - worker, poll and pool settings
pub fn build<S: Socket>(backend: Backend, config: &ReactorConfig) -> io::Result<Box<dyn Reactor<S>>> {
    match backend {
        Backend::Readiness => Ok(Box::new(ReadinessReactor::new(config)?)),
        #[cfg(target_os = "linux")]
        Backend::Completion => Ok(Box::new(CompletionProactor::new(config)?)),
        #[cfg(not(target_os = "linux"))]
        Backend::Completion => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "the completion backend requires Linux io_uring",
        )),
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_default_reactor_config() {
        let config = ReactorConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.poll_timeout, Duration::from_millis(10));
        assert_eq!(config.events_capacity, 128);
        assert_eq!(config.chunk_slots, 512);
        assert!(config.preallocate);
    }

    #[test]
    fn test_build_readiness_echo() {
        let reactor = build::<socket2::Socket>(Backend::Readiness, &ReactorConfig::default())
            .unwrap();
        reactor.start(1).unwrap();
        let driver = reactor.driver();

        let (a, b) = socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::STREAM, None)
            .unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let b = Arc::new(b);
        driver.register_descriptor(b.native_handle()).unwrap();

        // Receive, then send the same bytes back from inside the handler
        let (tx, rx) = mpsc::channel();
        let echo = Arc::new(move |driver: &dyn Driver<socket2::Socket>, done: Transfer<socket2::Socket>| {
            match done.kind {
                OpKind::Recv => {
                    let tx = tx.clone();
                    let sent = Arc::new(
                        move |_: &dyn Driver<socket2::Socket>, done: Transfer<socket2::Socket>| {
                            let _ = tx.send(done.bytes);
                        },
                    );
                    driver.async_send(done.socket, done.buf, sent).unwrap();
                }
                _ => unreachable!(),
            }
        });
        driver.async_recv(b, BytesMut::new(), 64, echo).unwrap();

        a.send_from(b"echo me").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);

        let mut buf = [0u8; 16];
        let mut n = 0;
        for _ in 0..100 {
            match a.recv_into(&mut buf) {
                Ok(read) => {
                    n = read;
                    break;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        assert_eq!(&buf[..n], b"echo me");

        reactor.stop(false);
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn test_completion_unsupported_off_linux() {
        let err = build::<socket2::Socket>(Backend::Completion, &ReactorConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
