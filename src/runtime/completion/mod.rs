//! Completion-based proactor over io_uring (Linux).
//!
//! Operations are handed to the kernel as submission entries whose `user_data`
//! is the encoded [`OpId`]. Workers wait directly on the completion queue, so
//! there is no dispatch queue and no retry loop: the kernel result is forwarded
//! to the handler as is.
//!
//! An accept completes once per connection. The proactor submits a fresh
//! accept for the same listener and handler before running the handler, so
//! the listener keeps accepting until shutdown.

mod ring;

use self::ring::Ring;
use super::op::{AcceptOp, ErrorCode, OpId, Operation};
use super::pool::SyncPool;
use super::socket::Socket;
use super::{Driver, Reactor, ReactorConfig};
use io_uring::{opcode, squeue, types};
use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// `user_data` of the no-op entries that wake workers on stop.
const WAKE_TOKEN: u64 = u64::MAX;
/// `user_data` of cancellation requests.
const CANCEL_TOKEN: u64 = u64::MAX - 1;

/// How long stopped workers keep reaping cancelled operations.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Pooled operation plus whether the kernel has been handed it.
struct Pending<S> {
    op: Operation<S>,
    submitted: bool,
}

pub(crate) struct Shared<S> {
    ring: Ring,
    ops: SyncPool<Pending<S>>,
    /// Submitted operations whose completion has not been reaped yet.
    in_flight: AtomicUsize,
    started: AtomicBool,
    stopped: AtomicBool,
    workers: AtomicUsize,
    poll_timeout: Duration,
}

impl<S: Socket> Shared<S> {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn complete(&self, user_data: u64, result: i32) {
        if user_data == WAKE_TOKEN || user_data == CANCEL_TOKEN {
            return;
        }

        let id = OpId::from_u64(user_data);
        let Some(pending) = self.ops.checkout(id) else {
            warn!(op = %id, "Completion for unknown operation");
            return;
        };
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        let ec = if result < 0 {
            ErrorCode::from_raw(-result)
        } else {
            ErrorCode::SUCCESS
        };
        trace!(op = %id, kind = %pending.op.kind(), result, "Completion");

        match pending.op {
            Operation::Accept(op) => self.complete_accept(op, result),
            Operation::Recv(mut op) => {
                if result > 0 {
                    op.advance(result as usize);
                }
                let (handler, done) = op.finish(ec);
                handler.on_complete(self, done);
            }
            Operation::Send(mut op) => {
                if result > 0 {
                    op.advance(result as usize);
                }
                let (handler, done) = op.finish(ec);
                handler.on_complete(self, done);
            }
        }

        self.ops.release(id);
    }

    fn complete_accept(&self, op: AcceptOp<S>, result: i32) {
        let listener_fd = op.listener.native_handle();

        if result < 0 {
            let ec = ErrorCode::from_raw(-result);
            if !self.is_stopped() && !is_listener_fatal(-result) {
                self.resubmit_accept(&op);
            }
            debug!(listener = listener_fd, ec = %ec, "Accept failed");
            op.handler.on_accept(self, None, ec);
            return;
        }

        // SAFETY: the kernel just created this descriptor and nothing else owns it
        let socket = S::from(unsafe { OwnedFd::from_raw_fd(result) });
        let prepared = socket
            .set_nonblocking()
            .and_then(|()| self.register_descriptor(result));

        if !self.is_stopped() {
            self.resubmit_accept(&op);
        }

        match prepared {
            Ok(()) => {
                debug!(listener = listener_fd, fd = result, "Accepted connection");
                op.handler.on_accept(self, Some(socket), ErrorCode::SUCCESS);
            }
            Err(e) => {
                debug!(fd = result, error = %e, "Failed to prepare accepted socket");
                op.handler.on_accept(self, None, ErrorCode::from_io(&e));
            }
        }
    }

    fn resubmit_accept(&self, op: &AcceptOp<S>) {
        let next = self.alloc_op(Operation::Accept(AcceptOp::new(
            Arc::clone(&op.listener),
            Arc::clone(&op.handler),
        )));
        if let Err(e) = self.submit(next) {
            warn!(
                listener = op.listener.native_handle(),
                error = %e,
                "Failed to re-submit accept"
            );
        }
    }

    /// Ask the kernel to cancel every submitted operation.
    fn cancel_submitted(&self) {
        for id in self.ops.occupied_ids() {
            if self.ops.with_value(id, |pending| pending.submitted) == Some(true) {
                self.request_cancel(id);
            }
        }
    }

    fn request_cancel(&self, id: OpId) {
        let entry = opcode::AsyncCancel::new(id.to_u64())
            .build()
            .user_data(CANCEL_TOKEN);
        // SAFETY: a cancel request references no buffers
        if let Err(e) = unsafe { self.ring.push(&entry) } {
            warn!(op = %id, error = %e, "Failed to request cancellation");
        }
    }

    /// Hand a pooled operation to the kernel.
    fn push_submission(&self, id: OpId) -> io::Result<()> {
        let entry = self.ops.with_value(id, |pending| {
            if pending.submitted {
                return None;
            }
            pending.submitted = true;
            Some(build_entry(&mut pending.op).user_data(id.to_u64()))
        });
        let entry = match entry {
            Some(Some(entry)) => entry,
            Some(None) => return Err(already_submitted()),
            None => return Err(unknown_operation()),
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        // SAFETY: the buffer lives in the pooled operation, which is only
        // released after its completion has been reaped
        if let Err(e) = unsafe { self.ring.push(&entry) } {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.ops.release(id);
            return Err(e);
        }

        // Stop may have scanned the pool before this op was marked submitted
        if self.is_stopped() {
            trace!(op = %id, "Submitted during stop, cancelling");
            self.request_cancel(id);
        }
        Ok(())
    }

    fn wake_workers(&self) {
        let entry = opcode::Nop::new().build().user_data(WAKE_TOKEN);
        for _ in 0..self.workers.load(Ordering::Acquire) {
            // SAFETY: a no-op references no buffers
            if let Err(e) = unsafe { self.ring.push(&entry) } {
                warn!(error = %e, "Failed to wake worker");
                break;
            }
        }
    }

    /// Settle every operation left after the workers have exited.
    ///
    /// Completions already posted are delivered normally. Receives and sends
    /// the kernel may still touch are leaked instead of freed; everything else
    /// completes with `ECANCELED`.
    fn cancel_pending(&self) {
        while let Some(cqe) = self.ring.poll_completion() {
            self.complete(cqe.user_data(), cqe.result());
        }

        loop {
            let pending = self.ops.drain();
            if pending.is_empty() {
                break;
            }
            for (id, pending) in pending {
                let owned_by_kernel =
                    pending.submitted && !matches!(pending.op, Operation::Accept(_));
                if owned_by_kernel {
                    warn!(op = %id, kind = %pending.op.kind(), "Leaking operation still owned by the kernel");
                    mem::forget(pending);
                    continue;
                }
                trace!(op = %id, kind = %pending.op.kind(), "Cancelling operation");
                pending.op.fail(self, ErrorCode::CANCELLED);
            }
        }
    }
}

/// Accept errors after which the listener cannot be used again.
fn is_listener_fatal(errno: i32) -> bool {
    matches!(
        errno,
        libc::ECANCELED | libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP
    )
}

fn already_submitted() -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, "operation already submitted")
}

fn unknown_operation() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "unknown operation")
}

fn build_entry<S: Socket>(op: &mut Operation<S>) -> squeue::Entry {
    match op {
        Operation::Accept(op) => opcode::Accept::new(
            types::Fd(op.listener.native_handle()),
            ptr::null_mut(),
            ptr::null_mut(),
        )
        .flags(libc::SOCK_CLOEXEC)
        .build(),
        Operation::Recv(op) => {
            let (socket, unfilled) = op.io_parts();
            let len = unfilled.len().min(u32::MAX as usize) as u32;
            opcode::Recv::new(types::Fd(socket.native_handle()), unfilled.as_mut_ptr(), len)
                .build()
        }
        Operation::Send(op) => {
            let remaining = op.remaining();
            let len = remaining.len().min(u32::MAX as usize) as u32;
            opcode::Send::new(types::Fd(op.socket.native_handle()), remaining.as_ptr(), len)
                .flags(libc::MSG_NOSIGNAL)
                .build()
        }
    }
}

impl<S: Socket> Driver<S> for Shared<S> {
    /// io_uring needs no association; only checks that `fd` is open.
    fn register_descriptor(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: F_GETFD only inspects the descriptor table
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unregister_descriptor(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn alloc_op(&self, op: Operation<S>) -> OpId {
        self.ops.get(Pending {
            op,
            submitted: false,
        })
    }

    fn submit(&self, id: OpId) -> io::Result<()> {
        if !self.is_stopped() {
            return self.push_submission(id);
        }

        // The kernel may still write into a submitted op's buffer
        match self.ops.with_value(id, |pending| pending.submitted) {
            Some(true) => Err(already_submitted()),
            Some(false) => {
                self.ops.release(id);
                Err(io::Error::new(io::ErrorKind::Other, "proactor is stopped"))
            }
            None => Err(unknown_operation()),
        }
    }

    /// Only operations the kernel has not been handed can be released.
    fn release(&self, id: OpId) -> bool {
        match self.ops.with_value(id, |pending| pending.submitted) {
            Some(false) => self.ops.release(id),
            _ => false,
        }
    }
}

/// io_uring proactor with a pool of worker threads.
pub struct CompletionProactor<S: Socket> {
    shared: Arc<Shared<S>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: ReactorConfig,
}

impl<S: Socket> CompletionProactor<S> {
    /// Fails with `Unsupported` when the kernel's io_uring is too old.
    pub fn new(config: &ReactorConfig) -> io::Result<Self> {
        let ring = Ring::new(config.ring_entries)?;

        let shared = Shared {
            ring,
            ops: SyncPool::new(config.chunk_slots, config.preallocate),
            in_flight: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            workers: AtomicUsize::new(0),
            poll_timeout: config.poll_timeout,
        };

        Ok(Self {
            shared: Arc::new(shared),
            threads: Mutex::new(Vec::new()),
            config: config.clone(),
        })
    }

    fn threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Socket> Reactor<S> for CompletionProactor<S> {
    fn driver(&self) -> Arc<dyn Driver<S>> {
        self.shared.clone()
    }

    fn start(&self, workers: usize) -> io::Result<()> {
        if self.shared.is_stopped() {
            return Err(io::Error::new(io::ErrorKind::Other, "proactor is stopped"));
        }
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(io::ErrorKind::Other, "proactor already started"));
        }

        let workers = if workers == 0 {
            self.config.workers
        } else {
            workers
        }
        .max(1);

        let mut threads = self.threads();
        for worker_id in 0..workers {
            let shared = Arc::clone(&self.shared);
            threads.push(
                thread::Builder::new()
                    .name(format!("proactor-worker-{worker_id}"))
                    .spawn(move || worker_loop(&shared, worker_id))?,
            );
            self.shared.workers.fetch_add(1, Ordering::AcqRel);
        }

        info!(
            workers,
            ring_entries = self.config.ring_entries,
            "Completion proactor started"
        );
        Ok(())
    }

    fn stop(&self, force: bool) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            info!(
                in_flight = self.shared.in_flight.load(Ordering::Acquire),
                "Stopping completion proactor"
            );
            self.shared.cancel_submitted();
            self.shared.wake_workers();
        }
        if !force {
            self.wait_all();
        }
    }

    fn wait_all(&self) {
        let threads = mem::take(&mut *self.threads());
        for handle in threads {
            if handle.join().is_err() {
                error!("Proactor thread panicked");
            }
        }

        if self.shared.is_stopped() {
            self.shared.cancel_pending();
        }
    }

    fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::Acquire) && !self.shared.is_stopped()
    }
}

impl<S: Socket> Drop for CompletionProactor<S> {
    fn drop(&mut self) {
        self.stop(false);
    }
}

fn worker_loop<S: Socket>(shared: &Shared<S>, worker_id: usize) {
    let timeout = shared.poll_timeout;
    let ts = types::Timespec::new()
        .sec(timeout.as_secs())
        .nsec(timeout.subsec_nanos());
    let args = types::SubmitArgs::new().timespec(&ts);
    let mut drain_deadline = None;

    debug!(worker = worker_id, "Worker started");

    loop {
        if shared.is_stopped() {
            let deadline = *drain_deadline.get_or_insert_with(|| Instant::now() + SHUTDOWN_GRACE);
            if shared.in_flight.load(Ordering::Acquire) == 0 || Instant::now() >= deadline {
                break;
            }
        }

        match shared.ring.next_completion(&args) {
            Ok(Some(cqe)) => shared.complete(cqe.user_data(), cqe.result()),
            Ok(None) => {}
            Err(e) => {
                error!(worker = worker_id, error = %e, "Completion wait failed");
                break;
            }
        }
    }

    debug!(worker = worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::op::{AcceptHandler, Transfer, TransferHandler};
    use crate::runtime::socket::bind_listener;
    use bytes::BytesMut;
    use socket2::{Domain, Type};
    use std::net::TcpStream;
    use std::sync::mpsc;

    type Sock = socket2::Socket;

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(100);

    /// `None` where io_uring is unavailable (old kernel, seccomp).
    fn started(workers: usize) -> Option<CompletionProactor<Sock>> {
        let config = ReactorConfig {
            workers,
            chunk_slots: 4,
            ..ReactorConfig::default()
        };
        match CompletionProactor::new(&config) {
            Ok(proactor) => {
                proactor.start(0).unwrap();
                Some(proactor)
            }
            Err(e) => {
                eprintln!("skipping io_uring test: {e}");
                None
            }
        }
    }

    fn pair() -> (Sock, Sock) {
        let (a, b) = Sock::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    fn forward(tx: mpsc::Sender<Transfer<Sock>>) -> Arc<dyn TransferHandler<Sock>> {
        Arc::new(move |_: &dyn Driver<Sock>, done: Transfer<Sock>| {
            let _ = tx.send(done);
        })
    }

    #[test]
    fn test_recv_reports_kernel_byte_count() {
        let Some(proactor) = started(2) else { return };
        let driver = proactor.driver();
        let (a, b) = pair();
        let b = Arc::new(b);
        driver.register_descriptor(b.native_handle()).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b">");
        driver.async_recv(b, buf, 32, forward(tx)).unwrap();

        a.send_from(b"hello").unwrap();
        let done = rx.recv_timeout(WAIT).unwrap();
        assert!(done.ec.is_success());
        assert_eq!(done.bytes, 5);
        assert_eq!(&done.buf[..], b">hello");

        proactor.stop(false);
        assert_eq!(proactor.shared.ops.in_use(), 0);
    }

    #[test]
    fn test_send_then_recv_roundtrip() {
        let Some(proactor) = started(2) else { return };
        let driver = proactor.driver();
        let (a, b) = pair();
        let (a, b) = (Arc::new(a), Arc::new(b));

        let (tx, rx) = mpsc::channel();
        let handler = forward(tx);
        driver
            .async_send(a, BytesMut::from(&b"payload"[..]), Arc::clone(&handler))
            .unwrap();
        let sent = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(sent.kind, crate::runtime::OpKind::Send);
        assert_eq!(sent.bytes, 7);

        driver.async_recv(b, BytesMut::new(), 7, handler).unwrap();
        let received = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(&received.buf[..], b"payload");

        proactor.stop(false);
    }

    #[test]
    fn test_stop_cancels_in_flight_once() {
        let Some(proactor) = started(2) else { return };
        let driver = proactor.driver();
        let (_a, b) = pair();

        let (tx, rx) = mpsc::channel();
        driver
            .async_recv(Arc::new(b), BytesMut::new(), 16, forward(tx))
            .unwrap();
        assert!(rx.recv_timeout(QUIET).is_err());

        proactor.stop(false);
        let done = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(done.ec, ErrorCode::CANCELLED);
        assert_eq!(done.bytes, 0);
        assert!(rx.recv_timeout(QUIET).is_err());
        assert!(!proactor.is_running());
    }

    #[test]
    fn test_accept_is_resubmitted() {
        let Some(proactor) = started(2) else { return };
        let driver = proactor.driver();

        let listener = Arc::new(bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap());
        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        driver.register_descriptor(listener.native_handle()).unwrap();

        let (tx, rx) = mpsc::channel();
        let handler: Arc<dyn AcceptHandler<Sock>> = Arc::new(
            move |_: &dyn Driver<Sock>, socket: Option<Sock>, ec: ErrorCode| {
                let _ = tx.send((socket.is_some(), ec));
            },
        );
        driver.async_accept(listener, handler).unwrap();

        let _first = TcpStream::connect(addr).unwrap();
        let _second = TcpStream::connect(addr).unwrap();
        for _ in 0..2 {
            assert_eq!(rx.recv_timeout(WAIT).unwrap(), (true, ErrorCode::SUCCESS));
        }

        proactor.stop(false);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (false, ErrorCode::CANCELLED));
        assert!(rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn test_release_only_before_submit() {
        let Some(proactor) = started(1) else { return };
        let driver = proactor.driver();
        let (_a, b) = pair();
        let b = Arc::new(b);

        let (tx, _rx) = mpsc::channel();
        let handler = forward(tx);
        let unsubmitted = driver.make_recv_op(Arc::clone(&b), BytesMut::new(), 8, Arc::clone(&handler));
        assert!(driver.release(unsubmitted));

        let submitted = driver.make_recv_op(b, BytesMut::new(), 8, handler);
        driver.submit(submitted).unwrap();
        assert!(!driver.release(submitted));
        assert_eq!(
            driver.submit(submitted).unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );

        proactor.stop(false);
    }

    /// `None` where io_uring is unavailable. No workers: tests reap by hand.
    fn unstarted() -> Option<CompletionProactor<Sock>> {
        match CompletionProactor::new(&ReactorConfig::default()) {
            Ok(proactor) => Some(proactor),
            Err(e) => {
                eprintln!("skipping io_uring test: {e}");
                None
            }
        }
    }

    #[test]
    fn test_resubmit_after_stop_keeps_kernel_owned_op() {
        let Some(proactor) = unstarted() else { return };
        let shared = &proactor.shared;
        let (_a, b) = pair();

        let (tx, rx) = mpsc::channel();
        let id = shared.make_recv_op(Arc::new(b), BytesMut::new(), 16, forward(tx));
        shared.submit(id).unwrap();

        shared.stopped.store(true, Ordering::Release);
        let err = shared.submit(id).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(shared.ops.is_live(id));
        assert_eq!(shared.in_flight.load(Ordering::Acquire), 1);

        // Cancel and reap it the way stop does
        shared.cancel_submitted();
        worker_loop(shared, 0);
        let done = rx.try_recv().unwrap();
        assert_eq!(done.ec, ErrorCode::CANCELLED);
        assert!(!shared.ops.is_live(id));
    }

    #[test]
    fn test_submission_racing_stop_is_cancelled() {
        let Some(proactor) = unstarted() else { return };
        let shared = &proactor.shared;
        let (_a, b) = pair();

        let (tx, rx) = mpsc::channel();
        let id = shared.make_recv_op(Arc::new(b), BytesMut::new(), 16, forward(tx));

        // Stop has already scanned the pool when the op reaches the ring
        shared.stopped.store(true, Ordering::Release);
        shared.cancel_submitted();
        shared.push_submission(id).unwrap();

        worker_loop(shared, 0);
        let done = rx.try_recv().unwrap();
        assert_eq!(done.ec, ErrorCode::CANCELLED);
        assert_eq!(shared.in_flight.load(Ordering::Acquire), 0);
        assert_eq!(shared.ops.in_use(), 0);
    }

    #[test]
    fn test_register_rejects_closed_descriptor() {
        let Some(proactor) = started(1) else { return };
        assert!(proactor.driver().register_descriptor(-1).is_err());
        proactor.stop(false);
    }
}
