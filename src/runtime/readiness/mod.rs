//! Readiness-based reactor over mio (epoll on Linux, kqueue on macOS).
//!
//! One poll thread waits for readiness events and pushes the armed operations
//! onto a [`DispatchQueue`]; worker threads pop them and perform the actual
//! non-blocking I/O.
//!
//! ## One-shot arming
//!
//! Descriptors are registered edge-triggered. Each registration has one read
//! and one write slot; submitting an operation fills the slot and re-registers
//! the descriptor, which makes the OS report a level that is already ready. An
//! event empties the slot, so at most one worker ever completes a given
//! operation, and events arriving while nothing is armed are dropped.

mod complete;
mod dispatch;

pub use dispatch::DispatchQueue;

use super::op::{ErrorCode, OpId, Operation};
use super::pool::SyncPool;
use super::socket::Socket;
use super::{Driver, Reactor, ReactorConfig};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Wakes the poll thread on stop. Descriptors never reach this value.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Operations armed on one descriptor.
#[derive(Debug, Default)]
struct Registration {
    read: Option<OpId>,
    write: Option<OpId>,
}

impl Registration {
    fn slot_mut(&mut self, writable: bool) -> &mut Option<OpId> {
        if writable {
            &mut self.write
        } else {
            &mut self.read
        }
    }

    fn interest(&self) -> Interest {
        let interest = read_interest();
        if self.write.is_some() {
            interest.add(Interest::WRITABLE)
        } else {
            interest
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn read_interest() -> Interest {
    Interest::READABLE.add(Interest::PRIORITY)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn read_interest() -> Interest {
    Interest::READABLE
}

/// State shared by the poll thread, the workers and every driver handle.
pub(crate) struct Shared<S> {
    registry: Registry,
    waker: Waker,
    registrations: Mutex<HashMap<RawFd, Registration>>,
    ops: SyncPool<Operation<S>>,
    queue: DispatchQueue,
    stopped: AtomicBool,
}

impl<S: Socket> Shared<S> {
    fn registrations(&self) -> MutexGuard<'_, HashMap<RawFd, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Arm `id` on `fd` and re-register the descriptor's interest.
    fn resume(&self, fd: RawFd, id: OpId, interest: Interest) -> io::Result<()> {
        let mut registrations = self.registrations();
        let registration = registrations.get_mut(&fd).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "descriptor is not registered")
        })?;

        let writable = interest.is_writable();
        let slot = registration.slot_mut(writable);
        let previous = *slot;
        if previous.is_some_and(|armed| armed != id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "another operation is armed for this direction",
            ));
        }
        *slot = Some(id);

        let interest = registration.interest();
        if let Err(e) = self
            .registry
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
        {
            *registration.slot_mut(writable) = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Move the operations an event makes ready onto the dispatch queue.
    fn dispatch_event(&self, fd: RawFd, readable: bool, writable: bool) {
        let ready = {
            let mut registrations = self.registrations();
            let Some(registration) = registrations.get_mut(&fd) else {
                trace!(fd, "Event for unregistered descriptor");
                return;
            };
            [
                if readable { registration.read.take() } else { None },
                if writable { registration.write.take() } else { None },
            ]
        };

        let mut dispatched = false;
        for id in ready.into_iter().flatten() {
            trace!(fd, op = %id, "Operation ready");
            self.queue.push(id);
            dispatched = true;
        }
        if !dispatched {
            trace!(fd, readable, writable, "Nothing armed, event dropped");
        }
    }

    /// Complete every operation still held by the pool with `ECANCELED`.
    fn cancel_pending(&self) {
        self.queue.take_all();
        for registration in self.registrations().values_mut() {
            *registration = Registration::default();
        }

        loop {
            let pending = self.ops.drain();
            if pending.is_empty() {
                break;
            }
            for (id, op) in pending {
                trace!(op = %id, kind = %op.kind(), "Cancelling operation");
                op.fail(self, ErrorCode::CANCELLED);
            }
        }
    }
}

impl<S: Socket> Driver<S> for Shared<S> {
    fn register_descriptor(&self, fd: RawFd) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid descriptor",
            ));
        }
        self.registry
            .register(&mut SourceFd(&fd), Token(fd as usize), read_interest())?;
        self.registrations().insert(fd, Registration::default());
        trace!(fd, "Registered descriptor");
        Ok(())
    }

    fn unregister_descriptor(&self, fd: RawFd) -> io::Result<()> {
        let armed = self.registrations().remove(&fd);
        let result = self.registry.deregister(&mut SourceFd(&fd));

        for id in armed.into_iter().flat_map(|r| [r.read, r.write]).flatten() {
            if let Some(op) = self.ops.take(id) {
                op.fail(self, ErrorCode::CANCELLED);
            }
        }
        trace!(fd, "Unregistered descriptor");
        result
    }

    fn alloc_op(&self, op: Operation<S>) -> OpId {
        self.ops.get(op)
    }

    fn submit(&self, id: OpId) -> io::Result<()> {
        let Some((fd, interest)) = self.ops.with_value(id, |op| {
            let interest = match op {
                Operation::Send(_) => Interest::WRITABLE,
                Operation::Accept(_) | Operation::Recv(_) => Interest::READABLE,
            };
            (op.descriptor(), interest)
        }) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unknown operation",
            ));
        };

        let result = if self.is_stopped() {
            Err(io::Error::new(io::ErrorKind::Other, "reactor is stopped"))
        } else {
            self.resume(fd, id, interest)
        };
        if result.is_err() {
            self.ops.release(id);
        }
        result
    }

    fn release(&self, id: OpId) -> bool {
        self.ops.release(id)
    }
}

/// Readiness reactor: a poll thread plus a pool of workers.
pub struct ReadinessReactor<S: Socket> {
    shared: Arc<Shared<S>>,
    /// Handed to the poll thread on start.
    poll: Mutex<Option<Poll>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: ReactorConfig,
}

impl<S: Socket> ReadinessReactor<S> {
    pub fn new(config: &ReactorConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let shared = Shared {
            registry,
            waker,
            registrations: Mutex::new(HashMap::new()),
            ops: SyncPool::new(config.chunk_slots, config.preallocate),
            queue: DispatchQueue::new(),
            stopped: AtomicBool::new(false),
        };

        Ok(Self {
            shared: Arc::new(shared),
            poll: Mutex::new(Some(poll)),
            threads: Mutex::new(Vec::new()),
            config: config.clone(),
        })
    }

    fn threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Socket> Reactor<S> for ReadinessReactor<S> {
    fn driver(&self) -> Arc<dyn Driver<S>> {
        self.shared.clone()
    }

    fn start(&self, workers: usize) -> io::Result<()> {
        if self.shared.is_stopped() {
            return Err(io::Error::new(io::ErrorKind::Other, "reactor is stopped"));
        }
        let poll = self
            .poll
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "reactor already started"))?;

        let workers = if workers == 0 {
            self.config.workers
        } else {
            workers
        };
        let capacity = self.config.events_capacity;
        let timeout = self.config.poll_timeout;

        self.shared.queue.open();
        let mut threads = self.threads();

        let shared = Arc::clone(&self.shared);
        threads.push(
            thread::Builder::new()
                .name("reactor-poll".to_string())
                .spawn(move || poll_loop(&shared, poll, capacity, timeout))?,
        );

        for worker_id in 0..workers.max(1) {
            let shared = Arc::clone(&self.shared);
            threads.push(
                thread::Builder::new()
                    .name(format!("reactor-worker-{worker_id}"))
                    .spawn(move || worker_loop(&shared, worker_id))?,
            );
        }

        info!(
            workers,
            events = capacity,
            timeout_ms = timeout.as_millis() as u64,
            "Readiness reactor started"
        );
        Ok(())
    }

    fn stop(&self, force: bool) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            info!("Stopping readiness reactor");
            self.shared.queue.close();
            if let Err(e) = self.shared.waker.wake() {
                warn!(error = %e, "Failed to wake poll thread");
            }
        }
        if !force {
            self.wait_all();
        }
    }

    fn wait_all(&self) {
        let threads = mem::take(&mut *self.threads());
        for handle in threads {
            if handle.join().is_err() {
                error!("Reactor thread panicked");
            }
        }

        if self.shared.is_stopped() {
            self.shared.cancel_pending();
        }
    }

    fn is_running(&self) -> bool {
        !self.shared.is_stopped() && self.shared.queue.is_running()
    }
}

impl<S: Socket> Drop for ReadinessReactor<S> {
    fn drop(&mut self) {
        self.stop(false);
    }
}

fn poll_loop<S: Socket>(shared: &Shared<S>, mut poll: Poll, capacity: usize, timeout: Duration) {
    let mut events = Events::with_capacity(capacity);
    debug!("Poll thread started");

    while !shared.is_stopped() {
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "Poll failed");
            break;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let fd = event.token().0 as RawFd;
            // A half-closed peer only finishes reads; writes still wait for room
            let readable = event.is_error()
                || event.is_read_closed()
                || event.is_readable()
                || event.is_priority();
            let writable = event.is_error() || event.is_write_closed() || event.is_writable();
            shared.dispatch_event(fd, readable, writable);
        }
    }

    debug!("Poll thread stopped");
}

fn worker_loop<S: Socket>(shared: &Shared<S>, worker_id: usize) {
    debug!(worker = worker_id, "Worker started");
    while let Some(id) = shared.queue.pop() {
        shared.complete(id);
    }
    debug!(worker = worker_id, "Worker stopped");
}
