//! One io_uring instance shared by every worker.
//!
//! The submission and completion queues are single-producer/single-consumer
//! rings, so each side sits behind its own lock. The completion lock also means
//! only one worker at a time waits in the kernel; the rest queue up behind it.

use io_uring::{cqueue, squeue, types, IoUring};
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

pub(super) struct Ring {
    ring: IoUring,
    sq_lock: Mutex<()>,
    cq_lock: Mutex<()>,
}

impl Ring {
    pub(super) fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries)?;
        // Bounded waits need IORING_ENTER_EXT_ARG
        if !ring.params().is_feature_ext_arg() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "io_uring lacks IORING_FEAT_EXT_ARG (Linux 5.11+ required)",
            ));
        }

        Ok(Self {
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
        })
    }

    /// Queue one entry and hand it to the kernel.
    ///
    /// # Safety
    ///
    /// Every buffer the entry points at must stay valid until its completion
    /// has been reaped.
    pub(super) unsafe fn push(&self, entry: &squeue::Entry) -> io::Result<()> {
        let _guard = lock(&self.sq_lock);

        // SAFETY: the submission lock makes this the only live submission queue
        let mut sq = unsafe { self.ring.submission_shared() };
        if sq.is_full() {
            drop(sq);
            self.ring.submit()?;
            // SAFETY: as above
            sq = unsafe { self.ring.submission_shared() };
        }

        // SAFETY: upheld by the caller
        unsafe { sq.push(entry) }
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))?;
        // Publishes the new tail
        drop(sq);

        // The entry is queued either way; a waiting worker submits it on its
        // next enter if this one fails.
        if let Err(e) = self.ring.submit() {
            if !is_transient(&e) {
                warn!(error = %e, "io_uring submit failed");
            }
        }
        Ok(())
    }

    /// Wait up to `args`' timeout for one completion.
    pub(super) fn next_completion(
        &self,
        args: &types::SubmitArgs<'_, '_>,
    ) -> io::Result<Option<cqueue::Entry>> {
        let _guard = lock(&self.cq_lock);

        if let Some(cqe) = self.try_pop() {
            return Ok(Some(cqe));
        }

        match self.ring.submitter().submit_with_args(1, args) {
            Ok(_) => {}
            Err(e) if is_transient(&e) => {}
            Err(e) => return Err(e),
        }

        Ok(self.try_pop())
    }

    /// Take one completion without waiting.
    pub(super) fn poll_completion(&self) -> Option<cqueue::Entry> {
        let _guard = lock(&self.cq_lock);
        self.try_pop()
    }

    /// Caller holds the completion lock.
    fn try_pop(&self) -> Option<cqueue::Entry> {
        // SAFETY: the completion lock makes this the only live completion queue
        let mut cq = unsafe { self.ring.completion_shared() };
        cq.next()
    }
}

/// Timeout, interrupt or a full completion queue.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) | Some(libc::EAGAIN)
    )
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
