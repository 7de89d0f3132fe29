//! Completion of ready operations on the worker threads.
//!
//! The poll thread only reports readiness; the I/O happens here. Receives and
//! sends loop on the non-blocking call until the request is satisfied, the
//! socket runs dry or a hard error occurs.

use super::Shared;
use crate::runtime::op::{AcceptOp, ErrorCode, OpId, Operation, RecvOp, SendOp};
use crate::runtime::socket::Socket;
use crate::runtime::Driver;
use mio::Interest;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::{debug, trace, warn};

impl<S: Socket> Shared<S> {
    /// Run the completion step for a dispatched operation.
    pub(super) fn complete(&self, id: OpId) {
        let Some(op) = self.ops.checkout(id) else {
            warn!(op = %id, "Dispatched operation is no longer pooled");
            return;
        };

        match op {
            Operation::Accept(op) => self.complete_accept(id, op),
            Operation::Recv(op) => self.complete_recv(id, op),
            Operation::Send(op) => self.complete_send(id, op),
        }
    }

    fn complete_accept(&self, id: OpId, op: AcceptOp<S>) {
        let listener_fd = op.listener.native_handle();
        let result = loop {
            match op.listener.accept() {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        if matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
            trace!(fd = listener_fd, "Spurious accept wakeup");
            self.rearm(id, Operation::Accept(op), listener_fd, Interest::READABLE);
            return;
        }

        // The accept op is persistent: keep the listener armed before the
        // handler runs so other workers can take the next connection.
        let handler = Arc::clone(&op.handler);
        self.rearm(id, Operation::Accept(op), listener_fd, Interest::READABLE);

        match result {
            Ok(socket) => {
                let fd = socket.native_handle();
                match socket
                    .set_nonblocking()
                    .and_then(|()| self.register_descriptor(fd))
                {
                    Ok(()) => {
                        debug!(listener = listener_fd, fd, "Accepted connection");
                        handler.on_accept(self, Some(socket), ErrorCode::SUCCESS);
                    }
                    Err(e) => {
                        debug!(fd, error = %e, "Failed to prepare accepted socket");
                        handler.on_accept(self, None, ErrorCode::from_io(&e));
                    }
                }
            }
            Err(e) => {
                debug!(listener = listener_fd, error = %e, "Accept failed");
                handler.on_accept(self, None, ErrorCode::from_io(&e));
            }
        }
    }

    fn complete_recv(&self, id: OpId, mut op: RecvOp<S>) {
        let mut ec = ErrorCode::SUCCESS;

        while !op.is_satisfied() {
            let (socket, unfilled) = op.io_parts();
            match socket.recv_into(unfilled) {
                // Peer closed
                Ok(0) => break,
                Ok(n) => op.advance(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if op.filled() == 0 {
                        let fd = op.socket.native_handle();
                        self.rearm(id, Operation::Recv(op), fd, Interest::READABLE);
                        return;
                    }
                    break;
                }
                Err(e) => {
                    ec = ErrorCode::from_io(&e);
                    break;
                }
            }
        }

        let (handler, done) = op.finish(ec);
        trace!(op = %id, bytes = done.bytes, ec = %done.ec, "Receive complete");
        handler.on_complete(self, done);
        self.ops.release(id);
    }

    fn complete_send(&self, id: OpId, mut op: SendOp<S>) {
        let mut ec = ErrorCode::SUCCESS;

        while !op.is_done() {
            match op.socket.send_from(op.remaining()) {
                Ok(0) => {
                    ec = ErrorCode::from_io(&io::Error::from(io::ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => op.advance(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let fd = op.socket.native_handle();
                    self.rearm(id, Operation::Send(op), fd, Interest::WRITABLE);
                    return;
                }
                Err(e) => {
                    ec = ErrorCode::from_io(&e);
                    break;
                }
            }
        }

        let (handler, done) = op.finish(ec);
        trace!(op = %id, bytes = done.bytes, ec = %done.ec, "Send complete");
        handler.on_complete(self, done);
        self.ops.release(id);
    }

    /// Put a checked-out operation back into its slot and arm it again.
    ///
    /// Once stopped the operation stays pooled for the shutdown drain. If the
    /// descriptor can no longer be armed the operation fails with that error.
    fn rearm(&self, id: OpId, op: Operation<S>, fd: RawFd, interest: Interest) {
        if let Err(op) = self.ops.restore(id, op) {
            warn!(op = %id, kind = %op.kind(), "Operation released while completing");
            return;
        }
        if self.is_stopped() {
            return;
        }

        if let Err(e) = self.resume(fd, id, interest) {
            debug!(fd, op = %id, error = %e, "Failed to re-arm operation");
            if let Some(op) = self.ops.take(id) {
                op.fail(self, ErrorCode::from_io(&e));
            }
        }
    }
}
