//! Asynchronous operations and their completion handlers.
//!
//! An [`Operation`] is one pending accept, receive or send. It owns the socket
//! handle, the buffer and the progress made so far, plus the handler to call
//! once it completes. Operations live in the reactor's pool while armed; the
//! worker completing one moves it out of its slot, runs the handler and frees
//! the slot.

use super::pool::SlotId;
use super::socket::Socket;
use super::Driver;
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Handle to an operation stored in a reactor's pool.
pub type OpId = SlotId;

/// Kind of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Accept,
    Recv,
    Send,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Accept => write!(f, "accept"),
            OpKind::Recv => write!(f, "recv"),
            OpKind::Send => write!(f, "send"),
        }
    }
}

/// Result code handed to completion handlers: the platform errno, `0` on success.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(i32);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0);

    /// Operation cancelled by shutdown or unregistration.
    pub const CANCELLED: ErrorCode = ErrorCode(libc::ECANCELED);

    pub const fn from_raw(code: i32) -> Self {
        ErrorCode(code)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Errors without an OS code map to `EIO`.
    pub fn from_io(err: &io::Error) -> Self {
        ErrorCode(err.raw_os_error().unwrap_or(libc::EIO))
    }

    pub fn to_io_error(self) -> Option<io::Error> {
        (!self.is_success()).then(|| io::Error::from_raw_os_error(self.0))
    }
}

impl From<&io::Error> for ErrorCode {
    fn from(err: &io::Error) -> Self {
        ErrorCode::from_io(err)
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode({})", self.0)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_io_error() {
            None => write!(f, "success"),
            Some(err) => write!(f, "{err}"),
        }
    }
}

/// Outcome of a receive or send, handed back to its [`TransferHandler`].
pub struct Transfer<S> {
    pub kind: OpKind,
    pub socket: Arc<S>,
    /// For receives: the caller's buffer extended by exactly `bytes` received
    /// bytes. For sends: the buffer that was sent.
    pub buf: BytesMut,
    pub ec: ErrorCode,
    pub bytes: usize,
}

impl<S> fmt::Debug for Transfer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("kind", &self.kind)
            .field("ec", &self.ec)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Called once per completed accept.
///
/// `socket` is the accepted connection, already non-blocking and registered with
/// the reactor, or `None` with the error in `ec`.
pub trait AcceptHandler<S>: Send + Sync {
    fn on_accept(self: Arc<Self>, driver: &dyn Driver<S>, socket: Option<S>, ec: ErrorCode);
}

/// Called once per completed receive or send.
pub trait TransferHandler<S>: Send + Sync {
    fn on_complete(self: Arc<Self>, driver: &dyn Driver<S>, done: Transfer<S>);
}

impl<S, F> AcceptHandler<S> for F
where
    F: Fn(&dyn Driver<S>, Option<S>, ErrorCode) + Send + Sync,
{
    fn on_accept(self: Arc<Self>, driver: &dyn Driver<S>, socket: Option<S>, ec: ErrorCode) {
        (*self)(driver, socket, ec)
    }
}

impl<S, F> TransferHandler<S> for F
where
    F: Fn(&dyn Driver<S>, Transfer<S>) + Send + Sync,
{
    fn on_complete(self: Arc<Self>, driver: &dyn Driver<S>, done: Transfer<S>) {
        (*self)(driver, done)
    }
}

/// Accepts connections on a listening socket.
pub struct AcceptOp<S> {
    pub(crate) listener: Arc<S>,
    pub(crate) handler: Arc<dyn AcceptHandler<S>>,
}

impl<S> AcceptOp<S> {
    pub fn new(listener: Arc<S>, handler: Arc<dyn AcceptHandler<S>>) -> Self {
        Self { listener, handler }
    }
}

/// Receives up to `len` bytes, appended after the buffer's existing contents.
pub struct RecvOp<S> {
    pub(crate) socket: Arc<S>,
    buf: BytesMut,
    /// Length of the caller's buffer before the receive.
    start: usize,
    len: usize,
    filled: usize,
    pub(crate) handler: Arc<dyn TransferHandler<S>>,
}

impl<S> RecvOp<S> {
    pub fn new(
        socket: Arc<S>,
        mut buf: BytesMut,
        len: usize,
        handler: Arc<dyn TransferHandler<S>>,
    ) -> Self {
        let start = buf.len();
        buf.resize(start + len, 0);
        Self {
            socket,
            buf,
            start,
            len,
            filled: 0,
            handler,
        }
    }

    /// The socket together with the unfilled space, for one receive call.
    pub(crate) fn io_parts(&mut self) -> (&S, &mut [u8]) {
        let range = self.start + self.filled..self.start + self.len;
        (&*self.socket, &mut self.buf[range])
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.len);
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub(crate) fn is_satisfied(&self) -> bool {
        self.filled == self.len
    }

    /// Split into the handler and the result to hand it.
    pub(crate) fn finish(mut self, ec: ErrorCode) -> (Arc<dyn TransferHandler<S>>, Transfer<S>) {
        self.buf.truncate(self.start + self.filled);
        let done = Transfer {
            kind: OpKind::Recv,
            socket: self.socket,
            buf: self.buf,
            ec,
            bytes: self.filled,
        };
        (self.handler, done)
    }
}

/// Sends the whole buffer.
pub struct SendOp<S> {
    pub(crate) socket: Arc<S>,
    buf: BytesMut,
    sent: usize,
    pub(crate) handler: Arc<dyn TransferHandler<S>>,
}

impl<S> SendOp<S> {
    pub fn new(socket: Arc<S>, buf: BytesMut, handler: Arc<dyn TransferHandler<S>>) -> Self {
        Self {
            socket,
            buf,
            sent: 0,
            handler,
        }
    }

    /// Bytes not yet written.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.sent..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.buf.len());
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub(crate) fn is_done(&self) -> bool {
        self.sent == self.buf.len()
    }

    pub(crate) fn finish(self, ec: ErrorCode) -> (Arc<dyn TransferHandler<S>>, Transfer<S>) {
        let done = Transfer {
            kind: OpKind::Send,
            socket: self.socket,
            buf: self.buf,
            ec,
            bytes: self.sent,
        };
        (self.handler, done)
    }
}

/// One pending asynchronous act.
pub enum Operation<S> {
    Accept(AcceptOp<S>),
    Recv(RecvOp<S>),
    Send(SendOp<S>),
}

impl<S> Operation<S> {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Accept(_) => OpKind::Accept,
            Operation::Recv(_) => OpKind::Recv,
            Operation::Send(_) => OpKind::Send,
        }
    }

    /// Complete without doing any I/O, reporting `ec` and the progress so far.
    pub fn fail(self, driver: &dyn Driver<S>, ec: ErrorCode) {
        match self {
            Operation::Accept(op) => op.handler.on_accept(driver, None, ec),
            Operation::Recv(op) => {
                let (handler, done) = op.finish(ec);
                handler.on_complete(driver, done);
            }
            Operation::Send(op) => {
                let (handler, done) = op.finish(ec);
                handler.on_complete(driver, done);
            }
        }
    }
}

impl<S: Socket> Operation<S> {
    /// Descriptor the operation acts on.
    pub fn descriptor(&self) -> RawFd {
        match self {
            Operation::Accept(op) => op.listener.native_handle(),
            Operation::Recv(op) => op.socket.native_handle(),
            Operation::Send(op) => op.socket.native_handle(),
        }
    }
}

impl<S> fmt::Debug for Operation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Accept(_) => f.debug_struct("Accept").finish_non_exhaustive(),
            Operation::Recv(op) => f
                .debug_struct("Recv")
                .field("len", &op.len)
                .field("filled", &op.filled)
                .finish_non_exhaustive(),
            Operation::Send(op) => f
                .debug_struct("Send")
                .field("len", &op.buf.len())
                .field("sent", &op.sent)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Arc<dyn TransferHandler<()>> {
        Arc::new(|_: &dyn Driver<()>, _: Transfer<()>| {})
    }

    #[test]
    fn test_error_code_mapping() {
        assert!(ErrorCode::SUCCESS.is_success());
        assert!(ErrorCode::SUCCESS.to_io_error().is_none());
        assert_eq!(ErrorCode::CANCELLED.raw(), libc::ECANCELED);

        let reset = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(ErrorCode::from(&reset).raw(), libc::ECONNRESET);

        // No OS code behind this one
        let custom = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(ErrorCode::from_io(&custom).raw(), libc::EIO);
    }

    #[test]
    fn test_recv_op_appends_after_existing_bytes() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"ab");

        let mut op = RecvOp::new(Arc::new(()), buf, 4, noop_handler());
        assert_eq!(op.io_parts().1.len(), 4);

        op.io_parts().1[..3].copy_from_slice(b"cde");
        op.advance(3);
        assert_eq!(op.filled(), 3);
        assert!(!op.is_satisfied());
        assert_eq!(op.io_parts().1.len(), 1);

        let (_, done) = op.finish(ErrorCode::SUCCESS);
        assert_eq!(done.kind, OpKind::Recv);
        assert_eq!(done.bytes, 3);
        assert_eq!(&done.buf[..], b"abcde");
    }

    #[test]
    fn test_send_op_progress() {
        let buf = BytesMut::from(&b"hello"[..]);
        let mut op = SendOp::new(Arc::new(()), buf, noop_handler());

        op.advance(2);
        assert_eq!(op.remaining(), b"llo");
        assert!(!op.is_done());

        op.advance(3);
        assert!(op.is_done());
        assert_eq!(op.sent(), 5);

        let (_, done) = op.finish(ErrorCode::SUCCESS);
        assert_eq!(done.bytes, 5);
        assert_eq!(&done.buf[..], b"hello");
    }

    #[test]
    fn test_operation_kind() {
        let op = Operation::Send(SendOp::new(Arc::new(()), BytesMut::new(), noop_handler()));
        assert_eq!(op.kind(), OpKind::Send);
        assert_eq!(op.kind().to_string(), "send");
    }
}
