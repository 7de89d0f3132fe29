//! sockreactor: asynchronous socket I/O over two native multiplexers.
//!
//! - Readiness reactor: mio (epoll/kqueue), edge triggered with one-shot
//!   re-arming, completed by a worker pool fed from a dispatch queue
//! - Completion proactor: io_uring, completed by workers waiting on the
//!   completion queue
//!
//! Operations (accept, receive, send) live in a fixed-slot object pool, so
//! submitting one does not allocate once the pool has warmed up.

pub mod config;
pub mod echo;
pub mod runtime;
