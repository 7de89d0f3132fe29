//! sockreactor-echo: echo server over the socket reactors
//!
//! Accepts TCP connections and writes back every byte it receives, using
//! either the readiness (mio) or the completion (io_uring) backend.
//! Configuration via CLI arguments or TOML file.

use sockreactor::config::Config;
use sockreactor::echo::EchoAcceptor;
use sockreactor::runtime::{self, bind_listener, Socket};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LISTEN_BACKLOG: i32 = 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    info!(
        addr = %addr,
        backend = %config.backend,
        workers = config.reactor.workers,
        chunk_slots = config.reactor.chunk_slots,
        recv_size = config.recv_size,
        "Starting sockreactor echo server"
    );

    let reactor = runtime::build::<socket2::Socket>(config.backend, &config.reactor)?;
    let driver = reactor.driver();

    let listener = Arc::new(bind_listener(addr, LISTEN_BACKLOG)?);
    driver.register_descriptor(listener.native_handle())?;
    driver.async_accept(listener, Arc::new(EchoAcceptor::new(config.recv_size)))?;

    reactor.start(config.reactor.workers)?;

    // Runs until the process is terminated
    reactor.wait_all();
    Ok(())
}
