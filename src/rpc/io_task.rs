//! TCP I/O driver: reactor-timed accept and read loops.
//!
//! Runs on the [`EventLoop`]'s `edge-executor` with `async-io-mini` timers
//! (no busy-spinning). Two concurrent futures:
//!
//! 1. **Accept**: drains the non-blocking listener every `accept_poll_ms`
//! 2. **Read**: delivers a readable notification to every client every
//!    `read_poll_ms`
//!
//! Deferred client removals are ordinary executor tasks, so they run
//! between ticks of the two loops.
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────┐
//!  │  futures_lite::future::block_on                            │
//!  │  ┌──────────────────────────────────────────────────────┐  │
//!  │  │  edge_executor::LocalExecutor                        │  │
//!  │  │                                                      │  │
//!  │  │  ┌──────────┐  ┌──────────┐  ┌────────────────────┐  │  │
//!  │  │  │ Accept   │  │ Read All │  │ deferred removals  │  │  │
//!  │  │  │ 50ms ⏱   │  │ 1ms ⏱    │  │ (TaskQueue::defer) │  │  │
//!  │  │  └──────────┘  └──────────┘  └────────────────────┘  │  │
//!  │  └──────────────────────────────────────────────────────┘  │
//!  └────────────────────────────────────────────────────────────┘
//! ```

use core::time::Duration;
use std::io::{self, ErrorKind};
use std::net::TcpListener;
use std::rc::Rc;

use log::{info, warn};

// Links the std time driver that backs `async_io_mini::Timer`.
use embassy_time as _;

use super::event_loop::EventLoop;
use super::server::RpcServer;
use super::transport::TcpTransport;

/// Accept every pending connection on `listener`. Returns how many were
/// handed to the server.
pub fn accept_pending(listener: &TcpListener, server: &RpcServer<TcpTransport>) -> usize {
    let mut accepted = 0;
    loop {
        match listener.accept() {
            Ok((stream, addr)) => match TcpTransport::new(stream) {
                Ok(transport) => {
                    if let Some(session) = server.add_client(transport) {
                        info!("IO: client {} connected from {}", session.id(), addr);
                        accepted += 1;
                    }
                }
                Err(e) => warn!("IO: cannot configure socket from {}: {}", addr, e),
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => return accepted,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("IO: accept failed: {}", e);
                return accepted;
            }
        }
    }
}

/// Accept task: new connections are infrequent, so a coarse interval is fine.
async fn accept_loop(listener: TcpListener, server: Rc<RpcServer<TcpTransport>>, every: Duration) {
    loop {
        accept_pending(&listener, &server);
        async_io_mini::Timer::after(every).await;
    }
}

/// Read task: the timer is wake-based, so deferred tasks run between ticks.
async fn read_loop(server: Rc<RpcServer<TcpTransport>>, every: Duration) {
    loop {
        server.poll();
        async_io_mini::Timer::after(every).await;
    }
}

/// Switch `listener` to non-blocking mode and spawn the accept and read
/// loops on `event_loop`. They make progress whenever the loop is driven.
pub fn spawn_io(
    listener: TcpListener,
    server: Rc<RpcServer<TcpTransport>>,
    event_loop: &EventLoop,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    let config = server.config();
    let accept_every = Duration::from_millis(config.accept_poll_ms);
    let read_every = Duration::from_millis(config.read_poll_ms);

    info!(
        "IO task started on {} ({} max clients)",
        listener.local_addr()?,
        config.max_clients
    );

    event_loop.spawn(accept_loop(listener, server.clone(), accept_every));
    event_loop.spawn(read_loop(server, read_every));
    Ok(())
}

/// Serve `server` on `listener` forever.
///
/// Only returns early if the listener cannot be switched to non-blocking
/// mode.
pub fn serve(
    listener: TcpListener,
    server: Rc<RpcServer<TcpTransport>>,
    event_loop: &EventLoop,
) -> io::Result<()> {
    spawn_io(listener, server, event_loop)?;
    event_loop.block_on(core::future::pending::<()>());
    Ok(())
}
