//! Scheduling models (C9): thread-per-connection, or a caller-driven tick.
//! Grounded on `original_source`'s `connectionHandlingThread` (threaded) vs.
//! `CS104_Slave_tick`/`handleClientConnections` (threadless); the thread
//! spawn-per-accept shape follows `maminrayej-handshake::NetStack::new` and
//! its `segment_loop`.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::connection::{FAST_POLL_MS, IDLE_POLL_MS};
use crate::error::{Error, Result};
use crate::server::Server;

/// A running threaded-mode server: one listener thread plus one handler
/// thread per accepted connection. Dropping or calling `stop` on the
/// `Server` causes the listener loop to exit on its next accept timeout and
/// every connection thread to exit on its next `service()` call.
pub struct ThreadedScheduler {
    listener_thread: Option<thread::JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl ThreadedScheduler {
    /// Binds `server`'s configured address and spawns the accept loop.
    pub fn start(server: Arc<Server>) -> Result<Self> {
        let addr = format!("{}:{}", server.config().bind_addr, server.config().port);
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        info!("listening on {addr}");

        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop_flag = stop_flag.clone();

        let listener_thread = thread::spawn(move || {
            accept_loop(server, listener, thread_stop_flag);
        });

        Ok(ThreadedScheduler {
            listener_thread: Some(listener_thread),
            stop_flag,
        })
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadedScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(server: Arc<Server>, listener: TcpListener, stop_flag: Arc<AtomicBool>) {
    while server.is_running() && !stop_flag.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY for {peer_addr}: {e}");
                }
                match server.admit(stream, peer_addr) {
                    Ok(Some(conn)) => {
                        let server = server.clone();
                        thread::spawn(move || {
                            while conn.is_running() && server.is_running() {
                                let timeout = if conn.has_pending_outbound() {
                                    FAST_POLL_MS
                                } else {
                                    IDLE_POLL_MS
                                };
                                if let Err(e) = conn.service(timeout) {
                                    debug!("connection {}: service error: {e}", conn.id());
                                    break;
                                }
                            }
                            server.retire(&conn);
                        });
                    }
                    Ok(None) => {}
                    Err(e) => error!("failed to admit connection from {peer_addr}: {e}"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!("accept failed: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// A single-threaded, caller-driven scheduler: the embedding application
/// calls `tick()` on its own cadence (an event loop, a timer, whatever),
/// and every accept/read/timer/drain step for every connection happens
/// synchronously inside that call. No threads are spawned.
pub struct TickScheduler {
    server: Arc<Server>,
    listener: TcpListener,
}

impl TickScheduler {
    pub fn start(server: Arc<Server>) -> Result<Self> {
        let addr = format!("{}:{}", server.config().bind_addr, server.config().port);
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        info!("listening on {addr} (tick mode)");
        Ok(TickScheduler { server, listener })
    }

    /// Performs one non-blocking accept attempt, then services every
    /// currently open connection exactly once with a 1 ms read-select
    /// budget (SPEC_FULL.md §4.8: tick mode is single-threaded cooperative,
    /// so no connection may suspend the caller beyond that budget),
    /// reaping any that closed.
    pub fn tick(&self) -> Result<()> {
        if !self.server.is_running() {
            return Ok(());
        }

        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    if let Err(e) = self.server.admit(stream, peer_addr) {
                        error!("failed to admit connection from {peer_addr}: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        for conn in self.server.snapshot_connections() {
            if !conn.is_running() {
                continue;
            }
            if let Err(e) = conn.service(FAST_POLL_MS) {
                debug!("connection {}: service error: {e}", conn.id());
            }
            if !conn.is_running() {
                self.server.retire(&conn);
            }
        }

        Ok(())
    }
}
