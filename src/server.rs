//! Server assembly: acceptor on the base loop, worker pool, live map.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{ClosedCallback, ConnRef, Connection, ConnectionCallbacks};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_thread::LoopThreadPool;
use crate::net::Socket;

/// `run_after` timer ids live in their own range so they cannot collide
/// with connection ids, which double as idle-timer ids and share the base
/// wheel with `run_after` tasks when the server runs without workers.
const TIMER_ID_BASE: u64 = 1 << 48;

struct ServerCore {
    base: LoopHandle,
    pool: Mutex<LoopThreadPool>,
    connections: Mutex<HashMap<u64, ConnRef>>,
    next_conn_id: AtomicU64,
    next_timer_id: AtomicU64,
    timeout: AtomicU32,
    inactive_release: AtomicBool,
    callbacks: Mutex<ConnectionCallbacks>,
}

impl ServerCore {
    /// Runs on the base loop whenever the acceptor hands over a socket.
    fn new_connection(core: &Arc<ServerCore>, socket: Socket) {
        let id = core.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let target = core.pool.lock().get_next_loop();
        let callbacks = core.callbacks.lock().clone();
        let server_closed: ClosedCallback = {
            let weak = Arc::downgrade(core);
            Arc::new(move |conn: &ConnRef| {
                let core = match weak.upgrade() {
                    Some(core) => core,
                    None => return,
                };
                let id = conn.id();
                let on_base = core.clone();
                // The live map belongs to the base loop.
                core.base.run_in_loop(move || {
                    on_base.connections.lock().remove(&id);
                });
            })
        };

        let conn = Connection::new(id, socket, target, callbacks, Some(server_closed));
        if core.inactive_release.load(Ordering::Acquire) {
            conn.enable_inactive_release(core.timeout.load(Ordering::Acquire));
        }
        conn.established();
        core.connections.lock().insert(id, conn);
        debug!(id, "connection registered");
    }
}

/// A TCP server: one base loop owning the acceptor and the live-connection
/// map, plus `N` worker loops the connections are spread over.
pub struct TcpServer {
    base_loop: EventLoop,
    acceptor: Acceptor,
    core: Arc<ServerCore>,
}

impl TcpServer {
    /// Binds `0.0.0.0:port` (port 0 picks an ephemeral port). Configure
    /// callbacks and the worker count before calling [`start`](Self::start).
    pub fn new(port: u16) -> io::Result<TcpServer> {
        let base_loop = EventLoop::new();
        let base = base_loop.handle();
        let core = Arc::new(ServerCore {
            base: base.clone(),
            pool: Mutex::new(LoopThreadPool::new(base.clone())),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            next_timer_id: AtomicU64::new(TIMER_ID_BASE),
            timeout: AtomicU32::new(0),
            inactive_release: AtomicBool::new(false),
            callbacks: Mutex::new(ConnectionCallbacks::default()),
        });
        let acceptor = {
            let weak = Arc::downgrade(&core);
            Acceptor::new(&base, port, move |socket| {
                if let Some(core) = weak.upgrade() {
                    ServerCore::new_connection(&core, socket);
                }
            })?
        };
        Ok(TcpServer {
            base_loop,
            acceptor,
            core,
        })
    }

    /// Sets the worker-loop count. Must happen before `start`; the count
    /// is fixed for the lifetime of the server.
    pub fn set_thread_num(&mut self, num: usize) {
        self.core.pool.lock().set_thread_num(num);
    }

    pub fn set_connected_callback(&mut self, f: impl Fn(&ConnRef) + Send + Sync + 'static) {
        self.core.callbacks.lock().connected = Some(Arc::new(f));
    }

    pub fn set_message_callback(
        &mut self,
        f: impl Fn(&ConnRef, &mut Buffer) + Send + Sync + 'static,
    ) {
        self.core.callbacks.lock().message = Some(Arc::new(f));
    }

    pub fn set_closed_callback(&mut self, f: impl Fn(&ConnRef) + Send + Sync + 'static) {
        self.core.callbacks.lock().closed = Some(Arc::new(f));
    }

    pub fn set_any_event_callback(&mut self, f: impl Fn(&ConnRef) + Send + Sync + 'static) {
        self.core.callbacks.lock().any_event = Some(Arc::new(f));
    }

    /// Releases connections that stay idle for `seconds`. Applies to
    /// connections accepted from now on.
    pub fn enable_inactive_release(&mut self, seconds: u32) {
        self.core.timeout.store(seconds, Ordering::Release);
        self.core.inactive_release.store(true, Ordering::Release);
    }

    /// Schedules `task` on the base loop's wheel, `delay` ticks from now.
    pub fn run_after(&self, delay: u32, task: impl FnOnce() + Send + 'static) {
        self.handle().run_after(delay, task);
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// A cloneable handle for observing and steering the running server
    /// from other threads.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            core: self.core.clone(),
        }
    }

    /// Spawns the worker loops, starts accepting, and runs the base loop
    /// on the calling thread. Blocks until [`ServerHandle::stop`].
    pub fn start(&mut self) {
        self.core.pool.lock().create();
        self.acceptor.listen();
        debug!(addr = %self.local_addr(), "server listening");
        self.base_loop.run();
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.acceptor.local_addr())
            .field("connections", &self.core.connections.lock().len())
            .finish()
    }
}

/// Thread-safe view of a running [`TcpServer`].
#[derive(Clone)]
pub struct ServerHandle {
    core: Arc<ServerCore>,
}

impl ServerHandle {
    /// Number of connections currently in the live map.
    pub fn connection_count(&self) -> usize {
        self.core.connections.lock().len()
    }

    /// Schedules `task` on the base loop's wheel, `delay` ticks from now.
    pub fn run_after(&self, delay: u32, task: impl FnOnce() + Send + 'static) {
        let id = self.core.next_timer_id.fetch_add(1, Ordering::Relaxed);
        self.core.base.timer_add(id, delay, task);
    }

    /// Makes `start` return; worker loops are joined when the server is
    /// dropped.
    pub fn stop(&self) {
        self.core.base.quit();
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("connections", &self.connection_count())
            .finish()
    }
}
