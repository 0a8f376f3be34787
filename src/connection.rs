//! Per-connection state machine with buffered I/O.
//!
//! A connection is pinned to one worker loop for its whole life. Shared
//! references are held by the server's live map and by whatever tasks are
//! currently queued on the owner loop; everything else (the channel's
//! event hooks, the idle timer) holds weak references. Every public method
//! posts to the owner loop, so all state below the mutex is only ever
//! touched by that one thread.

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelBuilder};
use crate::context::Context;
use crate::event_loop::LoopHandle;
use crate::net::Socket;

/// Shared reference to a connection.
pub type ConnRef = Arc<Connection>;

pub type ConnectedCallback = Arc<dyn Fn(&ConnRef) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&ConnRef, &mut Buffer) + Send + Sync>;
pub type ClosedCallback = Arc<dyn Fn(&ConnRef) + Send + Sync>;
pub type AnyEventCallback = Arc<dyn Fn(&ConnRef) + Send + Sync>;

/// The user-facing callback set of a connection. Replaced wholesale by a
/// protocol upgrade.
#[derive(Default, Clone)]
pub struct ConnectionCallbacks {
    pub connected: Option<ConnectedCallback>,
    pub message: Option<MessageCallback>,
    pub closed: Option<ClosedCallback>,
    pub any_event: Option<AnyEventCallback>,
}

impl std::fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("connected", &self.connected.is_some())
            .field("message", &self.message.is_some())
            .field("closed", &self.closed.is_some())
            .field("any_event", &self.any_event.is_some())
            .finish()
    }
}

/// Connection lifecycle states.
///
/// Connecting → Connected on `established`; Connected → Disconnecting on
/// the drain-close path; Disconnected is terminal and makes every later
/// task body a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

struct Inner {
    state: ConnState,
    socket: Option<Socket>,
    in_buffer: Buffer,
    out_buffer: Buffer,
    context: Context,
    inactive_release: bool,
    callbacks: ConnectionCallbacks,
    server_closed: Option<ClosedCallback>,
}

/// One accepted TCP connection.
pub struct Connection {
    id: u64,
    fd: RawFd,
    owner: LoopHandle,
    channel: Arc<Channel>,
    self_ref: Weak<Connection>,
    inner: Mutex<Inner>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        socket: Socket,
        owner: LoopHandle,
        callbacks: ConnectionCallbacks,
        server_closed: Option<ClosedCallback>,
    ) -> ConnRef {
        let fd = socket.fd();
        let registration = owner.registration();
        Arc::new_cyclic(|weak: &Weak<Connection>| {
            let hook = |f: fn(&Connection)| {
                let weak = weak.clone();
                move || {
                    if let Some(conn) = weak.upgrade() {
                        f(&conn);
                    }
                }
            };
            let channel = ChannelBuilder::new(fd, registration)
                .on_read(hook(Connection::handle_read))
                .on_write(hook(Connection::handle_write))
                .on_error(hook(Connection::handle_error))
                .on_close(hook(Connection::handle_close))
                .on_any_event(hook(Connection::handle_any_event))
                .finish();
            Connection {
                id,
                fd,
                owner,
                channel,
                self_ref: weak.clone(),
                inner: Mutex::new(Inner {
                    state: ConnState::Connecting,
                    socket: Some(socket),
                    in_buffer: Buffer::new(),
                    out_buffer: Buffer::new(),
                    context: Context::default(),
                    inactive_release: false,
                    callbacks,
                    server_closed,
                }),
            }
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().state == ConnState::Connected
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    /// Replaces the protocol context.
    pub fn set_context(&self, context: Context) {
        self.inner.lock().context = context;
    }

    /// Grants access to the protocol context. Do not call back into the
    /// connection from inside the closure.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Context) -> R) -> R {
        f(&mut self.inner.lock().context)
    }

    /// Finishes setup on the owner loop: registers read interest and fires
    /// the connected callback.
    pub(crate) fn established(&self) {
        let conn = self.to_ref();
        self.owner.run_in_loop(move || conn.established_in_loop());
    }

    /// Copies `data` into a detached buffer and appends it to the
    /// out-buffer on the owner loop, enabling write interest. The copy is
    /// mandatory: the task may run after the caller's slice is gone.
    pub fn send(&self, data: &[u8]) {
        let mut staged = Buffer::with_capacity(data.len().max(1));
        staged.write(data);
        let conn = self.to_ref();
        self.owner.run_in_loop(move || conn.send_in_loop(staged));
    }

    /// Drain-close: buffered input is delivered, buffered output is
    /// flushed, then the connection is released.
    pub fn shutdown(&self) {
        let conn = self.to_ref();
        self.owner.run_in_loop(move || conn.shutdown_in_loop());
    }

    /// Tears the connection down. Queued rather than run inline so that a
    /// release issued from inside an event handler does not destroy state
    /// the current dispatch pass still touches.
    pub fn release(&self) {
        let conn = self.to_ref();
        self.owner.queue_in_loop(move || conn.release_in_loop());
    }

    /// Starts (or refreshes) the sliding-window idle timer; when it fires
    /// the connection is released.
    pub fn enable_inactive_release(&self, seconds: u32) {
        let conn = self.to_ref();
        self.owner
            .run_in_loop(move || conn.enable_inactive_release_in_loop(seconds));
    }

    /// Stops the idle timer.
    pub fn disable_inactive_release(&self) {
        let conn = self.to_ref();
        self.owner
            .run_in_loop(move || conn.disable_inactive_release_in_loop());
    }

    /// Atomically switches the connection to a new protocol layer: context
    /// and all four user callbacks are replaced together, so bytes already
    /// buffered are parsed by the new layer. Must be called on the owning
    /// loop; the next dispatch would otherwise still hit the old callbacks.
    pub fn upgrade(&self, context: Context, callbacks: ConnectionCallbacks) {
        self.owner.assert_in_loop();
        let mut inner = self.inner.lock();
        inner.context = context;
        inner.callbacks = callbacks;
    }

    fn to_ref(&self) -> ConnRef {
        self.self_ref
            .upgrade()
            .expect("connection accessed after teardown")
    }

    fn established_in_loop(&self) {
        self.owner.assert_in_loop();
        {
            let mut inner = self.inner.lock();
            debug_assert_eq!(inner.state, ConnState::Connecting);
            inner.state = ConnState::Connected;
        }
        self.channel.enable_read();
        debug!(id = self.id, fd = self.fd, "connection established");
        let cb = self.inner.lock().callbacks.connected.clone();
        if let Some(cb) = cb {
            cb(&self.to_ref());
        }
    }

    fn send_in_loop(&self, data: Buffer) {
        self.owner.assert_in_loop();
        let mut inner = self.inner.lock();
        if inner.state == ConnState::Disconnected {
            return;
        }
        inner.out_buffer.write_buffer(&data);
        if inner.out_buffer.readable_size() > 0 && !self.channel.is_writing() {
            self.channel.enable_write();
        }
    }

    fn shutdown_in_loop(&self) {
        self.owner.assert_in_loop();
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnState::Disconnected {
                return;
            }
            inner.state = ConnState::Disconnecting;
        }
        self.deliver_message();
        let release_now = {
            let inner = self.inner.lock();
            if inner.out_buffer.readable_size() > 0 {
                if !self.channel.is_writing() {
                    self.channel.enable_write();
                }
                false
            } else {
                true
            }
        };
        if release_now {
            self.release();
        }
    }

    fn release_in_loop(&self) {
        self.owner.assert_in_loop();
        let (closed, server_closed, had_timer) = {
            let mut inner = self.inner.lock();
            if inner.state == ConnState::Disconnected {
                return;
            }
            inner.state = ConnState::Disconnected;
            let had_timer = mem::replace(&mut inner.inactive_release, false);
            (
                inner.callbacks.closed.clone(),
                inner.server_closed.clone(),
                had_timer,
            )
        };
        self.channel.remove();
        // Deregistered first, then the fd is closed by dropping the socket.
        self.inner.lock().socket = None;
        if had_timer {
            self.owner.timer_cancel(self.id);
        }
        debug!(id = self.id, "connection released");
        let conn = self.to_ref();
        // User callback before the server's, so the live-map entry outlives
        // everything the user callback might still reach.
        if let Some(cb) = closed {
            cb(&conn);
        }
        if let Some(cb) = server_closed {
            cb(&conn);
        }
    }

    fn enable_inactive_release_in_loop(&self, seconds: u32) {
        self.owner.assert_in_loop();
        let had_timer = {
            let mut inner = self.inner.lock();
            if inner.state == ConnState::Disconnected {
                return;
            }
            mem::replace(&mut inner.inactive_release, true)
        };
        if had_timer {
            self.owner.timer_refresh(self.id);
        } else {
            let weak = self.self_ref.clone();
            self.owner.timer_add(self.id, seconds, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.release();
                }
            });
        }
    }

    fn disable_inactive_release_in_loop(&self) {
        self.owner.assert_in_loop();
        let had_timer = mem::replace(&mut self.inner.lock().inactive_release, false);
        if had_timer {
            self.owner.timer_cancel(self.id);
        }
    }

    /// Read readiness: drain the socket into the in-buffer, then hand the
    /// buffered bytes to the message callback. A fatal read (including a
    /// clean end-of-stream) takes the drain-close path instead.
    fn handle_read(&self) {
        self.owner.assert_in_loop();
        let mut fatal = false;
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnState::Disconnected {
                return;
            }
            let Inner {
                socket, in_buffer, ..
            } = &mut *inner;
            let socket = match socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            let mut scratch = [0u8; 65536];
            loop {
                match socket.nonblock_recv(&mut scratch) {
                    Ok(0) => break,
                    Ok(n) => in_buffer.write(&scratch[..n]),
                    Err(_) => {
                        fatal = true;
                        break;
                    }
                }
            }
        }
        if fatal {
            return self.shutdown_in_loop();
        }
        self.deliver_message();
    }

    /// Write readiness: flush the out-buffer. Once drained, write interest
    /// is dropped, and a connection that was draining for shutdown is
    /// released.
    fn handle_write(&self) {
        self.owner.assert_in_loop();
        let mut fatal = false;
        let mut release_after_drain = false;
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnState::Disconnected {
                return;
            }
            let Inner {
                socket,
                out_buffer,
                state,
                ..
            } = &mut *inner;
            let socket = match socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            while out_buffer.readable_size() > 0 {
                match socket.nonblock_send(out_buffer.peek()) {
                    Ok(0) => break,
                    Ok(n) => out_buffer.advance_read(n),
                    Err(_) => {
                        fatal = true;
                        break;
                    }
                }
            }
            if !fatal && out_buffer.readable_size() == 0 {
                self.channel.disable_write();
                if *state == ConnState::Disconnecting {
                    release_after_drain = true;
                }
            }
        }
        if fatal {
            self.deliver_message();
            return self.release();
        }
        if release_after_drain {
            self.release();
        }
    }

    fn handle_error(&self) {
        self.handle_close();
    }

    /// Hangup: deliver whatever input is still buffered, then release.
    fn handle_close(&self) {
        self.owner.assert_in_loop();
        self.deliver_message();
        self.release();
    }

    /// Runs after every dispatched event; keeps the idle timer sliding and
    /// the write interest armed.
    fn handle_any_event(&self) {
        let (refresh, rearm_write, cb) = {
            let inner = self.inner.lock();
            (
                inner.inactive_release,
                self.channel.is_writing() && inner.out_buffer.readable_size() > 0,
                inner.callbacks.any_event.clone(),
            )
        };
        if rearm_write {
            // The kernel reports writability once per edge. A wakeup that
            // was consumed by the read branch must re-arm the interest or
            // a pending out-buffer would never flush.
            self.channel.enable_write();
        }
        if refresh {
            self.owner.timer_refresh(self.id);
        }
        if let Some(cb) = cb {
            cb(&self.to_ref());
        }
    }

    /// Fires the message callback with the in-buffer detached from the
    /// connection, so the callback can freely call `send`, `shutdown` or
    /// `upgrade` without re-entering the state lock. Unconsumed bytes are
    /// handed back afterwards.
    fn deliver_message(&self) {
        let (cb, mut pending) = {
            let mut inner = self.inner.lock();
            if inner.in_buffer.readable_size() == 0 {
                return;
            }
            let cb = match inner.callbacks.message.clone() {
                Some(cb) => cb,
                None => return,
            };
            (cb, mem::take(&mut inner.in_buffer))
        };
        cb(&self.to_ref(), &mut pending);
        self.inner.lock().in_buffer = pending;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("state", &self.state())
            .finish()
    }
}
