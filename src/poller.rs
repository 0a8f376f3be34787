//! Readiness dispatcher over the kernel poller.
//!
//! `Poller` owns the `mio::Poll` instance and the registry of live
//! channels; `Registration` is the part shared with every channel so that
//! interest changes reach the kernel before the loop's next wait. The
//! owning event loop is the only thread that mutates either.

use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token};
use parking_lot::Mutex;
use slab::Slab;
use tracing::error;

use crate::channel::Channel;

pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX - 1);

const MAX_POLL_EVENTS: usize = 1024;

/// Readiness bits delivered to a channel in one wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Ready(u8);

impl Ready {
    pub const READABLE: Ready = Ready(1 << 0);
    pub const WRITABLE: Ready = Ready(1 << 1);
    pub const ERROR: Ready = Ready(1 << 2);
    pub const HANGUP: Ready = Ready(1 << 3);
    pub const PEER_HANGUP: Ready = Ready(1 << 4);
    pub const PRIORITY: Ready = Ready(1 << 5);

    pub fn intersects(self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }

    fn from_event(event: &mio::event::Event) -> Ready {
        let mut ready = Ready(0);
        if event.is_readable() {
            ready = ready | Ready::READABLE;
        }
        if event.is_writable() {
            ready = ready | Ready::WRITABLE;
        }
        if event.is_error() {
            ready = ready | Ready::ERROR;
        }
        if event.is_read_closed() {
            ready = ready | Ready::PEER_HANGUP;
        }
        if event.is_read_closed() && event.is_write_closed() {
            ready = ready | Ready::HANGUP;
        }
        if event.is_priority() {
            ready = ready | Ready::PRIORITY;
        }
        ready
    }
}

impl std::ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

/// Dispatcher state shared with the channels: the kernel registry handle
/// and the token → channel mapping. Invariant: the set of fds registered
/// with the kernel equals the occupied keys of `channels`.
pub(crate) struct Registration {
    registry: Registry,
    channels: Mutex<Slab<Arc<Channel>>>,
}

impl Registration {
    /// Propagates `channel`'s current interest to the kernel, registering
    /// it on first use and unregistering it when no interest remains.
    pub(crate) fn update(&self, channel: &Arc<Channel>) {
        let mut channels = self.channels.lock();
        let fd = channel.fd();
        match (channel.token(), channel.mio_interest()) {
            (None, Some(interest)) => {
                let entry = channels.vacant_entry();
                let token = Token(entry.key());
                match self.registry.register(&mut SourceFd(&fd), token, interest) {
                    Ok(()) => {
                        channel.set_token(token.0);
                        entry.insert(channel.clone());
                    }
                    Err(e) => error!(fd, error = %e, "failed to register fd"),
                }
            }
            (Some(token), Some(interest)) => {
                if let Err(e) = self
                    .registry
                    .reregister(&mut SourceFd(&fd), Token(token), interest)
                {
                    error!(fd, error = %e, "failed to update fd interest");
                }
            }
            (Some(token), None) => {
                channels.try_remove(token);
                channel.clear_token();
                if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                    error!(fd, error = %e, "failed to deregister fd");
                }
            }
            (None, None) => {}
        }
    }

    /// Unregisters `channel` fully.
    pub(crate) fn remove(&self, channel: &Channel) {
        let mut channels = self.channels.lock();
        if let Some(token) = channel.token() {
            channels.try_remove(token);
            channel.clear_token();
            let fd = channel.fd();
            if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                error!(fd, error = %e, "failed to deregister fd");
            }
        }
    }

    fn get(&self, token: Token) -> Option<Arc<Channel>> {
        self.channels.lock().get(token.0).cloned()
    }
}

/// Blocks on the kernel until readiness arrives and translates it back to
/// channel references.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    registration: Arc<Registration>,
}

impl Poller {
    pub(crate) fn new() -> Poller {
        let poll = Poll::new().expect("failed to create kernel poller");
        let registry = poll
            .registry()
            .try_clone()
            .expect("failed to clone poll registry");
        Poller {
            poll,
            events: Events::with_capacity(MAX_POLL_EVENTS),
            registration: Arc::new(Registration {
                registry,
                channels: Mutex::new(Slab::new()),
            }),
        }
    }

    pub(crate) fn registration(&self) -> Arc<Registration> {
        self.registration.clone()
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Waits for readiness and fills `active` with (channel, readiness)
    /// pairs. An interrupted wait yields an empty set; any other poll
    /// failure is unrecoverable and terminates the process.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<(Arc<Channel>, Ready)>,
    ) {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                return;
            }
            error!(error = %e, "kernel poll failed");
            std::process::abort();
        }
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                // The waker exists only to unblock the wait; queued tasks
                // are drained at the end of every iteration.
                continue;
            }
            if let Some(channel) = self.registration.get(token) {
                active.push((channel, Ready::from_event(event)));
            }
        }
    }
}
