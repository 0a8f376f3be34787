//! Per-fd interest set and event callbacks.
//!
//! A `Channel` bridges one file descriptor and the subsystem that owns it
//! (connection or acceptor): it carries the current interest bits, keeps
//! the kernel registration in sync through the shared [`Registration`],
//! and routes a delivered readiness set to the right callback.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::poller::{Ready, Registration};

pub(crate) type EventCallback = Box<dyn Fn() + Send + Sync>;

const INTEREST_READ: u8 = 1 << 0;
const INTEREST_WRITE: u8 = 1 << 1;

const UNREGISTERED: usize = usize::MAX;

/// Event interest and callbacks for a single fd.
///
/// The callbacks are fixed at construction; they capture weak references
/// to their owner so a registered channel never extends the owner's
/// lifetime. Interest changes go to the kernel immediately, so they are
/// visible to the dispatcher before its next wait. All methods are meant
/// to be called on the owning loop's thread.
pub(crate) struct Channel {
    fd: RawFd,
    registration: Arc<Registration>,
    self_ref: Weak<Channel>,
    token: AtomicUsize,
    interest: AtomicU8,
    read_cb: Option<EventCallback>,
    write_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    any_event_cb: Option<EventCallback>,
}

pub(crate) struct ChannelBuilder {
    fd: RawFd,
    registration: Arc<Registration>,
    read_cb: Option<EventCallback>,
    write_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    any_event_cb: Option<EventCallback>,
}

impl ChannelBuilder {
    pub(crate) fn new(fd: RawFd, registration: Arc<Registration>) -> ChannelBuilder {
        ChannelBuilder {
            fd,
            registration,
            read_cb: None,
            write_cb: None,
            error_cb: None,
            close_cb: None,
            any_event_cb: None,
        }
    }

    pub(crate) fn on_read(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.read_cb = Some(Box::new(f));
        self
    }

    pub(crate) fn on_write(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.write_cb = Some(Box::new(f));
        self
    }

    pub(crate) fn on_error(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.error_cb = Some(Box::new(f));
        self
    }

    pub(crate) fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.close_cb = Some(Box::new(f));
        self
    }

    pub(crate) fn on_any_event(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.any_event_cb = Some(Box::new(f));
        self
    }

    pub(crate) fn finish(self) -> Arc<Channel> {
        Arc::new_cyclic(|weak| Channel {
            fd: self.fd,
            registration: self.registration,
            self_ref: weak.clone(),
            token: AtomicUsize::new(UNREGISTERED),
            interest: AtomicU8::new(0),
            read_cb: self.read_cb,
            write_cb: self.write_cb,
            error_cb: self.error_cb,
            close_cb: self.close_cb,
            any_event_cb: self.any_event_cb,
        })
    }
}

impl Channel {
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn token(&self) -> Option<usize> {
        match self.token.load(Ordering::Acquire) {
            UNREGISTERED => None,
            token => Some(token),
        }
    }

    pub(crate) fn set_token(&self, token: usize) {
        self.token.store(token, Ordering::Release);
    }

    pub(crate) fn clear_token(&self) {
        self.token.store(UNREGISTERED, Ordering::Release);
    }

    /// Current interest translated to the kernel representation; `None`
    /// when no interest bit is set.
    pub(crate) fn mio_interest(&self) -> Option<mio::Interest> {
        let bits = self.interest.load(Ordering::Acquire);
        match (bits & INTEREST_READ != 0, bits & INTEREST_WRITE != 0) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.interest.load(Ordering::Acquire) & INTEREST_WRITE != 0
    }

    pub(crate) fn enable_read(&self) {
        self.interest.fetch_or(INTEREST_READ, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn enable_write(&self) {
        self.interest.fetch_or(INTEREST_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub(crate) fn disable_write(&self) {
        self.interest.fetch_and(!INTEREST_WRITE, Ordering::AcqRel);
        self.update();
    }

    /// Pushes the current interest to the dispatcher.
    fn update(&self) {
        let this = self
            .self_ref
            .upgrade()
            .expect("channel updated during teardown");
        self.registration.update(&this);
    }

    /// Unregisters the fd fully.
    pub(crate) fn remove(&self) {
        self.interest.store(0, Ordering::Release);
        self.registration.remove(self);
    }

    /// Routes one delivered readiness set.
    ///
    /// At most one of read/write/error/close fires per wakeup; a read
    /// handler may release its connection, and dispatching a second branch
    /// afterwards would touch freed state. The any-event hook always runs
    /// last.
    pub(crate) fn dispatch(&self, ready: Ready) {
        if ready.intersects(Ready::READABLE | Ready::PEER_HANGUP | Ready::PRIORITY) {
            if let Some(cb) = &self.read_cb {
                cb();
            }
        } else if ready.intersects(Ready::WRITABLE) {
            if let Some(cb) = &self.write_cb {
                cb();
            }
        } else if ready.intersects(Ready::ERROR) {
            if let Some(cb) = &self.error_cb {
                cb();
            }
        } else if ready.intersects(Ready::HANGUP) {
            if let Some(cb) = &self.close_cb {
                cb();
            }
        }
        if let Some(cb) = &self.any_event_cb {
            cb();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("token", &self.token())
            .field("interest", &self.interest.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_channel(reg: Arc<Registration>, hits: &Arc<AtomicUsize>) -> Arc<Channel> {
        let h = hits.clone();
        ChannelBuilder::new(-1, reg)
            .on_read({
                let h = h.clone();
                move || {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_write({
                let h = h.clone();
                move || {
                    h.fetch_add(100, Ordering::SeqCst);
                }
            })
            .on_any_event(move || {
                h.fetch_add(1000, Ordering::SeqCst);
            })
            .finish()
    }

    #[test]
    fn read_shadows_write_in_one_wakeup() {
        let poller = crate::poller::Poller::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let channel = counting_channel(poller.registration(), &hits);
        channel.dispatch(Ready::READABLE | Ready::WRITABLE);
        // Only the read branch plus the any-event hook may run.
        assert_eq!(hits.load(Ordering::SeqCst), 1001);
    }

    #[test]
    fn write_fires_when_not_readable() {
        let poller = crate::poller::Poller::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let channel = counting_channel(poller.registration(), &hits);
        channel.dispatch(Ready::WRITABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 1100);
    }

    #[test]
    fn peer_hangup_routes_to_read() {
        let poller = crate::poller::Poller::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let channel = counting_channel(poller.registration(), &hits);
        channel.dispatch(Ready::PEER_HANGUP);
        assert_eq!(hits.load(Ordering::SeqCst), 1001);
    }
}
