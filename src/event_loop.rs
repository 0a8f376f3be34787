//! The reactor loop: poll, dispatch, drain tasks, repeat.
//!
//! Each loop is pinned to the thread that created it. Other threads talk
//! to it exclusively through its [`LoopHandle`]: closures and timer-wheel
//! commands are pushed onto a mutex-guarded queue and the loop's waker
//! unblocks the kernel wait so the post takes effect promptly. The loop
//! drains a snapshot of the queue at the end of every iteration, so tasks
//! may safely post further tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use mio::Waker;
use parking_lot::Mutex;
use tracing::warn;

use crate::channel::Channel;
use crate::poller::{Poller, Ready, Registration, WAKE_TOKEN};
use crate::timer::{TimerCallback, TimerWheel};

/// One wheel tick per second.
pub(crate) const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) enum LoopTask {
    Run(Box<dyn FnOnce() + Send>),
    TimerAdd {
        id: u64,
        delay: u32,
        callback: TimerCallback,
    },
    TimerRefresh(u64),
    TimerCancel(u64),
}

struct LoopShared {
    thread: ThreadId,
    running: AtomicBool,
    tasks: Mutex<Vec<LoopTask>>,
    waker: Waker,
    registration: Arc<Registration>,
}

/// Cloneable, thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Runs `task` inline when called on the loop's own thread, otherwise
    /// enqueues it and wakes the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop() {
            task();
        } else {
            self.post(LoopTask::Run(Box::new(task)));
        }
    }

    /// Unconditionally enqueues `task`; it runs after the current dispatch
    /// pass completes.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.post(LoopTask::Run(Box::new(task)));
    }

    /// Schedules `callback` on the loop's timer wheel, `delay` ticks out.
    /// Ids must be unique among live timers of this loop.
    pub fn timer_add(&self, id: u64, delay: u32, callback: impl FnOnce() + Send + 'static) {
        self.post(LoopTask::TimerAdd {
            id,
            delay,
            callback: Box::new(callback),
        });
    }

    /// Delays an existing timer by its original delay; unknown ids are
    /// ignored.
    pub fn timer_refresh(&self, id: u64) {
        self.post(LoopTask::TimerRefresh(id));
    }

    /// Cancels a timer; unknown ids are ignored.
    pub fn timer_cancel(&self, id: u64) {
        self.post(LoopTask::TimerCancel(id));
    }

    pub fn is_in_loop(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    pub fn assert_in_loop(&self) {
        debug_assert!(self.is_in_loop(), "called off the owning loop thread");
    }

    /// Asks the loop to exit after its current iteration.
    pub fn quit(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.wake();
    }

    pub(crate) fn post(&self, task: LoopTask) {
        self.shared.tasks.lock().push(task);
        self.wake();
    }

    pub(crate) fn registration(&self) -> Arc<Registration> {
        self.shared.registration.clone()
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "failed to wake event loop");
        }
    }
}

impl PartialEq for LoopHandle {
    /// Two handles are equal when they refer to the same loop.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}

/// A single reactor: kernel poller, timer wheel, task queue and waker,
/// bound to the constructing thread.
pub struct EventLoop {
    poller: Poller,
    wheel: TimerWheel,
    shared: Arc<LoopShared>,
    next_tick: Instant,
}

impl EventLoop {
    pub fn new() -> EventLoop {
        let poller = Poller::new();
        let waker = Waker::new(poller.registry(), WAKE_TOKEN).expect("failed to create loop waker");
        let registration = poller.registration();
        EventLoop {
            poller,
            wheel: TimerWheel::new(),
            shared: Arc::new(LoopShared {
                thread: thread::current().id(),
                running: AtomicBool::new(true),
                tasks: Mutex::new(Vec::new()),
                waker,
                registration,
            }),
            next_tick: Instant::now() + TICK_INTERVAL,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs the reactor until [`LoopHandle::quit`] is called. Blocks the
    /// calling thread, which must be the thread that built the loop.
    pub fn run(&mut self) {
        self.handle().assert_in_loop();
        let mut active: Vec<(Arc<Channel>, Ready)> = Vec::new();
        while self.shared.running.load(Ordering::Acquire) {
            let timeout = self.next_tick.saturating_duration_since(Instant::now());
            self.poller.poll(Some(timeout), &mut active);
            self.advance_wheel();
            for (channel, ready) in active.drain(..) {
                channel.dispatch(ready);
            }
            self.drain_tasks();
        }
    }

    /// Advances the wheel once per elapsed tick interval. A slow dispatch
    /// pass is caught up here, matching the multi-tick semantics of a
    /// periodic kernel timer read.
    fn advance_wheel(&mut self) {
        let now = Instant::now();
        while now >= self.next_tick {
            self.wheel.tick();
            self.next_tick += TICK_INTERVAL;
        }
    }

    /// Swaps the queue out under the lock and runs the snapshot, so queued
    /// tasks can post to the loop without deadlocking; anything they post
    /// runs next iteration.
    fn drain_tasks(&mut self) {
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            match task {
                LoopTask::Run(task) => task(),
                LoopTask::TimerAdd {
                    id,
                    delay,
                    callback,
                } => self.wheel.add(id, delay, callback),
                LoopTask::TimerRefresh(id) => self.wheel.refresh(id),
                LoopTask::TimerCancel(id) => self.wheel.cancel(id),
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}
