//! Worker threads hosting event loops, and the round-robin pool.
//!
//! A loop must live on the stack of the thread that runs it, so its
//! lifetime is tied to thread exit. `LoopThread` spawns the thread, lets
//! it construct its loop locally, and blocks the creator until the new
//! thread has published a ready-to-use handle.

use std::sync::mpsc;
use std::thread;

use crate::event_loop::{EventLoop, LoopHandle};

/// A thread running one [`EventLoop`]. Dropping the `LoopThread` signals
/// the loop to quit and joins the thread.
#[derive(Debug)]
pub struct LoopThread {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl LoopThread {
    /// Spawns the thread and blocks until its loop is ready for use.
    pub fn spawn() -> LoopThread {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("eddy-loop".into())
            .spawn(move || {
                let mut event_loop = EventLoop::new();
                if tx.send(event_loop.handle()).is_err() {
                    return;
                }
                event_loop.run();
            })
            .expect("failed to spawn loop thread");
        let handle = rx.recv().expect("loop thread died during startup");
        LoopThread {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The base loop plus `N` worker loop threads, with a round-robin picker.
#[derive(Debug)]
pub struct LoopThreadPool {
    base: LoopHandle,
    thread_num: usize,
    threads: Vec<LoopThread>,
    next: usize,
}

impl LoopThreadPool {
    pub fn new(base: LoopHandle) -> LoopThreadPool {
        LoopThreadPool {
            base,
            thread_num: 0,
            threads: Vec::new(),
            next: 0,
        }
    }

    /// Sets the worker count. Must be called before [`create`](Self::create).
    pub fn set_thread_num(&mut self, num: usize) {
        self.thread_num = num;
    }

    /// Spawns the worker threads, blocking until every loop is published.
    pub fn create(&mut self) {
        for _ in 0..self.thread_num {
            self.threads.push(LoopThread::spawn());
        }
    }

    /// The loop the next connection should be pinned to: the base loop
    /// when there are no workers, otherwise round-robin over the workers.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        if self.threads.is_empty() {
            return self.base.clone();
        }
        let handle = self.threads[self.next].handle();
        self.next = (self.next + 1) % self.threads.len();
        handle
    }
}
