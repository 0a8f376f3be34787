//! Hashed timer wheel.
//!
//! The wheel is a ring of 60 slots; each slot holds strong references to
//! the timers parked there. Refreshing a timer parks one more strong
//! reference at its new expiry slot without touching the old parkings, and
//! advancing the wheel drops everything in the newly-current slot. A timer
//! therefore fires exactly when its last strong reference goes away, which
//! makes "refresh = further delay" a single `Rc` clone.
//!
//! The wheel belongs to one event loop and is only touched on that loop's
//! thread; the thread-safe surface is the loop handle, which posts wheel
//! commands to the owner.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

pub(crate) type TimerCallback = Box<dyn FnOnce() + Send>;

/// Slot count; also the maximum schedulable delay (in ticks) minus one.
pub(crate) const WHEEL_CAPACITY: usize = 60;

type TimerIndex = Rc<RefCell<HashMap<u64, Weak<TimerEntry>>>>;

struct TimerEntry {
    id: u64,
    delay: u32,
    cancelled: Cell<bool>,
    callback: Option<TimerCallback>,
    index: std::rc::Weak<RefCell<HashMap<u64, Weak<TimerEntry>>>>,
}

impl Drop for TimerEntry {
    fn drop(&mut self) {
        if !self.cancelled.get() {
            if let Some(callback) = self.callback.take() {
                callback();
            }
        }
        if let Some(index) = self.index.upgrade() {
            let mut index = index.borrow_mut();
            // Only erase the id if the index still points at a dead entry;
            // the id may have been re-added and then refers to a live
            // timer this release must not orphan.
            let stale = index
                .get(&self.id)
                .map_or(false, |weak| weak.upgrade().is_none());
            if stale {
                index.remove(&self.id);
            }
        }
    }
}

pub(crate) struct TimerWheel {
    pos: usize,
    slots: Vec<Vec<Rc<TimerEntry>>>,
    index: TimerIndex,
}

impl TimerWheel {
    pub(crate) fn new() -> TimerWheel {
        TimerWheel {
            pos: 0,
            slots: (0..WHEEL_CAPACITY).map(|_| Vec::new()).collect(),
            index: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Schedules `callback` to run `delay` ticks from now; `delay` must be
    /// below the wheel capacity. Re-adding a live id detaches the old
    /// entry from the index: it ages out without firing refreshes.
    pub(crate) fn add(&mut self, id: u64, delay: u32, callback: TimerCallback) {
        debug_assert!((delay as usize) < WHEEL_CAPACITY);
        let entry = Rc::new(TimerEntry {
            id,
            delay,
            cancelled: Cell::new(false),
            callback: Some(callback),
            index: Rc::downgrade(&self.index),
        });
        self.index.borrow_mut().insert(id, Rc::downgrade(&entry));
        let slot = (self.pos + delay as usize) % WHEEL_CAPACITY;
        self.slots[slot].push(entry);
    }

    /// Pushes the timer's expiry out by its original delay. Unknown ids
    /// are ignored.
    pub(crate) fn refresh(&mut self, id: u64) {
        let entry = match self.index.borrow().get(&id).and_then(Weak::upgrade) {
            Some(entry) => entry,
            None => return,
        };
        let slot = (self.pos + entry.delay as usize) % WHEEL_CAPACITY;
        self.slots[slot].push(entry);
    }

    /// Marks the timer cancelled; its parked references age out normally
    /// but the callback will not run. Unknown ids are ignored.
    pub(crate) fn cancel(&mut self, id: u64) {
        if let Some(entry) = self.index.borrow().get(&id).and_then(Weak::upgrade) {
            entry.cancelled.set(true);
        }
    }

    pub(crate) fn has_timer(&self, id: u64) -> bool {
        self.index.borrow().contains_key(&id)
    }

    /// Advances the wheel one slot, releasing everything parked there.
    pub(crate) fn tick(&mut self) {
        self.pos = (self.pos + 1) % WHEEL_CAPACITY;
        let expired = std::mem::take(&mut self.slots[self.pos]);
        drop(expired);
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        // Tearing the loop down must not run pending timer actions.
        for slot in &self.slots {
            for entry in slot {
                entry.cancelled.set(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter_cb(counter: &Arc<AtomicU32>) -> TimerCallback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_exactly_once_after_delay() {
        let mut wheel = TimerWheel::new();
        let fired = Arc::new(AtomicU32::new(0));
        wheel.add(1, 3, counter_cb(&fired));

        wheel.tick();
        wheel.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        wheel.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!wheel.has_timer(1));

        for _ in 0..2 * WHEEL_CAPACITY {
            wheel.tick();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_extends_the_deadline() {
        let mut wheel = TimerWheel::new();
        let fired = Arc::new(AtomicU32::new(0));
        wheel.add(7, 2, counter_cb(&fired));

        wheel.tick();
        wheel.refresh(7);
        wheel.tick();
        // The original parking just aged out, but the refresh still holds
        // a strong reference.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(wheel.has_timer(7));
        wheel.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_suppresses_the_callback() {
        let mut wheel = TimerWheel::new();
        let fired = Arc::new(AtomicU32::new(0));
        wheel.add(9, 2, counter_cb(&fired));
        wheel.cancel(9);

        for _ in 0..WHEEL_CAPACITY {
            wheel.tick();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!wheel.has_timer(9));
    }

    #[test]
    fn cancelled_id_can_be_reused() {
        let mut wheel = TimerWheel::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        wheel.add(3, 2, counter_cb(&first));
        wheel.cancel(3);
        wheel.add(3, 4, counter_cb(&second));

        wheel.tick();
        wheel.tick();
        // The cancelled parking just aged out; it must neither fire nor
        // orphan the replacement entry.
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert!(wheel.has_timer(3));

        wheel.tick();
        wheel.tick();
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_and_cancel_of_unknown_ids_are_noops() {
        let mut wheel = TimerWheel::new();
        wheel.refresh(42);
        wheel.cancel(42);
        assert!(!wheel.has_timer(42));
    }

    #[test]
    fn dropping_the_wheel_does_not_fire() {
        let fired = Arc::new(AtomicU32::new(0));
        {
            let mut wheel = TimerWheel::new();
            wheel.add(1, 5, counter_cb(&fired));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
