//! Type-erased per-connection context slot.
//!
//! A protocol layer parks whatever state it needs here (the HTTP layer
//! stores its parse FSM); the framework never interprets the contents.
//! Retrieval is checked against the stored dynamic type.

use std::any::Any;

/// Heterogeneous value slot, empty by default.
#[derive(Default)]
pub struct Context {
    slot: Option<Box<dyn Any + Send>>,
}

impl Context {
    /// Creates a slot holding `value`.
    pub fn new<T: Any + Send>(value: T) -> Self {
        Context {
            slot: Some(Box::new(value)),
        }
    }

    /// Replaces the stored value.
    pub fn set<T: Any + Send>(&mut self, value: T) {
        self.slot = Some(Box::new(value));
    }

    /// Returns the stored value if its type is exactly `T`.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.slot.as_ref()?.downcast_ref()
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.slot.as_mut()?.downcast_mut()
    }

    /// Empties the slot.
    pub fn clear(&mut self) {
        self.slot = None;
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("occupied", &self.slot.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassignment_changes_the_stored_type() {
        let mut ctx = Context::new(10i32);
        assert_eq!(ctx.get::<i32>(), Some(&10));
        ctx.set(String::from("hello world"));
        assert_eq!(ctx.get::<i32>(), None);
        assert_eq!(ctx.get::<String>().map(String::as_str), Some("hello world"));
    }

    #[test]
    fn wrong_type_yields_none() {
        let ctx = Context::new(1u64);
        assert!(ctx.get::<u32>().is_none());
        assert!(ctx.get::<u64>().is_some());
    }

    #[test]
    fn mutation_through_the_slot() {
        let mut ctx = Context::new(vec![1, 2]);
        ctx.get_mut::<Vec<i32>>().unwrap().push(3);
        assert_eq!(ctx.get::<Vec<i32>>().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn empty_slot() {
        let mut ctx = Context::default();
        assert!(ctx.is_empty());
        assert!(ctx.get::<i32>().is_none());
        ctx.set(5i32);
        ctx.clear();
        assert!(ctx.is_empty());
    }
}
