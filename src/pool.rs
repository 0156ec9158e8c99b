//! A first-in, first-out store of reusable objects.
use std::collections::VecDeque;

/// Holds objects which have been released for reuse.
///
/// The pool never creates or modifies objects; it only stores them. Objects come back out in the
/// order they were released, so every pooled object gets a turn.
#[derive(Debug)]
pub struct ObjectPool<T> {
    available: VecDeque<T>,
}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self {
            available: VecDeque::new(),
        }
    }
}

impl<T> ObjectPool<T> {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an object to the pool
    pub fn release(&mut self, object: T) {
        self.available.push_back(object);
    }

    /// Take the object which has been waiting longest, if any
    pub fn acquire(&mut self) -> Option<T> {
        self.available.pop_front()
    }

    /// Whether there are no objects waiting
    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    /// The number of objects waiting
    pub fn len(&self) -> usize {
        self.available.len()
    }

    /// Remove and return every waiting object
    pub fn drain_all(&mut self) -> Vec<T> {
        self.available.drain(..).collect()
    }
}
