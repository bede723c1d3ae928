//! # Lock-free last-in-first-out stack.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// # Atomic LIFO over a single head pointer.
///
/// `push` and `pop` are compare-and-swap loops; an empty pop returns `None`.
/// Nodes are never reused while another operation holds them.
pub struct AtomicLifo<T> {
    head: AtomicPtr<Node<T>>,
}

unsafe impl<T: Send> Send for AtomicLifo<T> {}
unsafe impl<T: Send> Sync for AtomicLifo<T> {}

impl<T> Default for AtomicLifo<T> {
    fn default() -> Self {
        AtomicLifo::new()
    }
}

impl<T> AtomicLifo<T> {
    /// Builds an empty stack.
    pub const fn new() -> Self {
        AtomicLifo {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Atomically adds a value to the top of the stack.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        loop {
            let head = self.head.load(Ordering::Acquire);
            // node is not shared until the CAS below publishes it.
            unsafe { (*node).next = head };
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Atomically removes and returns the top value, or `None` if empty.
    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next };
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let node = unsafe { Box::from_raw(head) };
                return Some(node.value);
            }
        }
    }

    /// Returns whether the stack is currently empty.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for AtomicLifo<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
        }
    }
}
