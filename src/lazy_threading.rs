//! Lazy threading hints.
//!
//! A piece of code that was dispatched single-threaded can discover, midway
//! through, that it is going to take a while. `send_hint` lets it tell
//! whoever dispatched it (typically the parallel range engine after it
//! collapsed a small workload onto the calling thread) that remaining work
//! should be redistributed to other threads now.
//!
//! Receivers live on a thread-local stack with strict LIFO scoping, so no
//! synchronization is involved at all. Receivers must tolerate being called
//! more than once and in any order.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::mem;

thread_local! {
    static RECEIVERS: RefCell<Vec<*mut (dyn FnMut() + 'static)>> = RefCell::new(Vec::new());
}

/// Notify every hint receiver registered on the current thread.
///
/// Call this right before starting an operation that is expected to block
/// or compute for a long time.
pub fn send_hint() {
    // The callbacks are invoked outside of the borrow: a receiver is
    // allowed to register or isolate receivers of its own.
    let receivers = RECEIVERS.with(|stack| stack.borrow().clone());
    for receiver in receivers.into_iter().rev() {
        unsafe {
            (*receiver)();
        }
    }
}

/// Registers a hint receiver for the duration of a scope.
///
/// The callback runs on this thread whenever `send_hint` is called within
/// the scope. Deregistration happens on drop, on every exit path.
pub struct HintReceiver<'a> {
    marker: PhantomData<&'a mut dyn FnMut()>,
    // Thread-local registration must be undone on the same thread.
    not_send: PhantomData<*mut ()>,
}

impl<'a> HintReceiver<'a> {
    pub fn new(callback: &'a mut (dyn FnMut() + 'a)) -> HintReceiver<'a> {
        let ptr: *mut (dyn FnMut() + 'a) = callback;
        // The lifetime is erased for storage only; the guard guarantees the
        // pointer is popped before 'a ends.
        let ptr: *mut (dyn FnMut() + 'static) = unsafe { mem::transmute(ptr) };
        RECEIVERS.with(|stack| stack.borrow_mut().push(ptr));

        HintReceiver {
            marker: PhantomData,
            not_send: PhantomData,
        }
    }
}

impl<'a> Drop for HintReceiver<'a> {
    fn drop(&mut self) {
        RECEIVERS.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert!(popped.is_some(), "receiver stack out of balance");
        });
    }
}

/// Empties the calling thread's receiver stack for the duration of a
/// scope, restoring it on drop.
///
/// Used when entering an isolated execution region: hints sent from inside
/// must not tell an enclosing wait loop to release work for a computation
/// it knows nothing about.
pub struct ReceiverIsolation {
    saved: Vec<*mut (dyn FnMut() + 'static)>,
    not_send: PhantomData<*mut ()>,
}

impl ReceiverIsolation {
    pub fn new() -> ReceiverIsolation {
        let saved = RECEIVERS.with(|stack| mem::take(&mut *stack.borrow_mut()));

        ReceiverIsolation {
            saved,
            not_send: PhantomData,
        }
    }
}

impl Drop for ReceiverIsolation {
    fn drop(&mut self) {
        RECEIVERS.with(|stack| {
            let mut stack = stack.borrow_mut();
            // Receivers registered inside the scope must have been popped
            // by their own guards by now.
            debug_assert!(stack.is_empty(), "receiver leaked out of isolated scope");
            *stack = mem::take(&mut self.saved);
        });
    }
}

/// Run `f` with hint propagation cut off from the enclosing scope.
pub fn isolate<R>(f: impl FnOnce() -> R) -> R {
    let _isolation = ReceiverIsolation::new();
    f()
}
