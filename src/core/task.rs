use std::cell::RefCell;

use crate::core::sync::Arc;
use crate::core::Shared;
use crate::lazy_threading::ReceiverIsolation;
use crate::pool::PoolCore;

/// The priority of a task.
///
/// High priority tasks are dequeued before any previously queued
/// low-priority task, system-wide. Within one priority class the
/// queue is FIFO.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Low,
}

impl Priority {
    // For convenience, some per-priority data (like queues) are internally
    // stored in arrays.
    pub(crate) fn index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Low => 1,
        }
    }
}

/// A type-erased unit of work: an execute function, a matching discard
/// function, and an opaque data pointer.
///
/// A payload **must** be consumed exactly once, either by `run` or by
/// `discard`, or else data may leak or be freed twice.
///
/// Most payloads come from `RawPayload::heap` and own a boxed closure.
/// The parallel range engine builds payloads whose data pointer refers
/// to state pinned on the waiting thread's stack; those are only safe
/// because the same call frame waits for the pool to drain before the
/// state goes away.
pub(crate) struct RawPayload {
    execute_fn: unsafe fn(*const ()),
    discard_fn: unsafe fn(*const ()),
    data: *const (),
}

unsafe impl Send for RawPayload {}

impl RawPayload {
    /// Wrap a closure in a heap allocation and erase its type.
    pub fn heap<F>(f: F) -> Self
    where
        F: FnOnce() + Send,
    {
        unsafe fn execute<F: FnOnce()>(data: *const ()) {
            let f = *Box::from_raw(data as *mut F);
            f();
        }
        unsafe fn discard<F>(data: *const ()) {
            drop(Box::from_raw(data as *mut F));
        }

        RawPayload {
            execute_fn: execute::<F>,
            discard_fn: discard::<F>,
            data: Box::into_raw(Box::new(f)) as *const (),
        }
    }

    /// Build a payload from raw parts.
    ///
    /// Safety: the caller asserts that `data` stays valid until the payload
    /// is consumed, and that `execute_fn`/`discard_fn` agree on its type.
    pub unsafe fn from_raw(
        execute_fn: unsafe fn(*const ()),
        discard_fn: unsafe fn(*const ()),
        data: *const (),
    ) -> Self {
        RawPayload { execute_fn, discard_fn, data }
    }

    pub unsafe fn run(self) {
        (self.execute_fn)(self.data)
    }

    pub unsafe fn discard(self) {
        (self.discard_fn)(self.data)
    }
}

/// A task record as it sits in the shared queue: the owning pool plus the
/// erased payload.
///
/// Records are fixed-size, so the boxes they live in are recycled through a
/// small per-thread free list to keep push/complete cycles off the
/// allocator.
pub(crate) struct TaskUnit {
    pub pool: Option<Arc<PoolCore>>,
    payload: Option<RawPayload>,
    pub priority: Priority,
}

const TASK_CACHE_CAP: usize = 64;

thread_local! {
    static TASK_CACHE: RefCell<Vec<Box<TaskUnit>>> = RefCell::new(Vec::new());
}

impl TaskUnit {
    pub fn alloc(pool: Arc<PoolCore>, payload: RawPayload, priority: Priority) -> Box<TaskUnit> {
        let recycled = TASK_CACHE.with(|cache| cache.borrow_mut().pop());
        match recycled {
            Some(mut shell) => {
                shell.pool = Some(pool);
                shell.payload = Some(payload);
                shell.priority = priority;
                shell
            }
            None => Box::new(TaskUnit {
                pool: Some(pool),
                payload: Some(payload),
                priority,
            }),
        }
    }

    fn recycle(shell: Box<TaskUnit>) {
        // A shell being returned with live contents means it was never
        // consumed, which would leak the payload and the pool reference.
        debug_assert!(shell.pool.is_none());
        debug_assert!(shell.payload.is_none());
        TASK_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if cache.len() < TASK_CACHE_CAP {
                cache.push(shell);
            }
        });
    }

    pub fn pool_core(&self) -> &PoolCore {
        self.pool.as_deref().unwrap()
    }

    /// Run the task on the current thread and update the owning pool's
    /// bookkeeping. Tasks of a canceled pool are skipped, their payload
    /// dropped.
    pub fn execute(mut self: Box<Self>, shared: &Shared) {
        profiling::scope!("task");

        let pool = self.pool.take().unwrap();
        let payload = self.payload.take().unwrap();
        TaskUnit::recycle(self);

        if pool.is_canceled() {
            unsafe {
                payload.discard();
            }
        } else {
            // Hints sent by the task body must not reach receivers that an
            // enclosing wait loop registered on this thread.
            let _isolation = ReceiverIsolation::new();
            unsafe {
                payload.run();
            }
        }

        PoolCore::task_finished(&pool, shared);
    }

    /// Free the payload and return the pool without touching its pending
    /// count. For callers that do their own accounting (serial feed during
    /// shutdown).
    pub fn abandon(mut self: Box<Self>) -> Arc<PoolCore> {
        let pool = self.pool.take().unwrap();
        let payload = self.payload.take().unwrap();
        TaskUnit::recycle(self);

        unsafe {
            payload.discard();
        }

        pool
    }

    /// Drop the task without running it (cancellation purge, shutdown
    /// drain). The payload's data is freed and the pool is notified.
    pub fn discard(mut self: Box<Self>, shared: &Shared) {
        let pool = self.pool.take().unwrap();
        let payload = self.payload.take().unwrap();
        TaskUnit::recycle(self);

        unsafe {
            payload.discard();
        }

        PoolCore::task_finished(&pool, shared);
    }
}
