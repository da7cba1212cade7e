use std::ops::Range;

use crate::core::{Shared, WorkerHook};
use crate::core::sync::Arc;
use crate::core::shutdown::{Shutdown, ShutdownHandle};
use crate::iterator::{new_parallel_iterator, IterBuilder};
use crate::range::{new_parallel_range, RangeBuilder};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SchedulerId(pub(crate) u32);

/// A reference to a scheduler: the worker threads and their shared run
/// queue.
///
/// There is no implicit global scheduler; creating one and tearing it down
/// are explicit, and everything that submits work holds a reference to the
/// scheduler it was created from.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) shared: Arc<Shared>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder {
            num_threads: 0,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }

    /// Begin shutting down: wake every worker and let them exit.
    ///
    /// Call `wait()` on the returned handle to block until every worker has
    /// terminated; tasks still queued at that point are freed without
    /// running.
    pub fn shut_down(&self) -> ShutdownHandle {
        Shutdown::begin_shut_down(Arc::clone(&self.shared))
    }

    pub fn id(&self) -> SchedulerId {
        self.shared.id
    }

    /// Total worker count, including the calling thread's slot.
    pub fn num_threads(&self) -> u32 {
        self.shared.num_threads()
    }

    /// Process an index range in parallel.
    #[inline]
    pub fn range(&self, range: Range<u32>) -> RangeBuilder<'_, (), (), ()> {
        new_parallel_range(self, range)
    }

    /// Process the items of an arbitrary iterator in parallel.
    ///
    /// The iterator itself is advanced under a lock; use this for sequences
    /// that can't be indexed, like linked lists or pool walks.
    #[inline]
    pub fn iter<I: Iterator>(&self, items: I) -> IterBuilder<'_, I, (), (), ()> {
        new_parallel_iterator(self, items)
    }
}

pub struct SchedulerBuilder {
    pub(crate) num_threads: u32,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
}

impl SchedulerBuilder {
    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));

        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        self.name_handler = Box::new(handler);

        self
    }

    /// Request a total number of worker slots, the calling thread included.
    ///
    /// Zero (the default) means one slot per hardware thread.
    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads;

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    pub fn build(self) -> Scheduler {
        crate::core::init(self)
    }
}
