use std::collections::VecDeque;

use crossbeam_utils::CachePadded;

use crate::core::Shared;
use crate::core::scheduler::Scheduler;
use crate::core::sync::{Arc, Condvar, Mutex, Ordering, AtomicBool, AtomicUsize};
use crate::core::task::{Priority, RawPayload, TaskUnit};
use crate::lazy_threading::ReceiverIsolation;

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_POOL_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

/// How a pool's tasks reach the worker threads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolMode {
    /// Tasks run wherever a worker is free.
    Normal,
    /// Tasks are guaranteed a worker distinct from the pushing thread. If
    /// the scheduler has no dedicated general workers, a fallback worker
    /// restricted to background pools serves them.
    Background,
    /// Background, but tasks execute strictly one at a time, in submission
    /// order.
    BackgroundSerial,
    /// Pushed tasks are buffered locally and stay invisible to the
    /// scheduler until the first `work_and_wait` call. Cuts queue
    /// contention for bulk-submission patterns.
    Suspended,
    /// Tasks execute synchronously on the pushing thread, at push time.
    NoThreads,
}

impl PoolMode {
    pub(crate) fn is_background(&self) -> bool {
        matches!(self, PoolMode::Background | PoolMode::BackgroundSerial)
    }
}

struct LocalTask {
    payload: RawPayload,
    priority: Priority,
}

struct LocalState {
    // Suspended mode: tasks buffered until the first work_and_wait.
    // BackgroundSerial mode: tasks waiting for their predecessor to finish.
    buffer: VecDeque<LocalTask>,
    // True while a serial pool has a task queued or running.
    serial_running: bool,
    // True until a suspended pool is first flushed.
    buffering: bool,
}

/// The part of a pool the scheduler needs to see: bookkeeping, no user
/// data. Tasks sitting in the shared queue hold a reference to this.
pub(crate) struct PoolCore {
    id: PoolId,
    mode: PoolMode,
    /// Number of tasks queued, buffered, or executing. Zero if and only if
    /// no task of this pool exists anywhere.
    pending: CachePadded<AtomicUsize>,
    canceled: AtomicBool,
    // Waiters (work_and_wait, cancel) sleep here. Pushes and completions
    // notify under this mutex so a waiter's predicate check can't miss a
    // wakeup.
    sync: Mutex<()>,
    cond: Condvar,
    local: Mutex<LocalState>,
}

impl PoolCore {
    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn notify_waiters(&self) {
        let _guard = self.sync.lock().unwrap();
        self.cond.notify_all();
    }

    /// Called exactly once per task, whether it ran or was discarded.
    pub fn task_finished(this: &Arc<PoolCore>, shared: &Shared) {
        if this.mode == PoolMode::BackgroundSerial {
            PoolCore::feed_serial(this, shared);
        }

        this.pending.fetch_sub(1, Ordering::SeqCst);
        this.notify_waiters();
    }

    // A serial pool keeps at most one task in the shared queue; the
    // completion of that task promotes the next buffered one.
    fn feed_serial(this: &Arc<PoolCore>, shared: &Shared) {
        loop {
            let next = {
                let mut local = this.local.lock().unwrap();
                match local.buffer.pop_front() {
                    Some(task) => Some(task),
                    None => {
                        local.serial_running = false;
                        None
                    }
                }
            };

            let Some(task) = next else {
                return;
            };

            let unit = TaskUnit::alloc(this.clone(), task.payload, task.priority);
            match shared.queue.push(unit) {
                None => {
                    this.notify_waiters();
                    return;
                }
                Some(rejected) => {
                    // The scheduler is exiting: free the task and keep
                    // draining the buffer so the pending count settles.
                    let pool = rejected.abandon();
                    pool.pending.fetch_sub(1, Ordering::SeqCst);
                    pool.notify_waiters();
                }
            }
        }
    }
}

struct PoolInner<U> {
    core: Arc<PoolCore>,
    shared: Arc<Shared>,
    userdata: U,
}

/// Passed to every task body: access to the pool's user data and the
/// cooperative cancellation flag.
pub struct TaskCtx<'l, U> {
    inner: &'l PoolInner<U>,
}

impl<'l, U> TaskCtx<'l, U> {
    pub fn userdata(&self) -> &U {
        &self.inner.userdata
    }

    /// Cancellation is cooperative: a long-running task should poll this
    /// and bail out early when it returns true.
    pub fn is_canceled(&self) -> bool {
        self.inner.core.is_canceled()
    }
}

/// A named group of tasks sharing wait and cancel semantics, backed by the
/// scheduler's worker threads.
///
/// The pool owns every task pushed into it until the task completes or is
/// purged by cancellation; either way the task's captured data is released
/// exactly once. Dropping the pool cancels it and waits for tasks that are
/// already running.
pub struct TaskPool<U = ()> {
    inner: Arc<PoolInner<U>>,
}

impl TaskPool<()> {
    pub fn new(scheduler: &Scheduler, mode: PoolMode) -> TaskPool<()> {
        TaskPool::with_userdata(scheduler, mode, ())
    }
}

impl<U> TaskPool<U> {
    /// Create a pool whose tasks all see `userdata` through their
    /// `TaskCtx`.
    pub fn with_userdata(scheduler: &Scheduler, mode: PoolMode, userdata: U) -> TaskPool<U> {
        TaskPool {
            inner: Arc::new(PoolInner {
                core: Arc::new(PoolCore {
                    id: PoolId(NEXT_POOL_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)),
                    mode,
                    pending: CachePadded::new(AtomicUsize::new(0)),
                    canceled: AtomicBool::new(false),
                    sync: Mutex::new(()),
                    cond: Condvar::new(),
                    local: Mutex::new(LocalState {
                        buffer: VecDeque::new(),
                        serial_running: false,
                        buffering: mode == PoolMode::Suspended,
                    }),
                }),
                shared: scheduler.shared.clone(),
                userdata,
            }),
        }
    }

    pub fn mode(&self) -> PoolMode {
        self.inner.core.mode
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.core.is_canceled()
    }

    /// Flush any locally buffered tasks, then drain this pool's tasks on
    /// the calling thread until none are queued or executing.
    ///
    /// The calling thread only ever picks up tasks belonging to *this*
    /// pool, so it can't get stuck executing an unrelated pool's long
    /// task; genuine workers keep helping with everything in the
    /// meantime. Nesting is fine: a task may create and wait on a pool of
    /// its own.
    pub fn work_and_wait(&self) {
        profiling::scope!("work_and_wait");

        let core = &self.inner.core;
        let shared = &self.inner.shared;

        if core.mode == PoolMode::Suspended {
            self.flush_suspended();
        }

        loop {
            if let Some(task) = shared.queue.pop_for_pool(core.id) {
                task.execute(shared);
                continue;
            }

            let guard = core.sync.lock().unwrap();
            if core.pending() == 0 {
                return;
            }

            // A task may have been enqueued between the failed pop and
            // taking the pool lock. Pushes notify under this lock, so one
            // more check here closes the window.
            if let Some(task) = shared.queue.pop_for_pool(core.id) {
                drop(guard);
                task.execute(shared);
                continue;
            }

            let _guard = core.cond.wait(guard).unwrap();
        }
    }

    /// Request cancellation and wait for the pool to quiesce.
    ///
    /// Tasks that have not started are removed from the queue and their
    /// captured data dropped; tasks already running finish naturally (they
    /// can poll `TaskCtx::is_canceled` to bail out early). Pushes racing
    /// with the cancel are equally eligible for the purge.
    pub fn cancel(&self) {
        profiling::scope!("pool::cancel");

        let core = &self.inner.core;
        let shared = &self.inner.shared;

        core.canceled.store(true, Ordering::SeqCst);

        self.purge_not_started();
        core.notify_waiters();

        // Tasks already running finish on their own; pushes racing with the
        // cancel notify this pool after buffering or enqueuing, so every
        // wakeup re-purges before checking the count again.
        let mut guard = core.sync.lock().unwrap();
        while core.pending() > 0 {
            guard = core.cond.wait(guard).unwrap();

            drop(guard);
            self.purge_not_started();
            guard = core.sync.lock().unwrap();
        }
    }

    // Remove and free every task of this pool that no thread has started
    // yet, from the local buffer and from the shared queue.
    fn purge_not_started(&self) {
        let core = &self.inner.core;
        let shared = &self.inner.shared;

        let buffered: Vec<LocalTask> = {
            let mut local = core.local.lock().unwrap();
            local.buffer.drain(..).collect()
        };
        for task in buffered {
            unsafe {
                task.payload.discard();
            }
            core.pending.fetch_sub(1, Ordering::SeqCst);
        }

        for task in shared.queue.purge(core.id) {
            task.discard(shared);
        }
    }

    pub(crate) fn push_payload(&self, priority: Priority, payload: RawPayload) {
        profiling::scope!("pool::push");

        let core = &self.inner.core;
        self.inner.core.pending.fetch_add(1, Ordering::SeqCst);

        match core.mode {
            PoolMode::NoThreads => self.run_now(payload),
            PoolMode::Suspended => {
                let leftover = {
                    let mut local = core.local.lock().unwrap();
                    if local.buffering {
                        local.buffer.push_back(LocalTask { payload, priority });
                        None
                    } else {
                        Some(payload)
                    }
                };
                match leftover {
                    None => {
                        // A cancel racing with this push needs a wakeup to come
                        // back and purge the buffer.
                        core.notify_waiters();
                    }
                    Some(payload) => self.enqueue(priority, payload),
                }
            }
            PoolMode::BackgroundSerial => {
                let leftover = {
                    let mut local = core.local.lock().unwrap();
                    if local.serial_running {
                        local.buffer.push_back(LocalTask { payload, priority });
                        None
                    } else {
                        local.serial_running = true;
                        Some(payload)
                    }
                };
                match leftover {
                    Some(payload) => self.enqueue(priority, payload),
                    None => core.notify_waiters(),
                }
            }
            PoolMode::Normal | PoolMode::Background => self.enqueue(priority, payload),
        }
    }

    fn enqueue(&self, priority: Priority, payload: RawPayload) {
        let core = &self.inner.core;
        let shared = &self.inner.shared;

        let unit = TaskUnit::alloc(core.clone(), payload, priority);
        match shared.queue.push(unit) {
            None => core.notify_waiters(),
            Some(rejected) => {
                // Scheduler already shut down; free the task unexecuted.
                let pool = rejected.abandon();
                pool.pending.fetch_sub(1, Ordering::SeqCst);
                pool.notify_waiters();
            }
        }
    }

    fn run_now(&self, payload: RawPayload) {
        let core = &self.inner.core;
        {
            let _isolation = ReceiverIsolation::new();
            unsafe {
                payload.run();
            }
        }
        PoolCore::task_finished(core, &self.inner.shared);
    }

    fn flush_suspended(&self) {
        let drained: Vec<LocalTask> = {
            let mut local = self.inner.core.local.lock().unwrap();
            local.buffering = false;
            local.buffer.drain(..).collect()
        };
        for task in drained {
            self.enqueue(task.priority, task.payload);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_tasks(&self) -> usize {
        self.inner.core.pending()
    }
}

impl<U: Send + Sync + 'static> TaskPool<U> {
    /// Push a unit of work.
    ///
    /// The closure and everything it captures are owned by the pool until
    /// the task runs or is purged; in both cases the captures are dropped
    /// exactly once. Pushing to a canceled pool is accepted, but the task
    /// is released immediately without running.
    pub fn push<F>(&self, priority: Priority, task: F)
    where
        F: FnOnce(&TaskCtx<U>) + Send + 'static,
    {
        if self.inner.core.is_canceled() {
            return;
        }

        let inner = self.inner.clone();
        let payload = RawPayload::heap(move || {
            let ctx = TaskCtx { inner: &inner };
            task(&ctx);
        });

        self.push_payload(priority, payload);
    }
}

impl<U> Drop for TaskPool<U> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};

    // Counts drops so tests can assert that task captures are freed
    // exactly once whether or not the task ran.
    struct DropCounter(Arc<StdAtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, StdOrdering::SeqCst);
        }
    }

    #[test]
    fn drain_and_free() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();
        let pool = TaskPool::new(&scheduler, PoolMode::Normal);

        let runs = Arc::new(StdAtomicUsize::new(0));
        let drops = Arc::new(StdAtomicUsize::new(0));

        for _ in 0..100 {
            let runs = runs.clone();
            let guard = DropCounter(drops.clone());
            pool.push(Priority::Low, move |_| {
                let _guard = &guard;
                runs.fetch_add(1, StdOrdering::SeqCst);
            });
        }

        pool.work_and_wait();

        assert_eq!(runs.load(StdOrdering::SeqCst), 100);
        assert_eq!(drops.load(StdOrdering::SeqCst), 100);
        assert_eq!(pool.pending_tasks(), 0);

        // A second wait on a drained pool returns immediately.
        pool.work_and_wait();

        drop(pool);
        scheduler.shut_down().wait();
    }

    #[test]
    fn priority_order() {
        // One requested thread: no general worker exists, so only the
        // calling thread drains this pool and the order is deterministic.
        let scheduler = Scheduler::builder().with_worker_threads(1).build();
        let pool = TaskPool::new(&scheduler, PoolMode::Normal);

        let order = Arc::new(StdMutex::new(Vec::new()));

        let o = order.clone();
        pool.push(Priority::Low, move |_| o.lock().unwrap().push("low"));
        let o = order.clone();
        pool.push(Priority::High, move |_| o.lock().unwrap().push("high"));

        pool.work_and_wait();

        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);

        drop(pool);
        scheduler.shut_down().wait();
    }

    #[test]
    fn cancel_frees_everything_once() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();
        let pool = TaskPool::new(&scheduler, PoolMode::Normal);

        let runs = Arc::new(StdAtomicUsize::new(0));
        let drops = Arc::new(StdAtomicUsize::new(0));

        for _ in 0..1000 {
            let runs = runs.clone();
            let guard = DropCounter(drops.clone());
            pool.push(Priority::Low, move |_| {
                let _guard = &guard;
                runs.fetch_add(1, StdOrdering::SeqCst);
            });
        }

        pool.cancel();

        assert!(runs.load(StdOrdering::SeqCst) <= 1000);
        assert_eq!(drops.load(StdOrdering::SeqCst), 1000);
        assert_eq!(pool.pending_tasks(), 0);

        // Pushing after cancellation is accepted; the task is freed without
        // running.
        let runs_after = runs.load(StdOrdering::SeqCst);
        let guard = DropCounter(drops.clone());
        pool.push(Priority::High, move |_| {
            let _guard = &guard;
        });
        assert_eq!(runs.load(StdOrdering::SeqCst), runs_after);
        assert_eq!(drops.load(StdOrdering::SeqCst), 1001);

        drop(pool);
        scheduler.shut_down().wait();
    }

    #[test]
    fn cancel_is_observable_from_tasks() {
        let scheduler = Scheduler::builder().with_worker_threads(2).build();
        let pool = TaskPool::new(&scheduler, PoolMode::NoThreads);

        let observed = Arc::new(StdAtomicUsize::new(0));
        let o = observed.clone();
        pool.push(Priority::High, move |ctx| {
            o.store(ctx.is_canceled() as usize + 1, StdOrdering::SeqCst);
        });
        assert_eq!(observed.load(StdOrdering::SeqCst), 1);

        drop(pool);
        scheduler.shut_down().wait();
    }

    #[test]
    fn suspended_tasks_stay_invisible() {
        let scheduler = Scheduler::builder().with_worker_threads(8).build();
        let pool = TaskPool::new(&scheduler, PoolMode::Suspended);

        let runs = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..64 {
            let runs = runs.clone();
            pool.push(Priority::High, move |_| {
                runs.fetch_add(1, StdOrdering::SeqCst);
            });
        }

        // Workers are idle, yet nothing can have run: the tasks are only
        // buffered inside the pool.
        assert_eq!(runs.load(StdOrdering::SeqCst), 0);
        assert_eq!(pool.pending_tasks(), 64);

        pool.work_and_wait();
        assert_eq!(runs.load(StdOrdering::SeqCst), 64);

        // After the first flush the pool behaves like a normal one.
        let runs2 = runs.clone();
        pool.push(Priority::High, move |_| {
            runs2.fetch_add(1, StdOrdering::SeqCst);
        });
        pool.work_and_wait();
        assert_eq!(runs.load(StdOrdering::SeqCst), 65);

        drop(pool);
        scheduler.shut_down().wait();
    }

    #[test]
    fn no_threads_runs_at_push() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();
        let pool = TaskPool::new(&scheduler, PoolMode::NoThreads);

        let caller = std::thread::current().id();
        let ran_on = Arc::new(StdMutex::new(None));
        let r = ran_on.clone();
        pool.push(Priority::Low, move |_| {
            *r.lock().unwrap() = Some(std::thread::current().id());
        });

        assert_eq!(*ran_on.lock().unwrap(), Some(caller));

        drop(pool);
        scheduler.shut_down().wait();
    }

    #[test]
    fn background_runs_off_the_calling_thread() {
        // Even a single-slot scheduler promises background pools a real
        // worker distinct from the submitter.
        let scheduler = Scheduler::builder().with_worker_threads(1).build();
        let pool = TaskPool::new(&scheduler, PoolMode::Background);

        let caller = std::thread::current().id();
        let ran_on = Arc::new(StdMutex::new(None));
        let r = ran_on.clone();
        pool.push(Priority::High, move |_| {
            *r.lock().unwrap() = Some(std::thread::current().id());
        });

        // Wait without helping: the fallback worker must pick it up.
        while pool.pending_tasks() > 0 {
            std::thread::yield_now();
        }

        let ran_on = ran_on.lock().unwrap().unwrap();
        assert_ne!(ran_on, caller);

        drop(pool);
        scheduler.shut_down().wait();
    }

    #[test]
    fn background_serial_preserves_submission_order() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();
        let pool = TaskPool::new(&scheduler, PoolMode::BackgroundSerial);

        let order = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..100 {
            let order = order.clone();
            pool.push(Priority::High, move |_| {
                order.lock().unwrap().push(i);
            });
        }

        pool.work_and_wait();

        let order = order.lock().unwrap();
        assert_eq!(*order, (0..100).collect::<Vec<_>>());

        drop(pool);
        scheduler.shut_down().wait();
    }

    #[test]
    fn nested_pools_do_not_deadlock() {
        let scheduler = Scheduler::builder().with_worker_threads(2).build();
        let outer = TaskPool::new(&scheduler, PoolMode::Normal);

        let total = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..16 {
            let scheduler = scheduler.clone();
            let total = total.clone();
            outer.push(Priority::High, move |_| {
                let inner = TaskPool::new(&scheduler, PoolMode::Normal);
                for _ in 0..8 {
                    let total = total.clone();
                    inner.push(Priority::Low, move |_| {
                        total.fetch_add(1, StdOrdering::SeqCst);
                    });
                }
                inner.work_and_wait();
            });
        }

        outer.work_and_wait();
        assert_eq!(total.load(StdOrdering::SeqCst), 16 * 8);

        drop(outer);
        scheduler.shut_down().wait();
    }

    #[test]
    fn userdata_is_visible_to_tasks() {
        let scheduler = Scheduler::builder().with_worker_threads(2).build();
        let pool = TaskPool::with_userdata(&scheduler, PoolMode::Normal, StdAtomicUsize::new(0));

        for _ in 0..32 {
            pool.push(Priority::High, |ctx| {
                ctx.userdata().fetch_add(1, StdOrdering::SeqCst);
            });
        }
        pool.work_and_wait();

        assert_eq!(pool.inner.userdata.load(StdOrdering::SeqCst), 32);

        drop(pool);
        scheduler.shut_down().wait();
    }
}
