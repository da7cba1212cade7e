use std::collections::VecDeque;

use crate::core::sync::{Condvar, Mutex};
use crate::core::task::TaskUnit;
use crate::pool::PoolId;

/// What a worker thread is allowed to pick up from the queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WorkerKind {
    /// Runs anything.
    General,
    /// The dedicated fallback worker: only runs tasks of background pools,
    /// so that foreground work can never occupy the one thread background
    /// pools were promised.
    BackgroundOnly,
}

struct QueueState {
    // One FIFO per priority. High is always drained before Low, which gives
    // the "pushed to the head of the queue" behavior without reordering
    // tasks within a priority class.
    tasks: [VecDeque<Box<TaskUnit>>; 2],
    exit: bool,
}

/// The scheduler's shared two-priority queue.
///
/// A single mutex/condvar pair protects both priority classes. This is
/// deliberately not a distributed work-stealing structure: waiting threads
/// need to drain *their own pool's* tasks only, and cancellation needs to
/// remove a specific pool's tasks, both of which require scanning under one
/// lock.
pub(crate) struct SharedQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl SharedQueue {
    pub fn new() -> Self {
        SharedQueue {
            state: Mutex::new(QueueState {
                tasks: [VecDeque::new(), VecDeque::new()],
                exit: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Enqueue a task and wake workers.
    ///
    /// Returns the task back to the caller if the scheduler is shutting
    /// down; the caller is responsible for discarding it.
    pub fn push(&self, task: Box<TaskUnit>) -> Option<Box<TaskUnit>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.exit {
                return Some(task);
            }
            state.tasks[task.priority.index()].push_back(task);
        }

        // notify_all rather than notify_one: with mixed worker kinds a
        // single wakeup could land on a worker whose filter rejects the
        // task, and the wakeup would be lost.
        self.cond.notify_all();

        None
    }

    /// Block until a task passing the worker's filter is available, or until
    /// shutdown begins. Returns None on shutdown.
    pub fn wait_pop(&self, kind: WorkerKind) -> Option<Box<TaskUnit>> {
        let mut state = self.state.lock().unwrap();
        loop {
            // The exit flag is re-checked on every wakeup; a wakeup never
            // implies that work is available.
            if state.exit {
                return None;
            }

            if let Some(task) = Self::pop_filtered(&mut state, kind) {
                return Some(task);
            }

            state = self.cond.wait(state).unwrap();
        }
    }

    fn pop_filtered(state: &mut QueueState, kind: WorkerKind) -> Option<Box<TaskUnit>> {
        for queue in &mut state.tasks {
            match kind {
                WorkerKind::General => {
                    if let Some(task) = queue.pop_front() {
                        return Some(task);
                    }
                }
                WorkerKind::BackgroundOnly => {
                    let idx = queue
                        .iter()
                        .position(|task| task.pool_core().mode().is_background());
                    if let Some(idx) = idx {
                        return queue.remove(idx);
                    }
                }
            }
        }

        None
    }

    /// Remove one queued task belonging to the given pool, if any.
    ///
    /// Used by `work_and_wait`: the waiting thread only ever helps with its
    /// own pool's tasks, so it can't get stuck behind an unrelated pool's
    /// long-running work.
    pub fn pop_for_pool(&self, pool: PoolId) -> Option<Box<TaskUnit>> {
        let mut state = self.state.lock().unwrap();
        for queue in &mut state.tasks {
            let idx = queue.iter().position(|task| task.pool_core().id() == pool);
            if let Some(idx) = idx {
                return queue.remove(idx);
            }
        }

        None
    }

    /// Remove every queued task belonging to the given pool.
    pub fn purge(&self, pool: PoolId) -> Vec<Box<TaskUnit>> {
        let mut purged = Vec::new();
        let mut state = self.state.lock().unwrap();
        for queue in &mut state.tasks {
            let mut kept = VecDeque::with_capacity(queue.len());
            for task in queue.drain(..) {
                if task.pool_core().id() == pool {
                    purged.push(task);
                } else {
                    kept.push_back(task);
                }
            }
            *queue = kept;
        }

        purged
    }

    pub fn begin_exit(&self) {
        self.state.lock().unwrap().exit = true;
        self.cond.notify_all();
    }

    /// Take every remaining task. Called once after all workers have shut
    /// down.
    pub fn drain(&self) -> Vec<Box<TaskUnit>> {
        let mut state = self.state.lock().unwrap();
        let mut tasks = Vec::new();
        for queue in &mut state.tasks {
            tasks.extend(queue.drain(..));
        }

        tasks
    }
}
