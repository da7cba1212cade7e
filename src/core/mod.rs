pub mod scheduler;
pub mod shutdown;
pub mod task;
pub(crate) mod queue;
/// basic std::sync types reexported here so that we can hook loom into them
/// for testing.
pub mod sync;

use sync::{Arc, Ordering, AtomicU32, thread};
use queue::{SharedQueue, WorkerKind};
use scheduler::{Scheduler, SchedulerBuilder, SchedulerId};
use shutdown::{Ready, Shutdown};

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_SCHEDULER_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

/// Data shared by every pool and worker of one scheduler.
pub(crate) struct Shared {
    /// Number of dedicated general worker threads that actually started.
    /// The calling thread counts as one extra worker slot on top of this.
    num_workers: AtomicU32,
    /// The single two-priority run queue.
    pub queue: SharedQueue,
    /// Startup barrier.
    pub ready: Ready,
    /// State and logic to handle shutting down.
    pub shutdown: Shutdown,
    /// A unique ID per scheduler to sanity-check that pools aren't moved
    /// from one scheduler to another if there are several of them.
    pub id: SchedulerId,
    // A few hooks to register work.
    handlers: SchedulerHooks,
}

impl Shared {
    /// Total worker count, including the calling thread's slot.
    pub fn num_threads(&self) -> u32 {
        self.num_workers.load(Ordering::Relaxed) + 1
    }
}

pub(crate) fn init(params: SchedulerBuilder) -> Scheduler {
    let requested = if params.num_threads == 0 {
        // Query std directly; this is host configuration, not modeled state.
        std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
    } else {
        params.num_threads
    };

    // The calling thread occupies one of the requested slots. If that
    // leaves no dedicated worker, spawn one anyway, restricted to
    // background pools: background semantics promise a thread distinct
    // from the submitter.
    let num_general = requested - 1;
    let spawn_plan: Vec<WorkerKind> = if num_general == 0 {
        vec![WorkerKind::BackgroundOnly]
    } else {
        vec![WorkerKind::General; num_general as usize]
    };

    let shared = Arc::new(Shared {
        num_workers: AtomicU32::new(num_general),
        queue: SharedQueue::new(),
        ready: Ready::new(spawn_plan.len() as u32),
        shutdown: Shutdown::new(spawn_plan.len() as u32),
        id: SchedulerId(NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed)),
        handlers: SchedulerHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },
    });

    for (i, kind) in spawn_plan.into_iter().enumerate() {
        let worker = Worker {
            shared: shared.clone(),
            kind,
            index: i as u32,
        };

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i as u32));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let spawned = builder.spawn(move || {
            profiling::register_thread!("Worker");

            worker.run();
        });

        if let Err(error) = spawned {
            // Degrade to fewer threads rather than failing outright; the
            // barrier and the shutdown count must not wait for a thread
            // that never existed.
            log::warn!("failed to spawn worker thread {}: {}", i, error);
            if kind == WorkerKind::General {
                shared.num_workers.fetch_sub(1, Ordering::SeqCst);
            }
            shared.ready.worker_ready();
            shared.shutdown.worker_has_shut_down();
        }
    }

    shared.ready.wait_ready();

    Scheduler { shared }
}

struct Worker {
    shared: Arc<Shared>,
    kind: WorkerKind,
    index: u32,
}

impl Worker {
    fn run(&self) {
        let shared = &self.shared;

        if let Some(handler) = &shared.handlers.start {
            handler.run(self.index);
        }

        shared.ready.worker_ready();

        // wait_pop re-checks the exit flag and the queue predicate on every
        // wakeup, and applies this worker's filter.
        while let Some(task) = shared.queue.wait_pop(self.kind) {
            task.execute(shared);
        }

        // Shutdown phase.

        if let Some(handler) = &shared.handlers.exit {
            handler.run(self.index);
        }

        shared.shutdown.worker_has_shut_down();
    }
}

pub(crate) struct SchedulerHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}
