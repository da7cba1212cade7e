/// Startup and shutdown.
///
/// Both directions use the same shape: a mutex/condvar pair tracking a
/// count of worker threads. At startup the builder blocks until every
/// spawned worker has signaled ready, so that a pool created right after
/// `build()` can't race the scheduler's own construction. At shutdown,
/// workers check an atomic flag, and the handle waits for the count of
/// live workers to reach zero before draining the queue.

use crate::core::sync::{Ordering, AtomicBool, Mutex, Condvar, Arc};

use crate::core::Shared;

pub(crate) struct Ready {
    remaining: Mutex<u32>,
    cond: Condvar,
}

impl Ready {
    pub fn new(num_threads: u32) -> Self {
        Ready {
            remaining: Mutex::new(num_threads),
            cond: Condvar::new(),
        }
    }

    pub fn worker_ready(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    pub fn wait_ready(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.cond.wait(remaining).unwrap();
        }
    }
}

pub(crate) struct Shutdown {
    pub is_shutting_down: AtomicBool,
    pub shutdown_mutex: Mutex<u32>,
    pub shutdown_cond: Condvar,
}

impl Shutdown {
    pub fn new(num_threads: u32) -> Self {
        Shutdown {
            is_shutting_down: AtomicBool::new(false),
            shutdown_mutex: Mutex::new(num_threads),
            shutdown_cond: Condvar::new(),
        }
    }

    pub fn begin_shut_down(shared: Arc<Shared>) -> ShutdownHandle {
        shared.shutdown.is_shutting_down.store(true, Ordering::SeqCst);

        shared.queue.begin_exit();

        ShutdownHandle { shared }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn wait_shutdown(&self) {
        let mut num_workers = self.shutdown_mutex.lock().unwrap();
        while *num_workers > 0 {
            num_workers = self.shutdown_cond.wait(num_workers).unwrap();
        }
    }

    pub fn worker_has_shut_down(&self) {
        let mut num_workers = self.shutdown_mutex.lock().unwrap();
        *num_workers -= 1;
        if *num_workers == 0 {
            self.shutdown_cond.notify_all();
        }
    }
}

pub struct ShutdownHandle {
    pub(crate) shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Wait for every worker thread to terminate, then free any task that
    /// was still queued. Dropping an unexecuted task releases its captured
    /// data, so nothing leaks and every pool's pending count returns to
    /// zero.
    pub fn wait(self) {
        self.shared.shutdown.wait_shutdown();

        for task in self.shared.queue.drain() {
            task.discard(&self.shared);
        }
    }
}

#[test]
fn test_shutdown() {
    use std::sync::atomic::AtomicU32;
    use crate::Scheduler;
    static INITIALIZED_WORKERS: AtomicU32 = AtomicU32::new(0);
    static SHUTDOWN_WORKERS: AtomicU32 = AtomicU32::new(0);

    for _ in 0..20 {
        for num_threads in 2..8 {
            INITIALIZED_WORKERS.store(0, Ordering::SeqCst);
            SHUTDOWN_WORKERS.store(0, Ordering::SeqCst);

            let scheduler = Scheduler::builder()
                .with_worker_threads(num_threads)
                .with_start_handler(|_id| { INITIALIZED_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .with_exit_handler(|_id| { SHUTDOWN_WORKERS.fetch_add(1, Ordering::SeqCst); })
                .build();

            let handle = scheduler.shut_down();
            handle.wait();

            // The calling thread counts as one of the requested threads, so
            // num_threads - 1 dedicated workers are spawned.
            assert_eq!(INITIALIZED_WORKERS.load(Ordering::SeqCst), num_threads - 1);
            assert_eq!(SHUTDOWN_WORKERS.load(Ordering::SeqCst), num_threads - 1);
        }
    }
}
