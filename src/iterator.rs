//! Parallel processing of a generic sequence.
//!
//! Same chunking model as the range engine, but driven by a caller
//! supplied iterator instead of indices. The iterator is advanced under a
//! spinlock (it mutates shared cursor state), so this is the right tool
//! for sequences that can't be indexed, like linked lists and pool walks,
//! and the wrong tool when a plain index range would do.

use crate::core::scheduler::Scheduler;
use crate::core::sync::Mutex;
use crate::core::task::{Priority, RawPayload};
use crate::pool::{PoolMode, TaskPool};
use crate::range::{RangeFinalize, RangeReduce, ReduceWith, FinalizeWith};
use crate::util::{ExclusiveCheck, SpinLock};

pub struct IterBuilder<'s, I, Local, Red, Fin> {
    scheduler: &'s Scheduler,
    items: I,
    threading: bool,
    grain: Option<u32>,
    priority: Priority,
    local: Local,
    reduce: Red,
    finalize: Fin,
}

pub(crate) fn new_parallel_iterator<I: Iterator>(
    scheduler: &Scheduler,
    items: I,
) -> IterBuilder<'_, I, (), (), ()> {
    IterBuilder {
        scheduler,
        items,
        threading: true,
        grain: None,
        priority: Priority::High,
        local: (),
        reduce: (),
        finalize: (),
    }
}

impl<'s, I: Iterator, Local, Red, Fin> IterBuilder<'s, I, Local, Red, Fin> {
    #[inline]
    pub fn with_threading(mut self, threading: bool) -> Self {
        self.threading = threading;

        self
    }

    /// Number of items pulled from the iterator per lock acquisition.
    #[inline]
    pub fn with_grain(mut self, grain: u32) -> Self {
        self.grain = Some(grain.max(1));

        self
    }

    #[inline]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;

        self
    }

    #[inline]
    pub fn with_local<T: Clone + Send>(self, template: T) -> IterBuilder<'s, I, T, Red, Fin> {
        IterBuilder {
            scheduler: self.scheduler,
            items: self.items,
            threading: self.threading,
            grain: self.grain,
            priority: self.priority,
            local: template,
            reduce: self.reduce,
            finalize: self.finalize,
        }
    }

    #[inline]
    pub fn with_reduce<F>(self, reduce: F) -> IterBuilder<'s, I, Local, ReduceWith<F>, Fin>
    where
        F: Fn(&mut Local, Local),
    {
        IterBuilder {
            scheduler: self.scheduler,
            items: self.items,
            threading: self.threading,
            grain: self.grain,
            priority: self.priority,
            local: self.local,
            reduce: ReduceWith::new(reduce),
            finalize: self.finalize,
        }
    }

    #[inline]
    pub fn with_finalize<F>(self, finalize: F) -> IterBuilder<'s, I, Local, Red, FinalizeWith<F>>
    where
        F: Fn(&mut Local),
    {
        IterBuilder {
            scheduler: self.scheduler,
            items: self.items,
            threading: self.threading,
            grain: self.grain,
            priority: self.priority,
            local: self.local,
            reduce: self.reduce,
            finalize: FinalizeWith::new(finalize),
        }
    }

    /// Run the loop and return the merged local value. The body receives
    /// each item together with its position in the sequence.
    pub fn run<Body>(self, body: Body) -> Local
    where
        I: Send,
        I::Item: Send,
        Local: Clone + Send,
        Red: RangeReduce<Local>,
        Fin: RangeFinalize<Local>,
        Body: Fn(I::Item, u32, &mut Local) + Sync,
    {
        profiling::scope!("parallel_iterator");

        let IterBuilder {
            scheduler,
            items,
            threading,
            grain,
            priority,
            local: mut acc,
            reduce,
            finalize,
        } = self;

        let workers = scheduler.num_threads();
        let chunk = grain.unwrap_or(32 * (workers / 8).max(1)).max(1);

        if !threading || workers <= 1 {
            let mut index = 0u32;
            let mut any = false;
            for item in items {
                body(item, index, &mut acc);
                index += 1;
                any = true;
            }
            if any {
                finalize.apply(&mut acc);
            }
            return acc;
        }

        let state = IterState {
            source: SpinLock::new(Source { items, next_index: 0 }),
            check: ExclusiveCheck::with_tag("parallel_iterator"),
            chunk,
            template: &acc,
            body: &body,
            chunks: Mutex::new(Vec::new()),
        };

        let pool = TaskPool::new(scheduler, PoolMode::Suspended);
        for _ in 0..workers {
            let payload = unsafe {
                RawPayload::from_raw(
                    iterator_task::<I, Local, Body>,
                    discard_nothing,
                    &state as *const IterState<I, Local, Body> as *const (),
                )
            };
            pool.push_payload(priority, payload);
        }

        pool.work_and_wait();
        drop(pool);

        let chunks = std::mem::take(&mut *state.chunks.lock().unwrap());
        for mut chunk_local in chunks {
            finalize.apply(&mut chunk_local);
            reduce.apply(&mut acc, chunk_local);
        }

        acc
    }
}

struct Source<I> {
    items: I,
    next_index: u32,
}

// Pinned on the submitting thread's stack for the duration of `run`; see
// the range engine for the pointer discipline.
struct IterState<I, Local, Body> {
    source: SpinLock<Source<I>>,
    // Debug-validates that the spinlock really serializes the pulls.
    check: ExclusiveCheck<&'static str>,
    chunk: u32,
    template: *const Local,
    body: *const Body,
    chunks: Mutex<Vec<Local>>,
}

unsafe fn iterator_task<I, Local, Body>(data: *const ())
where
    I: Iterator + Send,
    I::Item: Send,
    Local: Clone + Send,
    Body: Fn(I::Item, u32, &mut Local) + Sync,
{
    let state = &*(data as *const IterState<I, Local, Body>);
    let template = &*state.template;
    let body = &*state.body;

    let mut local: Option<Local> = None;
    let mut buffer: Vec<(I::Item, u32)> = Vec::with_capacity(state.chunk as usize);

    loop {
        // Pull a batch of items while holding the lock, process them after
        // releasing it.
        {
            let mut source = state.source.lock();
            state.check.begin();
            for _ in 0..state.chunk {
                match source.items.next() {
                    Some(item) => {
                        buffer.push((item, source.next_index));
                        source.next_index += 1;
                    }
                    None => break,
                }
            }
            state.check.end();
        }

        if buffer.is_empty() {
            break;
        }

        let acc = local.get_or_insert_with(|| template.clone());
        for (item, index) in buffer.drain(..) {
            body(item, index, acc);
        }
    }

    if let Some(local) = local {
        state.chunks.lock().unwrap().push(local);
    }
}

unsafe fn discard_nothing(_data: *const ()) {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::collections::LinkedList;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn iterator_sum() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();

        for threading in [true, false] {
            let sum = scheduler
                .iter(0u64..100_000)
                .with_threading(threading)
                .with_local(0u64)
                .with_reduce(|into, chunk| *into += chunk)
                .run(|item, _index, acc| *acc += item);

            assert_eq!(sum, 100_000u64 * 99_999 / 2);
        }

        scheduler.shut_down().wait();
    }

    #[test]
    fn indices_match_sequence_order() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();

        let items: Vec<u32> = (0..10_000).map(|i| i * 3).collect();
        scheduler
            .iter(items.iter())
            .run(|item, index, _| {
                assert_eq!(*item, index * 3);
            });

        scheduler.shut_down().wait();
    }

    #[test]
    fn linked_list_walk() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();

        let mut list = LinkedList::new();
        for i in 0..5_000u32 {
            list.push_back(i);
        }

        let seen: Vec<AtomicBool> = (0..5_000).map(|_| AtomicBool::new(false)).collect();
        scheduler.iter(list.iter()).run(|item, _, _| {
            let prev = seen[*item as usize].swap(true, Ordering::SeqCst);
            assert!(!prev);
        });

        assert!(seen.iter().all(|s| s.load(Ordering::SeqCst)));

        scheduler.shut_down().wait();
    }

    #[test]
    fn empty_iterator() {
        let scheduler = Scheduler::builder().with_worker_threads(2).build();

        let out = scheduler
            .iter(std::iter::empty::<u32>())
            .with_local(7u32)
            .run(|_, _, _| panic!("nothing to process"));
        assert_eq!(out, 7);

        scheduler.shut_down().wait();
    }
}
