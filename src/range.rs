use std::cell::Cell;
use std::ops::Range;

use crossbeam_utils::CachePadded;

use crate::core::scheduler::Scheduler;
use crate::core::sync::{Mutex, Ordering, AtomicU32};
use crate::core::task::{Priority, RawPayload};
use crate::lazy_threading::HintReceiver;
use crate::pool::{PoolMode, TaskPool};

/// How the range is carved into tasks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Workers claim the next unclaimed chunk through a shared atomic
    /// cursor. The default; balances uneven per-item cost.
    Dynamic,
    /// The range is pre-split into contiguous, evenly sized sub-ranges,
    /// one per task.
    Static,
}

/// Merges one worker-local buffer into another. The unit implementation is
/// the "no reduction" placeholder.
pub trait RangeReduce<Local> {
    fn apply(&self, into: &mut Local, chunk: Local);
}

impl<Local> RangeReduce<Local> for () {
    fn apply(&self, _into: &mut Local, _chunk: Local) {}
}

pub struct ReduceWith<F>(F);

impl<F> ReduceWith<F> {
    pub(crate) fn new(f: F) -> Self {
        ReduceWith(f)
    }
}

impl<Local, F: Fn(&mut Local, Local)> RangeReduce<Local> for ReduceWith<F> {
    fn apply(&self, into: &mut Local, chunk: Local) {
        (self.0)(into, chunk)
    }
}

/// Drains one worker-local buffer after its items are done. Runs once per
/// buffer that processed at least one item, never concurrently.
pub trait RangeFinalize<Local> {
    fn apply(&self, chunk: &mut Local);
}

impl<Local> RangeFinalize<Local> for () {
    fn apply(&self, _chunk: &mut Local) {}
}

pub struct FinalizeWith<F>(F);

impl<F> FinalizeWith<F> {
    pub(crate) fn new(f: F) -> Self {
        FinalizeWith(f)
    }
}

impl<Local, F: Fn(&mut Local)> RangeFinalize<Local> for FinalizeWith<F> {
    fn apply(&self, chunk: &mut Local) {
        (self.0)(chunk)
    }
}

/// A builder for parallel loops over an index range.
///
/// The range is split into chunks distributed over the scheduler's
/// workers; the submitting thread participates in the work while it
/// waits. An optional per-worker local value (seeded by cloning the
/// template before any item runs) can accumulate partial results, which a
/// reduction step merges back sequentially at the end.
pub struct RangeBuilder<'s, Local, Red, Fin> {
    scheduler: &'s Scheduler,
    range: Range<u32>,
    threading: bool,
    grain: Option<u32>,
    schedule: Schedule,
    priority: Priority,
    local: Local,
    reduce: Red,
    finalize: Fin,
}

pub(crate) fn new_parallel_range(scheduler: &Scheduler, range: Range<u32>) -> RangeBuilder<'_, (), (), ()> {
    RangeBuilder {
        scheduler,
        range,
        threading: true,
        grain: None,
        schedule: Schedule::Dynamic,
        priority: Priority::High,
        local: (),
        reduce: (),
        finalize: (),
    }
}

impl<'s, Local, Red, Fin> RangeBuilder<'s, Local, Red, Fin> {
    /// Escape hatch: `false` forces everything to run on the calling
    /// thread, in one chunk, with no task overhead.
    #[inline]
    pub fn with_threading(mut self, threading: bool) -> Self {
        self.threading = threading;

        self
    }

    /// Pin the number of iterations below which a chunk is not split
    /// further. Overrides the built-in heuristic.
    #[inline]
    pub fn with_grain(mut self, grain: u32) -> Self {
        self.grain = Some(grain.max(1));

        self
    }

    #[inline]
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;

        self
    }

    /// Specify the priority of this workload.
    #[inline]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;

        self
    }

    /// Provide a per-worker local value. Every worker task receives a
    /// clone of `template`, made in full before its first item runs.
    #[inline]
    pub fn with_local<T: Clone + Send>(self, template: T) -> RangeBuilder<'s, T, Red, Fin> {
        RangeBuilder {
            scheduler: self.scheduler,
            range: self.range,
            threading: self.threading,
            grain: self.grain,
            schedule: self.schedule,
            priority: self.priority,
            local: template,
            reduce: self.reduce,
            finalize: self.finalize,
        }
    }

    /// Merge one worker-local value into another. Called sequentially on
    /// the submitting thread once the loop is done, exactly once per
    /// worker-local buffer.
    #[inline]
    pub fn with_reduce<F>(self, reduce: F) -> RangeBuilder<'s, Local, ReduceWith<F>, Fin>
    where
        F: Fn(&mut Local, Local),
    {
        RangeBuilder {
            scheduler: self.scheduler,
            range: self.range,
            threading: self.threading,
            grain: self.grain,
            schedule: self.schedule,
            priority: self.priority,
            local: self.local,
            reduce: ReduceWith(reduce),
            finalize: self.finalize,
        }
    }

    /// Drain a worker-local buffer after its last item. Runs sequentially
    /// on the submitting thread, before the buffer is merged.
    #[inline]
    pub fn with_finalize<F>(self, finalize: F) -> RangeBuilder<'s, Local, Red, FinalizeWith<F>>
    where
        F: Fn(&mut Local),
    {
        RangeBuilder {
            scheduler: self.scheduler,
            range: self.range,
            threading: self.threading,
            grain: self.grain,
            schedule: self.schedule,
            priority: self.priority,
            local: self.local,
            reduce: self.reduce,
            finalize: FinalizeWith(finalize),
        }
    }

    /// Run the loop and return the merged local value.
    ///
    /// Caller-supplied functions must not panic across this boundary; any
    /// error state belongs in the data the closures capture, checked after
    /// the call returns.
    pub fn run<Body>(self, body: Body) -> Local
    where
        Local: Clone + Send,
        Red: RangeReduce<Local>,
        Fin: RangeFinalize<Local>,
        Body: Fn(u32, &mut Local) + Sync,
    {
        profiling::scope!("parallel_range");

        let RangeBuilder {
            scheduler,
            range,
            threading,
            grain,
            schedule,
            priority,
            local: mut acc,
            reduce,
            finalize,
        } = self;

        if range.end <= range.start {
            return acc;
        }
        let len = range.end - range.start;

        let workers = scheduler.num_threads();
        // Chunks get bigger as workers are added, to offset the per-task
        // dispatch overhead.
        let chunk = grain.unwrap_or(32 * (workers / 8).max(1)).max(1);

        if !threading || workers <= 1 {
            for i in range {
                body(i, &mut acc);
            }
            finalize.apply(&mut acc);
            return acc;
        }

        if len < chunk * 2 {
            // Not worth dispatching: one inline pass, but leave an
            // escalation hatch open (see below).
            return run_collapsed(scheduler, priority, range, chunk, acc, &body, &reduce, &finalize);
        }

        let chunks = dispatch(scheduler, priority, schedule, range, chunk, &acc, &body);
        for mut chunk_local in chunks {
            finalize.apply(&mut chunk_local);
            reduce.apply(&mut acc, chunk_local);
        }

        acc
    }
}

/// Single inline pass over a small range. If an item announces through
/// `lazy_threading::send_hint` that it is going to take a while, the
/// remaining items are handed over to worker tasks after all.
fn run_collapsed<Local, Body, Red, Fin>(
    scheduler: &Scheduler,
    priority: Priority,
    range: Range<u32>,
    chunk: u32,
    mut acc: Local,
    body: &Body,
    reduce: &Red,
    finalize: &Fin,
) -> Local
where
    Local: Clone + Send,
    Red: RangeReduce<Local>,
    Fin: RangeFinalize<Local>,
    Body: Fn(u32, &mut Local) + Sync,
{
    // Worker clones must be seeded from the untouched template, not from
    // the partially accumulated inline state.
    let pristine = acc.clone();

    let escalated = Cell::new(false);
    let mut next = range.start;
    {
        let mut on_hint = || escalated.set(true);
        let _receiver = HintReceiver::new(&mut on_hint);

        while next < range.end {
            body(next, &mut acc);
            next += 1;
            if escalated.get() {
                break;
            }
        }
    }

    if next < range.end {
        profiling::scope!("range escalation");
        let chunks = dispatch(
            scheduler,
            priority,
            Schedule::Dynamic,
            next..range.end,
            chunk,
            &pristine,
            body,
        );
        for mut chunk_local in chunks {
            finalize.apply(&mut chunk_local);
            reduce.apply(&mut acc, chunk_local);
        }
    }

    finalize.apply(&mut acc);

    acc
}

// The state shared by every worker task of one dispatch, pinned on the
// submitting thread's stack. The raw pointers are sound because
// `dispatch` drains its pool before returning, so no task outlives the
// frame that owns the pointees.
struct RangeState<Local, Body> {
    cursor: CachePadded<AtomicU32>,
    end: u32,
    chunk: u32,
    template: *const Local,
    body: *const Body,
    // Each finished worker task parks its local value here for the
    // sequential merge phase.
    chunks: Mutex<Vec<Local>>,
}

fn dispatch<Local, Body>(
    scheduler: &Scheduler,
    priority: Priority,
    schedule: Schedule,
    range: Range<u32>,
    chunk: u32,
    template: &Local,
    body: &Body,
) -> Vec<Local>
where
    Local: Clone + Send,
    Body: Fn(u32, &mut Local) + Sync,
{
    let len = range.end - range.start;
    let num_tasks = div_ceil(len, chunk).min(scheduler.num_threads()).max(1);

    let state = RangeState {
        cursor: CachePadded::new(AtomicU32::new(range.start)),
        end: range.end,
        chunk,
        template,
        body,
        chunks: Mutex::new(Vec::new()),
    };

    // A suspended pool keeps the bulk submission below off the shared
    // queue until we start waiting.
    let pool = TaskPool::new(scheduler, PoolMode::Suspended);

    match schedule {
        Schedule::Dynamic => {
            for _ in 0..num_tasks {
                let payload = unsafe {
                    RawPayload::from_raw(
                        dynamic_range_task::<Local, Body>,
                        discard_nothing,
                        &state as *const RangeState<Local, Body> as *const (),
                    )
                };
                pool.push_payload(priority, payload);
            }
        }
        Schedule::Static => {
            let per_task = div_ceil(len, num_tasks);
            let mut start = range.start;
            while start < range.end {
                let end = (start + per_task).min(range.end);
                let task = Box::new(StaticRangeTask {
                    state: &state as *const RangeState<Local, Body>,
                    range: start..end,
                });
                let payload = unsafe {
                    RawPayload::from_raw(
                        static_range_task::<Local, Body>,
                        discard_boxed::<StaticRangeTask<Local, Body>>,
                        Box::into_raw(task) as *const (),
                    )
                };
                pool.push_payload(priority, payload);
                start = end;
            }
        }
    }

    pool.work_and_wait();
    drop(pool);

    let chunks = std::mem::take(&mut *state.chunks.lock().unwrap());
    chunks
}

unsafe fn dynamic_range_task<Local, Body>(data: *const ())
where
    Local: Clone + Send,
    Body: Fn(u32, &mut Local) + Sync,
{
    let state = &*(data as *const RangeState<Local, Body>);
    let template = &*state.template;
    let body = &*state.body;

    let mut local: Option<Local> = None;
    loop {
        let start = state.cursor.fetch_add(state.chunk, Ordering::Relaxed);
        if start >= state.end {
            break;
        }
        let end = (start + state.chunk).min(state.end);

        // The full clone happens before the first item of the first chunk.
        let acc = local.get_or_insert_with(|| template.clone());
        for i in start..end {
            body(i, acc);
        }
    }

    if let Some(local) = local {
        state.chunks.lock().unwrap().push(local);
    }
}

struct StaticRangeTask<Local, Body> {
    state: *const RangeState<Local, Body>,
    range: Range<u32>,
}

unsafe fn static_range_task<Local, Body>(data: *const ())
where
    Local: Clone + Send,
    Body: Fn(u32, &mut Local) + Sync,
{
    let task = Box::from_raw(data as *mut StaticRangeTask<Local, Body>);
    let state = &*task.state;
    let template = &*state.template;
    let body = &*state.body;

    if task.range.start >= task.range.end {
        return;
    }

    let mut acc = template.clone();
    for i in task.range.clone() {
        body(i, &mut acc);
    }

    state.chunks.lock().unwrap().push(acc);
}

unsafe fn discard_nothing(_data: *const ()) {}

unsafe fn discard_boxed<T>(data: *const ()) {
    drop(Box::from_raw(data as *mut T));
}

fn div_ceil(a: u32, b: u32) -> u32 {
    let d = a / b;
    let r = a % b;
    if r > 0 && b > 0 { d + 1 } else { d }
}
