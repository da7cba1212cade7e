//! A multithreaded task scheduler with pools, parallel ranges and task
//! graphs.
//!
//! What we want:
//! - No implicit global thread pool; the scheduler is an explicit object
//!   with an explicit lifetime.
//! - Grouping tasks into pools that can be waited on and canceled
//!   independently, without one pool's wait getting stuck behind another
//!   pool's work.
//! - Background work guaranteed a thread distinct from the submitter, even
//!   on a single-slot scheduler.
//! - Parallel loops with per-worker local state and a sequential reduction
//!   step, that degrade to a plain loop when the workload is too small to
//!   be worth dispatching.
//! - A way for long single-threaded stretches to escalate to multiple
//!   threads after the fact (lazy threading hints).
//! - No need to scale to a very large number of threads; this targets the
//!   handful of cores a workstation has.

mod core;
mod graph;
mod iterator;
mod lockfree_list;
mod pool;
mod range;
pub mod lazy_threading;
pub mod util;

pub use crate::core::task::Priority;
pub use crate::core::scheduler::{Scheduler, SchedulerBuilder, SchedulerId};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::WorkerHook;
pub use crate::core::sync;
pub use graph::{NodeId, TaskGraph};
pub use iterator::IterBuilder;
pub use lockfree_list::LockFreeList;
pub use pool::{PoolId, PoolMode, TaskCtx, TaskPool};
pub use range::{FinalizeWith, RangeBuilder, RangeFinalize, RangeReduce, ReduceWith, Schedule};
pub use lazy_threading::{isolate, send_hint, HintReceiver, ReceiverIsolation};

pub use crossbeam_utils::CachePadded;
