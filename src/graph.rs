//! A dependency graph of tasks.
//!
//! Nodes are created up front and wired with explicit edges; running a
//! node triggers every successor when it completes. Several independent
//! trees can share one graph and be triggered and waited on together.
//!
//! Two deliberate properties, which callers rely on:
//!
//! - Fan-in is **not** deduplicated. A node with several parents runs once
//!   per parent that triggers it. Re-triggering a sub-tree re-runs it.
//! - There is no cycle detection. A graph with a cycle executes forever;
//!   building one is a caller bug that this module does not guard against.

use crate::core::scheduler::Scheduler;
use crate::core::sync::Arc;
use crate::core::task::Priority;
use crate::pool::{PoolMode, TaskPool};

/// A non-owning handle to a node. The graph owns the node itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

struct Node {
    run: Box<dyn Fn() + Send + Sync>,
    // Runs exactly once when the graph is destroyed. When several nodes
    // share their captured data, register a teardown on only one of them.
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
    successors: Vec<NodeId>,
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

struct GraphCore {
    nodes: Vec<Node>,
    pool: TaskPool<()>,
    // Global policy, decided once from the worker count: either nodes are
    // submitted to the pool, or they execute by direct recursion on the
    // triggering thread.
    threaded: bool,
}

/// A DAG of task nodes with explicit edges.
pub struct TaskGraph {
    core: Arc<GraphCore>,
}

impl TaskGraph {
    pub fn new(scheduler: &Scheduler) -> TaskGraph {
        TaskGraph {
            core: Arc::new(GraphCore {
                nodes: Vec::new(),
                pool: TaskPool::new(scheduler, PoolMode::Normal),
                threaded: scheduler.num_threads() > 1,
            }),
        }
    }

    /// Add a node. The closure may run once per incoming trigger, possibly
    /// concurrently with other nodes; shared mutable state belongs behind
    /// a lock in its captures.
    pub fn add_node<F>(&mut self, run: F) -> NodeId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let core = self.core_mut();
        core.nodes.push(Node {
            run: Box::new(run),
            teardown: None,
            successors: Vec::new(),
        });

        NodeId(core.nodes.len() as u32 - 1)
    }

    /// Register a hook that runs exactly once when the graph is dropped.
    pub fn set_teardown<F>(&mut self, node: NodeId, teardown: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        let core = self.core_mut();
        let node = &mut core.nodes[node.0 as usize];
        debug_assert!(node.teardown.is_none());
        node.teardown = Some(Box::new(teardown));
    }

    /// Record `to` as a successor of `from`. No cycle check is performed.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        let core = self.core_mut();
        assert!((to.0 as usize) < core.nodes.len());
        core.nodes[from.0 as usize].successors.push(to);
    }

    /// Trigger execution starting at `node`, which can be any node rather
    /// than a root. This allows re-running a sub-tree on its own.
    pub fn push_work(&self, node: NodeId) {
        assert!((node.0 as usize) < self.core.nodes.len());
        trigger(&self.core, node);
    }

    /// Block until every execution chain triggered so far has completed,
    /// across all trees of the graph.
    pub fn work_and_wait(&self) {
        self.core.pool.work_and_wait();
    }

    fn core_mut(&mut self) -> &mut GraphCore {
        // Mutation is only allowed while no execution is in flight; any
        // running node holds a reference to the core.
        Arc::get_mut(&mut self.core).expect("graph is executing")
    }
}

fn trigger(core: &Arc<GraphCore>, id: NodeId) {
    if core.threaded {
        let task_core = Arc::clone(core);
        core.pool.push(Priority::High, move |_| {
            run_node(&task_core, id);
        });
    } else {
        run_node(core, id);
    }
}

fn run_node(core: &Arc<GraphCore>, id: NodeId) {
    profiling::scope!("graph node");

    let node = &core.nodes[id.0 as usize];
    (node.run)();

    for &successor in &node.successors {
        trigger(core, successor);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // A linear chain: +1, *2, -1, ^2, +1.
    fn build_chain(graph: &mut TaskGraph, data: &Arc<Mutex<i64>>) -> [NodeId; 5] {
        let d = data.clone();
        let node_a = graph.add_node(move || {
            let mut v = d.lock().unwrap();
            *v += 1;
        });
        let d = data.clone();
        let node_b = graph.add_node(move || {
            let mut v = d.lock().unwrap();
            *v *= 2;
        });
        let d = data.clone();
        let node_c = graph.add_node(move || {
            let mut v = d.lock().unwrap();
            *v -= 1;
        });
        let d = data.clone();
        let node_d = graph.add_node(move || {
            let mut v = d.lock().unwrap();
            *v *= *v;
        });
        let d = data.clone();
        let node_e = graph.add_node(move || {
            let mut v = d.lock().unwrap();
            *v += 1;
        });

        graph.add_edge(node_a, node_b);
        graph.add_edge(node_b, node_c);
        graph.add_edge(node_c, node_d);
        graph.add_edge(node_d, node_e);

        [node_a, node_b, node_c, node_d, node_e]
    }

    #[test]
    fn sequential_chain() {
        for num_threads in [1u32, 4] {
            let scheduler = Scheduler::builder().with_worker_threads(num_threads).build();

            let data = Arc::new(Mutex::new(0i64));
            let mut graph = TaskGraph::new(&scheduler);
            let nodes = build_chain(&mut graph, &data);

            graph.push_work(nodes[0]);
            graph.work_and_wait();

            // ((0 + 1) * 2 - 1)^2 + 1
            assert_eq!(*data.lock().unwrap(), 2);

            drop(graph);
            scheduler.shut_down().wait();
        }
    }

    #[test]
    fn start_mid_chain() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();

        let data = Arc::new(Mutex::new(0i64));
        let mut graph = TaskGraph::new(&scheduler);
        let nodes = build_chain(&mut graph, &data);

        // Restart a sub-tree: only the tail of the chain runs.
        *data.lock().unwrap() = 4;
        graph.push_work(nodes[2]);
        graph.work_and_wait();

        // (4 - 1)^2 + 1
        assert_eq!(*data.lock().unwrap(), 10);

        drop(graph);
        scheduler.shut_down().wait();
    }

    struct SplitData {
        value: i64,
        store: i64,
    }

    // One parent feeding two children. The children touch different
    // fields, so the result is deterministic even though they may run
    // concurrently.
    fn build_split(graph: &mut TaskGraph, data: &Arc<Mutex<SplitData>>) -> NodeId {
        let d = data.clone();
        let store_value = graph.add_node(move || {
            let mut data = d.lock().unwrap();
            data.store = data.value;
        });
        let d = data.clone();
        let increase_value = graph.add_node(move || {
            let mut data = d.lock().unwrap();
            data.value += 2;
        });
        let d = data.clone();
        let double_store = graph.add_node(move || {
            let mut data = d.lock().unwrap();
            data.store = (data.store + 1) * 2;
        });

        graph.add_edge(store_value, increase_value);
        graph.add_edge(store_value, double_store);

        store_value
    }

    #[test]
    fn fan_out() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();

        let data = Arc::new(Mutex::new(SplitData { value: 1, store: 0 }));
        let mut graph = TaskGraph::new(&scheduler);
        let root = build_split(&mut graph, &data);

        graph.push_work(root);
        graph.work_and_wait();

        let data = data.lock().unwrap();
        assert_eq!(data.value, 3);
        assert_eq!(data.store, 4);

        drop(data);
        drop(graph);
        scheduler.shut_down().wait();
    }

    #[test]
    fn forest() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();

        // Two independent trees share the graph; triggered together and
        // waited on jointly, each must produce its result untouched by the
        // other.
        let data_1 = Arc::new(Mutex::new(SplitData { value: 1, store: 0 }));
        let data_2 = Arc::new(Mutex::new(SplitData { value: 3, store: 0 }));
        let mut graph = TaskGraph::new(&scheduler);
        let root_1 = build_split(&mut graph, &data_1);
        let root_2 = build_split(&mut graph, &data_2);

        graph.push_work(root_1);
        graph.push_work(root_2);
        graph.work_and_wait();

        {
            let data = data_1.lock().unwrap();
            assert_eq!((data.value, data.store), (3, 4));
        }
        {
            let data = data_2.lock().unwrap();
            assert_eq!((data.value, data.store), (5, 8));
        }

        drop(graph);
        scheduler.shut_down().wait();
    }

    #[test]
    fn fan_in_runs_once_per_trigger() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();

        let count = Arc::new(Mutex::new(0));
        let mut graph = TaskGraph::new(&scheduler);

        let parent_1 = graph.add_node(|| {});
        let parent_2 = graph.add_node(|| {});
        let c = count.clone();
        let child = graph.add_node(move || {
            *c.lock().unwrap() += 1;
        });

        graph.add_edge(parent_1, child);
        graph.add_edge(parent_2, child);

        graph.push_work(parent_1);
        graph.push_work(parent_2);
        graph.work_and_wait();

        // Fan-in is not deduplicated: one run per parent edge.
        assert_eq!(*count.lock().unwrap(), 2);

        drop(graph);
        scheduler.shut_down().wait();
    }

    #[test]
    fn shared_data_teardown_runs_once() {
        let scheduler = Scheduler::builder().with_worker_threads(4).build();

        let data = Arc::new(Mutex::new(0i64));
        let mut graph = TaskGraph::new(&scheduler);

        let d = data.clone();
        let node_a = graph.add_node(move || {
            *d.lock().unwrap() += 10;
        });
        let d = data.clone();
        let node_b = graph.add_node(move || {
            *d.lock().unwrap() += 100;
        });
        graph.add_edge(node_a, node_b);

        // Both nodes share `data`; the teardown is registered on only one
        // of them so it fires once.
        let d = data.clone();
        graph.set_teardown(node_a, move || {
            *d.lock().unwrap() += 1;
        });

        graph.push_work(node_a);
        graph.work_and_wait();
        assert_eq!(*data.lock().unwrap(), 110);

        drop(graph);
        assert_eq!(*data.lock().unwrap(), 111);

        scheduler.shut_down().wait();
    }
}
