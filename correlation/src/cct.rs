//! Calling-context tree collaborators
//!
//! The pipeline only needs a handful of operations from the CCT: insert a
//! child at a normalized ip, mark a node as retained, and add metric values.
//! They are expressed as traits so a profiler can plug in its own tree.
//! [`ContextTree`] and [`ThreadStackCapture`] are in-memory implementations
//! used by the `gpucorr` driver and the tests.

use crate::{lock, read, write};
use gpucorr_shared::{MetricId, MetricValue, ModuleId, NodeId, NormalizedIp, PlaceholderKind};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, RwLock};

/// Calling-context tree operations used by the pipeline
pub trait CallingContextTree: Send + Sync {
    fn root(&self) -> NodeId;

    /// Child of `parent` at `ip`, inserted if missing
    fn insert_child(&self, parent: NodeId, ip: NormalizedIp, is_leaf: bool) -> NodeId;

    /// Mark `node` as directly referenced by a trace record
    fn retain(&self, node: NodeId);

    /// Child with the lowest ip, if any
    fn first_child(&self, node: NodeId) -> Option<NodeId>;

    /// Ip the node was inserted at
    fn addr(&self, node: NodeId) -> Option<NormalizedIp>;
}

/// Destination of attributed metric values
pub trait MetricSink: Send + Sync {
    /// Accumulate `value` onto the node's metric
    fn attribute_metric(&self, node: NodeId, metric: MetricId, value: MetricValue);

    /// Overwrite the node's metric
    fn set_metric(&self, node: NodeId, metric: MetricId, value: MetricValue);
}

/// Captures the calling context of the current thread
pub trait ContextCapture: Send + Sync {
    /// Insert the current call path into `cct`, eliding frames from ignored
    /// modules, and return its deepest node
    fn capture(&self, cct: &dyn CallingContextTree, ignore: &ModuleIgnoreSet) -> NodeId;
}

static GLOBAL_IGNORE_SET: Lazy<ModuleIgnoreSet> = Lazy::new(ModuleIgnoreSet::new);

/// Load modules whose frames are elided from captured contexts (vendor
/// runtime internals)
#[derive(Debug, Default)]
pub struct ModuleIgnoreSet {
    modules: RwLock<HashSet<ModuleId>>,
}

impl ModuleIgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide set consulted by the engine
    pub fn global() -> &'static ModuleIgnoreSet {
        &GLOBAL_IGNORE_SET
    }

    /// Returns false if the module was already registered
    pub fn register(&self, module: ModuleId) -> bool {
        write(&self.modules).insert(module)
    }

    pub fn unregister(&self, module: ModuleId) -> bool {
        write(&self.modules).remove(&module)
    }

    pub fn contains(&self, module: ModuleId) -> bool {
        read(&self.modules).contains(&module)
    }

    pub fn len(&self) -> usize {
        read(&self.modules).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    ip: NormalizedIp,
    is_leaf: bool,
    retained: bool,
    children: BTreeMap<NormalizedIp, NodeId>,
    metrics: BTreeMap<MetricId, MetricValue>,
}

impl Node {
    fn new(parent: Option<NodeId>, ip: NormalizedIp, is_leaf: bool) -> Self {
        Self {
            parent,
            ip,
            is_leaf,
            retained: false,
            children: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }
}

/// Arena-backed calling-context tree with per-node metric vectors
#[derive(Debug)]
pub struct ContextTree {
    nodes: Mutex<Vec<Node>>,
}

impl ContextTree {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(vec![Node::new(None, NormalizedIp::NULL, false)]),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.nodes).len()
    }

    pub fn is_empty(&self) -> bool {
        // The root always exists
        false
    }

    /// Existing child of `parent` at `ip`
    pub fn child(&self, parent: NodeId, ip: NormalizedIp) -> Option<NodeId> {
        lock(&self.nodes)
            .get(parent.0 as usize)
            .and_then(|n| n.children.get(&ip).copied())
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        lock(&self.nodes).get(node.0 as usize).and_then(|n| n.parent)
    }

    /// Ips from the root's child down to `node`
    pub fn path(&self, node: NodeId) -> Vec<NormalizedIp> {
        let nodes = lock(&self.nodes);
        let mut path = Vec::new();
        let mut cur = nodes.get(node.0 as usize);
        while let Some(n) = cur {
            let Some(parent) = n.parent else { break };
            path.push(n.ip);
            cur = nodes.get(parent.0 as usize);
        }
        path.reverse();
        path
    }

    pub fn is_retained(&self, node: NodeId) -> bool {
        lock(&self.nodes)
            .get(node.0 as usize)
            .map(|n| n.retained)
            .unwrap_or(false)
    }

    pub fn metric(&self, node: NodeId, metric: MetricId) -> Option<MetricValue> {
        lock(&self.nodes)
            .get(node.0 as usize)
            .and_then(|n| n.metrics.get(&metric).copied())
    }

    pub fn metrics(&self, node: NodeId) -> Vec<(MetricId, MetricValue)> {
        lock(&self.nodes)
            .get(node.0 as usize)
            .map(|n| n.metrics.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default()
    }

    /// Sum of one metric over every node
    pub fn total(&self, metric: MetricId) -> Option<MetricValue> {
        lock(&self.nodes)
            .iter()
            .filter_map(|n| n.metrics.get(&metric).copied())
            .reduce(|mut acc, v| {
                acc += v;
                acc
            })
    }

    /// Serializable copy of every node that carries metrics or is retained
    pub fn snapshot(&self) -> CctSnapshot {
        let nodes = lock(&self.nodes);
        let mut out = Vec::new();
        for (idx, n) in nodes.iter().enumerate() {
            if n.metrics.is_empty() && !n.retained {
                continue;
            }
            let mut path = Vec::new();
            let mut cur = Some(n);
            while let Some(c) = cur {
                let Some(parent) = c.parent else { break };
                path.push(match PlaceholderKind::from_ip(c.ip) {
                    Some(kind) => format!("<{}>", kind),
                    None => c.ip.to_string(),
                });
                cur = nodes.get(parent.0 as usize);
            }
            path.reverse();

            out.push(NodeSnapshot {
                id: idx as u32,
                parent: n.parent.map(|p| p.0),
                path,
                is_leaf: n.is_leaf,
                retained: n.retained,
                metrics: n.metrics.iter().map(|(k, v)| (k.name(), *v)).collect(),
            });
        }
        CctSnapshot {
            total_nodes: nodes.len(),
            nodes: out,
        }
    }
}

impl Default for ContextTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CallingContextTree for ContextTree {
    fn root(&self) -> NodeId {
        NodeId(0)
    }

    fn insert_child(&self, parent: NodeId, ip: NormalizedIp, is_leaf: bool) -> NodeId {
        let mut nodes = lock(&self.nodes);
        let parent = if (parent.0 as usize) < nodes.len() {
            parent
        } else {
            tracing::debug!(parent = parent.0, "insert under unknown node, using root");
            NodeId(0)
        };
        if let Some(&child) = nodes[parent.0 as usize].children.get(&ip) {
            return child;
        }
        let child = NodeId(nodes.len() as u32);
        nodes.push(Node::new(Some(parent), ip, is_leaf));
        nodes[parent.0 as usize].children.insert(ip, child);
        child
    }

    fn retain(&self, node: NodeId) {
        if let Some(n) = lock(&self.nodes).get_mut(node.0 as usize) {
            n.retained = true;
        }
    }

    fn first_child(&self, node: NodeId) -> Option<NodeId> {
        lock(&self.nodes)
            .get(node.0 as usize)
            .and_then(|n| n.children.values().next().copied())
    }

    fn addr(&self, node: NodeId) -> Option<NormalizedIp> {
        lock(&self.nodes).get(node.0 as usize).map(|n| n.ip)
    }
}

impl MetricSink for ContextTree {
    fn attribute_metric(&self, node: NodeId, metric: MetricId, value: MetricValue) {
        if let Some(n) = lock(&self.nodes).get_mut(node.0 as usize) {
            n.metrics
                .entry(metric)
                .and_modify(|v| *v += value)
                .or_insert(value);
        }
    }

    fn set_metric(&self, node: NodeId, metric: MetricId, value: MetricValue) {
        if let Some(n) = lock(&self.nodes).get_mut(node.0 as usize) {
            n.metrics.insert(metric, value);
        }
    }
}

/// One node of a [`CctSnapshot`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: u32,
    pub parent: Option<u32>,
    pub path: Vec<String>,
    pub is_leaf: bool,
    pub retained: bool,
    pub metrics: BTreeMap<String, MetricValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CctSnapshot {
    pub total_nodes: usize,
    pub nodes: Vec<NodeSnapshot>,
}

thread_local! {
    static FRAMES: RefCell<Vec<NormalizedIp>> = const { RefCell::new(Vec::new()) };
}

/// Context capture over an explicit per-thread frame stack.
///
/// Callers bracket their "functions" with [`ThreadStackCapture::enter`]; the
/// captured context is the current stack minus frames from ignored modules and
/// from the reserved placeholder module.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadStackCapture;

impl ThreadStackCapture {
    pub fn new() -> Self {
        Self
    }

    /// Push a frame; it is popped when the guard drops
    #[must_use = "the frame is popped when the guard is dropped"]
    pub fn enter(ip: NormalizedIp) -> FrameGuard {
        FRAMES.with(|f| f.borrow_mut().push(ip));
        FrameGuard { _private: () }
    }

    pub fn depth() -> usize {
        FRAMES.with(|f| f.borrow().len())
    }
}

impl ContextCapture for ThreadStackCapture {
    fn capture(&self, cct: &dyn CallingContextTree, ignore: &ModuleIgnoreSet) -> NodeId {
        FRAMES.with(|f| {
            let frames = f.borrow();
            let kept: Vec<_> = frames
                .iter()
                .filter(|ip| ip.module != ModuleId::PLACEHOLDER && !ignore.contains(ip.module))
                .collect();
            let last = kept.len().saturating_sub(1);
            kept.iter()
                .enumerate()
                .fold(cct.root(), |parent, (i, ip)| cct.insert_child(parent, **ip, i == last))
        })
    }
}

/// Pops its frame from the thread's capture stack on drop
#[derive(Debug)]
pub struct FrameGuard {
    _private: (),
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let _ = FRAMES.try_with(|f| f.borrow_mut().pop());
    }
}
