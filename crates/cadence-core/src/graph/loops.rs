//! Loop analyzer: strongly connected components of the input-edge graph.
//!
//! For a root node, every cycle reachable through input edges becomes a
//! [`LoopUnit`]: one strongly connected component, its members in intra-loop
//! evaluation order, and the direction time must be stepped in. Everything
//! else stays an ordinary node for the planner to schedule in parallel.
//!
//! # Algorithm
//!
//! 1. Enumerate nodes reachable from the root (depth-first post-order).
//! 2. Run Tarjan's algorithm, iteratively, over the edges node → input.
//!    Under [`PairingPolicy::SkipDuringDiscovery`] the input edges of
//!    [`Group::Pair`](super::Group::Pair) nodes are left out.
//! 3. Components with more than one member, or a self-edge, become loops,
//!    numbered in completion order.
//! 4. Intra-loop order is a post-order over in-loop edges that does not
//!    follow the inputs of delay members; the delay reads an earlier (or
//!    later) step, so that edge imposes no order within a step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{GraphError, Result};

use super::network::{Group, Network, PairingPolicy};
use super::node::NodeId;

/// Order in which a sequential segment visits time steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepDirection {
    /// `t = 0, 1, .., T-1`.
    Forward,
    /// `t = T-1, .., 1, 0`.
    Backward,
}

impl StepDirection {
    /// Returns the opposite direction.
    pub fn reversed(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }

    /// Returns `+1` or `-1`.
    pub fn sign(self) -> i32 {
        match self {
            Self::Forward => 1,
            Self::Backward => -1,
        }
    }

    /// Returns the steps `0..steps` in this direction.
    pub fn steps(self, steps: usize) -> impl Iterator<Item = usize> {
        let forward = self == Self::Forward;
        (0..steps).map(move |i| if forward { i } else { steps - 1 - i })
    }
}

/// Identifier of a loop unit within one [`LoopAnalysis`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub usize);

impl core::fmt::Display for LoopId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "loop {}", self.0)
    }
}

/// A recurrent cluster of nodes evaluated step by step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopUnit {
    /// Discovery-order identifier.
    pub id: LoopId,
    /// Members in intra-loop evaluation order.
    pub members: Vec<NodeId>,
    /// First delay member in evaluation order.
    pub source: NodeId,
    /// Step order during forward propagation.
    pub direction: StepDirection,
}

/// Loop decomposition of the graph reachable from one root.
#[derive(Debug, Clone)]
pub struct LoopAnalysis {
    pub(crate) root: NodeId,
    pub(crate) epoch: u64,
    loops: Vec<LoopUnit>,
    membership: HashMap<NodeId, LoopId>,
}

impl LoopAnalysis {
    /// Returns the root this analysis was computed for.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Returns the loop units in discovery order.
    pub fn loops(&self) -> &[LoopUnit] {
        &self.loops
    }

    /// Returns the loop containing `node`, if any.
    pub fn loop_of(&self, node: NodeId) -> Option<&LoopUnit> {
        self.membership.get(&node).map(|id| &self.loops[id.0])
    }

    /// Returns `true` if `a` and `b` belong to the same loop.
    pub fn same_loop(&self, a: NodeId, b: NodeId) -> bool {
        match (self.membership.get(&a), self.membership.get(&b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }
}

impl Network {
    /// Returns the loop decomposition for `root`, computing it if the cached
    /// one is missing or stale.
    pub fn loop_analysis(&mut self, root: NodeId) -> Result<Arc<LoopAnalysis>> {
        if let Some(cached) = self.loop_cache.get(&root)
            && cached.epoch == self.epoch
        {
            return Ok(Arc::clone(cached));
        }
        let analysis = Arc::new(analyze(self, root)?);
        self.loop_cache.insert(root, Arc::clone(&analysis));
        Ok(analysis)
    }
}

/// Computes the loop decomposition for `root`.
pub(crate) fn analyze(net: &Network, root: NodeId) -> Result<LoopAnalysis> {
    let reachable = net.enumerate(root)?;
    let skip_pairs = net.options.pairing == PairingPolicy::SkipDuringDiscovery;

    let mut edges: HashMap<NodeId, Vec<NodeId>> = HashMap::with_capacity(reachable.len());
    for &id in &reachable {
        let node = net.node(id)?;
        let out = if skip_pairs && net.in_group(Group::Pair, id) {
            Vec::new()
        } else {
            node.inputs().to_vec()
        };
        edges.insert(id, out);
    }

    let mut loops = Vec::new();
    let mut membership = HashMap::new();
    for component in strongly_connected(&reachable, &edges) {
        let cyclic = component.len() > 1
            || edges
                .get(&component[0])
                .is_some_and(|inputs| inputs.contains(&component[0]));
        if !cyclic {
            continue;
        }

        let id = LoopId(loops.len());
        let members: HashSet<NodeId> = component.iter().copied().collect();
        let order = intra_order(net, id, &reachable, &members, &edges)?;
        let (source, direction) = loop_direction(net, id, &order)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "loop_found: {id} members={order:?} source={source} direction={}",
            direction.sign()
        );

        for &m in &order {
            membership.insert(m, id);
        }
        loops.push(LoopUnit {
            id,
            members: order,
            source,
            direction,
        });
    }

    Ok(LoopAnalysis {
        root,
        epoch: net.epoch,
        loops,
        membership,
    })
}

/// Tarjan's algorithm with an explicit call stack.
///
/// Components come out in completion order; start nodes are tried in the
/// order given, so the result is deterministic for an unchanged graph.
fn strongly_connected(
    nodes: &[NodeId],
    edges: &HashMap<NodeId, Vec<NodeId>>,
) -> Vec<Vec<NodeId>> {
    let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(nodes.len());
    let mut low: HashMap<NodeId, usize> = HashMap::with_capacity(nodes.len());
    let mut on_stack: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = Vec::new();
    let mut components = Vec::new();
    let mut next = 0;

    for &start in nodes {
        if index.contains_key(&start) {
            continue;
        }
        let mut call: Vec<(NodeId, usize)> = vec![(start, 0)];
        index.insert(start, next);
        low.insert(start, next);
        next += 1;
        stack.push(start);
        on_stack.insert(start);

        while let Some(&(v, child)) = call.last() {
            let succ = edges.get(&v).map_or(&[][..], Vec::as_slice);
            if let Some(&w) = succ.get(child) {
                if let Some(top) = call.last_mut() {
                    top.1 += 1;
                }
                if !index.contains_key(&w) {
                    index.insert(w, next);
                    low.insert(w, next);
                    next += 1;
                    stack.push(w);
                    on_stack.insert(w);
                    call.push((w, 0));
                } else if on_stack.contains(&w) {
                    let lw = index[&w];
                    if let Some(lv) = low.get_mut(&v) {
                        *lv = (*lv).min(lw);
                    }
                }
                continue;
            }

            call.pop();
            let lv = low[&v];
            if let Some(&(parent, _)) = call.last()
                && let Some(lp) = low.get_mut(&parent)
            {
                *lp = (*lp).min(lv);
            }
            if lv == index[&v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack.remove(&w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                components.push(component);
            }
        }
    }
    components
}

/// Post-order over in-loop edges, not following delay members' inputs.
fn intra_order(
    net: &Network,
    id: LoopId,
    reachable: &[NodeId],
    members: &HashSet<NodeId>,
    edges: &HashMap<NodeId, Vec<NodeId>>,
) -> Result<Vec<NodeId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Active,
        Done,
    }

    fn ordering_inputs<'a>(
        net: &Network,
        edges: &'a HashMap<NodeId, Vec<NodeId>>,
        n: NodeId,
    ) -> Result<&'a [NodeId]> {
        if net.node(n)?.is_delay() {
            Ok(&[])
        } else {
            Ok(edges.get(&n).map_or(&[][..], Vec::as_slice))
        }
    }

    let mut marks: HashMap<NodeId, Mark> = HashMap::with_capacity(members.len());
    let mut order = Vec::with_capacity(members.len());

    for &start in reachable.iter().filter(|n| members.contains(n)) {
        if marks.contains_key(&start) {
            continue;
        }
        marks.insert(start, Mark::Active);
        let mut call: Vec<(NodeId, usize)> = vec![(start, 0)];

        while let Some(&(v, child)) = call.last() {
            let inputs = ordering_inputs(net, edges, v)?;
            let next = inputs[child.min(inputs.len())..]
                .iter()
                .position(|w| members.contains(w))
                .map(|offset| child + offset);
            match next {
                Some(i) => {
                    let w = inputs[i];
                    if let Some(top) = call.last_mut() {
                        top.1 = i + 1;
                    }
                    match marks.get(&w) {
                        None => {
                            marks.insert(w, Mark::Active);
                            call.push((w, 0));
                        }
                        Some(Mark::Active) => {
                            return Err(GraphError::FatalGraph(format!(
                                "{id} contains a cycle through {} '{}' not cut by a delay",
                                w,
                                net.node(w)?.name()
                            )));
                        }
                        Some(Mark::Done) => {}
                    }
                }
                None => {
                    call.pop();
                    marks.insert(v, Mark::Done);
                    order.push(v);
                }
            }
        }
    }
    Ok(order)
}

/// Finds the source delay and checks every delay steps the same way.
fn loop_direction(net: &Network, id: LoopId, order: &[NodeId]) -> Result<(NodeId, StepDirection)> {
    let mut found: Option<(NodeId, StepDirection)> = None;
    for &m in order {
        let Some(delay) = net.node(m)?.kind().delay() else {
            continue;
        };
        match found {
            None => found = Some((m, delay.direction())),
            Some((source, direction)) if direction != delay.direction() => {
                return Err(GraphError::FatalGraph(format!(
                    "{id} mixes step directions: '{}' and '{}'",
                    net.node(source)?.name(),
                    net.node(m)?.name()
                )));
            }
            Some(_) => {}
        }
    }
    found.ok_or_else(|| GraphError::FatalGraph(format!("{id} has no delay")))
}
