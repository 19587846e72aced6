//! Traversal planner: per-root evaluation orders.
//!
//! A [`TraversalOrder`] is an immutable, cached plan for one root and one
//! pass direction. It is a list of [`Segment`]s: runs of ordinary nodes
//! evaluated once over the whole minibatch ([`Segment::Par`]) and loop units
//! evaluated once per time step ([`Segment::Seq`]).
//!
//! The forward order is a depth-first post-order over the graph with every
//! loop unit contracted to a single super-node, visiting inputs in
//! declaration order. The backward order is its mirror image: segments in
//! reverse, the nodes of each segment in reverse, and each loop stepped in
//! the opposite direction.
//!
//! Orders are shared via `Arc` and tagged with the network epoch; any
//! structural edit makes them stale.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{GraphError, Result};

use super::loops::{LoopAnalysis, LoopId, StepDirection};
use super::network::Network;
use super::node::NodeId;

/// Which propagation an order is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassDirection {
    /// Forward propagation (inputs before consumers).
    Forward,
    /// Gradient propagation (consumers before inputs).
    Backward,
}

/// A loop unit scheduled for step-by-step evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqSegment {
    /// The loop this segment evaluates.
    pub loop_id: LoopId,
    /// Members in the order they run within one step.
    pub members: Vec<NodeId>,
    /// Order in which steps are visited.
    pub direction: StepDirection,
}

/// One piece of a traversal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Nodes evaluated once each over the whole minibatch.
    Par(Vec<NodeId>),
    /// A loop evaluated once per time step.
    Seq(SeqSegment),
}

impl Segment {
    /// Returns the nodes of this segment in execution order.
    pub fn members(&self) -> &[NodeId] {
        match self {
            Self::Par(nodes) => nodes,
            Self::Seq(seq) => &seq.members,
        }
    }
}

/// Cached evaluation plan for one (root, direction) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalOrder {
    root: NodeId,
    pass: PassDirection,
    segments: Vec<Segment>,
    pub(crate) epoch: u64,
}

impl TraversalOrder {
    /// Returns the root this order evaluates.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Returns the pass direction.
    pub fn pass(&self) -> PassDirection {
        self.pass
    }

    /// Returns the segments in execution order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Iterates every node in execution order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.segments.iter().flat_map(|s| s.members().iter().copied())
    }

    /// Returns the number of nodes in the order.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.members().len()).sum()
    }

    /// Returns `true` if the order holds no node.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the mirrored order for the opposite pass.
    pub(crate) fn reversed(&self) -> Self {
        let segments = self
            .segments
            .iter()
            .rev()
            .map(|segment| match segment {
                Segment::Par(nodes) => Segment::Par(nodes.iter().rev().copied().collect()),
                Segment::Seq(seq) => Segment::Seq(SeqSegment {
                    loop_id: seq.loop_id,
                    members: seq.members.iter().rev().copied().collect(),
                    direction: seq.direction.reversed(),
                }),
            })
            .collect();
        Self {
            root: self.root,
            pass: match self.pass {
                PassDirection::Forward => PassDirection::Backward,
                PassDirection::Backward => PassDirection::Forward,
            },
            segments,
            epoch: self.epoch,
        }
    }
}

/// Renders a segment for debug logs.
#[cfg(feature = "tracing")]
pub(crate) fn format_segment(net: &Network, segment: &Segment) -> String {
    let names = |nodes: &[NodeId]| {
        nodes
            .iter()
            .map(|&id| net.node(id).map_or("?", |n| n.name()))
            .collect::<Vec<_>>()
            .join(", ")
    };
    match segment {
        Segment::Par(nodes) => format!("PAR [{}]", names(nodes)),
        Segment::Seq(seq) => format!(
            "SEQ {} dir={} [{}]",
            seq.loop_id,
            seq.direction.sign(),
            names(&seq.members)
        ),
    }
}

impl Network {
    /// Lists the nodes reachable from `root` in depth-first post-order.
    ///
    /// Cycles are tolerated: a node is visited once.
    pub fn enumerate(&self, root: NodeId) -> Result<Vec<NodeId>> {
        self.node(root)?;
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut order = Vec::new();
        let mut call: Vec<(NodeId, usize)> = vec![(root, 0)];
        visited.insert(root);

        while let Some(&(v, child)) = call.last() {
            let node = self.node(v)?;
            match node.inputs().get(child) {
                Some(&w) => {
                    if let Some(top) = call.last_mut() {
                        top.1 += 1;
                    }
                    if visited.insert(w) {
                        call.push((w, 0));
                    }
                }
                None => {
                    call.pop();
                    order.push(v);
                }
            }
        }
        Ok(order)
    }

    /// Returns the forward order for `root`, planning it if needed.
    pub fn forward_order(&mut self, root: NodeId) -> Result<Arc<TraversalOrder>> {
        if let Some(cached) = self.forward_cache.get(&root)
            && cached.epoch == self.epoch
        {
            return Ok(Arc::clone(cached));
        }
        let analysis = self.loop_analysis(root)?;
        let order = Arc::new(plan_forward(self, &analysis)?);

        #[cfg(feature = "tracing")]
        {
            tracing::debug!(
                "plan: root {root}, {} nodes in {} segments",
                order.len(),
                order.segments().len()
            );
            for (i, segment) in order.segments().iter().enumerate() {
                tracing::debug!("  segment[{i}]: {}", format_segment(self, segment));
            }
        }

        self.forward_cache.insert(root, Arc::clone(&order));
        Ok(order)
    }

    /// Returns the backward order for `root`, planning it if needed.
    pub fn backward_order(&mut self, root: NodeId) -> Result<Arc<TraversalOrder>> {
        if let Some(cached) = self.backward_cache.get(&root)
            && cached.epoch == self.epoch
        {
            return Ok(Arc::clone(cached));
        }
        let forward = self.forward_order(root)?;
        let order = Arc::new(forward.reversed());
        self.backward_cache.insert(root, Arc::clone(&order));
        Ok(order)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Unit {
    Node(NodeId),
    Loop(LoopId),
}

/// Depth-first post-order over the loop-contracted graph.
fn plan_forward(net: &Network, analysis: &LoopAnalysis) -> Result<TraversalOrder> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Active,
        Done,
    }

    let unit_of = |id: NodeId| match analysis.loop_of(id) {
        Some(unit) => Unit::Loop(unit.id),
        None => Unit::Node(id),
    };
    let successors = |unit: Unit| -> Result<Vec<Unit>> {
        match unit {
            Unit::Node(id) => Ok(net.node(id)?.inputs().iter().map(|&i| unit_of(i)).collect()),
            Unit::Loop(lid) => {
                let mut out = Vec::new();
                for &m in &analysis.loops()[lid.0].members {
                    for &i in net.node(m)?.inputs() {
                        if !analysis.same_loop(m, i) {
                            out.push(unit_of(i));
                        }
                    }
                }
                Ok(out)
            }
        }
    };

    let start = unit_of(analysis.root());
    let mut marks: HashMap<Unit, Mark> = HashMap::new();
    let mut units = Vec::new();
    let mut call: Vec<(Unit, Vec<Unit>, usize)> = vec![(start, successors(start)?, 0)];
    marks.insert(start, Mark::Active);

    while let Some((unit, succ, child)) = call.last_mut() {
        let Some(&next) = succ.get(*child) else {
            let done = *unit;
            call.pop();
            marks.insert(done, Mark::Done);
            units.push(done);
            continue;
        };
        *child += 1;
        match marks.get(&next) {
            None => {
                marks.insert(next, Mark::Active);
                call.push((next, successors(next)?, 0));
            }
            Some(Mark::Active) => {
                let culprit = match next {
                    Unit::Node(id) => net.node(id)?.name().to_string(),
                    Unit::Loop(lid) => lid.to_string(),
                };
                return Err(GraphError::FatalGraph(format!(
                    "cycle through '{culprit}' cannot be ordered; loops must not overlap"
                )));
            }
            Some(Mark::Done) => {}
        }
    }

    let mut segments: Vec<Segment> = Vec::new();
    for unit in units {
        match unit {
            Unit::Node(id) => match segments.last_mut() {
                Some(Segment::Par(nodes)) => nodes.push(id),
                _ => segments.push(Segment::Par(vec![id])),
            },
            Unit::Loop(lid) => {
                let l = &analysis.loops()[lid.0];
                segments.push(Segment::Seq(SeqSegment {
                    loop_id: l.id,
                    members: l.members.clone(),
                    direction: l.direction,
                }));
            }
        }
    }

    Ok(TraversalOrder {
        root: analysis.root(),
        pass: PassDirection::Forward,
        segments,
        epoch: net.epoch,
    })
}
