//! Execution controller: build, forward propagation, and backpropagation.
//!
//! Each root moves through `NotBuilt → Built → Evaluating → Built`. Building
//! plans the root and validates shapes along every edge once per epoch.
//! A forward run walks the cached forward order; a backward run walks the
//! mirrored backward order.
//!
//! # Segment semantics
//!
//! | Segment | Forward | Backward |
//! |---------|---------|----------|
//! | `Par`   | each node once over [`FrameRange::All`] | each node once, to every input that needs a gradient |
//! | `Seq`   | per step `t`, each member over [`FrameRange::Step`] | per step, members to in-loop inputs; then once to inputs outside the loop |
//!
//! # Buffer lifetimes
//!
//! Before a forward run every computed value in the order goes back to the
//! pool. Each node's value is requested just before it runs and recycled
//! once its last consumer in the order has run (for loop members, once the
//! whole segment has run). Gradients follow the same scheme over the
//! backward order.

use std::collections::{HashMap, HashSet};

use crate::error::{GraphError, Result};
use crate::layout::{FrameRange, MinibatchLayout};

use super::buffer::{Matrix, Role};
use super::network::Network;
use super::node::{BackwardContext, ForwardContext, Node, NodeId, Shape, ShapeError};
use super::schedule::{PassDirection, Segment, TraversalOrder};

#[cfg(feature = "tracing")]
use super::schedule::format_segment;

/// Lifecycle state of a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootState {
    /// Not validated at the current epoch.
    NotBuilt,
    /// Validated; ready to run.
    Built,
    /// A pass is in progress. Only observable if an operator panicked.
    Evaluating(PassDirection),
}

/// Per-root execution bookkeeping.
#[derive(Debug, Clone, Default)]
pub(crate) struct RootRecord {
    pub(crate) built_epoch: Option<u64>,
    pub(crate) evaluating: Option<PassDirection>,
    /// Epoch of the last completed forward run.
    pub(crate) forward_epoch: Option<u64>,
    /// Whether that run kept the values backward reads.
    pub(crate) kept_for_gradient: bool,
    pub(crate) gradient_root: bool,
}

impl Network {
    /// Returns the lifecycle state of `root`.
    pub fn root_state(&self, root: NodeId) -> RootState {
        let Some(record) = self.roots.get(&root) else {
            return RootState::NotBuilt;
        };
        if let Some(pass) = record.evaluating {
            return RootState::Evaluating(pass);
        }
        if record.built_epoch == Some(self.epoch) {
            RootState::Built
        } else {
            RootState::NotBuilt
        }
    }

    /// Returns `true` if `root` is validated at the current epoch.
    pub fn is_built(&self, root: NodeId) -> bool {
        self.root_state(root) == RootState::Built
    }

    /// Plans `root` and validates shapes along every edge it reaches.
    ///
    /// Does nothing if the root was already built at the current epoch.
    /// On failure nothing is marked built.
    pub fn build_and_validate(&mut self, root: NodeId) -> Result<()> {
        self.node(root)?;
        if self.is_built(root) {
            return Ok(());
        }
        let order = self.forward_order(root)?;
        let shapes = self.validate(&order)?;
        for (id, shape) in shapes {
            self.node_mut(id)?.shape = Some(shape);
        }
        self.derive_gradient_flags(&order)?;

        #[cfg(feature = "tracing")]
        tracing::debug!("build: root {root}, {} nodes validated", order.len());

        let epoch = self.epoch;
        self.roots.entry(root).or_default().built_epoch = Some(epoch);
        Ok(())
    }

    /// Registers `root` as a gradient root.
    ///
    /// Must be called before the forward run that [`backprop()`](Self::backprop)
    /// follows, so that run keeps the values backward reads.
    pub fn allocate_gradients(&mut self, root: NodeId) -> Result<()> {
        self.build_and_validate(root)?;
        self.roots.entry(root).or_default().gradient_root = true;
        Ok(())
    }

    /// Evaluates every node `root` depends on, then `root` itself.
    pub fn forward_prop(&mut self, root: NodeId) -> Result<()> {
        self.build_and_validate(root)?;
        let order = self.forward_order(root)?;
        self.check_leaves(&order)?;

        let gradient_root = self.roots.get(&root).is_some_and(|r| r.gradient_root);
        self.invalidate_overlapping(root, &order);
        self.roots.entry(root).or_default().evaluating = Some(PassDirection::Forward);
        let result = self.run_forward(root, &order, gradient_root);

        let epoch = self.epoch;
        let record = self.roots.entry(root).or_default();
        record.evaluating = None;
        if result.is_ok() {
            record.forward_epoch = Some(epoch);
            record.kept_for_gradient = gradient_root;
        } else {
            record.forward_epoch = None;
        }
        result
    }

    /// Zeroes the gradient accumulator of every node in `root`'s order that
    /// needs one, allocating it if missing. The root's own gradient is left
    /// untouched.
    pub fn zero_gradients(&mut self, root: NodeId) -> Result<()> {
        self.build_and_validate(root)?;
        let order = self.forward_order(root)?;
        for id in order.nodes() {
            if id == root {
                continue;
            }
            if self.node(id)?.needs_gradient {
                self.zero_gradient(id)?;
            }
        }
        Ok(())
    }

    /// Propagates gradients from `root` back to every node that needs one.
    ///
    /// Requires [`allocate_gradients()`](Self::allocate_gradients) before
    /// the last forward run and that run to be current.
    pub fn backprop(&mut self, root: NodeId) -> Result<()> {
        let name = self.node(root)?.name.clone();
        let Some(record) = self.roots.get(&root) else {
            return Err(GraphError::InvalidState(format!(
                "'{name}' has no forward run to backpropagate"
            )));
        };
        if !record.gradient_root {
            return Err(GraphError::InvalidState(format!(
                "allocate_gradients('{name}') must precede forward_prop"
            )));
        }
        let current = record.built_epoch == Some(self.epoch)
            && record.forward_epoch == Some(self.epoch)
            && record.kept_for_gradient;
        if !current {
            return Err(GraphError::InvalidState(format!(
                "'{name}' needs a forward run after the last change"
            )));
        }

        let order = self.backward_order(root)?;
        self.seed_gradient(root)?;
        self.reset_gradients(root, &order)?;

        self.roots.entry(root).or_default().evaluating = Some(PassDirection::Backward);
        let result = self.run_backward(root, &order);
        self.roots.entry(root).or_default().evaluating = None;
        result
    }

    // --- Validation ---

    /// Infers every node's shape in forward order.
    ///
    /// Delays report their declared shape on the first pass, since in a loop
    /// their input comes later in the order; a second pass checks each
    /// delay's input against that declaration.
    fn validate(&self, order: &TraversalOrder) -> Result<HashMap<NodeId, Shape>> {
        let mut shapes: HashMap<NodeId, Shape> = HashMap::with_capacity(order.len());
        for id in order.nodes() {
            let node = self.node(id)?;
            let shape = match node.kind.declared_shape() {
                Some(shape) => shape,
                None => self.infer(node, &shapes)?,
            };
            shapes.insert(id, shape);
        }
        for id in order.nodes() {
            let node = self.node(id)?;
            if node.is_delay() {
                self.infer(node, &shapes)?;
            }
        }
        Ok(shapes)
    }

    fn infer(&self, node: &Node, shapes: &HashMap<NodeId, Shape>) -> Result<Shape> {
        let op = node.kind.operator().ok_or_else(|| {
            GraphError::InvalidState(format!("'{}' has no operator", node.name))
        })?;
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for &i in &node.inputs {
            let shape = shapes.get(&i).copied().ok_or_else(|| {
                GraphError::FatalGraph(format!(
                    "'{}' reads {i} before it is evaluated",
                    node.name
                ))
            })?;
            inputs.push(shape);
        }
        op.infer_shape(&inputs).map_err(|err| match err {
            ShapeError::Mismatch {
                input,
                expected,
                found,
            } => GraphError::DimensionMismatch {
                node: node.name.clone(),
                input: node
                    .inputs
                    .get(input)
                    .and_then(|&i| self.node(i).ok())
                    .map_or_else(|| format!("#{input}"), |n| n.name.clone()),
                expected,
                found,
            },
            ShapeError::InputCount { expected, found } => GraphError::InputCount {
                node: node.name.clone(),
                expected,
                found,
            },
        })
    }

    /// Recomputes the gradient flag of every computed node in the order.
    ///
    /// Iterates to a fixed point because loop members depend on each other.
    fn derive_gradient_flags(&mut self, order: &TraversalOrder) -> Result<()> {
        let ids: Vec<NodeId> = order.nodes().collect();
        for &id in &ids {
            let node = self.node_mut(id)?;
            if !node.is_leaf() {
                node.needs_gradient = false;
            }
        }
        loop {
            let mut changed = false;
            for &id in &ids {
                let node = self.node(id)?;
                if node.is_leaf() || node.needs_gradient {
                    continue;
                }
                let needs = node.inputs.iter().any(|&i| {
                    self.nodes[i.slot()]
                        .as_ref()
                        .is_some_and(|n| n.needs_gradient)
                });
                if needs {
                    self.node_mut(id)?.needs_gradient = true;
                    changed = true;
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    /// Concrete `(rows, cols)` of a validated node under the current layout.
    fn dims(&self, node: &Node) -> Result<(usize, usize)> {
        let shape = node.shape.ok_or_else(|| {
            GraphError::InvalidState(format!("'{}' has not been validated", node.name))
        })?;
        Ok((shape.rows, shape.columns(&self.layout)))
    }

    fn check_leaves(&self, order: &TraversalOrder) -> Result<()> {
        for id in order.nodes() {
            let node = self.node(id)?;
            if !node.is_leaf() {
                continue;
            }
            let (rows, cols) = self.dims(node)?;
            let Some(value) = self.values[id.slot()].as_ref() else {
                return Err(GraphError::InvalidState(format!(
                    "no value set for '{}'",
                    node.name
                )));
            };
            if value.rows() != rows || value.cols() != cols {
                return Err(GraphError::DimensionMismatch {
                    node: node.name.clone(),
                    input: node.name.clone(),
                    expected: Shape::fixed(rows, cols),
                    found: Shape::fixed(value.rows(), value.cols()),
                });
            }
        }
        Ok(())
    }

    // --- Forward ---

    /// Clears the forward record of every other root whose order shares a
    /// computed node with `order`; this run reclaims those values.
    fn invalidate_overlapping(&mut self, root: NodeId, order: &TraversalOrder) {
        let computed: HashSet<NodeId> = order
            .nodes()
            .filter(|&id| self.node(id).is_ok_and(|n| !n.is_leaf()))
            .collect();
        let epoch = self.epoch;
        for (&other, record) in self.roots.iter_mut() {
            if other == root || record.forward_epoch.is_none() {
                continue;
            }
            let shared = match self.forward_cache.get(&other) {
                Some(cached) if cached.epoch == epoch => cached.nodes().any(|id| computed.contains(&id)),
                _ => true,
            };
            if shared {
                record.forward_epoch = None;
                record.kept_for_gradient = false;
            }
        }
    }

    fn run_forward(&mut self, root: NodeId, order: &TraversalOrder, gradient_root: bool) -> Result<()> {
        let keep_fresh = self.options.skip_up_to_date;
        let mut counts: HashMap<NodeId, usize> = HashMap::new();
        let mut exempt: HashSet<NodeId> = HashSet::new();
        exempt.insert(root);

        for id in order.nodes() {
            let node = self.node(id)?;
            if node.is_leaf() {
                continue;
            }
            if node.keep_value || node.precomputed || self.is_observed(id) {
                exempt.insert(id);
            }
            for &i in &node.inputs {
                if self.node(i).is_ok_and(|n| !n.is_leaf()) {
                    *counts.entry(i).or_default() += 1;
                }
            }
            if gradient_root && node.needs_gradient
                && let Some(op) = node.kind.operator()
            {
                if op.output_needed_for_gradient() {
                    exempt.insert(id);
                }
                for (k, &i) in node.inputs.iter().enumerate() {
                    if op.input_needed_for_gradient(k) {
                        exempt.insert(i);
                    }
                }
            }
            if !(node.precomputed && keep_fresh)
                && let Some(m) = self.values[id.slot()].take()
            {
                self.pool.recycle(m);
            }
        }
        self.pool.begin_pass(Role::Value, counts, exempt);

        for segment in order.segments() {
            #[cfg(feature = "tracing")]
            tracing::trace!("forward: {}", format_segment(self, segment));

            match segment {
                Segment::Par(nodes) => {
                    for &id in nodes {
                        if !self.is_up_to_date(id)? {
                            self.prepare_output(id)?;
                            self.forward_node(id, FrameRange::All)?;
                            self.stamp(id);
                        }
                        self.release_inputs(id)?;
                    }
                }
                Segment::Seq(seq) => {
                    for &id in &seq.members {
                        self.prepare_output(id)?;
                        if let Some(op) = self.node_mut(id)?.kind.operator_mut() {
                            op.begin_forward();
                        }
                    }
                    let steps = self.layout.num_time_steps();
                    for t in seq.direction.steps(steps) {
                        for &id in &seq.members {
                            self.forward_node(id, FrameRange::Step(t))?;
                        }
                        if self.options.mask_gaps {
                            self.mask_gap_frames(&seq.members, t);
                        }
                    }
                    for &id in &seq.members {
                        if let Some(op) = self.node_mut(id)?.kind.operator_mut() {
                            op.end_forward();
                        }
                        self.stamp(id);
                    }
                    for &id in &seq.members {
                        self.release_inputs(id)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// A node can be skipped if it is a leaf, or a precomputed node whose
    /// value is at least as new as every input.
    fn is_up_to_date(&self, id: NodeId) -> Result<bool> {
        let node = self.node(id)?;
        if node.is_leaf() {
            return Ok(true);
        }
        if !(self.options.skip_up_to_date && node.precomputed) || node.timestamp == 0 {
            return Ok(false);
        }
        let (rows, cols) = self.dims(node)?;
        let has_value = self.values[id.slot()]
            .as_ref()
            .is_some_and(|m| m.rows() == rows && m.cols() == cols);
        let inputs_older = node
            .inputs
            .iter()
            .all(|&i| self.node(i).is_ok_and(|n| n.timestamp <= node.timestamp));
        Ok(has_value && inputs_older)
    }

    fn stamp(&mut self, id: NodeId) {
        self.clock += 1;
        if let Some(node) = self.nodes[id.slot()].as_mut() {
            node.timestamp = self.clock;
        }
    }

    /// Makes sure the node holds a zeroed output buffer of the right size.
    fn prepare_output(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let (rows, cols) = self.dims(node)?;
        let device = node.device;
        let slot = id.slot();
        match self.values[slot].as_mut() {
            Some(m) if m.rows() == rows && m.cols() == cols => m.fill(0.0),
            _ => {
                if let Some(old) = self.values[slot].take() {
                    self.pool.recycle(old);
                }
                self.values[slot] = Some(self.pool.request(rows, cols, device));
            }
        }
        Ok(())
    }

    fn forward_node(&mut self, id: NodeId, range: FrameRange) -> Result<()> {
        let slot = id.slot();
        let mut node = self.nodes[slot].take().ok_or(GraphError::InvalidNode(id))?;
        let result = run_node_forward(&mut node, &self.nodes, &mut self.values, &self.layout, range);
        self.nodes[slot] = Some(node);
        result
    }

    /// Zeroes the gap frames of step `t` in every minibatch-shaped member.
    fn mask_gap_frames(&mut self, members: &[NodeId], t: usize) {
        if !self.layout.has_gaps() {
            return;
        }
        for &id in members {
            let minibatch = self.nodes[id.slot()]
                .as_ref()
                .and_then(|n| n.shape)
                .is_some_and(|s| s.is_minibatch());
            if !minibatch {
                continue;
            }
            let Some(value) = self.values[id.slot()].as_mut() else {
                continue;
            };
            for s in 0..self.layout.num_parallel_sequences() {
                if self.layout.is_gap(s, t) {
                    value.column_mut(self.layout.frame_index(s, t)).fill(0.0);
                }
            }
        }
    }

    fn release_inputs(&mut self, id: NodeId) -> Result<()> {
        let node = self.nodes[id.slot()].as_ref().ok_or(GraphError::InvalidNode(id))?;
        for &i in &node.inputs {
            if self.pool.consume(i, Role::Value)
                && let Some(m) = self.values[i.slot()].take()
            {
                self.pool.recycle(m);
            }
        }
        Ok(())
    }

    // --- Backward ---

    fn seed_gradient(&mut self, root: NodeId) -> Result<()> {
        let node = self.node(root)?;
        let (rows, cols) = self.dims(node)?;
        let device = node.device;
        let slot = root.slot();
        let mut seed = match self.gradients[slot].take() {
            Some(m) if m.rows() == rows && m.cols() == cols => m,
            Some(m) => {
                self.pool.recycle(m);
                self.pool.request(rows, cols, device)
            }
            None => self.pool.request(rows, cols, device),
        };
        seed.fill(1.0);
        self.gradients[slot] = Some(seed);
        Ok(())
    }

    fn zero_gradient(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let (rows, cols) = self.dims(node)?;
        let device = node.device;
        let slot = id.slot();
        match self.gradients[slot].as_mut() {
            Some(g) if g.rows() == rows && g.cols() == cols => g.fill(0.0),
            _ => {
                if let Some(old) = self.gradients[slot].take() {
                    self.pool.recycle(old);
                }
                self.gradients[slot] = Some(self.pool.request(rows, cols, device));
            }
        }
        Ok(())
    }

    /// Zeroes the leaf accumulators and hands every intermediate gradient
    /// back to the pool; those are requested again as the walk reaches them.
    fn reset_gradients(&mut self, root: NodeId, order: &TraversalOrder) -> Result<()> {
        for id in order.nodes() {
            if id == root {
                continue;
            }
            let node = self.node(id)?;
            if node.is_leaf() {
                if node.needs_gradient {
                    self.zero_gradient(id)?;
                }
            } else if let Some(old) = self.gradients[id.slot()].take() {
                self.pool.recycle(old);
            }
        }
        Ok(())
    }

    /// Requests a zeroed gradient buffer for `id` if it has none.
    fn ensure_gradient(&mut self, id: NodeId) -> Result<()> {
        if self.gradients[id.slot()].is_some() {
            return Ok(());
        }
        let node = self.node(id)?;
        let (rows, cols) = self.dims(node)?;
        let device = node.device;
        self.gradients[id.slot()] = Some(self.pool.request(rows, cols, device));
        Ok(())
    }

    fn run_backward(&mut self, root: NodeId, order: &TraversalOrder) -> Result<()> {
        let analysis = self.loop_analysis(root)?;
        let counts: Vec<(NodeId, usize)> = order
            .nodes()
            .filter(|&id| {
                id != root
                    && self
                        .node(id)
                        .is_ok_and(|n| !n.is_leaf() && n.needs_gradient)
            })
            .map(|id| (id, 1))
            .collect();
        self.pool.begin_pass(Role::Gradient, counts, [root]);

        for segment in order.segments() {
            #[cfg(feature = "tracing")]
            tracing::trace!("backward: {}", format_segment(self, segment));

            match segment {
                Segment::Par(nodes) => {
                    for &id in nodes {
                        if !self.propagates(id)? {
                            continue;
                        }
                        self.hook_backward(id, true)?;
                        let inputs = self.node(id)?.inputs.len();
                        for k in 0..inputs {
                            if self.input_needs_gradient(id, k)? {
                                self.backward_node(id, k, FrameRange::All)?;
                            }
                        }
                        self.hook_backward(id, false)?;
                        self.release_gradient(id);
                    }
                }
                Segment::Seq(seq) => {
                    let mut active = Vec::with_capacity(seq.members.len());
                    for &id in &seq.members {
                        if self.propagates(id)? {
                            self.hook_backward(id, true)?;
                            active.push(id);
                        }
                    }
                    let steps = self.layout.num_time_steps();
                    for t in seq.direction.steps(steps) {
                        for &id in &active {
                            let inputs = self.node(id)?.inputs.clone();
                            for (k, &i) in inputs.iter().enumerate() {
                                if analysis.same_loop(id, i) && self.input_needs_gradient(id, k)? {
                                    self.backward_node(id, k, FrameRange::Step(t))?;
                                }
                            }
                        }
                    }
                    for &id in &active {
                        let inputs = self.node(id)?.inputs.clone();
                        for (k, &i) in inputs.iter().enumerate() {
                            if !analysis.same_loop(id, i) && self.input_needs_gradient(id, k)? {
                                self.backward_node(id, k, FrameRange::All)?;
                            }
                        }
                    }
                    for &id in &active {
                        self.hook_backward(id, false)?;
                        self.release_gradient(id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether `id` passes gradient on to its inputs.
    fn propagates(&self, id: NodeId) -> Result<bool> {
        let node = self.node(id)?;
        Ok(!node.is_leaf() && node.needs_gradient)
    }

    fn input_needs_gradient(&self, id: NodeId, k: usize) -> Result<bool> {
        let input = self.node(id)?.inputs[k];
        Ok(self.node(input)?.needs_gradient)
    }

    fn hook_backward(&mut self, id: NodeId, begin: bool) -> Result<()> {
        if let Some(op) = self.node_mut(id)?.kind.operator_mut() {
            if begin {
                op.begin_backward();
            } else {
                op.end_backward();
            }
        }
        Ok(())
    }

    fn backward_node(&mut self, id: NodeId, input: usize, range: FrameRange) -> Result<()> {
        let target = self.node(id)?.inputs[input];
        self.ensure_gradient(id)?;
        self.ensure_gradient(target)?;
        let slot = id.slot();
        let mut node = self.nodes[slot].take().ok_or(GraphError::InvalidNode(id))?;
        let result = run_node_backward(
            &mut node,
            input,
            &self.nodes,
            &self.values,
            &mut self.gradients,
            &self.layout,
            range,
        );
        self.nodes[slot] = Some(node);
        result
    }

    fn release_gradient(&mut self, id: NodeId) {
        if self.pool.consume(id, Role::Gradient)
            && let Some(m) = self.gradients[id.slot()].take()
        {
            self.pool.recycle(m);
        }
    }
}

/// Shapes of a node's inputs; `own` stands in for the node itself, which is
/// out of the arena while it runs.
fn input_shapes(node: &Node, nodes: &[Option<Node>], own: Shape) -> Result<Vec<Shape>> {
    node.inputs
        .iter()
        .map(|&i| {
            if i == node.id {
                return Ok(own);
            }
            nodes[i.slot()]
                .as_ref()
                .and_then(|n| n.shape)
                .ok_or(GraphError::InvalidNode(i))
        })
        .collect()
}

fn run_node_forward(
    node: &mut Node,
    nodes: &[Option<Node>],
    values: &mut [Option<Matrix>],
    layout: &MinibatchLayout,
    range: FrameRange,
) -> Result<()> {
    let id = node.id;
    let output_shape = node.shape.ok_or_else(|| {
        GraphError::InvalidState(format!("'{}' has not been validated", node.name))
    })?;
    let shapes = input_shapes(node, nodes, output_shape)?;
    let Some(op) = node.kind.operator_mut() else {
        return Ok(());
    };
    let mut output = values[id.slot()].take().ok_or_else(|| {
        GraphError::InvalidState(format!("'{}' has no output buffer", node.name))
    })?;

    let gathered: Result<Vec<Option<&Matrix>>> = node
        .inputs
        .iter()
        .map(|&i| {
            if i == id {
                return Ok(None);
            }
            values[i.slot()].as_ref().map(Some).ok_or_else(|| {
                GraphError::InvalidState(format!("value of {i} released before '{}' ran", node.name))
            })
        })
        .collect();
    let result = gathered.map(|inputs| {
        let mut ctx = ForwardContext {
            range,
            layout,
            inputs,
            input_shapes: shapes,
            output: &mut output,
            output_shape,
        };
        op.forward(&mut ctx);
    });
    values[id.slot()] = Some(output);
    result
}

fn run_node_backward(
    node: &mut Node,
    input: usize,
    nodes: &[Option<Node>],
    values: &[Option<Matrix>],
    gradients: &mut [Option<Matrix>],
    layout: &MinibatchLayout,
    range: FrameRange,
) -> Result<()> {
    let id = node.id;
    let target = node.inputs[input];
    let output_shape = node.shape.ok_or_else(|| {
        GraphError::InvalidState(format!("'{}' has not been validated", node.name))
    })?;
    let shapes = input_shapes(node, nodes, output_shape)?;
    let inputs: Vec<Option<&Matrix>> = node
        .inputs
        .iter()
        .map(|&i| values[i.slot()].as_ref())
        .collect();
    let output = values[id.slot()].as_ref();
    let missing = |what: &str| {
        GraphError::InvalidState(format!("'{}' has no {what} gradient buffer", node.name))
    };

    if target == id {
        let own = gradients[id.slot()].clone().ok_or_else(|| missing("own"))?;
        let input_gradient = gradients[id.slot()].as_mut().ok_or_else(|| missing("own"))?;
        let Some(op) = node.kind.operator_mut() else {
            return Ok(());
        };
        let mut ctx = BackwardContext {
            range,
            layout,
            input_index: input,
            inputs,
            input_shapes: shapes,
            output,
            output_shape,
            output_gradient: &own,
            input_gradient,
        };
        op.backward(&mut ctx);
        return Ok(());
    }

    let mut input_gradient = gradients[target.slot()].take().ok_or_else(|| missing("input"))?;
    let result = match gradients[id.slot()].as_ref() {
        Some(output_gradient) => match node.kind.operator_mut() {
            Some(op) => {
                let mut ctx = BackwardContext {
                    range,
                    layout,
                    input_index: input,
                    inputs,
                    input_shapes: shapes,
                    output,
                    output_shape,
                    output_gradient,
                    input_gradient: &mut input_gradient,
                };
                op.backward(&mut ctx);
                Ok(())
            }
            None => Ok(()),
        },
        None => Err(missing("output")),
    };
    gradients[target.slot()] = Some(input_gradient);
    result
}
