//! Graph node types.
//!
//! Each node in a [`Network`](super::Network) has a [`NodeId`] arena handle, a
//! unique name, and a [`NodeKind`] that determines its role: a data input, a
//! learnable parameter, a delay (the only source of recurrence), or a compute
//! node wrapping an [`Operator`]. Inputs are stored as handles, never as owning
//! pointers, so cyclic graphs need no special teardown.

use core::ops::Range;

use crate::error::{GraphError, Result};
use crate::layout::{FrameRange, MinibatchLayout};

use super::buffer::{DeviceId, Matrix};
use super::loops::StepDirection;

/// Unique identifier for a node in a network.
///
/// Node IDs are assigned sequentially and never reused within a network
/// instance. They remain stable across renames, rewiring, and re-planning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn slot(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Column dimension of a node value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cols {
    /// A fixed number of columns, independent of the minibatch (parameters).
    Fixed(usize),
    /// One column per frame of the current minibatch.
    Minibatch,
}

/// Output dimensions of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    /// Number of rows.
    pub rows: usize,
    /// Column dimension.
    pub cols: Cols,
}

impl Shape {
    /// Creates a shape.
    pub const fn new(rows: usize, cols: Cols) -> Self {
        Self { rows, cols }
    }

    /// Creates a minibatch-shaped `rows x frames` shape.
    pub const fn minibatch(rows: usize) -> Self {
        Self::new(rows, Cols::Minibatch)
    }

    /// Creates a fixed `rows x cols` shape.
    pub const fn fixed(rows: usize, cols: usize) -> Self {
        Self::new(rows, Cols::Fixed(cols))
    }

    /// Returns `true` if the column count follows the minibatch.
    pub fn is_minibatch(&self) -> bool {
        matches!(self.cols, Cols::Minibatch)
    }

    /// Returns the concrete column count under `layout`.
    pub fn columns(&self, layout: &MinibatchLayout) -> usize {
        match self.cols {
            Cols::Fixed(n) => n,
            Cols::Minibatch => layout.num_frames(),
        }
    }

    /// Returns the columns of a value of this shape covered by `range`.
    ///
    /// Fixed-width values are always used whole.
    pub fn column_range(&self, layout: &MinibatchLayout, range: FrameRange) -> Range<usize> {
        match self.cols {
            Cols::Fixed(n) => 0..n,
            Cols::Minibatch => layout.columns(range),
        }
    }
}

impl core::fmt::Display for Shape {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.cols {
            Cols::Fixed(n) => write!(f, "{} x {}", self.rows, n),
            Cols::Minibatch => write!(f, "{} x mb", self.rows),
        }
    }
}

/// Shape inference failure reported by an [`Operator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeError {
    /// Input `input` has shape `found` where `expected` is required.
    Mismatch {
        /// Index of the offending input.
        input: usize,
        /// Required shape.
        expected: Shape,
        /// Actual shape.
        found: Shape,
    },
    /// Wrong number of inputs.
    InputCount {
        /// Number of inputs required.
        expected: usize,
        /// Number of inputs connected.
        found: usize,
    },
}

/// Arguments for one forward computation.
///
/// Gives an operator read access to its inputs and write access to its own
/// output over one [`FrameRange`]. An input that is the node itself (a
/// self-loop) reads the node's current output.
pub struct ForwardContext<'a> {
    pub(crate) range: FrameRange,
    pub(crate) layout: &'a MinibatchLayout,
    /// `None` marks an input that is the node itself.
    pub(crate) inputs: Vec<Option<&'a Matrix>>,
    pub(crate) input_shapes: Vec<Shape>,
    pub(crate) output: &'a mut Matrix,
    pub(crate) output_shape: Shape,
}

impl<'a> ForwardContext<'a> {
    /// Returns the extent to compute.
    pub fn range(&self) -> FrameRange {
        self.range
    }

    /// Returns the minibatch layout.
    pub fn layout(&self) -> &'a MinibatchLayout {
        self.layout
    }

    /// Returns the number of inputs.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Returns the value of input `i`.
    pub fn input(&self, i: usize) -> &Matrix {
        match self.inputs[i] {
            Some(m) => m,
            None => &*self.output,
        }
    }

    /// Returns the value of input `i` without borrowing the context, so it
    /// can be read while the output is written.
    ///
    /// # Panics
    ///
    /// Panics if input `i` is the node itself. Only delays may read their
    /// own output; they use [`input()`](Self::input).
    pub fn input_value(&self, i: usize) -> &'a Matrix {
        match self.inputs[i] {
            Some(m) => m,
            None => panic!("input {i} is the node's own output"),
        }
    }

    /// Returns the validated shape of input `i`.
    pub fn input_shape(&self, i: usize) -> Shape {
        self.input_shapes[i]
    }

    /// Returns the columns of input `i` covered by the current range.
    pub fn input_columns(&self, i: usize) -> Range<usize> {
        self.input_shapes[i].column_range(self.layout, self.range)
    }

    /// Returns the node's output.
    pub fn output(&self) -> &Matrix {
        &*self.output
    }

    /// Returns the node's output, mutably.
    pub fn output_mut(&mut self) -> &mut Matrix {
        &mut *self.output
    }

    /// Returns the columns of the output covered by the current range.
    pub fn output_columns(&self) -> Range<usize> {
        self.output_shape.column_range(self.layout, self.range)
    }
}

/// Arguments for propagating a gradient to one input.
pub struct BackwardContext<'a> {
    pub(crate) range: FrameRange,
    pub(crate) layout: &'a MinibatchLayout,
    pub(crate) input_index: usize,
    /// `None` marks a value released because the operator declared it unneeded.
    pub(crate) inputs: Vec<Option<&'a Matrix>>,
    pub(crate) input_shapes: Vec<Shape>,
    pub(crate) output: Option<&'a Matrix>,
    pub(crate) output_shape: Shape,
    pub(crate) output_gradient: &'a Matrix,
    pub(crate) input_gradient: &'a mut Matrix,
}

impl<'a> BackwardContext<'a> {
    /// Returns the extent to propagate over.
    pub fn range(&self) -> FrameRange {
        self.range
    }

    /// Returns the minibatch layout.
    pub fn layout(&self) -> &'a MinibatchLayout {
        self.layout
    }

    /// Returns which input receives the gradient.
    pub fn input_index(&self) -> usize {
        self.input_index
    }

    /// Returns the forward value of input `i`.
    ///
    /// # Panics
    ///
    /// Panics if the value was released, which only happens when
    /// [`Operator::input_needed_for_gradient`] returned `false` for it.
    pub fn input(&self, i: usize) -> &'a Matrix {
        match self.inputs[i] {
            Some(m) => m,
            None => panic!("value of input {i} was released before backward"),
        }
    }

    /// Returns the validated shape of input `i`.
    pub fn input_shape(&self, i: usize) -> Shape {
        self.input_shapes[i]
    }

    /// Returns the columns of input `i` covered by the current range.
    pub fn input_columns(&self, i: usize) -> Range<usize> {
        self.input_shapes[i].column_range(self.layout, self.range)
    }

    /// Returns the node's forward output.
    ///
    /// # Panics
    ///
    /// Panics if the value was released, which only happens when
    /// [`Operator::output_needed_for_gradient`] returned `false`.
    pub fn output(&self) -> &'a Matrix {
        match self.output {
            Some(m) => m,
            None => panic!("output value was released before backward"),
        }
    }

    /// Returns the columns of the output covered by the current range.
    pub fn output_columns(&self) -> Range<usize> {
        self.output_shape.column_range(self.layout, self.range)
    }

    /// Returns the gradient arriving at the node's output.
    pub fn output_gradient(&self) -> &'a Matrix {
        self.output_gradient
    }

    /// Returns the gradient accumulator of the target input.
    ///
    /// Operators add into it; they never overwrite it, since several
    /// consumers may contribute to the same input.
    pub fn input_gradient_mut(&mut self) -> &mut Matrix {
        &mut *self.input_gradient
    }
}

/// Numeric capability of a compute node.
///
/// The engine decides *when* an operator runs and over which extent; the
/// operator decides *what* it computes. Operators must produce identical
/// results whether called once with [`FrameRange::All`] or once per
/// [`FrameRange::Step`] over every step, except for nodes inside a recurrent
/// loop where only per-step evaluation is meaningful.
pub trait Operator: Send {
    /// Returns the operation name, used for kind queries and diagnostics.
    fn operation_name(&self) -> &'static str;

    /// Computes the output shape from the input shapes.
    fn infer_shape(&self, inputs: &[Shape]) -> core::result::Result<Shape, ShapeError>;

    /// Computes the output over `ctx.range()`.
    fn forward(&mut self, ctx: &mut ForwardContext<'_>);

    /// Adds the gradient for input `ctx.input_index()` over `ctx.range()`.
    fn backward(&mut self, ctx: &mut BackwardContext<'_>);

    /// Called once before a forward pass over this node.
    fn begin_forward(&mut self) {}

    /// Called once after a forward pass over this node.
    fn end_forward(&mut self) {}

    /// Called once before a backward pass over this node.
    fn begin_backward(&mut self) {}

    /// Called once after a backward pass over this node.
    fn end_backward(&mut self) {}

    /// Whether [`backward()`](Self::backward) reads the node's own output.
    fn output_needed_for_gradient(&self) -> bool {
        true
    }

    /// Whether [`backward()`](Self::backward) reads the value of input `input`.
    fn input_needed_for_gradient(&self, _input: usize) -> bool {
        true
    }
}

/// Time-shift operator: output at step `t` is the input at `t - offset`.
///
/// A positive offset reads the past (`PastValue`), a negative one the future
/// (`FutureValue`). Reads that would leave the minibatch, cross a sequence
/// boundary, or land on a gap frame yield the initial value instead. Delays
/// are the only nodes allowed to close a cycle.
#[derive(Debug, Clone)]
pub struct Delay {
    offset: isize,
    rows: usize,
    initial: f32,
    scratch: Vec<f32>,
}

impl Delay {
    /// Creates a delay reading `offset` steps back (positive) or ahead (negative).
    pub fn new(offset: isize, rows: usize, initial: f32) -> Result<Self> {
        if offset == 0 {
            return Err(GraphError::InvalidArgument(
                "delay offset must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            offset,
            rows,
            initial,
            scratch: Vec::new(),
        })
    }

    /// Creates a delay reading `steps` steps into the past.
    ///
    /// # Panics
    ///
    /// Panics if `steps` is zero.
    pub fn past(steps: usize, rows: usize, initial: f32) -> Self {
        assert!(steps > 0, "past delay needs at least one step");
        Self {
            offset: steps as isize,
            rows,
            initial,
            scratch: Vec::new(),
        }
    }

    /// Creates a delay reading `steps` steps into the future.
    ///
    /// # Panics
    ///
    /// Panics if `steps` is zero.
    pub fn future(steps: usize, rows: usize, initial: f32) -> Self {
        assert!(steps > 0, "future delay needs at least one step");
        Self {
            offset: -(steps as isize),
            rows,
            initial,
            scratch: Vec::new(),
        }
    }

    /// Returns the signed time offset.
    pub fn offset(&self) -> isize {
        self.offset
    }

    /// Returns the declared row count.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Returns the value used where no source frame exists.
    pub fn initial_value(&self) -> f32 {
        self.initial
    }

    /// Returns the stepping direction a loop through this delay must use.
    pub fn direction(&self) -> StepDirection {
        if self.offset > 0 {
            StepDirection::Forward
        } else {
            StepDirection::Backward
        }
    }

    /// Returns the step read by sequence `s` at step `t`, if any.
    pub fn source_step(&self, layout: &MinibatchLayout, s: usize, t: usize) -> Option<usize> {
        let steps = layout.num_time_steps();
        let distance = self.offset.unsigned_abs();
        let src = if self.offset > 0 {
            let src = t.checked_sub(distance)?;
            if (src + 1..=t).any(|u| layout.is_sequence_start(s, u)) {
                return None;
            }
            src
        } else {
            let src = t + distance;
            if src >= steps || (t..src).any(|u| layout.is_sequence_end(s, u)) {
                return None;
            }
            src
        };
        if layout.is_gap(s, src) {
            return None;
        }
        Some(src)
    }
}

impl Operator for Delay {
    fn operation_name(&self) -> &'static str {
        if self.offset > 0 {
            "PastValue"
        } else {
            "FutureValue"
        }
    }

    fn infer_shape(&self, inputs: &[Shape]) -> core::result::Result<Shape, ShapeError> {
        if inputs.len() != 1 {
            return Err(ShapeError::InputCount {
                expected: 1,
                found: inputs.len(),
            });
        }
        let expected = Shape::minibatch(self.rows);
        if inputs[0] != expected {
            return Err(ShapeError::Mismatch {
                input: 0,
                expected,
                found: inputs[0],
            });
        }
        Ok(expected)
    }

    fn forward(&mut self, ctx: &mut ForwardContext<'_>) {
        let layout = ctx.layout;
        for t in layout.steps_in(ctx.range) {
            for s in 0..layout.num_parallel_sequences() {
                let dst = layout.frame_index(s, t);
                match self.source_step(layout, s, t) {
                    Some(src) => {
                        self.scratch.clear();
                        self.scratch
                            .extend_from_slice(ctx.input(0).column(layout.frame_index(s, src)));
                        ctx.output_mut().column_mut(dst).copy_from_slice(&self.scratch);
                    }
                    None => ctx.output_mut().column_mut(dst).fill(self.initial),
                }
            }
        }
    }

    fn backward(&mut self, ctx: &mut BackwardContext<'_>) {
        let layout = ctx.layout;
        for t in layout.steps_in(ctx.range) {
            for s in 0..layout.num_parallel_sequences() {
                let Some(src) = self.source_step(layout, s, t) else {
                    continue;
                };
                let from = layout.frame_index(s, t);
                let to = layout.frame_index(s, src);
                for r in 0..self.rows {
                    let g = ctx.output_gradient.get(r, from);
                    let acc = ctx.input_gradient.get(r, to);
                    ctx.input_gradient.set(r, to, acc + g);
                }
            }
        }
    }

    fn output_needed_for_gradient(&self) -> bool {
        false
    }

    fn input_needed_for_gradient(&self, _input: usize) -> bool {
        false
    }
}

/// The role of a node in the network.
pub enum NodeKind {
    /// Data fed from outside, one column per frame.
    Input {
        /// Row count of the fed value.
        rows: usize,
    },
    /// Learnable parameter with a fixed shape.
    Parameter {
        /// Row count.
        rows: usize,
        /// Column count.
        cols: usize,
    },
    /// Time-shift node; the only kind that may close a cycle.
    Delay(Delay),
    /// Any other computation.
    Compute(Box<dyn Operator>),
}

impl NodeKind {
    /// Returns the operation name.
    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::Input { .. } => "Input",
            Self::Parameter { .. } => "LearnableParameter",
            Self::Delay(delay) => delay.operation_name(),
            Self::Compute(op) => op.operation_name(),
        }
    }

    /// Returns `true` for nodes that own their value (inputs and parameters).
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Input { .. } | Self::Parameter { .. })
    }

    /// Returns the delay, if this is a delay node.
    pub fn delay(&self) -> Option<&Delay> {
        match self {
            Self::Delay(delay) => Some(delay),
            _ => None,
        }
    }

    /// Returns `true` for delay nodes.
    pub fn is_delay(&self) -> bool {
        matches!(self, Self::Delay(_))
    }

    /// Returns the declared shape of a leaf or delay.
    pub(crate) fn declared_shape(&self) -> Option<Shape> {
        match self {
            Self::Input { rows } => Some(Shape::minibatch(*rows)),
            Self::Parameter { rows, cols } => Some(Shape::fixed(*rows, *cols)),
            Self::Delay(delay) => Some(Shape::minibatch(delay.rows())),
            Self::Compute(_) => None,
        }
    }

    pub(crate) fn operator(&self) -> Option<&dyn Operator> {
        match self {
            Self::Delay(delay) => Some(delay),
            Self::Compute(op) => Some(op.as_ref()),
            Self::Input { .. } | Self::Parameter { .. } => None,
        }
    }

    pub(crate) fn operator_mut(&mut self) -> Option<&mut dyn Operator> {
        match self {
            Self::Delay(delay) => Some(delay),
            Self::Compute(op) => Some(op.as_mut()),
            Self::Input { .. } | Self::Parameter { .. } => None,
        }
    }
}

impl core::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Input { rows } => f.debug_struct("Input").field("rows", rows).finish(),
            Self::Parameter { rows, cols } => f
                .debug_struct("Parameter")
                .field("rows", rows)
                .field("cols", cols)
                .finish(),
            Self::Delay(delay) => f.debug_tuple("Delay").field(&delay.offset()).finish(),
            Self::Compute(op) => f.debug_tuple("Compute").field(&op.operation_name()).finish(),
        }
    }
}

/// Description of a node to add with [`Network::add_node`](super::Network::add_node).
#[derive(Debug)]
pub struct NodeSpec {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) needs_gradient: Option<bool>,
    pub(crate) keep_value: bool,
    pub(crate) precomputed: bool,
}

impl NodeSpec {
    /// Describes a node of any kind.
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            needs_gradient: None,
            keep_value: false,
            precomputed: false,
        }
    }

    /// Data input with `rows` rows.
    pub fn input(name: impl Into<String>, rows: usize) -> Self {
        Self::new(name, NodeKind::Input { rows })
    }

    /// Learnable `rows x cols` parameter.
    pub fn parameter(name: impl Into<String>, rows: usize, cols: usize) -> Self {
        Self::new(name, NodeKind::Parameter { rows, cols })
    }

    /// Delay of `source`.
    pub fn delay(name: impl Into<String>, delay: Delay, source: NodeId) -> Self {
        Self::new(name, NodeKind::Delay(delay)).with_inputs([source])
    }

    /// Compute node running `op`.
    pub fn compute(name: impl Into<String>, op: impl Operator + 'static) -> Self {
        Self::new(name, NodeKind::Compute(Box::new(op)))
    }

    /// Sets the ordered inputs.
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = NodeId>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    /// Overrides whether a leaf receives a gradient.
    ///
    /// Parameters default to `true`, inputs to `false`. Ignored for computed
    /// nodes, whose flag is derived from their inputs.
    pub fn with_needs_gradient(mut self, needs_gradient: bool) -> Self {
        self.needs_gradient = Some(needs_gradient);
        self
    }

    /// Keeps the value alive past the end of a run (exempt from reuse).
    pub fn keep_value(mut self) -> Self {
        self.keep_value = true;
        self
    }

    /// Marks the node as computed once and then reused while its inputs
    /// stay unchanged.
    pub fn precomputed(mut self) -> Self {
        self.precomputed = true;
        self
    }
}

/// A node owned by a [`Network`](super::Network).
#[derive(Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) inputs: Vec<NodeId>,
    /// Set by validation.
    pub(crate) shape: Option<Shape>,
    pub(crate) timestamp: u64,
    pub(crate) needs_gradient: bool,
    pub(crate) keep_value: bool,
    pub(crate) precomputed: bool,
    pub(crate) device: DeviceId,
}

impl Node {
    pub(crate) fn new(id: NodeId, spec: NodeSpec, device: DeviceId) -> Self {
        let needs_gradient = spec.needs_gradient.unwrap_or(match spec.kind {
            NodeKind::Input { .. } => false,
            NodeKind::Parameter { .. } => true,
            // Derived from inputs during validation.
            NodeKind::Delay(_) | NodeKind::Compute(_) => false,
        });
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            inputs: spec.inputs,
            shape: None,
            timestamp: 0,
            needs_gradient,
            keep_value: spec.keep_value,
            precomputed: spec.precomputed,
            device,
        }
    }

    /// Returns the node's handle.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the node's kind.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Returns the ordered input handles.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Returns the operation name.
    pub fn operation_name(&self) -> &'static str {
        self.kind.operation_name()
    }

    /// Returns the validated shape, or `None` before the first build.
    pub fn shape(&self) -> Option<Shape> {
        self.shape
    }

    /// Returns the evaluation timestamp (0 = never evaluated).
    pub fn eval_timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Returns whether the node takes part in gradient computation.
    pub fn needs_gradient(&self) -> bool {
        self.needs_gradient
    }

    /// Returns whether the value survives the end of a run.
    pub fn keeps_value(&self) -> bool {
        self.keep_value
    }

    /// Returns whether the node is a precompute-once node.
    pub fn is_precomputed(&self) -> bool {
        self.precomputed
    }

    /// Returns `true` for delay nodes.
    pub fn is_delay(&self) -> bool {
        self.kind.is_delay()
    }

    /// Returns `true` for inputs and parameters.
    pub fn is_leaf(&self) -> bool {
        self.kind.is_leaf()
    }

    /// Returns the device the node's buffers are requested on.
    pub fn device(&self) -> DeviceId {
        self.device
    }
}
