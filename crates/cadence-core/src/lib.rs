//! Cadence Core - execution engine for recurrent computation graphs
//!
//! This crate owns a mutable graph of operator nodes, plans valid evaluation
//! orders for it (including cycles created by time-delay nodes), runs
//! forward and backward propagation over those orders, and recycles
//! intermediate buffers as soon as their last consumer has run.
//!
//! # Core Abstractions
//!
//! ## Graph
//!
//! - [`Network`] - Node registry, caches, and execution entry points
//! - [`NodeSpec`] / [`NodeKind`] - What a node is: input, parameter, delay, or compute
//! - [`Operator`] - Numeric capability a compute node runs
//! - [`Delay`] - Time shift; the only node kind allowed to close a cycle
//!
//! ## Planning
//!
//! - [`LoopAnalysis`] / [`LoopUnit`] - Strongly connected components and their step direction
//! - [`TraversalOrder`] / [`Segment`] - Cached per-root plans of parallel and sequential segments
//!
//! ## Data
//!
//! - [`Matrix`] - Column-major `f32` storage for values and gradients
//! - [`BufferPool`] - Reference-counted reuse of intermediate buffers
//! - [`MinibatchLayout`] / [`FrameRange`] - Parallel sequences, time steps, and gap frames
//!
//! # Example
//!
//! ```rust
//! use cadence_core::{Delay, Matrix, MinibatchLayout, Network};
//! use cadence_core::ops::{Plus, ReduceSum};
//!
//! let mut net = Network::new();
//! let x = net.add_input("x", 1).unwrap();
//! let h = net.add_compute("h", Plus, &[x, x]).unwrap();
//! let prev = net.add_delay("prev", Delay::past(1, 1, 0.0), h).unwrap();
//! net.set_inputs("h", &[x, prev]).unwrap();
//! let total = net.add_compute("total", ReduceSum, &[h]).unwrap();
//!
//! // One sequence of three steps: h(t) = x(t) + h(t-1)
//! net.set_layout(MinibatchLayout::new(1, 3));
//! net.set_value(x, Matrix::filled(1, 3, 1.0)).unwrap();
//! net.forward_prop(total).unwrap();
//!
//! assert_eq!(net.value(total).unwrap().get(0, 0), 1.0 + 2.0 + 3.0);
//! ```
//!
//! # Features
//!
//! - `tracing` - Emit `tracing` events for graph edits, planning, loop
//!   discovery, and buffer reuse. Off by default.

pub mod error;
pub mod graph;
pub mod layout;
pub mod ops;

pub use error::{GraphError, Result};
pub use graph::{
    BackwardContext, BufferPool, Cols, Delay, DeviceId, EngineOptions, ForwardContext, Group,
    KindFilter, LoopAnalysis, LoopId, LoopUnit, Matrix, Network, Node, NodeId, NodeKind, NodeSpec,
    Operator, PairingPolicy, PassDirection, PoolStats, Role, RootState, SeqSegment, Segment, Shape,
    ShapeError, StepDirection, TraversalOrder,
};
pub use layout::{FrameFlags, FrameRange, MinibatchLayout};
