//! Graph registry, planning, and execution.
//!
//! A [`Network`] is edited at will (add, remove, rename, rewire). Nothing
//! is planned until a root is built; from then on every query reuses cached
//! results until the next structural edit bumps the epoch.
//!
//! # Architecture
//!
//! The pipeline runs leaves first:
//!
//! - [`network`] - arena of [`Node`]s by [`NodeId`], case-insensitive name
//!   index, groups, edits.
//! - [`loops`] - Tarjan SCC over input edges reachable from a root, giving
//!   [`LoopUnit`]s with an intra-loop order and a [`StepDirection`].
//! - [`schedule`] - contracted depth-first post-order, giving a
//!   [`TraversalOrder`] of [`Segment::Par`] and [`Segment::Seq`] pieces, and
//!   its mirror image for backpropagation.
//! - [`execute`] - validation, forward propagation, backpropagation.
//! - [`buffer`] - [`Matrix`] storage and the [`BufferPool`].
//!
//! # Recurrence
//!
//! Cycles are legal only through a [`Delay`] node, which reads its input at
//! another time step. Each strongly connected component becomes a loop
//! unit evaluated one time step at a time; everything else is evaluated once
//! over the whole minibatch. Overlapping loops, loops without a delay, and
//! loops mixing past and future delays are rejected with
//! [`GraphError::FatalGraph`](crate::GraphError::FatalGraph).
//!
//! # Threading
//!
//! A network is driven by one thread at a time. Every entry point that
//! mutates takes `&mut self`, and `Network` is `Send`, so a network can be
//! moved to a worker or shared behind a lock.

pub mod buffer;
pub mod execute;
pub mod loops;
pub mod network;
pub mod node;
pub mod schedule;

pub use buffer::{BufferPool, DeviceId, Matrix, PoolStats, Role};
pub use execute::RootState;
pub use loops::{LoopAnalysis, LoopId, LoopUnit, StepDirection};
pub use network::{EngineOptions, Group, KindFilter, Network, PairingPolicy};
pub use node::{
    BackwardContext, Cols, Delay, ForwardContext, Node, NodeId, NodeKind, NodeSpec, Operator,
    Shape, ShapeError,
};
pub use schedule::{PassDirection, SeqSegment, Segment, TraversalOrder};
