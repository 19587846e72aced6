//! Graph registry: node ownership, name lookup, groups, and structural edits.
//!
//! A [`Network`] owns every node in an arena indexed by [`NodeId`]. Names are
//! unique under case-insensitive comparison and resolve through a sorted
//! index. Every structural edit bumps the network's epoch; cached loop
//! analyses, traversal orders, and build marks record the epoch they were
//! computed at and are rebuilt when it is stale.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::layout::MinibatchLayout;

use super::buffer::{BufferPool, DeviceId, Matrix, PoolStats};
use super::execute::RootRecord;
use super::loops::LoopAnalysis;
use super::node::{Delay, Node, NodeId, NodeKind, NodeSpec, Operator};
use super::schedule::TraversalOrder;

/// Named node sets a network declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {
    /// Data inputs carrying features.
    Feature,
    /// Data inputs carrying labels.
    Label,
    /// Training criteria. Externally observed.
    Criterion,
    /// Evaluation criteria. Externally observed.
    Evaluation,
    /// Declared outputs. Externally observed.
    Output,
    /// Nodes that bridge two otherwise separate sub-networks.
    Pair,
}

impl Group {
    /// Returns `true` for groups whose values callers read after a run.
    pub fn is_observed(self) -> bool {
        matches!(self, Self::Criterion | Self::Evaluation | Self::Output)
    }
}

/// How loop discovery treats [`Group::Pair`] nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingPolicy {
    /// Ignore the input edges of pairing nodes while forming loops, so a
    /// cycle through a pairing node is never fused into one loop unit.
    #[default]
    SkipDuringDiscovery,
    /// Treat pairing nodes like any other node.
    Traverse,
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Loop discovery policy for pairing nodes.
    pub pairing: PairingPolicy,
    /// Recycle intermediate buffers once their last consumer has run.
    pub reuse_buffers: bool,
    /// Device new buffers are requested on.
    pub device: DeviceId,
    /// Skip precomputed nodes whose value is newer than all their inputs.
    pub skip_up_to_date: bool,
    /// Zero gap frames after each step of a sequential segment.
    pub mask_gaps: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pairing: PairingPolicy::default(),
            reuse_buffers: true,
            device: DeviceId::CPU,
            skip_up_to_date: true,
            mask_gaps: true,
        }
    }
}

/// Filter for [`Network::nodes_of_kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFilter {
    /// Data inputs.
    Input,
    /// Learnable parameters.
    Parameter,
    /// Delay nodes.
    Delay,
    /// Compute nodes.
    Compute,
}

impl KindFilter {
    fn matches(self, kind: &NodeKind) -> bool {
        match kind {
            NodeKind::Input { .. } => self == Self::Input,
            NodeKind::Parameter { .. } => self == Self::Parameter,
            NodeKind::Delay(_) => self == Self::Delay,
            NodeKind::Compute(_) => self == Self::Compute,
        }
    }
}

/// A computation graph and its execution state.
///
/// # Example
///
/// ```rust
/// use cadence_core::Network;
/// use cadence_core::ops::Tanh;
///
/// let mut net = Network::new();
/// let x = net.add_input("features", 3).unwrap();
/// let y = net.add_compute("act", Tanh, &[x]).unwrap();
///
/// assert_eq!(net.find_node("ACT").unwrap(), y);
/// assert_eq!(net.find_nodes("f*"), vec![x]);
/// ```
pub struct Network {
    pub(crate) nodes: Vec<Option<Node>>,
    pub(crate) values: Vec<Option<Matrix>>,
    pub(crate) gradients: Vec<Option<Matrix>>,
    names: BTreeMap<String, NodeId>,
    groups: BTreeMap<Group, Vec<NodeId>>,
    pub(crate) epoch: u64,
    pub(crate) clock: u64,
    pub(crate) options: EngineOptions,
    pub(crate) layout: MinibatchLayout,
    pub(crate) pool: BufferPool,
    pub(crate) loop_cache: HashMap<NodeId, Arc<LoopAnalysis>>,
    pub(crate) forward_cache: HashMap<NodeId, Arc<TraversalOrder>>,
    pub(crate) backward_cache: HashMap<NodeId, Arc<TraversalOrder>>,
    pub(crate) roots: HashMap<NodeId, RootRecord>,
}

impl Network {
    /// Creates an empty network with default options.
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    /// Creates an empty network with the given options.
    pub fn with_options(options: EngineOptions) -> Self {
        let mut pool = BufferPool::new();
        pool.set_reuse(options.reuse_buffers);
        Self {
            nodes: Vec::new(),
            values: Vec::new(),
            gradients: Vec::new(),
            names: BTreeMap::new(),
            groups: BTreeMap::new(),
            epoch: 0,
            clock: 0,
            options,
            layout: MinibatchLayout::default(),
            pool,
            loop_cache: HashMap::new(),
            forward_cache: HashMap::new(),
            backward_cache: HashMap::new(),
            roots: HashMap::new(),
        }
    }

    /// Returns the engine options.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Replaces the engine options. Stales every cached plan.
    pub fn set_options(&mut self, options: EngineOptions) {
        self.options = options;
        self.pool.set_reuse(options.reuse_buffers);
        self.touch();
    }

    /// Returns the structural edit counter.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Records a structural edit.
    fn touch(&mut self) {
        self.epoch += 1;
        self.pool.clear_pending();
    }

    // --- Construction ---

    /// Adds a node.
    ///
    /// Fails with [`GraphError::DuplicateName`] if the name is taken
    /// (case-insensitive) and with [`GraphError::InvalidNode`] if an input
    /// handle is not live. The network is unchanged on failure.
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId> {
        let key = spec.name.to_lowercase();
        if self.names.contains_key(&key) {
            return Err(GraphError::DuplicateName(spec.name));
        }
        if let Some(&bad) = spec.inputs.iter().find(|&&i| !self.contains(i)) {
            return Err(GraphError::InvalidNode(bad));
        }

        let id = NodeId(self.nodes.len() as u32);
        let node = Node::new(id, spec, self.options.device);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "graph_add: {id} '{}' ({}) inputs={:?}",
            node.name,
            node.operation_name(),
            node.inputs
        );

        self.names.insert(key, id);
        self.nodes.push(Some(node));
        self.values.push(None);
        self.gradients.push(None);
        self.touch();
        Ok(id)
    }

    /// Adds a data input with `rows` rows per frame.
    pub fn add_input(&mut self, name: impl Into<String>, rows: usize) -> Result<NodeId> {
        self.add_node(NodeSpec::input(name, rows))
    }

    /// Adds a learnable `rows x cols` parameter, initialized to zeros.
    pub fn add_parameter(
        &mut self,
        name: impl Into<String>,
        rows: usize,
        cols: usize,
    ) -> Result<NodeId> {
        let id = self.add_node(NodeSpec::parameter(name, rows, cols))?;
        self.values[id.slot()] = Some(Matrix::zeros(rows, cols));
        Ok(id)
    }

    /// Adds a delay of `source`.
    pub fn add_delay(
        &mut self,
        name: impl Into<String>,
        delay: Delay,
        source: NodeId,
    ) -> Result<NodeId> {
        self.add_node(NodeSpec::delay(name, delay, source))
    }

    /// Adds a compute node running `op` over `inputs`.
    pub fn add_compute(
        &mut self,
        name: impl Into<String>,
        op: impl Operator + 'static,
        inputs: &[NodeId],
    ) -> Result<NodeId> {
        self.add_node(NodeSpec::compute(name, op).with_inputs(inputs.iter().copied()))
    }

    /// Removes the named node.
    ///
    /// The node is also removed from every consumer's input list and from
    /// every group; consumers that lose an input fail validation until they
    /// are rewired.
    pub fn remove_node(&mut self, name: &str) -> Result<()> {
        let id = self.find_node(name)?;
        let slot = id.slot();
        if let Some(node) = self.nodes[slot].take() {
            self.names.remove(&node.name.to_lowercase());
        }
        if let Some(m) = self.values[slot].take() {
            self.pool.recycle(m);
        }
        if let Some(m) = self.gradients[slot].take() {
            self.pool.recycle(m);
        }
        for node in self.nodes.iter_mut().flatten() {
            node.inputs.retain(|&i| i != id);
        }
        for members in self.groups.values_mut() {
            members.retain(|&i| i != id);
        }
        self.roots.remove(&id);

        #[cfg(feature = "tracing")]
        tracing::debug!("graph_remove: {id} '{name}'");

        self.touch();
        Ok(())
    }

    /// Renames a node.
    ///
    /// Fails with [`GraphError::DuplicateName`] if `new_name` already belongs
    /// to a different node. Renaming to a different capitalization of the
    /// same name is allowed.
    pub fn rename_node(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        let id = self.find_node(old_name)?;
        let new_key = new_name.to_lowercase();
        if let Some(&other) = self.names.get(&new_key)
            && other != id
        {
            return Err(GraphError::DuplicateName(new_name.to_string()));
        }
        self.names.remove(&old_name.to_lowercase());
        self.names.insert(new_key, id);
        if let Some(node) = self.nodes[id.slot()].as_mut() {
            node.name = new_name.to_string();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("graph_rename: {id} '{old_name}' -> '{new_name}'");

        self.touch();
        Ok(())
    }

    /// Replaces the inputs of the named node.
    pub fn set_inputs(&mut self, name: &str, inputs: &[NodeId]) -> Result<()> {
        let id = self.find_node(name)?;
        if let Some(&bad) = inputs.iter().find(|&&i| !self.contains(i)) {
            return Err(GraphError::InvalidNode(bad));
        }
        if let Some(node) = self.nodes[id.slot()].as_mut() {
            node.inputs = inputs.to_vec();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("graph_rewire: {id} inputs={inputs:?}");

        self.touch();
        Ok(())
    }

    /// Removes every node. Handles issued before are never reissued.
    pub fn clear(&mut self) {
        for slot in 0..self.nodes.len() {
            self.nodes[slot] = None;
            if let Some(m) = self.values[slot].take() {
                self.pool.recycle(m);
            }
            if let Some(m) = self.gradients[slot].take() {
                self.pool.recycle(m);
            }
        }
        self.names.clear();
        self.groups.clear();
        self.roots.clear();
        self.touch();
    }

    // --- Lookup ---

    /// Returns `true` if `id` refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id.slot()).is_some_and(Option::is_some)
    }

    /// Returns the node behind a handle.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.slot())
            .and_then(Option::as_ref)
            .ok_or(GraphError::InvalidNode(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.slot())
            .and_then(Option::as_mut)
            .ok_or(GraphError::InvalidNode(id))
    }

    /// Looks up a node by exact name (case-insensitive).
    pub fn find_node(&self, name: &str) -> Result<NodeId> {
        self.try_find_node(name)
            .ok_or_else(|| GraphError::NotFound(name.to_string()))
    }

    /// Looks up a node by exact name, returning `None` when it is missing.
    pub fn try_find_node(&self, name: &str) -> Option<NodeId> {
        self.names.get(&name.to_lowercase()).copied()
    }

    /// Returns every node whose name matches `pattern`, in insertion order.
    ///
    /// `pattern` may contain one `*`, which matches any (possibly empty) run
    /// of characters; the text before and after it must be a prefix and a
    /// suffix of the name. Matching ignores case. A pattern without `*` is an
    /// exact lookup; a pattern with more than one `*` matches nothing.
    pub fn find_nodes(&self, pattern: &str) -> Vec<NodeId> {
        let pattern = pattern.to_lowercase();
        match pattern.matches('*').count() {
            0 => self.try_find_node(&pattern).into_iter().collect(),
            1 => {
                let Some((prefix, suffix)) = pattern.split_once('*') else {
                    return Vec::new();
                };
                self.nodes()
                    .filter(|node| {
                        let name = node.name.to_lowercase();
                        name.len() >= prefix.len() + suffix.len()
                            && name.starts_with(prefix)
                            && name.ends_with(suffix)
                    })
                    .map(Node::id)
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Iterates live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    /// Returns the number of live nodes.
    pub fn node_count(&self) -> usize {
        self.names.len()
    }

    // --- Groups ---

    /// Adds a node to a group. Adding twice is a no-op.
    pub fn add_to_group(&mut self, group: Group, id: NodeId) -> Result<()> {
        if !self.contains(id) {
            return Err(GraphError::InvalidNode(id));
        }
        let members = self.groups.entry(group).or_default();
        if !members.contains(&id) {
            members.push(id);
            self.touch();
        }
        Ok(())
    }

    /// Returns the members of a group in the order they were added.
    pub fn group(&self, group: Group) -> &[NodeId] {
        self.groups.get(&group).map_or(&[], Vec::as_slice)
    }

    /// Returns `true` if `id` belongs to `group`.
    pub fn in_group(&self, group: Group, id: NodeId) -> bool {
        self.group(group).contains(&id)
    }

    /// Returns `true` if callers read the node's value after a run.
    pub(crate) fn is_observed(&self, id: NodeId) -> bool {
        self.groups
            .iter()
            .any(|(g, members)| g.is_observed() && members.contains(&id))
    }

    // --- Per-root queries ---

    /// Returns the nodes reachable from `root` whose kind matches `filter`,
    /// in evaluation dependency order.
    pub fn nodes_of_kind(&self, filter: KindFilter, root: NodeId) -> Result<Vec<NodeId>> {
        self.select(root, |node| filter.matches(&node.kind))
    }

    /// Returns the nodes reachable from `root` running the named operation
    /// (compared case-insensitively).
    pub fn nodes_with_operation(&self, operation: &str, root: NodeId) -> Result<Vec<NodeId>> {
        self.select(root, |node| node.operation_name().eq_ignore_ascii_case(operation))
    }

    /// Returns the data inputs reachable from `root`.
    pub fn input_nodes(&self, root: NodeId) -> Result<Vec<NodeId>> {
        self.nodes_of_kind(KindFilter::Input, root)
    }

    /// Returns the learnable parameters reachable from `root` that receive a
    /// gradient.
    pub fn learnable_parameters(&self, root: NodeId) -> Result<Vec<NodeId>> {
        self.select(root, |node| {
            matches!(node.kind, NodeKind::Parameter { .. }) && node.needs_gradient
        })
    }

    /// Returns the precompute-once nodes reachable from `root` that still
    /// need to be evaluated.
    pub fn nodes_requiring_precomputation(&self, root: NodeId) -> Result<Vec<NodeId>> {
        self.select(root, |node| node.precomputed && node.timestamp == 0)
    }

    fn select(&self, root: NodeId, keep: impl Fn(&Node) -> bool) -> Result<Vec<NodeId>> {
        let order = self.enumerate(root)?;
        Ok(order
            .into_iter()
            .filter(|&id| self.nodes[id.slot()].as_ref().is_some_and(&keep))
            .collect())
    }

    // --- Flags ---

    /// Sets whether a leaf receives a gradient.
    pub fn set_needs_gradient(&mut self, id: NodeId, needs_gradient: bool) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.is_leaf() {
            return Err(GraphError::InvalidArgument(format!(
                "'{}' is computed; its gradient flag follows its inputs",
                node.name
            )));
        }
        node.needs_gradient = needs_gradient;
        self.touch();
        Ok(())
    }

    /// Keeps the node's value alive past the end of every run.
    pub fn set_keep_value(&mut self, id: NodeId, keep: bool) -> Result<()> {
        self.node_mut(id)?.keep_value = keep;
        self.touch();
        Ok(())
    }

    /// Marks the node as precompute-once.
    pub fn set_precomputed(&mut self, id: NodeId, precomputed: bool) -> Result<()> {
        self.node_mut(id)?.precomputed = precomputed;
        self.touch();
        Ok(())
    }

    // --- Data ---

    /// Returns the minibatch layout.
    pub fn layout(&self) -> &MinibatchLayout {
        &self.layout
    }

    /// Replaces the minibatch layout.
    ///
    /// Computed values of the old layout are dropped; every root must run
    /// forward again before backward.
    pub fn set_layout(&mut self, layout: MinibatchLayout) {
        self.layout = layout;
        for slot in 0..self.nodes.len() {
            let leaf = self.nodes[slot].as_ref().is_none_or(Node::is_leaf);
            if !leaf && let Some(m) = self.values[slot].take() {
                self.pool.recycle(m);
            }
            if let Some(node) = self.nodes[slot].as_mut()
                && !node.is_leaf()
            {
                node.timestamp = 0;
            }
        }
        for record in self.roots.values_mut() {
            record.forward_epoch = None;
        }
    }

    /// Sets the value of an input or parameter.
    pub fn set_value(&mut self, id: NodeId, value: Matrix) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.is_leaf() {
            return Err(GraphError::InvalidArgument(format!(
                "'{}' is computed; only inputs and parameters take values",
                node.name
            )));
        }
        self.clock += 1;
        let clock = self.clock;
        self.node_mut(id)?.timestamp = clock;
        self.values[id.slot()] = Some(value);
        Ok(())
    }

    /// Returns the node's current value, if it holds one.
    pub fn value(&self, id: NodeId) -> Option<&Matrix> {
        self.values.get(id.slot()).and_then(Option::as_ref)
    }

    /// Returns the node's gradient accumulator, if it holds one.
    pub fn gradient(&self, id: NodeId) -> Option<&Matrix> {
        self.gradients.get(id.slot()).and_then(Option::as_ref)
    }

    /// Returns buffer pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Network {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Network")
            .field("nodes", &self.node_count())
            .field("epoch", &self.epoch)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Plus, Tanh};

    fn chain() -> (Network, NodeId, NodeId, NodeId) {
        let mut net = Network::new();
        let a = net.add_input("A", 2).unwrap();
        let b = net.add_compute("B", Tanh, &[a]).unwrap();
        let c = net.add_compute("C", Tanh, &[b]).unwrap();
        (net, a, b, c)
    }

    #[test]
    fn duplicate_name_is_rejected_case_insensitively() {
        let (mut net, ..) = chain();
        let before = net.node_count();
        let err = net.add_input("b", 2).unwrap_err();
        assert_eq!(err, GraphError::DuplicateName("b".to_string()));
        assert_eq!(net.node_count(), before);
    }

    #[test]
    fn unknown_input_handle_is_rejected() {
        let mut net = Network::new();
        let err = net.add_compute("t", Tanh, &[NodeId(7)]).unwrap_err();
        assert_eq!(err, GraphError::InvalidNode(NodeId(7)));
        assert_eq!(net.node_count(), 0);
    }

    #[test]
    fn exact_lookup_modes() {
        let (net, a, ..) = chain();
        assert_eq!(net.find_node("a").unwrap(), a);
        assert_eq!(
            net.find_node("missing").unwrap_err(),
            GraphError::NotFound("missing".to_string())
        );
        assert_eq!(net.try_find_node("missing"), None);
    }

    #[test]
    fn wildcard_lookup() {
        let mut net = Network::new();
        let w0 = net.add_parameter("W0", 2, 2).unwrap();
        let w1 = net.add_parameter("W1", 2, 2).unwrap();
        let b0 = net.add_parameter("B0", 2, 1).unwrap();

        assert_eq!(net.find_nodes("w*"), vec![w0, w1]);
        assert_eq!(net.find_nodes("*0"), vec![w0, b0]);
        assert_eq!(net.find_nodes("*"), vec![w0, w1, b0]);
        assert_eq!(net.find_nodes("W1"), vec![w1]);
        assert!(net.find_nodes("x*").is_empty());
        assert!(net.find_nodes("*W*").is_empty());
    }

    #[test]
    fn wildcard_prefix_and_suffix_do_not_overlap() {
        let mut net = Network::new();
        net.add_input("ab", 1).unwrap();
        assert!(net.find_nodes("ab*b").is_empty());
    }

    #[test]
    fn remove_scrubs_consumers_and_groups() {
        let (mut net, a, b, c) = chain();
        net.add_to_group(Group::Output, b).unwrap();
        let epoch = net.epoch();

        net.remove_node("B").unwrap();
        assert!(!net.contains(b));
        assert!(net.node(c).unwrap().inputs().is_empty());
        assert!(net.group(Group::Output).is_empty());
        assert!(net.epoch() > epoch);

        // Handles are never reissued.
        let d = net.add_compute("B", Tanh, &[a]).unwrap();
        assert_ne!(d, b);
    }

    #[test]
    fn rename_checks_collisions() {
        let (mut net, a, ..) = chain();
        assert_eq!(
            net.rename_node("A", "c").unwrap_err(),
            GraphError::DuplicateName("c".to_string())
        );
        net.rename_node("A", "a").unwrap();
        net.rename_node("a", "source").unwrap();
        assert_eq!(net.find_node("SOURCE").unwrap(), a);
        assert_eq!(net.try_find_node("A"), None);
        assert_eq!(net.node(a).unwrap().name(), "source");
    }

    #[test]
    fn set_inputs_rewires_and_bumps_epoch() {
        let (mut net, a, _, c) = chain();
        let epoch = net.epoch();
        net.set_inputs("C", &[a]).unwrap();
        assert_eq!(net.node(c).unwrap().inputs(), &[a]);
        assert!(net.epoch() > epoch);
    }

    #[test]
    fn clear_empties_registry() {
        let (mut net, a, ..) = chain();
        net.clear();
        assert_eq!(net.node_count(), 0);
        assert_eq!(net.nodes().count(), 0);
        assert!(!net.contains(a));
        let again = net.add_input("A", 1).unwrap();
        assert_ne!(again, a);
    }

    #[test]
    fn kind_queries_follow_dependency_order() {
        let mut net = Network::new();
        let x = net.add_input("x", 2).unwrap();
        let w = net.add_parameter("w", 2, 2).unwrap();
        let frozen = net.add_parameter("frozen", 2, 2).unwrap();
        net.set_needs_gradient(frozen, false).unwrap();
        let s1 = net.add_compute("s1", Plus, &[x, w]).unwrap();
        let s2 = net.add_compute("s2", Plus, &[s1, frozen]).unwrap();
        let _unrelated = net.add_input("other", 2).unwrap();

        assert_eq!(net.input_nodes(s2).unwrap(), vec![x]);
        assert_eq!(net.learnable_parameters(s2).unwrap(), vec![w]);
        assert_eq!(
            net.nodes_of_kind(KindFilter::Parameter, s2).unwrap(),
            vec![w, frozen]
        );
        assert_eq!(net.nodes_with_operation("plus", s2).unwrap(), vec![s1, s2]);
    }

    #[test]
    fn set_value_rejects_computed_nodes() {
        let (mut net, _, b, _) = chain();
        let err = net.set_value(b, Matrix::zeros(2, 1)).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }

    #[test]
    fn gradient_flag_only_settable_on_leaves() {
        let (mut net, a, b, _) = chain();
        net.set_needs_gradient(a, true).unwrap();
        assert!(net.node(a).unwrap().needs_gradient());
        assert!(net.set_needs_gradient(b, true).is_err());
    }
}
