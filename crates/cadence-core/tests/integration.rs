//! Integration tests for cadence-core.
//!
//! Drives whole networks through the public API: planning of acyclic and
//! recurrent graphs, hand-computed forward and backward values for a small
//! recurrent network, cache reuse across builds, invalidation by edits, name
//! lookup, and the graph shapes that must be rejected.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cadence_core::ops::{Plus, ReduceSum, Scale, Tanh, Times};
use cadence_core::{
    BackwardContext, Delay, EngineOptions, ForwardContext, GraphError, Group, Matrix,
    MinibatchLayout, Network, NodeSpec, Operator, PairingPolicy, RootState, Segment, Shape,
    ShapeError, StepDirection,
};

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-5
}

fn assert_slice_approx(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!(approx(*a, *e), "{actual:?} vs {expected:?}");
    }
}

/// Identity operator that counts shape inference calls.
struct CountingInfer(Arc<AtomicUsize>);

impl Operator for CountingInfer {
    fn operation_name(&self) -> &'static str {
        "CountingInfer"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Shape, ShapeError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        inputs.first().copied().ok_or(ShapeError::InputCount {
            expected: 1,
            found: 0,
        })
    }

    fn forward(&mut self, ctx: &mut ForwardContext<'_>) {
        let cols = ctx.output_columns();
        let x = ctx.input_value(0).columns(cols.clone());
        ctx.output_mut().columns_mut(cols).copy_from_slice(x);
    }

    fn backward(&mut self, ctx: &mut BackwardContext<'_>) {
        let cols = ctx.output_columns();
        let g = ctx.output_gradient().columns(cols.clone());
        for (a, &d) in ctx.input_gradient_mut().columns_mut(cols).iter_mut().zip(g) {
            *a += d;
        }
    }
}

// ============================================================================
// 1. Acyclic chains
// ============================================================================

#[test]
fn chain_orders_and_gradient_zeroing() {
    let mut net = Network::new();
    let a = net
        .add_node(NodeSpec::input("A", 1).with_needs_gradient(true))
        .unwrap();
    let b = net.add_compute("B", Tanh, &[a]).unwrap();
    let c = net.add_compute("C", ReduceSum, &[b]).unwrap();

    let forward = net.forward_order(c).unwrap();
    assert_eq!(forward.nodes().collect::<Vec<_>>(), vec![a, b, c]);
    let backward = net.backward_order(c).unwrap();
    assert_eq!(backward.nodes().collect::<Vec<_>>(), vec![c, b, a]);

    net.set_value(a, Matrix::filled(1, 1, 0.3)).unwrap();
    net.allocate_gradients(c).unwrap();
    net.forward_prop(c).unwrap();
    net.backprop(c).unwrap();

    let y = 0.3f32.tanh();
    assert!(approx(net.gradient(a).unwrap().get(0, 0), 1.0 - y * y));

    net.zero_gradients(c).unwrap();
    assert_eq!(net.gradient(c).unwrap().as_slice(), &[1.0]);
    assert_eq!(net.gradient(b).unwrap().as_slice(), &[0.0]);
    assert_eq!(net.gradient(a).unwrap().as_slice(), &[0.0]);
}

#[test]
fn root_state_follows_the_lifecycle() {
    let mut net = Network::new();
    let x = net.add_input("x", 1).unwrap();
    let y = net.add_compute("y", Scale(3.0), &[x]).unwrap();

    assert_eq!(net.root_state(y), RootState::NotBuilt);
    net.build_and_validate(y).unwrap();
    assert_eq!(net.root_state(y), RootState::Built);

    net.set_value(x, Matrix::filled(1, 1, 2.0)).unwrap();
    net.forward_prop(y).unwrap();
    assert_eq!(net.root_state(y), RootState::Built);
    assert_eq!(net.value(y).unwrap().as_slice(), &[6.0]);

    net.rename_node("y", "tripled").unwrap();
    assert_eq!(net.root_state(y), RootState::NotBuilt);
}

// ============================================================================
// 2. Recurrent loops
// ============================================================================

/// `x(t) = in(t) + 0.5 * x(t - 1)`, built as X -> Delay -> Y -> X.
fn three_node_loop() -> (Network, [cadence_core::NodeId; 4]) {
    let mut net = Network::new();
    let input = net.add_input("in", 1).unwrap();
    let x = net.add_compute("x", Plus, &[input, input]).unwrap();
    let d = net.add_delay("d", Delay::past(1, 1, 0.0), x).unwrap();
    let y = net.add_compute("y", Scale(0.5), &[d]).unwrap();
    net.set_inputs("x", &[input, y]).unwrap();
    (net, [input, x, d, y])
}

#[test]
fn delay_cycle_forms_one_forward_loop() {
    let (mut net, [input, x, d, y]) = three_node_loop();

    let analysis = net.loop_analysis(x).unwrap();
    assert_eq!(analysis.loops().len(), 1);
    let unit = &analysis.loops()[0];
    assert_eq!(unit.members.len(), 3);
    assert_eq!(unit.members[0], d);
    assert_eq!(unit.source, d);
    assert_eq!(unit.direction, StepDirection::Forward);
    assert_eq!(unit.direction.sign(), 1);
    assert!(analysis.same_loop(x, y));
    assert!(analysis.loop_of(input).is_none());

    let forward = net.forward_order(x).unwrap();
    assert_eq!(forward.segments().len(), 2);
    assert!(matches!(&forward.segments()[0], Segment::Par(nodes) if nodes == &vec![input]));
    let Segment::Seq(seq) = &forward.segments()[1] else {
        panic!("expected a sequential segment");
    };
    assert_eq!(seq.members, vec![d, y, x]);

    let backward = net.backward_order(x).unwrap();
    let Segment::Seq(back) = &backward.segments()[0] else {
        panic!("expected a sequential segment first");
    };
    assert_eq!(back.members, vec![x, y, d]);
    assert_eq!(back.direction, StepDirection::Backward);
}

#[test]
fn delay_cycle_evaluates_step_by_step() {
    let (mut net, [input, x, _, _]) = three_node_loop();
    net.set_layout(MinibatchLayout::new(1, 4));
    net.set_value(input, Matrix::filled(1, 4, 1.0)).unwrap();
    net.forward_prop(x).unwrap();

    assert_slice_approx(net.value(x).unwrap().as_slice(), &[1.0, 1.5, 1.75, 1.875]);
}

#[test]
fn recurrent_network_matches_hand_computed_gradients() {
    // h(t) = W x(t) + U h(t - 1), loss = sum_t h(t)
    let mut net = Network::new();
    let w = net.add_parameter("W", 1, 1).unwrap();
    let u = net.add_parameter("U", 1, 1).unwrap();
    let x = net.add_input("x", 1).unwrap();
    let wx = net.add_compute("Wx", Times, &[w, x]).unwrap();
    let h = net.add_compute("h", Plus, &[wx, wx]).unwrap();
    let prev = net.add_delay("h.prev", Delay::past(1, 1, 0.0), h).unwrap();
    let uh = net.add_compute("Uh", Times, &[u, prev]).unwrap();
    net.set_inputs("h", &[wx, uh]).unwrap();
    let loss = net.add_compute("loss", ReduceSum, &[h]).unwrap();
    net.add_to_group(Group::Criterion, loss).unwrap();
    net.set_keep_value(h, true).unwrap();

    net.set_layout(MinibatchLayout::new(1, 3));
    net.set_value(w, Matrix::filled(1, 1, 2.0)).unwrap();
    net.set_value(u, Matrix::filled(1, 1, 0.5)).unwrap();
    net.set_value(x, Matrix::from_vec(1, 3, vec![1.0, 0.0, 1.0]).unwrap())
        .unwrap();

    net.allocate_gradients(loss).unwrap();
    net.forward_prop(loss).unwrap();

    // h = [2, 1, 2.5]
    assert_slice_approx(net.value(h).unwrap().as_slice(), &[2.0, 1.0, 2.5]);
    assert!(approx(net.value(loss).unwrap().get(0, 0), 5.5));

    net.backprop(loss).unwrap();

    // dL/dh = [1.75, 1.5, 1]
    // dW = sum_t dh(t) x(t) = 1.75 + 1 = 2.75
    // dU = sum_t dh(t) h(t - 1) = 1.5 * 2 + 1 * 1 = 4
    assert!(approx(net.gradient(w).unwrap().get(0, 0), 2.75));
    assert!(approx(net.gradient(u).unwrap().get(0, 0), 4.0));
    assert!(net.gradient(x).is_none());
}

#[test]
fn future_delay_loop_matches_hand_computed_gradients() {
    // h(t) = W x(t) + U h(t + 1), loss = sum_t h(t)
    let mut net = Network::new();
    let w = net.add_parameter("W", 1, 1).unwrap();
    let u = net.add_parameter("U", 1, 1).unwrap();
    let x = net.add_input("x", 1).unwrap();
    let wx = net.add_compute("Wx", Times, &[w, x]).unwrap();
    let h = net.add_compute("h", Plus, &[wx, wx]).unwrap();
    let next = net.add_delay("h.next", Delay::future(1, 1, 0.0), h).unwrap();
    let uh = net.add_compute("Uh", Times, &[u, next]).unwrap();
    net.set_inputs("h", &[wx, uh]).unwrap();
    let loss = net.add_compute("loss", ReduceSum, &[h]).unwrap();
    net.add_to_group(Group::Criterion, loss).unwrap();
    net.set_keep_value(h, true).unwrap();

    net.set_layout(MinibatchLayout::new(1, 3));
    net.set_value(w, Matrix::filled(1, 1, 2.0)).unwrap();
    net.set_value(u, Matrix::filled(1, 1, 0.5)).unwrap();
    net.set_value(x, Matrix::from_vec(1, 3, vec![1.0, 0.0, 1.0]).unwrap())
        .unwrap();

    let analysis = net.loop_analysis(loss).unwrap();
    assert_eq!(analysis.loops().len(), 1);
    assert_eq!(analysis.loops()[0].direction, StepDirection::Backward);

    net.allocate_gradients(loss).unwrap();
    net.forward_prop(loss).unwrap();

    // h = [2.5, 1, 2]
    assert_slice_approx(net.value(h).unwrap().as_slice(), &[2.5, 1.0, 2.0]);
    assert!(approx(net.value(loss).unwrap().get(0, 0), 5.5));

    net.backprop(loss).unwrap();

    // dL/dh = [1, 1.5, 1.75]
    // dW = sum_t dh(t) x(t) = 1 + 1.75 = 2.75
    // dU = sum_t dh(t) h(t + 1) = 1 * 1 + 1.5 * 2 = 4
    assert!(approx(net.gradient(w).unwrap().get(0, 0), 2.75));
    assert!(approx(net.gradient(u).unwrap().get(0, 0), 4.0));
}

#[test]
fn parallel_sequences_restart_at_sequence_boundaries() {
    let (mut net, [input, x, _, _]) = three_node_loop();
    // Two sequences, two steps each; frames are time-major.
    net.set_layout(MinibatchLayout::new(2, 2));
    net.set_value(input, Matrix::from_vec(1, 4, vec![1.0, 2.0, 1.0, 2.0]).unwrap())
        .unwrap();
    net.forward_prop(x).unwrap();

    // seq 0: 1, 1 + 0.5; seq 1: 2, 2 + 1
    assert_slice_approx(net.value(x).unwrap().as_slice(), &[1.0, 2.0, 1.5, 3.0]);
}

// ============================================================================
// 3. Caching and invalidation
// ============================================================================

#[test]
fn building_twice_reuses_plans_without_revalidating() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut net = Network::new();
    let x = net.add_input("x", 2).unwrap();
    let id = net
        .add_compute("id", CountingInfer(Arc::clone(&calls)), &[x])
        .unwrap();

    net.build_and_validate(id).unwrap();
    let first = net.forward_order(id).unwrap();
    let validated = calls.load(Ordering::SeqCst);
    assert!(validated > 0);

    net.build_and_validate(id).unwrap();
    let second = net.forward_order(id).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), validated);

    net.rename_node("id", "identity").unwrap();
    net.build_and_validate(id).unwrap();
    let third = net.forward_order(id).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert!(calls.load(Ordering::SeqCst) > validated);
}

#[test]
fn structural_edit_forces_recomputation() {
    let mut net = Network::new();
    let a = net.add_input("a", 1).unwrap();
    let b = net.add_input("b", 1).unwrap();
    let s = net.add_compute("s", Scale(2.0), &[a]).unwrap();
    net.set_value(a, Matrix::filled(1, 1, 1.0)).unwrap();
    net.set_value(b, Matrix::filled(1, 1, 5.0)).unwrap();

    net.forward_prop(s).unwrap();
    assert_eq!(net.value(s).unwrap().as_slice(), &[2.0]);

    net.set_inputs("s", &[b]).unwrap();
    assert!(!net.is_built(s));
    net.forward_prop(s).unwrap();
    assert_eq!(net.value(s).unwrap().as_slice(), &[10.0]);

    // New leaf data alone also reaches the output.
    net.set_value(b, Matrix::filled(1, 1, -1.0)).unwrap();
    net.forward_prop(s).unwrap();
    assert_eq!(net.value(s).unwrap().as_slice(), &[-2.0]);
}

#[test]
fn removed_input_fails_validation_until_rewired() {
    let mut net = Network::new();
    let a = net.add_input("a", 1).unwrap();
    let b = net.add_input("b", 1).unwrap();
    let sum = net.add_compute("sum", Plus, &[a, b]).unwrap();
    net.build_and_validate(sum).unwrap();

    net.remove_node("b").unwrap();
    assert!(net.try_find_node("b").is_none());
    assert!(matches!(
        net.build_and_validate(sum),
        Err(GraphError::InputCount { expected: 2, found: 1, .. })
    ));

    net.set_inputs("sum", &[a, a]).unwrap();
    net.build_and_validate(sum).unwrap();
}

// ============================================================================
// 4. Names
// ============================================================================

#[test]
fn names_are_unique_and_case_insensitive() {
    let mut net = Network::new();
    let w = net.add_parameter("Layer1.W", 2, 2).unwrap();
    let b = net.add_parameter("Layer1.b", 2, 1).unwrap();
    let out = net.add_input("Output.x", 2).unwrap();

    let dup = net.add_parameter("layer1.w", 1, 1);
    assert!(matches!(dup, Err(GraphError::DuplicateName(_))));
    assert_eq!(net.node_count(), 3);

    assert_eq!(net.find_node("LAYER1.W").unwrap(), w);
    assert!(matches!(net.find_node("missing"), Err(GraphError::NotFound(_))));

    assert_eq!(net.find_nodes("layer1.*"), vec![w, b]);
    assert_eq!(net.find_nodes("*.x"), vec![out]);
    assert_eq!(net.find_nodes("*"), vec![w, b, out]);
    assert_eq!(net.find_nodes("Layer1.b"), vec![b]);
    assert!(net.find_nodes("layer2.*").is_empty());
    assert!(net.find_nodes("*1*").is_empty());

    assert!(matches!(
        net.rename_node("Layer1.b", "LAYER1.w"),
        Err(GraphError::DuplicateName(_))
    ));
    net.rename_node("Layer1.b", "Layer1.bias").unwrap();
    assert_eq!(net.find_node("layer1.BIAS").unwrap(), b);
}

// ============================================================================
// 5. Rejected graphs
// ============================================================================

#[test]
fn cycle_through_pairing_node_is_fatal_unless_traversed() {
    let build = |pairing| {
        let mut net = Network::with_options(EngineOptions {
            pairing,
            ..EngineOptions::default()
        });
        let input = net.add_input("in", 1).unwrap();
        let x = net.add_compute("x", Plus, &[input, input]).unwrap();
        let d = net.add_delay("d", Delay::past(1, 1, 0.0), x).unwrap();
        let p = net.add_compute("pair", Scale(0.5), &[d]).unwrap();
        net.add_to_group(Group::Pair, p).unwrap();
        net.set_inputs("x", &[input, p]).unwrap();
        (net, x)
    };

    let (mut net, x) = build(PairingPolicy::SkipDuringDiscovery);
    assert!(net.loop_analysis(x).unwrap().loops().is_empty());
    let err = net.build_and_validate(x).unwrap_err();
    assert!(matches!(err, GraphError::FatalGraph(_)));
    assert!(!net.is_built(x));

    let (mut net, x) = build(PairingPolicy::Traverse);
    net.build_and_validate(x).unwrap();
    assert_eq!(net.loop_analysis(x).unwrap().loops().len(), 1);
}

#[test]
fn loop_mixing_past_and_future_is_fatal() {
    let mut net = Network::new();
    let x = net.add_input("seed", 1).unwrap();
    let h = net.add_compute("h", Plus, &[x, x]).unwrap();
    let past = net.add_delay("past", Delay::past(1, 1, 0.0), h).unwrap();
    let future = net.add_delay("future", Delay::future(1, 1, 0.0), h).unwrap();
    net.set_inputs("h", &[past, future]).unwrap();

    let err = net.build_and_validate(h).unwrap_err();
    assert!(matches!(err, GraphError::FatalGraph(ref msg) if msg.contains("mixes step directions")));
}

#[test]
fn cycle_without_delay_is_fatal() {
    let mut net = Network::new();
    let x = net.add_input("x", 1).unwrap();
    let a = net.add_compute("a", Plus, &[x, x]).unwrap();
    let b = net.add_compute("b", Scale(2.0), &[a]).unwrap();
    net.set_inputs("a", &[x, b]).unwrap();

    assert!(matches!(
        net.build_and_validate(b),
        Err(GraphError::FatalGraph(_))
    ));
}

#[test]
fn zero_delay_offset_is_rejected() {
    assert!(matches!(
        Delay::new(0, 1, 0.0),
        Err(GraphError::InvalidArgument(_))
    ));
}
