use crate::graph::{BlockRef, Graph, NodeId, Op, Type, ValueId};
use crate::rewrite::TransformError;

use log::debug;
use std::collections::HashMap;

/// Handles produced by [interchange_innermost]: the regenerated micro-kernel
/// and the two new loops.
#[derive(Debug, Clone, Copy)]
pub struct ReorderOutcome {
    pub kernel: NodeId,
    pub outer: NodeId,
    pub inner: NodeId,
}

/// Exchanges the nesting of two adjacent counted loops: `l0` (the outer) and
/// `l1` (its immediate inner). Required for the input-stationary schedule,
/// whose reuse pattern needs the opposite nesting from what cache-tile order
/// produces.
///
/// The new outer loop iterates `l1`'s bounds while carrying `l0`'s initial
/// state; the new inner loop iterates `l0`'s bounds carrying the outer's
/// freshly bound state. Every non-terminator instruction is duplicated under
/// a substitution that swaps the induction variables and threads the carried
/// slots through, then uses are redirected and the old loops destroyed.
///
/// All structural preconditions — both nodes simple counted loops with two
/// carried slots, exactly one packing write in `l1`'s body, shaped carried
/// values — are validated against the source before any node is created, so
/// a failure leaves the graph untouched.
pub fn interchange_innermost(
    graph: &mut Graph,
    parent: BlockRef,
    l0: NodeId,
    l1: NodeId,
    kernel: NodeId,
) -> Result<ReorderOutcome, TransformError> {
    validate(graph, l0, l1)?;

    let l0_node = graph.node(l0).clone();
    let l1_node = graph.node(l1).clone();
    let (Op::For {
        lower: lo0,
        upper: up0,
        step: st0,
    }, Op::For {
        lower: lo1,
        upper: up1,
        step: st1,
    }) = (&l0_node.op, &l1_node.op)
    else {
        unreachable!("validated as counted loops");
    };
    let l1_pos = l0_node
        .body
        .iter()
        .position(|&n| n == l1)
        .expect("validated as nested");
    let l0_yield = *l0_node.body.last().expect("validated as terminated");
    let l1_yield = *l1_node.body.last().expect("validated as terminated");

    let mut subst: HashMap<ValueId, ValueId> = HashMap::new();
    let mut remap: HashMap<NodeId, NodeId> = HashMap::new();

    // New outer loop: l1's bounds, l0's initial carried state.
    let no = graph.insert_for_before(parent, l0, *lo1, *up1, *st1, &l0_node.operands);
    subst.insert(l1_node.induction_var(), graph.node(no).induction_var());
    for (&old, &new) in l0_node
        .carried_args()
        .iter()
        .zip(graph.node(no).carried_args())
    {
        subst.insert(old, new);
    }

    // Instructions of l0's body ahead of l1 move into the new outer loop.
    for &n in &l0_node.body[..l1_pos] {
        graph.clone_node_into(BlockRef::Body(no), n, &mut subst, &mut remap);
    }

    // New inner loop: l0's bounds, carrying the outer's fresh state.
    let no_carried: Vec<ValueId> = graph.node(no).carried_args().to_vec();
    let ni = graph.append_for(BlockRef::Body(no), *lo0, *up0, *st0, &no_carried);
    subst.insert(l0_node.induction_var(), graph.node(ni).induction_var());
    for (&old, &new) in l1_node
        .carried_args()
        .iter()
        .zip(graph.node(ni).carried_args())
    {
        subst.insert(old, new);
    }

    // Duplicate l1's body under the substitution; each clone's results feed
    // the substitution so later clones see remapped operands.
    for &n in &l1_node.body[..l1_node.body.len() - 1] {
        graph.clone_node_into(BlockRef::Body(ni), n, &mut subst, &mut remap);
    }

    // Terminate the inner loop with the remapped packed-buffer and carried
    // values of l1's original yield.
    let ni_yield: Vec<ValueId> = graph
        .node(l1_yield)
        .operands
        .iter()
        .map(|v| *subst.get(v).unwrap_or(v))
        .collect();
    graph.append(BlockRef::Body(ni), Op::Yield, &ni_yield, vec![]);
    for (&old, &new) in l1_node.results.iter().zip(&graph.node(ni).results.clone()) {
        subst.insert(old, new);
    }

    // Remaining l0 instructions (after l1, excluding the terminator), then
    // terminate the outer loop by yielding the inner loop's result.
    for &n in &l0_node.body[l1_pos + 1..l0_node.body.len() - 1] {
        graph.clone_node_into(BlockRef::Body(no), n, &mut subst, &mut remap);
    }
    let no_yield: Vec<ValueId> = graph
        .node(l0_yield)
        .operands
        .iter()
        .map(|v| *subst.get(v).unwrap_or(v))
        .collect();
    graph.append(BlockRef::Body(no), Op::Yield, &no_yield, vec![]);

    // Redirect external uses, then destroy the old pair.
    let no_results = graph.node(no).results.clone();
    for (&old, &new) in l0_node.results.iter().zip(&no_results) {
        graph.replace_all_uses(old, new);
    }
    graph.erase_node(parent, l0);

    let kernel = remap.get(&kernel).copied().unwrap_or(kernel);
    debug!(
        "interchanged loops {:?}/{:?} into {:?}/{:?}",
        l0, l1, no, ni
    );
    Ok(ReorderOutcome {
        kernel,
        outer: no,
        inner: ni,
    })
}

fn validate(graph: &Graph, l0: NodeId, l1: NodeId) -> Result<(), TransformError> {
    let l0_node = graph.node(l0);
    let l1_node = graph.node(l1);
    if !l0_node.is_loop() || !l1_node.is_loop() {
        return Err(TransformError::StructuralInvariant(
            "interchange targets must be simple counted loops".into(),
        ));
    }
    if !l0_node.body.contains(&l1) {
        return Err(TransformError::StructuralInvariant(
            "inner loop is not nested in the outer loop".into(),
        ));
    }
    if l0_node.carried_args().len() != 2 || l1_node.carried_args().len() != 2 {
        return Err(TransformError::StructuralInvariant(
            "interchange expects two carried state slots per loop".into(),
        ));
    }
    for node in [l0_node, l1_node] {
        match node.body.last() {
            Some(&last) if matches!(graph.node(last).op, Op::Yield) => {}
            _ => {
                return Err(TransformError::StructuralInvariant(
                    "loop body is not terminated by a yield".into(),
                ));
            }
        }
    }

    let packs = l1_node
        .body
        .iter()
        .filter(|&&n| matches!(graph.node(n).op, Op::Pack))
        .count();
    if packs != 1 {
        return Err(TransformError::StructuralInvariant(format!(
            "expected exactly one packing write in the inner loop body, found {}",
            packs
        )));
    }

    for &arg in l1_node.carried_args() {
        if !matches!(graph.value(arg).ty, Type::Tensor(_)) {
            return Err(TransformError::Type(
                "carried packing-buffer and input values must be shaped".into(),
            ));
        }
    }
    Ok(())
}
