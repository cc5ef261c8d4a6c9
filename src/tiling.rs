use crate::common::{DimSize, Shape};
use crate::expr::IndexExpr;
use crate::graph::{
    BlockRef, GenericOp, Graph, NodeId, Op, SliceInfo, TensorType, Type, ValueId,
};
use crate::lowering::{conv_access_maps, window_params, WindowParams};
use crate::planner::TileSpec;
use crate::rewrite::TransformError;

use log::debug;
use smallvec::{smallvec, SmallVec};

/// The flattened-window dimension of the lowered iteration space.
const WINDOW_DIM: usize = 2;

/// Result of one tiling application: the residual tiled computation and the
/// produced loops, innermost first.
#[derive(Debug)]
pub struct TileOutcome {
    pub body: NodeId,
    pub loops: Vec<NodeId>,
}

/// Result of the two-level application: the micro-kernel computation and all
/// loops, innermost first (inner tier before outer tier).
#[derive(Debug)]
pub struct TwoLevelOutcome {
    pub kernel: NodeId,
    pub loops: Vec<NodeId>,
    /// How many of the leading `loops` belong to the micro-kernel tier.
    pub micro_loops: usize,
    /// The block holding the outermost micro-tier loop.
    pub micro_parent: BlockRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Cache,
    Micro,
}

/// Applies a single [TileSpec] to a tileable target, producing counted loops
/// (nested per the interchange order) around a shrunken residual computation.
///
/// A tile size of 0 leaves the dimension untiled; a size equal to or larger
/// than the extent consumes the dimension inside the body without a loop. A
/// size that does not divide its extent, or a window tile that is neither a
/// multiple nor a divisor of the window-row width, fails with
/// [TransformError::TilingFailure].
pub fn tile(
    graph: &mut Graph,
    block: BlockRef,
    target: NodeId,
    spec: &TileSpec,
) -> Result<TileOutcome, TransformError> {
    tile_tier(graph, block, target, spec, Tier::Cache)
}

/// Applies the outer (cache) and inner (micro-kernel) tile specifications in
/// sequence. The inner tier additionally materializes the packed filter
/// working buffer; its loops carry (packed buffer, accumulator).
///
/// If the inner application fails after the outer succeeded, the graph is
/// left in the post-outer state; no rollback is attempted. Callers needing
/// atomicity should clone the graph first.
pub fn two_level_tile(
    graph: &mut Graph,
    block: BlockRef,
    target: NodeId,
    outer_spec: &TileSpec,
    inner_spec: &TileSpec,
) -> Result<TwoLevelOutcome, TransformError> {
    let outer = tile_tier(graph, block, target, outer_spec, Tier::Cache)?;
    let micro_parent = outer
        .loops
        .first()
        .map(|&l| BlockRef::Body(l))
        .unwrap_or(block);
    let inner = tile_tier(graph, micro_parent, outer.body, inner_spec, Tier::Micro)?;
    let micro_loops = inner.loops.len();
    let mut loops = inner.loops;
    loops.extend(outer.loops);
    debug!(
        "two-level tiling produced {} loops ({} micro)",
        loops.len(),
        micro_loops
    );
    Ok(TwoLevelOutcome {
        kernel: inner.body,
        loops,
        micro_loops,
        micro_parent,
    })
}

fn tile_tier(
    graph: &mut Graph,
    block: BlockRef,
    target: NodeId,
    spec: &TileSpec,
    tier: Tier,
) -> Result<TileOutcome, TransformError> {
    let target_node = graph.node(target);
    let Some(gop) = target_node.tileable() else {
        return Err(TransformError::TargetKind(
            "tiling target does not support iteration-space partitioning".into(),
        ));
    };
    let gop = gop.clone();
    debug_assert_eq!(target_node.operands.len(), 3);
    let input = target_node.operands[0];
    let filter = target_node.operands[1];
    let init = target_node.operands[2];
    let target_result = target_node.results[0];

    let wp = window_params(&gop.maps[0]).ok_or_else(|| {
        TransformError::TilingFailure("unrecognized window access pattern in target".into())
    })?;

    // Select the loop-producing dimensions, outermost first.
    let tiled = spec.tiled_dims();
    let mut seen = spec.interchange.clone();
    seen.sort_unstable();
    if !seen.iter().copied().eq(0..tiled.len()) {
        return Err(TransformError::TilingFailure(format!(
            "interchange {:?} is not a permutation of the {} tiled dimensions",
            spec.interchange,
            tiled.len()
        )));
    }
    struct LoopDim {
        dim: usize,
        size: DimSize,
    }
    let mut loop_dims: Vec<LoopDim> = Vec::new();
    for &j in &spec.interchange {
        let dim = tiled[j];
        let size = spec.sizes[dim];
        let extent = gop.extents[dim];
        if size >= extent {
            // Fully consumed within the body; no loop.
            continue;
        }
        if extent % size != 0 {
            return Err(TransformError::TilingFailure(format!(
                "tile size {} does not divide extent {} of dimension {}",
                size, extent, dim
            )));
        }
        if dim == WINDOW_DIM {
            let cols = wp.cols as DimSize;
            if size % cols != 0 && cols % size != 0 {
                return Err(TransformError::TilingFailure(format!(
                    "window tile {} is neither a multiple nor a divisor of row width {}",
                    size, cols
                )));
            }
        }
        loop_dims.push(LoopDim { dim, size });
    }

    if loop_dims.is_empty() {
        return Ok(TileOutcome {
            body: target,
            loops: vec![],
        });
    }

    let mut body_extents = gop.extents.clone();
    for ld in &loop_dims {
        body_extents[ld.dim] = ld.size;
    }

    let acc_dtype = graph
        .tensor_type(init)
        .map(|t| t.dtype)
        .expect("accumulator operand must be a tensor");
    let filter_dtype = graph
        .tensor_type(filter)
        .map(|t| t.dtype)
        .expect("filter operand must be a tensor");

    // Carried state: (packed filter buffer, accumulator) at the micro tier,
    // just the accumulator at the cache tier.
    let buf_ty = TensorType::new(
        &[
            body_extents[1],
            body_extents[3],
            body_extents[4],
            body_extents[5],
        ],
        filter_dtype,
    );
    let mut inits: SmallVec<[ValueId; 2]> = SmallVec::new();
    if tier == Tier::Micro {
        let empty = graph.insert_before(
            block,
            target,
            Op::Empty,
            &[],
            vec![Type::Tensor(buf_ty.clone())],
        );
        inits.push(graph.result(empty, 0));
    }
    inits.push(init);

    // Build the nest, outermost first, in front of the target.
    let mut loops: Vec<NodeId> = Vec::new();
    let mut cur_block = block;
    let mut carried: SmallVec<[ValueId; 2]> = inits;
    for ld in &loop_dims {
        let upper = i64::from(gop.extents[ld.dim]);
        let step = i64::from(ld.size);
        let l = if loops.is_empty() {
            graph.insert_for_before(cur_block, target, 0, upper, step, &carried)
        } else {
            graph.append_for(cur_block, 0, upper, step, &carried)
        };
        carried = graph.node(l).carried_args().iter().copied().collect();
        cur_block = BlockRef::Body(l);
        loops.push(l);
    }

    // Innermost body: operand slices, the residual computation, write-back.
    let ivs: Vec<ValueId> = loops
        .iter()
        .map(|&l| graph.node(l).induction_var())
        .collect();
    let mut dim_offset: Vec<IndexExpr> = (0..6).map(|_| IndexExpr::Const(0)).collect();
    for (k, ld) in loop_dims.iter().enumerate() {
        dim_offset[ld.dim] = IndexExpr::dim(k);
    }

    let acc_arg = *carried.last().expect("at least one carried slot");
    let acc_ty = graph.value(acc_arg).ty.clone();

    let out_offsets = vec![
        dim_offset[0].clone(),
        dim_offset[1].clone(),
        dim_offset[2].clone(),
    ];
    let out_sizes: Shape = smallvec![body_extents[0], body_extents[1], body_extents[2]];
    let out_tile_ty = TensorType::new(&out_sizes, acc_dtype);
    let mut extract_operands = vec![acc_arg];
    extract_operands.extend(&ivs);
    let out_tile = graph.append(
        cur_block,
        Op::ExtractSlice(SliceInfo {
            offsets: out_offsets.clone(),
            sizes: out_sizes.clone(),
        }),
        &extract_operands,
        vec![Type::Tensor(out_tile_ty.clone())],
    );

    // Spatial extents of the input slice depend on whether the window tile
    // covers whole output rows or stays within one.
    let tw = i64::from(body_extents[2]);
    let fh = i64::from(body_extents[4]);
    let fw = i64::from(body_extents[5]);
    let (rows_size, cols_size, body_cols) = if tw % wp.cols == 0 {
        (
            (tw / wp.cols - 1) * wp.stride_h + fh,
            (wp.cols - 1) * wp.stride_w + fw,
            wp.cols,
        )
    } else {
        (fh, (tw - 1) * wp.stride_w + fw, tw)
    };
    let in_offsets = vec![
        dim_offset[0].clone(),
        dim_offset[3].clone(),
        dim_offset[2].clone().floor_div(wp.cols) * wp.stride_h,
        dim_offset[2].clone().modulo(wp.cols) * wp.stride_w,
    ];
    let in_sizes: Shape = smallvec![
        body_extents[0],
        body_extents[3],
        rows_size as DimSize,
        cols_size as DimSize
    ];
    let in_tile_ty = TensorType::new(&in_sizes, graph.tensor_type(input).unwrap().dtype);
    let mut in_operands = vec![input];
    in_operands.extend(&ivs);
    let in_tile = graph.append(
        cur_block,
        Op::ExtractSlice(SliceInfo {
            offsets: in_offsets,
            sizes: in_sizes,
        }),
        &in_operands,
        vec![Type::Tensor(in_tile_ty)],
    );

    let f_offsets = vec![
        dim_offset[1].clone(),
        dim_offset[3].clone(),
        IndexExpr::Const(0),
        IndexExpr::Const(0),
    ];
    let f_sizes: Shape = smallvec![
        body_extents[1],
        body_extents[3],
        body_extents[4],
        body_extents[5]
    ];
    let mut f_operands = vec![filter];
    f_operands.extend(&ivs);
    let f_tile = graph.append(
        cur_block,
        Op::ExtractSlice(SliceInfo {
            offsets: f_offsets,
            sizes: f_sizes,
        }),
        &f_operands,
        vec![Type::Tensor(buf_ty.clone())],
    );

    let filter_val = match tier {
        Tier::Cache => graph.result(f_tile, 0),
        Tier::Micro => {
            let packed = graph.append(
                cur_block,
                Op::Pack,
                &[graph.result(f_tile, 0), carried[0]],
                vec![Type::Tensor(buf_ty)],
            );
            graph.result(packed, 0)
        }
    };

    let body_maps = conv_access_maps(WindowParams {
        cols: body_cols,
        stride_h: wp.stride_h,
        stride_w: wp.stride_w,
    });
    let tiled_body = graph.append(
        cur_block,
        Op::Generic(GenericOp {
            extents: body_extents,
            iterators: gop.iterators.clone(),
            maps: body_maps.to_vec(),
            combiner: gop.combiner,
        }),
        &[graph.result(in_tile, 0), filter_val, graph.result(out_tile, 0)],
        vec![Type::Tensor(out_tile_ty)],
    );

    let mut insert_operands = vec![graph.result(tiled_body, 0), acc_arg];
    insert_operands.extend(&ivs);
    let new_acc = graph.append(
        cur_block,
        Op::InsertSlice(SliceInfo {
            offsets: out_offsets,
            sizes: out_sizes,
        }),
        &insert_operands,
        vec![acc_ty],
    );

    let innermost_yield: SmallVec<[ValueId; 2]> = match tier {
        Tier::Cache => smallvec![graph.result(new_acc, 0)],
        Tier::Micro => smallvec![filter_val, graph.result(new_acc, 0)],
    };
    graph.append(cur_block, Op::Yield, &innermost_yield, vec![]);
    for pair in loops.windows(2) {
        let yielded: SmallVec<[ValueId; 2]> = graph.node(pair[1]).results.clone();
        graph.append(BlockRef::Body(pair[0]), Op::Yield, &yielded, vec![]);
    }

    // Construct, then redirect, then erase.
    let outermost = loops[0];
    let final_acc = graph.result(outermost, graph.node(outermost).results.len() - 1);
    graph.replace_all_uses(target_result, final_acc);
    graph.erase_node(block, target);

    loops.reverse();
    Ok(TileOutcome {
        body: tiled_body,
        loops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ConvolutionDescriptor, Dtype};
    use crate::lowering::{add_conv, lower_conv};
    use crate::planner::{plan_tiles, KernelShape, Schedule, Strategy};

    fn lowered_conv() -> (Graph, NodeId) {
        let desc = ConvolutionDescriptor {
            batch: 1,
            in_channels: 4,
            out_channels: 4,
            out_height: 6,
            out_width: 6,
            filter_height: 3,
            filter_width: 3,
            strides: (1, 1),
            dilations: (1, 1),
        };
        let mut g = Graph::new();
        let conv = add_conv(&mut g, &desc, Dtype::Float32, Dtype::Float32);
        let generic = lower_conv(&mut g, BlockRef::Top, conv).unwrap();
        (g, generic)
    }

    fn is_plan() -> (TileSpec, TileSpec) {
        // Outer sizes (1, 4, 12, 2, 0, 0): the out-channel tile equals its
        // extent, so the outer tier produces loops for in-channel and window
        // only; the inner tier tiles both out-channel and window.
        plan_tiles(
            &Strategy {
                schedule: Schedule::InputStationary,
                k2: 2,
                k3: 2,
                tile_c: 2,
            },
            &KernelShape {
                num_filters: 2,
                num_windows: 6,
            },
        )
    }

    #[test]
    fn test_two_level_structure() {
        let (mut g, generic) = lowered_conv();
        let (outer, inner) = is_plan();
        let out = two_level_tile(&mut g, BlockRef::Top, generic, &outer, &inner).unwrap();
        assert_eq!(out.loops.len(), 4);
        assert_eq!(out.micro_loops, 2);
        assert!(!g.is_live(generic));

        // Loops are reported innermost first.
        let innermost = g.node(out.loops[0]);
        assert!(innermost.is_loop());
        assert!(innermost.body.contains(&out.kernel));
        for pair in out.loops.windows(2) {
            assert!(g.node(pair[1]).body.contains(&pair[0]));
        }

        // Micro-tier loops carry (packed buffer, accumulator).
        assert_eq!(g.node(out.loops[0]).carried_args().len(), 2);
        assert_eq!(g.node(out.loops[1]).carried_args().len(), 2);
        assert_eq!(g.node(out.loops[2]).carried_args().len(), 1);

        let kernel = g.node(out.kernel).tileable().unwrap();
        assert_eq!(kernel.extents.as_slice(), &[1, 2, 6, 2, 3, 3]);

        // Pre-reorder micro nesting for input-stationary: window outside
        // out-channel, so the innermost loop steps by the filter count.
        let Op::For { upper, step, .. } = g.node(out.loops[0]).op else {
            panic!();
        };
        assert_eq!((upper, step), (4, 2));
        let Op::For { upper, step, .. } = g.node(out.loops[1]).op else {
            panic!();
        };
        assert_eq!((upper, step), (12, 6));
    }

    #[test]
    fn test_exactly_one_packing_write_per_micro_body() {
        let (mut g, generic) = lowered_conv();
        let (outer, inner) = is_plan();
        let out = two_level_tile(&mut g, BlockRef::Top, generic, &outer, &inner).unwrap();
        let packs = g
            .node(out.loops[0])
            .body
            .iter()
            .filter(|&&n| matches!(g.node(n).op, Op::Pack))
            .count();
        assert_eq!(packs, 1);
    }

    #[test]
    fn test_non_tileable_target_is_rejected() {
        let (mut g, generic) = lowered_conv();
        let filter = g.node(generic).operands[1];
        let stray = g.append(
            BlockRef::Top,
            Op::Pack,
            &[filter, filter],
            vec![g.value(filter).ty.clone()],
        );
        let (outer, _) = is_plan();
        let err = tile(&mut g, BlockRef::Top, stray, &outer).unwrap_err();
        assert!(matches!(err, TransformError::TargetKind(_)));
    }

    #[test]
    fn test_indivisible_tile_size_fails() {
        let (mut g, generic) = lowered_conv();
        let (mut outer, _) = is_plan();
        outer.sizes[3] = 3; // 3 does not divide 4 input channels
        let err = tile(&mut g, BlockRef::Top, generic, &outer).unwrap_err();
        assert!(matches!(err, TransformError::TilingFailure(_)));
    }

    #[test]
    fn test_window_incompatible_tile_fails() {
        let (mut g, generic) = lowered_conv();
        let (mut outer, _) = is_plan();
        outer.sizes[2] = 4; // divides 36 but is neither multiple nor divisor of 6
        let err = tile(&mut g, BlockRef::Top, generic, &outer).unwrap_err();
        assert!(matches!(err, TransformError::TilingFailure(_)));
    }

    #[test]
    fn test_inner_failure_leaves_post_outer_state() {
        let (mut g, generic) = lowered_conv();
        let (outer, mut inner) = is_plan();
        inner.sizes[2] = 4; // infeasible at the micro tier
        let err = two_level_tile(&mut g, BlockRef::Top, generic, &outer, &inner).unwrap_err();
        assert!(matches!(err, TransformError::TilingFailure(_)));
        // The outer tier already rewrote the graph: the lowered reduction is
        // gone and cache-tier loops remain.
        assert!(g
            .top
            .iter()
            .any(|&n| g.node(n).is_loop()));
    }

    #[test]
    fn test_full_extent_sizes_produce_no_loops() {
        let (mut g, generic) = lowered_conv();
        let spec = TileSpec {
            sizes: [1, 4, 36, 4, 0, 0],
            interchange: smallvec::smallvec![0, 1, 2, 3],
        };
        let before = g.live_node_count();
        let out = tile(&mut g, BlockRef::Top, generic, &spec).unwrap();
        assert!(out.loops.is_empty());
        assert_eq!(out.body, generic);
        assert_eq!(g.live_node_count(), before);
    }
}
