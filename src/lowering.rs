use crate::common::{ConvolutionDescriptor, Dtype};
use crate::expr::{IndexExpr, IndexMap};
use crate::graph::{
    BlockRef, Combiner, GenericOp, Graph, IterKind, NodeId, Op, TensorType, Type, ValueId,
};
use crate::rewrite::TransformError;

use log::debug;
use smallvec::smallvec;

/// Parameters of the strided window-to-pixel index mapping: a flattened
/// window index `w` maps to input row `⌊w/cols⌋·stride_h + d4` and column
/// `(w mod cols)·stride_w + d5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub cols: i64,
    pub stride_h: i64,
    pub stride_w: i64,
}

/// Builds the three access maps of a lowered convolution over the 6-variable
/// iteration space (d0..d5 = batch, out-channel, window, in-channel,
/// filter-row, filter-col), in operand order (input, filter, output).
pub fn conv_access_maps(params: WindowParams) -> [IndexMap; 3] {
    let WindowParams {
        cols,
        stride_h,
        stride_w,
    } = params;
    let input = vec![
        IndexExpr::dim(0),
        IndexExpr::dim(3),
        IndexExpr::dim(2).floor_div(cols) * stride_h + IndexExpr::dim(4),
        IndexExpr::dim(2).modulo(cols) * stride_w + IndexExpr::dim(5),
    ];
    let filter = vec![
        IndexExpr::dim(1),
        IndexExpr::dim(3),
        IndexExpr::dim(4),
        IndexExpr::dim(5),
    ];
    let output = vec![IndexExpr::dim(0), IndexExpr::dim(1), IndexExpr::dim(2)];
    [input, filter, output]
}

/// Recovers [WindowParams] from a lowered input access map. Returns `None`
/// for maps that are not in the shape produced by [conv_access_maps].
pub fn window_params(input_map: &IndexMap) -> Option<WindowParams> {
    fn split_scaled(e: &IndexExpr) -> (&IndexExpr, i64) {
        match e {
            IndexExpr::Mul(inner, c) => (inner, *c),
            other => (other, 1),
        }
    }

    let [d0, d3, row, col] = input_map.as_slice() else {
        return None;
    };
    if *d0 != IndexExpr::Dim(0) || *d3 != IndexExpr::Dim(3) {
        return None;
    }
    let (IndexExpr::Add(row_base, row_rem), IndexExpr::Add(col_base, col_rem)) = (row, col) else {
        return None;
    };
    if **row_rem != IndexExpr::Dim(4) || **col_rem != IndexExpr::Dim(5) {
        return None;
    }
    let (row_inner, stride_h) = split_scaled(row_base);
    let (col_inner, stride_w) = split_scaled(col_base);
    match (row_inner, col_inner) {
        (IndexExpr::FloorDiv(a, row_cols), IndexExpr::Mod(b, col_cols))
            if **a == IndexExpr::Dim(2) && **b == IndexExpr::Dim(2) && row_cols == col_cols =>
        {
            Some(WindowParams {
                cols: *row_cols,
                stride_h,
                stride_w,
            })
        }
        _ => None,
    }
}

/// Adds a named convolution with fresh graph inputs for its input, filter and
/// output initializer, registering the result as a graph output.
pub fn add_conv(
    graph: &mut Graph,
    desc: &ConvolutionDescriptor,
    operand_dtype: Dtype,
    acc_dtype: Dtype,
) -> NodeId {
    let input = graph.add_input(TensorType::new(&desc.input_shape(), operand_dtype));
    let filter = graph.add_input(TensorType::new(&desc.filter_shape(), operand_dtype));
    let init = graph.add_input(TensorType::new(&desc.output_shape(), acc_dtype));
    let out_ty = TensorType::new(&desc.output_shape(), acc_dtype);
    let conv = graph.append(
        BlockRef::Top,
        Op::Conv2d(*desc),
        &[input, filter, init],
        vec![Type::Tensor(out_ty)],
    );
    let result = graph.result(conv, 0);
    graph.outputs.push(result);
    conv
}

/// Rewrites a named convolution into an explicit parallel+reduction
/// computation over a window-flattened output.
///
/// Preconditions are checked before any mutation: input and filter shapes
/// must be fully static and the dilation all-ones. On success the original
/// convolution node is destroyed and every external use is redirected to the
/// re-expanded result; the returned handle is the new reduction node.
pub fn lower_conv(
    graph: &mut Graph,
    block: BlockRef,
    conv: NodeId,
) -> Result<NodeId, TransformError> {
    let node = graph.node(conv);
    let Op::Conv2d(desc) = node.op.clone() else {
        return Err(TransformError::TargetKind(
            "expected a conv2d node for lowering".into(),
        ));
    };
    debug_assert_eq!(node.operands.len(), 3);
    let input: ValueId = node.operands[0];
    let filter: ValueId = node.operands[1];
    let init: ValueId = node.operands[2];

    // Fail fast; nothing below may run unless all preconditions hold.
    if graph.static_shape(input).is_none() {
        return Err(TransformError::Shape(
            "expected a static shape for the input".into(),
        ));
    }
    if graph.static_shape(filter).is_none() {
        return Err(TransformError::Shape(
            "expected a static shape for the filter".into(),
        ));
    }
    if desc.dilations != (1, 1) {
        return Err(TransformError::UnsupportedFeature(
            "expected all ones for dilations".into(),
        ));
    }

    let dtype = graph
        .tensor_type(init)
        .map(|t| t.dtype)
        .unwrap_or(Dtype::Float32);
    let (n, oc, ohw) = (desc.batch, desc.out_channels, desc.window_count());
    let reassociation = vec![vec![0], vec![1], vec![2, 3]];
    let collapsed_ty = TensorType::new(&[n, oc, ohw], dtype);

    let collapse = graph.insert_before(
        block,
        conv,
        Op::CollapseShape {
            reassociation: reassociation.clone(),
        },
        &[init],
        vec![Type::Tensor(collapsed_ty.clone())],
    );
    let collapsed = graph.result(collapse, 0);

    let maps = conv_access_maps(WindowParams {
        cols: i64::from(desc.out_width),
        stride_h: i64::from(desc.strides.0),
        stride_w: i64::from(desc.strides.1),
    });
    let combiner = if dtype.is_integral() {
        Combiner::MulAccInt
    } else {
        Combiner::MulAccFloat
    };
    let generic = graph.insert_before(
        block,
        conv,
        Op::Generic(GenericOp {
            extents: smallvec![
                n,
                oc,
                ohw,
                desc.in_channels,
                desc.filter_height,
                desc.filter_width
            ],
            iterators: smallvec![
                IterKind::Parallel,
                IterKind::Parallel,
                IterKind::Parallel,
                IterKind::Reduction,
                IterKind::Reduction,
                IterKind::Reduction
            ],
            maps: maps.to_vec(),
            combiner,
        }),
        &[input, filter, collapsed],
        vec![Type::Tensor(collapsed_ty)],
    );
    let reduced = graph.result(generic, 0);

    let expand = graph.insert_before(
        block,
        conv,
        Op::ExpandShape { reassociation },
        &[reduced],
        vec![Type::Tensor(TensorType::new(&desc.output_shape(), dtype))],
    );
    let expanded = graph.result(expand, 0);

    // Construct, then redirect, then erase.
    let conv_result = graph.result(conv, 0);
    graph.replace_all_uses(conv_result, expanded);
    graph.erase_node(block, conv);

    debug!(
        "lowered convolution to reduction {:?} over extents {:?}",
        generic,
        graph.node(generic).tileable().map(|g| g.extents.clone())
    );
    Ok(generic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BlockRef;

    fn small_desc() -> ConvolutionDescriptor {
        ConvolutionDescriptor {
            batch: 1,
            in_channels: 4,
            out_channels: 4,
            out_height: 6,
            out_width: 6,
            filter_height: 3,
            filter_width: 3,
            strides: (1, 1),
            dilations: (1, 1),
        }
    }

    #[test]
    fn test_lowering_produces_six_dim_reduction() {
        let mut g = Graph::new();
        let conv = add_conv(&mut g, &small_desc(), Dtype::Float32, Dtype::Float32);
        let generic = lower_conv(&mut g, BlockRef::Top, conv).unwrap();
        assert!(!g.is_live(conv));
        let gop = g.node(generic).tileable().unwrap();
        assert_eq!(gop.extents.as_slice(), &[1, 4, 36, 4, 3, 3]);
        assert_eq!(
            gop.iterators.as_slice(),
            &[
                IterKind::Parallel,
                IterKind::Parallel,
                IterKind::Parallel,
                IterKind::Reduction,
                IterKind::Reduction,
                IterKind::Reduction
            ]
        );
        assert_eq!(gop.combiner, Combiner::MulAccFloat);
        // collapse, generic, expand
        assert_eq!(g.top.len(), 3);
    }

    #[test]
    fn test_integral_accumulator_selects_integer_combiner() {
        let mut g = Graph::new();
        let conv = add_conv(&mut g, &small_desc(), Dtype::Uint8, Dtype::Sint32);
        let generic = lower_conv(&mut g, BlockRef::Top, conv).unwrap();
        assert_eq!(
            g.node(generic).tileable().unwrap().combiner,
            Combiner::MulAccInt
        );
    }

    #[test]
    fn test_dilation_is_rejected_without_mutation() {
        let mut g = Graph::new();
        let mut desc = small_desc();
        desc.dilations = (2, 1);
        let conv = add_conv(&mut g, &desc, Dtype::Float32, Dtype::Float32);
        let err = lower_conv(&mut g, BlockRef::Top, conv).unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedFeature(_)));
        assert!(g.is_live(conv));
        assert_eq!(g.top.len(), 1);
    }

    #[test]
    fn test_dynamic_filter_is_rejected_without_mutation() {
        let mut g = Graph::new();
        let desc = small_desc();
        let input = g.add_input(TensorType::new(&desc.input_shape(), Dtype::Float32));
        let filter = g.add_input(TensorType::new_dynamic(4, Dtype::Float32));
        let init = g.add_input(TensorType::new(&desc.output_shape(), Dtype::Float32));
        let conv = g.append(
            BlockRef::Top,
            Op::Conv2d(desc),
            &[input, filter, init],
            vec![Type::Tensor(TensorType::new(
                &desc.output_shape(),
                Dtype::Float32,
            ))],
        );
        let err = lower_conv(&mut g, BlockRef::Top, conv).unwrap_err();
        assert!(matches!(err, TransformError::Shape(_)));
        assert!(g.is_live(conv));
        assert_eq!(g.top.len(), 1);
    }

    #[test]
    fn test_window_params_roundtrip() {
        let params = WindowParams {
            cols: 6,
            stride_h: 2,
            stride_w: 3,
        };
        let [input, _, _] = conv_access_maps(params);
        assert_eq!(window_params(&input), Some(params));

        // Unit strides fold the scale away; recovery must still work.
        let unit = WindowParams {
            cols: 4,
            stride_h: 1,
            stride_w: 1,
        };
        let [input, _, _] = conv_access_maps(unit);
        assert_eq!(window_params(&input), Some(unit));
    }
}
