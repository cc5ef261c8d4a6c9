use crate::graph::{BlockRef, Graph, NodeId};
use crate::interchange::interchange_innermost;
use crate::lowering::lower_conv;
use crate::planner::{plan_tiles, KernelShape, Schedule, Strategy};
use crate::tiling::two_level_tile;

use log::debug;

/// Errors surfaced by the rewrite pipeline and its stages.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// An operand shape is dynamic or otherwise unusable.
    #[error("shape error: {0}")]
    Shape(String),
    /// The operation uses a feature the rewrite does not handle.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    /// The targeted node is not of the kind the stage rewrites.
    #[error("wrong target kind: {0}")]
    TargetKind(String),
    /// A tile specification cannot be applied to the target.
    #[error("tiling failure: {0}")]
    TilingFailure(String),
    /// The graph does not have the structure a stage requires.
    #[error("structural invariant violated: {0}")]
    StructuralInvariant(String),
    /// A value does not have the type a stage requires.
    #[error("type error: {0}")]
    Type(String),
}

/// Handles published after a successful rewrite: the residual micro-kernel
/// computation and the surrounding loops, innermost first.
#[derive(Debug)]
pub struct TransformResult {
    pub kernel: NodeId,
    pub loops: Vec<NodeId>,
}

/// Rewrites a named convolution into a cache-blocked, two-tier tiled loop
/// nest following the supplied strategy.
///
/// The pipeline lowers the convolution to an explicit reduction, applies the
/// planned cache and micro-kernel tiles, and, for the input-stationary
/// schedule, exchanges the two micro-tier loops so the packed filter block
/// stays resident across windows. Uses of the original convolution result
/// are redirected stage by stage; the caller's other handles into the graph
/// remain valid.
///
/// Lowering failures leave the graph untouched. A failure in a later stage
/// leaves the graph in the documented state of that stage (see
/// [crate::tiling::two_level_tile] and
/// [crate::interchange::interchange_innermost]).
pub fn rewrite_conv(
    graph: &mut Graph,
    block: BlockRef,
    conv: NodeId,
    strategy: &Strategy,
    kernel_shape: &KernelShape,
) -> Result<TransformResult, TransformError> {
    let generic = lower_conv(graph, block, conv)?;
    let (outer_spec, inner_spec) = plan_tiles(strategy, kernel_shape);
    let tiled = two_level_tile(graph, block, generic, &outer_spec, &inner_spec)?;
    debug!(
        "tiled convolution under {:?}: {} loops, kernel {:?}",
        strategy.schedule,
        tiled.loops.len(),
        tiled.kernel
    );

    let mut kernel = tiled.kernel;
    let mut loops = tiled.loops;
    if strategy.schedule == Schedule::InputStationary {
        if tiled.micro_loops < 2 {
            return Err(TransformError::StructuralInvariant(format!(
                "input-stationary reordering needs two micro-kernel loops, found {}",
                tiled.micro_loops
            )));
        }
        let reordered =
            interchange_innermost(graph, tiled.micro_parent, loops[1], loops[0], kernel)?;
        kernel = reordered.kernel;
        loops[0] = reordered.inner;
        loops[1] = reordered.outer;
    }

    if log::log_enabled!(log::Level::Trace) {
        log::trace!("rewritten graph:\n{}", crate::pprint::pprint(graph));
    }
    Ok(TransformResult { kernel, loops })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ConvolutionDescriptor, Dtype};
    use crate::graph::Op;
    use crate::lowering::add_conv;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

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

    fn is_strategy() -> (Strategy, KernelShape) {
        (
            Strategy {
                schedule: Schedule::InputStationary,
                k2: 2,
                k3: 2,
                tile_c: 2,
            },
            KernelShape {
                num_filters: 2,
                num_windows: 6,
            },
        )
    }

    fn ws_strategy() -> (Strategy, KernelShape) {
        (
            Strategy {
                schedule: Schedule::WeightStationary,
                k2: 3,
                k3: 1,
                tile_c: 2,
            },
            KernelShape {
                num_filters: 2,
                num_windows: 6,
            },
        )
    }

    #[test]
    fn test_input_stationary_pipeline_reorders_micro_loops() {
        init_logging();
        let mut g = Graph::new();
        let conv = add_conv(&mut g, &small_desc(), Dtype::Float32, Dtype::Float32);
        let (strategy, kernel_shape) = is_strategy();
        let out = rewrite_conv(&mut g, BlockRef::Top, conv, &strategy, &kernel_shape).unwrap();
        assert_eq!(out.loops.len(), 4);
        assert!(g.node(out.kernel).tileable().is_some());

        // After reordering, the filter loop runs outside the window loop:
        // the innermost loop steps through windows.
        let Op::For { upper, step, .. } = g.node(out.loops[0]).op else {
            panic!();
        };
        assert_eq!((upper, step), (12, 6));
        let Op::For { upper, step, .. } = g.node(out.loops[1]).op else {
            panic!();
        };
        assert_eq!((upper, step), (4, 2));
        assert!(g.node(out.loops[1]).body.contains(&out.loops[0]));
        assert!(g.node(out.loops[0]).body.contains(&out.kernel));
    }

    #[test]
    fn test_weight_stationary_pipeline_keeps_micro_order() {
        init_logging();
        let mut g = Graph::new();
        let conv = add_conv(&mut g, &small_desc(), Dtype::Float32, Dtype::Float32);
        let (strategy, kernel_shape) = ws_strategy();
        let out = rewrite_conv(&mut g, BlockRef::Top, conv, &strategy, &kernel_shape).unwrap();
        // Outer tier: in-channel, out-channel and window loops; micro tier:
        // window only (the filter tile equals its extent).
        assert_eq!(out.loops.len(), 4);
        let Op::For { upper, step, .. } = g.node(out.loops[0]).op else {
            panic!();
        };
        assert_eq!((upper, step), (18, 6));
    }

    #[test]
    fn test_dilated_convolution_rejected_before_mutation() {
        let mut g = Graph::new();
        let mut desc = small_desc();
        desc.dilations = (2, 2);
        let conv = add_conv(&mut g, &desc, Dtype::Float32, Dtype::Float32);
        let (strategy, kernel_shape) = is_strategy();
        let err = rewrite_conv(&mut g, BlockRef::Top, conv, &strategy, &kernel_shape).unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedFeature(_)));
        assert!(g.is_live(conv));
        assert_eq!(g.top.len(), 1);
    }

    #[cfg(feature = "verification")]
    mod numeric {
        use super::*;
        use crate::interpret::{evaluate, TensorValue};
        use ndarray::ArrayD;

        fn cycling_u8(shape: &[usize]) -> TensorValue {
            let len: usize = shape.iter().product();
            TensorValue::Uint8(
                ArrayD::from_shape_vec(
                    ndarray::IxDyn(shape),
                    (0..len).map(|i| (i % 7) as u8).collect(),
                )
                .unwrap(),
            )
        }

        fn cycling_f32(shape: &[usize]) -> TensorValue {
            let len: usize = shape.iter().product();
            TensorValue::Float32(
                ArrayD::from_shape_vec(
                    ndarray::IxDyn(shape),
                    (0..len).map(|i| (i % 13) as f32 * 0.25 - 1.5).collect(),
                )
                .unwrap(),
            )
        }

        fn usized(shape: &[u32]) -> Vec<usize> {
            shape.iter().map(|&d| d as usize).collect()
        }

        fn assert_close(a: &TensorValue, b: &TensorValue) {
            match (a, b) {
                (TensorValue::Float32(a), TensorValue::Float32(b)) => {
                    assert_eq!(a.shape(), b.shape());
                    for (x, y) in a.iter().zip(b.iter()) {
                        assert!(
                            (x - y).abs() <= 1e-3 * y.abs().max(1.0),
                            "{} != {}",
                            x,
                            y
                        );
                    }
                }
                _ => assert_eq!(a, b),
            }
        }

        #[test]
        fn test_integer_results_match_exactly_for_both_schedules() {
            for (strategy, kernel_shape) in [is_strategy(), ws_strategy()] {
                let desc = small_desc();
                let mut g = Graph::new();
                let conv = add_conv(&mut g, &desc, Dtype::Uint8, Dtype::Sint32);
                let inputs = vec![
                    cycling_u8(&usized(&desc.input_shape())),
                    cycling_u8(&usized(&desc.filter_shape())),
                    TensorValue::Sint32(ArrayD::zeros(ndarray::IxDyn(&usized(
                        &desc.output_shape(),
                    )))),
                ];
                let before = evaluate(&g, &inputs);
                rewrite_conv(&mut g, BlockRef::Top, conv, &strategy, &kernel_shape).unwrap();
                let after = evaluate(&g, &inputs);
                assert_eq!(before, after, "schedule {:?}", strategy.schedule);
            }
        }

        #[test]
        fn test_float_results_match_within_tolerance() {
            for (strategy, kernel_shape) in [is_strategy(), ws_strategy()] {
                let desc = small_desc();
                let mut g = Graph::new();
                let conv = add_conv(&mut g, &desc, Dtype::Float32, Dtype::Float32);
                let inputs = vec![
                    cycling_f32(&usized(&desc.input_shape())),
                    cycling_f32(&usized(&desc.filter_shape())),
                    TensorValue::Float32(ArrayD::zeros(ndarray::IxDyn(&usized(
                        &desc.output_shape(),
                    )))),
                ];
                let before = evaluate(&g, &inputs);
                rewrite_conv(&mut g, BlockRef::Top, conv, &strategy, &kernel_shape).unwrap();
                let after = evaluate(&g, &inputs);
                for (a, b) in after.iter().zip(&before) {
                    assert_close(a, b);
                }
            }
        }

        #[test]
        fn test_strided_convolution_matches() {
            let mut desc = small_desc();
            desc.strides = (2, 2);
            let (strategy, kernel_shape) = is_strategy();
            let mut g = Graph::new();
            let conv = add_conv(&mut g, &desc, Dtype::Uint8, Dtype::Sint32);
            let inputs = vec![
                cycling_u8(&usized(&desc.input_shape())),
                cycling_u8(&usized(&desc.filter_shape())),
                TensorValue::Sint32(ArrayD::zeros(ndarray::IxDyn(&usized(
                    &desc.output_shape(),
                )))),
            ];
            let before = evaluate(&g, &inputs);
            rewrite_conv(&mut g, BlockRef::Top, conv, &strategy, &kernel_shape).unwrap();
            let after = evaluate(&g, &inputs);
            assert_eq!(before, after);
        }
    }
}
