//! A reference evaluator for program graphs, used to check that rewrites
//! preserve results. Enabled by the `verification` feature.
//!
//! The evaluator is a straightforward walk of the node list: tensors are
//! materialized eagerly as `ndarray` arrays and loops are unrolled. It
//! panics on malformed graphs rather than reporting errors; it only ever
//! runs over graphs this crate's own transforms produce.

use crate::common::{ConvolutionDescriptor, Dtype};
use crate::expr::IndexMap;
use crate::graph::{Combiner, Graph, Node, NodeId, Op, SliceInfo, Type, ValueId};

use ndarray::{ArrayD, IxDyn, SliceInfoElem};
use num_traits::NumAssign;
use std::collections::HashMap;

/// A concrete tensor, discriminated by element type.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    Uint8(ArrayD<u8>),
    Sint32(ArrayD<i32>),
    Float32(ArrayD<f32>),
}

impl TensorValue {
    pub fn dtype(&self) -> Dtype {
        match self {
            TensorValue::Uint8(_) => Dtype::Uint8,
            TensorValue::Sint32(_) => Dtype::Sint32,
            TensorValue::Float32(_) => Dtype::Float32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorValue::Uint8(a) => a.shape(),
            TensorValue::Sint32(a) => a.shape(),
            TensorValue::Float32(a) => a.shape(),
        }
    }

    /// Element read with a widening conversion to the integer accumulator.
    fn scalar_i32(&self, idx: &[usize]) -> i32 {
        match self {
            TensorValue::Uint8(a) => i32::from(a[IxDyn(idx)]),
            TensorValue::Sint32(a) => a[IxDyn(idx)],
            TensorValue::Float32(_) => panic!("float operand under an integer combiner"),
        }
    }

    fn scalar_f32(&self, idx: &[usize]) -> f32 {
        match self {
            TensorValue::Uint8(a) => f32::from(a[IxDyn(idx)]),
            TensorValue::Sint32(a) => a[IxDyn(idx)] as f32,
            TensorValue::Float32(a) => a[IxDyn(idx)],
        }
    }

    fn reshaped(&self, shape: &[usize]) -> TensorValue {
        fn go<T: Clone>(a: &ArrayD<T>, shape: &[usize]) -> ArrayD<T> {
            a.as_standard_layout()
                .to_owned()
                .into_shape(IxDyn(shape))
                .expect("reshape changes the element count")
        }
        match self {
            TensorValue::Uint8(a) => TensorValue::Uint8(go(a, shape)),
            TensorValue::Sint32(a) => TensorValue::Sint32(go(a, shape)),
            TensorValue::Float32(a) => TensorValue::Float32(go(a, shape)),
        }
    }

    fn sliced(&self, elems: &[SliceInfoElem]) -> TensorValue {
        match self {
            TensorValue::Uint8(a) => TensorValue::Uint8(a.slice(elems).to_owned()),
            TensorValue::Sint32(a) => TensorValue::Sint32(a.slice(elems).to_owned()),
            TensorValue::Float32(a) => TensorValue::Float32(a.slice(elems).to_owned()),
        }
    }

    fn with_region_assigned(&self, elems: &[SliceInfoElem], value: &TensorValue) -> TensorValue {
        match (self, value) {
            (TensorValue::Uint8(d), TensorValue::Uint8(v)) => {
                let mut d = d.clone();
                d.slice_mut(elems).assign(v);
                TensorValue::Uint8(d)
            }
            (TensorValue::Sint32(d), TensorValue::Sint32(v)) => {
                let mut d = d.clone();
                d.slice_mut(elems).assign(v);
                TensorValue::Sint32(d)
            }
            (TensorValue::Float32(d), TensorValue::Float32(v)) => {
                let mut d = d.clone();
                d.slice_mut(elems).assign(v);
                TensorValue::Float32(d)
            }
            _ => panic!("element type mismatch in slice insertion"),
        }
    }

    fn zeros(shape: &[usize], dtype: Dtype) -> TensorValue {
        match dtype {
            Dtype::Uint8 => TensorValue::Uint8(ArrayD::zeros(IxDyn(shape))),
            Dtype::Sint32 => TensorValue::Sint32(ArrayD::zeros(IxDyn(shape))),
            Dtype::Float32 => TensorValue::Float32(ArrayD::zeros(IxDyn(shape))),
        }
    }
}

/// Evaluates `graph` over `inputs` (one value per graph input, in order) and
/// returns the graph's output values.
pub fn evaluate(graph: &Graph, inputs: &[TensorValue]) -> Vec<TensorValue> {
    assert_eq!(
        inputs.len(),
        graph.inputs.len(),
        "one input value per graph input"
    );
    let mut eval = Evaluator {
        graph,
        tensors: HashMap::new(),
        indices: HashMap::new(),
    };
    for (&v, value) in graph.inputs.iter().zip(inputs) {
        eval.tensors.insert(v, value.clone());
    }
    eval.run_block(&graph.top);
    graph
        .outputs
        .iter()
        .map(|&v| eval.tensor(v).clone())
        .collect()
}

struct Evaluator<'g> {
    graph: &'g Graph,
    tensors: HashMap<ValueId, TensorValue>,
    indices: HashMap<ValueId, i64>,
}

impl Evaluator<'_> {
    fn tensor(&self, v: ValueId) -> &TensorValue {
        self.tensors
            .get(&v)
            .unwrap_or_else(|| panic!("use of unevaluated value {:?}", v))
    }

    /// Runs a block; if it ends with a terminator, returns its operand
    /// values.
    fn run_block(&mut self, nodes: &[NodeId]) -> Option<Vec<TensorValue>> {
        for &id in nodes {
            let node = self.graph.node(id);
            if matches!(node.op, Op::Yield) {
                return Some(
                    node.operands
                        .iter()
                        .map(|&v| self.tensor(v).clone())
                        .collect(),
                );
            }
            self.eval_node(node);
        }
        None
    }

    fn eval_node(&mut self, node: &Node) {
        match &node.op {
            Op::Conv2d(desc) => {
                let input = self.tensor(node.operands[0]).clone();
                let filter = self.tensor(node.operands[1]).clone();
                let result = match self.tensor(node.operands[2]).clone() {
                    TensorValue::Sint32(mut out) => {
                        direct_conv(
                            desc,
                            |i| input.scalar_i32(i),
                            |i| filter.scalar_i32(i),
                            &mut out,
                        );
                        TensorValue::Sint32(out)
                    }
                    TensorValue::Float32(mut out) => {
                        direct_conv(
                            desc,
                            |i| input.scalar_f32(i),
                            |i| filter.scalar_f32(i),
                            &mut out,
                        );
                        TensorValue::Float32(out)
                    }
                    TensorValue::Uint8(_) => panic!("u8 accumulators are not supported"),
                };
                self.tensors.insert(node.results[0], result);
            }
            Op::Generic(gop) => {
                let a = self.tensor(node.operands[0]).clone();
                let b = self.tensor(node.operands[1]).clone();
                let extents: Vec<usize> = gop.extents.iter().map(|&e| e as usize).collect();
                let result = match (gop.combiner, self.tensor(node.operands[2]).clone()) {
                    (Combiner::MulAccInt, TensorValue::Sint32(mut out)) => {
                        accumulate(
                            &extents,
                            &gop.maps,
                            |i| a.scalar_i32(i),
                            |i| b.scalar_i32(i),
                            &mut out,
                        );
                        TensorValue::Sint32(out)
                    }
                    (Combiner::MulAccFloat, TensorValue::Float32(mut out)) => {
                        accumulate(
                            &extents,
                            &gop.maps,
                            |i| a.scalar_f32(i),
                            |i| b.scalar_f32(i),
                            &mut out,
                        );
                        TensorValue::Float32(out)
                    }
                    _ => panic!("combiner does not match the accumulator element type"),
                };
                self.tensors.insert(node.results[0], result);
            }
            Op::CollapseShape { .. } | Op::ExpandShape { .. } => {
                let shape = self.result_shape(node, 0);
                let reshaped = self.tensor(node.operands[0]).reshaped(&shape);
                self.tensors.insert(node.results[0], reshaped);
            }
            Op::For { lower, upper, step } => {
                let iv = node.induction_var();
                let carried_args: Vec<ValueId> = node.carried_args().to_vec();
                let mut current: Vec<TensorValue> = node
                    .operands
                    .iter()
                    .map(|&v| self.tensor(v).clone())
                    .collect();
                let mut i = *lower;
                while i < *upper {
                    self.indices.insert(iv, i);
                    for (&arg, value) in carried_args.iter().zip(&current) {
                        self.tensors.insert(arg, value.clone());
                    }
                    current = self
                        .run_block(&node.body)
                        .expect("loop body must end with a terminator");
                    i += step;
                }
                for (&r, value) in node.results.iter().zip(current) {
                    self.tensors.insert(r, value);
                }
            }
            Op::ExtractSlice(info) => {
                let elems = self.slice_elems(info, &node.operands[1..]);
                let tile = self.tensor(node.operands[0]).sliced(&elems);
                self.tensors.insert(node.results[0], tile);
            }
            Op::InsertSlice(info) => {
                let elems = self.slice_elems(info, &node.operands[2..]);
                let value = self.tensor(node.operands[0]).clone();
                let updated = self
                    .tensor(node.operands[1])
                    .with_region_assigned(&elems, &value);
                self.tensors.insert(node.results[0], updated);
            }
            Op::Pack => {
                // The packed layout is opaque at this level; evaluation keeps
                // the source contents.
                let packed = self.tensor(node.operands[0]).clone();
                self.tensors.insert(node.results[0], packed);
            }
            Op::Empty => {
                let shape = self.result_shape(node, 0);
                let dtype = match &self.graph.value(node.results[0]).ty {
                    Type::Tensor(t) => t.dtype,
                    Type::Index => panic!("buffer result must be a tensor"),
                };
                self.tensors
                    .insert(node.results[0], TensorValue::zeros(&shape, dtype));
            }
            Op::Yield => unreachable!("terminators are handled by run_block"),
        }
    }

    fn result_shape(&self, node: &Node, index: usize) -> Vec<usize> {
        self.graph
            .static_shape(node.results[index])
            .expect("result shape must be static")
            .iter()
            .map(|&d| d as usize)
            .collect()
    }

    fn slice_elems(&self, info: &SliceInfo, index_operands: &[ValueId]) -> Vec<SliceInfoElem> {
        let ivs: Vec<i64> = index_operands
            .iter()
            .map(|v| {
                *self
                    .indices
                    .get(v)
                    .unwrap_or_else(|| panic!("use of unbound index value {:?}", v))
            })
            .collect();
        info.offsets
            .iter()
            .zip(&info.sizes)
            .map(|(off, &size)| {
                let start = off.eval(&ivs) as isize;
                SliceInfoElem::Slice {
                    start,
                    end: Some(start + size as isize),
                    step: 1,
                }
            })
            .collect()
    }
}

fn direct_conv<T: NumAssign + Copy>(
    desc: &ConvolutionDescriptor,
    input: impl Fn(&[usize]) -> T,
    filter: impl Fn(&[usize]) -> T,
    out: &mut ArrayD<T>,
) {
    let (sh, sw) = (desc.strides.0 as usize, desc.strides.1 as usize);
    for n in 0..desc.batch as usize {
        for oc in 0..desc.out_channels as usize {
            for oh in 0..desc.out_height as usize {
                for ow in 0..desc.out_width as usize {
                    let mut acc = out[IxDyn(&[n, oc, oh, ow])];
                    for ic in 0..desc.in_channels as usize {
                        for fh in 0..desc.filter_height as usize {
                            for fw in 0..desc.filter_width as usize {
                                acc += input(&[n, ic, oh * sh + fh, ow * sw + fw])
                                    * filter(&[oc, ic, fh, fw]);
                            }
                        }
                    }
                    out[IxDyn(&[n, oc, oh, ow])] = acc;
                }
            }
        }
    }
}

/// Walks the iteration space in row-major order, reading both operands and
/// accumulating into the output through the access maps.
fn accumulate<T: NumAssign + Copy>(
    extents: &[usize],
    maps: &[IndexMap],
    a: impl Fn(&[usize]) -> T,
    b: impl Fn(&[usize]) -> T,
    out: &mut ArrayD<T>,
) {
    let total: usize = extents.iter().product();
    let mut coords = vec![0i64; extents.len()];
    for linear in 0..total {
        let mut rem = linear;
        for (d, &e) in extents.iter().enumerate().rev() {
            coords[d] = (rem % e) as i64;
            rem /= e;
        }
        let a_idx = eval_map(&maps[0], &coords);
        let b_idx = eval_map(&maps[1], &coords);
        let o_idx = eval_map(&maps[2], &coords);
        let prod = a(&a_idx) * b(&b_idx);
        out[IxDyn(&o_idx)] += prod;
    }
}

fn eval_map(map: &IndexMap, coords: &[i64]) -> Vec<usize> {
    map.iter().map(|e| e.eval(coords) as usize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BlockRef, TensorType};
    use crate::lowering::{add_conv, lower_conv};
    use proptest::prelude::*;

    fn iota_i32(shape: &[usize]) -> TensorValue {
        let len: usize = shape.iter().product();
        TensorValue::Sint32(
            ArrayD::from_shape_vec(IxDyn(shape), (0..len as i32).collect()).unwrap(),
        )
    }

    fn ones_i32(shape: &[usize]) -> TensorValue {
        TensorValue::Sint32(ArrayD::from_elem(IxDyn(shape), 1))
    }

    #[test]
    fn test_direct_convolution_against_hand_computation() {
        let desc = ConvolutionDescriptor {
            batch: 1,
            in_channels: 1,
            out_channels: 1,
            out_height: 2,
            out_width: 2,
            filter_height: 2,
            filter_width: 2,
            strides: (1, 1),
            dilations: (1, 1),
        };
        let mut g = Graph::new();
        add_conv(&mut g, &desc, Dtype::Sint32, Dtype::Sint32);
        let outputs = evaluate(
            &g,
            &[
                iota_i32(&[1, 1, 3, 3]),
                ones_i32(&[1, 1, 2, 2]),
                TensorValue::Sint32(ArrayD::zeros(IxDyn(&[1, 1, 2, 2]))),
            ],
        );
        let TensorValue::Sint32(out) = &outputs[0] else {
            panic!();
        };
        assert_eq!(
            out.iter().copied().collect::<Vec<_>>(),
            // Each output sums a 2x2 patch of 0..9.
            vec![8, 12, 20, 24]
        );
    }

    #[test]
    fn test_lowered_reduction_matches_named_convolution() {
        let desc = ConvolutionDescriptor {
            batch: 1,
            in_channels: 2,
            out_channels: 3,
            out_height: 4,
            out_width: 5,
            filter_height: 3,
            filter_width: 2,
            strides: (2, 1),
            dilations: (1, 1),
        };
        let mut g = Graph::new();
        let conv = add_conv(&mut g, &desc, Dtype::Uint8, Dtype::Sint32);
        let ishape: Vec<usize> = desc.input_shape().iter().map(|&d| d as usize).collect();
        let fshape: Vec<usize> = desc.filter_shape().iter().map(|&d| d as usize).collect();
        let oshape: Vec<usize> = desc.output_shape().iter().map(|&d| d as usize).collect();
        let ilen: usize = ishape.iter().product();
        let flen: usize = fshape.iter().product();
        let inputs = vec![
            TensorValue::Uint8(
                ArrayD::from_shape_vec(
                    IxDyn(&ishape),
                    (0..ilen).map(|i| (i % 11) as u8).collect(),
                )
                .unwrap(),
            ),
            TensorValue::Uint8(
                ArrayD::from_shape_vec(IxDyn(&fshape), (0..flen).map(|i| (i % 5) as u8).collect())
                    .unwrap(),
            ),
            TensorValue::Sint32(ArrayD::zeros(IxDyn(&oshape))),
        ];
        let before = evaluate(&g, &inputs);
        lower_conv(&mut g, BlockRef::Top, conv).unwrap();
        let after = evaluate(&g, &inputs);
        assert_eq!(before, after);
    }

    proptest! {
        // Collapsing the two trailing output dimensions and re-expanding
        // them is the identity for any output extent pair.
        #[test]
        fn test_collapse_expand_roundtrip(oh in 1u32..8, ow in 1u32..8) {
            let mut g = Graph::new();
            let input = g.add_input(TensorType::new(&[1, 2, oh, ow], Dtype::Sint32));
            let reassociation = vec![vec![0], vec![1], vec![2, 3]];
            let collapse = g.append(
                BlockRef::Top,
                Op::CollapseShape { reassociation: reassociation.clone() },
                &[input],
                vec![Type::Tensor(TensorType::new(&[1, 2, oh * ow], Dtype::Sint32))],
            );
            let collapsed = g.result(collapse, 0);
            let expand = g.append(
                BlockRef::Top,
                Op::ExpandShape { reassociation },
                &[collapsed],
                vec![Type::Tensor(TensorType::new(&[1, 2, oh, ow], Dtype::Sint32))],
            );
            g.outputs.push(g.result(expand, 0));

            let shape = [1usize, 2, oh as usize, ow as usize];
            let value = iota_i32(&shape);
            let outputs = evaluate(&g, &[value.clone()]);
            prop_assert_eq!(&outputs[0], &value);
        }
    }
}
