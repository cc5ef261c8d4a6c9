use crate::common::{ConvolutionDescriptor, DimSize, Dtype, Shape};
use crate::expr::{IndexExpr, IndexMap};

use smallvec::SmallVec;
use std::collections::HashMap;

/// Stable handle to a node in a [Graph]'s arena.
///
/// Handles stay valid across mutation; erased nodes leave a tombstone behind
/// so that stale handles fail loudly instead of aliasing a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Stable handle to an SSA value: a graph input, a node result, or a block
/// argument of a counted loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    /// Per-dimension extents; `None` marks a dynamic dimension.
    pub shape: SmallVec<[Option<DimSize>; 4]>,
    pub dtype: Dtype,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Tensor(TensorType),
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Def {
    Input(usize),
    Result { node: NodeId, index: usize },
    BlockArg { node: NodeId, index: usize },
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub def: Def,
    pub ty: Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterKind {
    Parallel,
    Reduction,
}

/// Scalar combiner of a [Op::Generic] body. Chosen from the accumulator dtype
/// at lowering time: integer multiply/add for integral accumulators, float
/// otherwise. Operands are converted to the accumulator dtype with a
/// sign-extending conversion before combining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combiner {
    MulAccInt,
    MulAccFloat,
}

/// An explicit parallel+reduction computation over a static iteration space.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericOp {
    pub extents: SmallVec<[DimSize; 6]>,
    pub iterators: SmallVec<[IterKind; 6]>,
    /// One access map per operand, in operand order (input, filter, output).
    pub maps: Vec<IndexMap>,
    pub combiner: Combiner,
}

/// Offsets/sizes of a rectangular slice. Offset expressions refer to the
/// node's index operands: `Dim(k)` is the k-th operand after the slice
/// sources.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceInfo {
    pub offsets: Vec<IndexExpr>,
    pub sizes: Shape,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// A named direct convolution; operands are (input, filter, output init).
    Conv2d(ConvolutionDescriptor),
    Generic(GenericOp),
    /// Merges consecutive result dimensions; operand dims listed per group.
    CollapseShape { reassociation: Vec<Vec<usize>> },
    /// Splits dimensions back; the result type carries the expanded shape.
    ExpandShape { reassociation: Vec<Vec<usize>> },
    /// A counted loop. Operands are the carried-state initializers; block
    /// args are the induction variable followed by one arg per carried slot.
    For { lower: i64, upper: i64, step: i64 },
    /// Operands: (source, index operands...). One result, the extracted tile.
    ExtractSlice(SliceInfo),
    /// Operands: (value, destination, index operands...). One result, the
    /// updated destination.
    InsertSlice(SliceInfo),
    /// The packing write: rearranges a data slice into a working buffer.
    /// Operands: (source slice, destination buffer); result is the updated
    /// buffer.
    Pack,
    /// A fresh, uninitialized working buffer of the result type's shape.
    Empty,
    /// Loop terminator; operands are the values carried to the next
    /// iteration (and, on the last one, the loop's results).
    Yield,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub operands: SmallVec<[ValueId; 4]>,
    pub results: SmallVec<[ValueId; 2]>,
    /// Block arguments, populated for [Op::For] only.
    pub args: SmallVec<[ValueId; 3]>,
    /// Nested nodes, populated for [Op::For] only.
    pub body: Vec<NodeId>,
}

/// Explicit insertion context: the block a mutation targets. Never stored;
/// always passed to the operation that needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Top,
    Body(NodeId),
}

/// An arena-backed program graph.
///
/// Mutation follows a strict three-phase protocol: construct replacement
/// nodes, redirect every use with [Graph::replace_all_uses], then erase the
/// originals with [Graph::erase_node]. Handles into erased nodes panic on
/// access rather than dangle.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    values: Vec<ValueData>,
    nodes: Vec<Option<Node>>,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub top: Vec<NodeId>,
}

impl TensorType {
    pub fn new(shape: &[DimSize], dtype: Dtype) -> TensorType {
        TensorType {
            shape: shape.iter().map(|&d| Some(d)).collect(),
            dtype,
        }
    }

    /// A tensor type whose every dimension is dynamic.
    pub fn new_dynamic(rank: usize, dtype: Dtype) -> TensorType {
        TensorType {
            shape: (0..rank).map(|_| None).collect(),
            dtype,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn static_shape(&self) -> Option<Shape> {
        self.shape.iter().copied().collect()
    }
}

impl Node {
    /// The tiling-capability probe: nodes that can be partitioned into
    /// counted loops plus a residual body expose their iteration space here.
    pub fn tileable(&self) -> Option<&GenericOp> {
        match &self.op {
            Op::Generic(g) => Some(g),
            _ => None,
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.op, Op::For { .. })
    }

    /// The loop's induction variable. Panics on non-loop nodes.
    pub fn induction_var(&self) -> ValueId {
        debug_assert!(self.is_loop());
        self.args[0]
    }

    /// The loop's carried-state block arguments.
    pub fn carried_args(&self) -> &[ValueId] {
        debug_assert!(self.is_loop());
        &self.args[1..]
    }
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn add_input(&mut self, ty: TensorType) -> ValueId {
        let idx = self.inputs.len();
        let v = self.new_value(Def::Input(idx), Type::Tensor(ty));
        self.inputs.push(v);
        v
    }

    pub fn value(&self, v: ValueId) -> &ValueData {
        &self.values[v.0]
    }

    pub fn tensor_type(&self, v: ValueId) -> Option<&TensorType> {
        match &self.value(v).ty {
            Type::Tensor(t) => Some(t),
            Type::Index => None,
        }
    }

    /// The fully static shape of a tensor value, if it has one.
    pub fn static_shape(&self, v: ValueId) -> Option<Shape> {
        self.tensor_type(v).and_then(TensorType::static_shape)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("access to erased node {:?}", id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("access to erased node {:?}", id))
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.nodes[id.0].is_some()
    }

    pub fn live_node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn result(&self, id: NodeId, index: usize) -> ValueId {
        self.node(id).results[index]
    }

    pub fn block(&self, block: BlockRef) -> &[NodeId] {
        match block {
            BlockRef::Top => &self.top,
            BlockRef::Body(n) => &self.node(n).body,
        }
    }

    fn block_mut(&mut self, block: BlockRef) -> &mut Vec<NodeId> {
        match block {
            BlockRef::Top => &mut self.top,
            BlockRef::Body(n) => &mut self.node_mut(n).body,
        }
    }

    /// Appends a node at the end of `block`.
    pub fn append(
        &mut self,
        block: BlockRef,
        op: Op,
        operands: &[ValueId],
        result_tys: Vec<Type>,
    ) -> NodeId {
        let id = self.create_node(op, operands, result_tys);
        self.block_mut(block).push(id);
        id
    }

    /// Inserts a node into `block` immediately before `anchor`.
    pub fn insert_before(
        &mut self,
        block: BlockRef,
        anchor: NodeId,
        op: Op,
        operands: &[ValueId],
        result_tys: Vec<Type>,
    ) -> NodeId {
        let id = self.create_node(op, operands, result_tys);
        let nodes = self.block_mut(block);
        let pos = nodes
            .iter()
            .position(|&n| n == anchor)
            .unwrap_or_else(|| panic!("{:?} is not in the target block", anchor));
        nodes.insert(pos, id);
        id
    }

    /// Creates a counted loop before `anchor`. Results and carried block args
    /// mirror the types of `inits`; block arg 0 is the induction variable.
    pub fn insert_for_before(
        &mut self,
        block: BlockRef,
        anchor: NodeId,
        lower: i64,
        upper: i64,
        step: i64,
        inits: &[ValueId],
    ) -> NodeId {
        let id = self.insert_before(
            block,
            anchor,
            Op::For { lower, upper, step },
            inits,
            inits.iter().map(|&v| self.value(v).ty.clone()).collect(),
        );
        self.add_loop_args(id, inits);
        id
    }

    /// Creates a counted loop at the end of `block`.
    pub fn append_for(
        &mut self,
        block: BlockRef,
        lower: i64,
        upper: i64,
        step: i64,
        inits: &[ValueId],
    ) -> NodeId {
        let id = self.append(
            block,
            Op::For { lower, upper, step },
            inits,
            inits.iter().map(|&v| self.value(v).ty.clone()).collect(),
        );
        self.add_loop_args(id, inits);
        id
    }

    /// Redirects every use of `old` (operands and graph outputs) to `new`.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for slot in &mut self.nodes {
            if let Some(node) = slot {
                for operand in &mut node.operands {
                    if *operand == old {
                        *operand = new;
                    }
                }
            }
        }
        for out in &mut self.outputs {
            if *out == old {
                *out = new;
            }
        }
    }

    /// Erases a node and, recursively, its body. The node must already be
    /// unused; the caller is responsible for redirecting uses first.
    pub fn erase_node(&mut self, block: BlockRef, id: NodeId) {
        let nodes = self.block_mut(block);
        let pos = nodes
            .iter()
            .position(|&n| n == id)
            .unwrap_or_else(|| panic!("{:?} is not in the target block", id));
        nodes.remove(pos);
        self.erase_subtree(id);
    }

    /// Clones `src` (recursively, for loops) to the end of `dst`, remapping
    /// operands through `subst`. Results and block args of the clone are
    /// recorded in `subst`, cloned node ids in `remap`, so later clones see
    /// already-remapped values.
    pub fn clone_node_into(
        &mut self,
        dst: BlockRef,
        src: NodeId,
        subst: &mut HashMap<ValueId, ValueId>,
        remap: &mut HashMap<NodeId, NodeId>,
    ) -> NodeId {
        let src_node = self.node(src).clone();
        let operands: Vec<ValueId> = src_node
            .operands
            .iter()
            .map(|v| *subst.get(v).unwrap_or(v))
            .collect();
        let result_tys = src_node
            .results
            .iter()
            .map(|&r| self.value(r).ty.clone())
            .collect();
        let new_id = self.append(dst, src_node.op.clone(), &operands, result_tys);
        remap.insert(src, new_id);
        let new_results = self.node(new_id).results.clone();
        for (&old, &new) in src_node.results.iter().zip(&new_results) {
            subst.insert(old, new);
        }
        if src_node.is_loop() {
            self.add_loop_args(new_id, &operands[..]);
            let new_args = self.node(new_id).args.clone();
            for (&old, &new) in src_node.args.iter().zip(&new_args) {
                subst.insert(old, new);
            }
            for child in src_node.body {
                self.clone_node_into(BlockRef::Body(new_id), child, subst, remap);
            }
        }
        new_id
    }

    fn new_value(&mut self, def: Def, ty: Type) -> ValueId {
        let v = ValueId(self.values.len());
        self.values.push(ValueData { def, ty });
        v
    }

    fn create_node(&mut self, op: Op, operands: &[ValueId], result_tys: Vec<Type>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(Node {
            op,
            operands: operands.iter().copied().collect(),
            results: SmallVec::new(),
            args: SmallVec::new(),
            body: Vec::new(),
        }));
        for (index, ty) in result_tys.into_iter().enumerate() {
            let v = self.new_value(Def::Result { node: id, index }, ty);
            self.node_mut(id).results.push(v);
        }
        id
    }

    fn add_loop_args(&mut self, id: NodeId, inits: &[ValueId]) {
        let iv = self.new_value(Def::BlockArg { node: id, index: 0 }, Type::Index);
        self.node_mut(id).args.push(iv);
        for (i, &init) in inits.iter().enumerate() {
            let ty = self.value(init).ty.clone();
            let arg = self.new_value(
                Def::BlockArg {
                    node: id,
                    index: i + 1,
                },
                ty,
            );
            self.node_mut(id).args.push(arg);
        }
    }

    fn erase_subtree(&mut self, id: NodeId) {
        let body = std::mem::take(&mut self.node_mut(id).body);
        for child in body {
            self.erase_subtree(child);
        }
        self.nodes[id.0] = None;
    }
}
