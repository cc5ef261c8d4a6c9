//! Textual rendering of program graphs for logs and test failure output.

use crate::graph::{BlockRef, Graph, NodeId, Op, TensorType, Type, ValueId};

use itertools::Itertools;
use std::collections::HashMap;
use std::fmt::Write;

/// Renders the whole graph, one node per line, loop bodies indented.
pub fn pprint(graph: &Graph) -> String {
    let mut printer = Printer {
        graph,
        names: HashMap::new(),
        next: 0,
    };
    let mut out = String::new();
    let params = graph
        .inputs
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let name = format!("%arg{}", i);
            printer.names.insert(v, name.clone());
            format!("{}: {}", name, type_str(&graph.value(v).ty))
        })
        .join(", ");
    let _ = writeln!(out, "graph({}) {{", params);
    printer.block(&mut out, graph.block(BlockRef::Top), 1);
    let results = graph.outputs.iter().map(|&v| printer.name(v)).join(", ");
    let _ = writeln!(out, "  output {}", results);
    out.push('}');
    out
}

struct Printer<'g> {
    graph: &'g Graph,
    names: HashMap<ValueId, String>,
    next: usize,
}

impl Printer<'_> {
    fn name(&mut self, v: ValueId) -> String {
        if let Some(name) = self.names.get(&v) {
            return name.clone();
        }
        let name = format!("%{}", self.next);
        self.next += 1;
        self.names.insert(v, name.clone());
        name
    }

    fn block(&mut self, out: &mut String, nodes: &[NodeId], depth: usize) {
        for &id in nodes {
            self.node(out, id, depth);
        }
    }

    fn node(&mut self, out: &mut String, id: NodeId, depth: usize) {
        let node = self.graph.node(id);
        let indent = "  ".repeat(depth);
        let results = node
            .results
            .iter()
            .map(|&r| self.name(r))
            .collect::<Vec<_>>();
        let lhs = if results.is_empty() {
            String::new()
        } else {
            format!("{} = ", results.join(", "))
        };
        let operands = node
            .operands
            .iter()
            .map(|&v| self.name(v))
            .collect::<Vec<_>>();

        match &node.op {
            Op::For { lower, upper, step } => {
                let iv = self.name(node.induction_var());
                let carried = node
                    .carried_args()
                    .iter()
                    .zip(&operands)
                    .map(|(&arg, init)| format!("{} = {}", self.name(arg), init))
                    .join(", ");
                let _ = writeln!(
                    out,
                    "{}{}for {} in {}..{} step {} carry({}) {{",
                    indent, lhs, iv, lower, upper, step, carried
                );
                let body = node.body.clone();
                self.block(out, &body, depth + 1);
                let _ = writeln!(out, "{}}}", indent);
            }
            op => {
                let _ = writeln!(
                    out,
                    "{}{}{} {}{}",
                    indent,
                    lhs,
                    mnemonic(op),
                    operands.join(", "),
                    attributes(op)
                );
            }
        }
    }
}

fn mnemonic(op: &Op) -> &'static str {
    match op {
        Op::Conv2d(_) => "conv2d",
        Op::Generic(_) => "generic",
        Op::CollapseShape { .. } => "collapse_shape",
        Op::ExpandShape { .. } => "expand_shape",
        Op::For { .. } => "for",
        Op::ExtractSlice(_) => "extract_slice",
        Op::InsertSlice(_) => "insert_slice",
        Op::Pack => "pack",
        Op::Empty => "empty",
        Op::Yield => "yield",
    }
}

fn attributes(op: &Op) -> String {
    match op {
        Op::Generic(g) => format!(
            " extents [{}] maps [{}]",
            g.extents.iter().join(", "),
            g.maps
                .iter()
                .map(|m| format!("({})", m.iter().join(", ")))
                .join(", ")
        ),
        Op::ExtractSlice(info) | Op::InsertSlice(info) => format!(
            " offsets [{}] sizes [{}]",
            info.offsets.iter().join(", "),
            info.sizes.iter().join(", ")
        ),
        _ => String::new(),
    }
}

fn type_str(ty: &Type) -> String {
    match ty {
        Type::Tensor(TensorType { shape, dtype }) => {
            let dims = shape
                .iter()
                .map(|d| match d {
                    Some(d) => d.to_string(),
                    None => "?".to_string(),
                })
                .join("x");
            format!("tensor<{}x{}>", dims, dtype)
        }
        Type::Index => "index".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ConvolutionDescriptor, Dtype};
    use crate::lowering::{add_conv, lower_conv};

    #[test]
    fn test_rendering_shows_loops_and_slices() {
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
        let text = pprint(&g);
        assert!(text.contains("conv2d %arg0, %arg1, %arg2"));
        assert!(text.contains("tensor<1x4x8x8xf32>"));

        lower_conv(&mut g, BlockRef::Top, conv).unwrap();
        let text = pprint(&g);
        assert!(text.contains("collapse_shape"));
        assert!(text.contains("generic"));
        assert!(text.contains("expand_shape"));
        assert!(text.contains("extents [1, 4, 36, 4, 3, 3]"));
    }
}
