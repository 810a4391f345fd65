//! Structural verification of a finished kernel.
//!
//! Checks that every block is terminated and reachable, that branch
//! targets exist, that each phi lists exactly the block's predecessors,
//! and that every register is defined once and only used after some
//! definition exists.

use std::collections::{BTreeSet, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;

use super::{BlockId, IntType, KIROp, Kernel, RegType, Terminator, Value};
use crate::diagnostic::Diagnostic;
use crate::span::Span;

/// Control-flow graph with one node per block; node `i` is block `bb{i}`.
pub fn control_flow_graph(kernel: &Kernel) -> DiGraph<BlockId, ()> {
    let mut graph = DiGraph::with_capacity(kernel.blocks.len(), kernel.blocks.len() * 2);
    for block in &kernel.blocks {
        graph.add_node(block.id);
    }
    let count = kernel.blocks.len();
    for block in &kernel.blocks {
        let succs: BTreeSet<BlockId> = block.successors().into_iter().collect();
        for succ in succs {
            if (succ.0 as usize) < count {
                graph.add_edge(node(block.id), node(succ), ());
            }
        }
    }
    graph
}

/// Whether the kernel contains any loop.
pub fn has_loops(kernel: &Kernel) -> bool {
    is_cyclic_directed(&control_flow_graph(kernel))
}

/// Predecessors of `block`, in block order.
pub fn predecessors(kernel: &Kernel, block: BlockId) -> Vec<BlockId> {
    let graph = control_flow_graph(kernel);
    let preds: BTreeSet<BlockId> = graph
        .neighbors_directed(node(block), Direction::Incoming)
        .map(|n| graph[n])
        .collect();
    preds.into_iter().collect()
}

fn node(id: BlockId) -> NodeIndex {
    NodeIndex::new(id.0 as usize)
}

fn error(message: String) -> Diagnostic {
    Diagnostic::error(message, Span::dummy())
}

pub fn verify(kernel: &Kernel) -> Result<(), Vec<Diagnostic>> {
    let mut errors = Vec::new();
    let count = kernel.blocks.len();

    for (i, block) in kernel.blocks.iter().enumerate() {
        if block.id.0 as usize != i {
            errors.push(error(format!("block at position {} has id {}", i, block.id)));
        }
        match &block.terminator {
            None => errors.push(
                error(format!("block {} ({}) has no terminator", block.id, block.name))
                    .with_help("every block must end in br, conditional br or ret".to_string()),
            ),
            Some(term) => {
                for succ in term.successors() {
                    if succ.0 as usize >= count {
                        errors.push(error(format!(
                            "block {} branches to missing block {}",
                            block.id, succ
                        )));
                    }
                }
                if let Terminator::CondBr {
                    cond: Value::Reg(r),
                    ..
                } = term
                {
                    if kernel.reg_types.get(r.0 as usize) != Some(&RegType::Int(IntType::I1)) {
                        errors.push(error(format!(
                            "branch condition {} in {} is not i1",
                            r, block.id
                        )));
                    }
                }
            }
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    let graph = control_flow_graph(kernel);

    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&graph, node(kernel.entry));
    while let Some(n) = dfs.next(&graph) {
        reachable.insert(graph[n]);
    }
    for block in &kernel.blocks {
        if !reachable.contains(&block.id) {
            errors.push(error(format!(
                "block {} ({}) is unreachable from {}",
                block.id, block.name, kernel.entry
            )));
        }
    }

    for block in &kernel.blocks {
        let preds: BTreeSet<BlockId> = graph
            .neighbors_directed(node(block.id), Direction::Incoming)
            .map(|n| graph[n])
            .collect();
        let mut seen_non_phi = false;
        for op in &block.ops {
            match op {
                KIROp::Phi { dst, incoming, .. } => {
                    if seen_non_phi {
                        errors.push(error(format!(
                            "phi {} in {} follows a non-phi instruction",
                            dst, block.id
                        )));
                    }
                    let listed: BTreeSet<BlockId> = incoming.iter().map(|(_, b)| *b).collect();
                    if listed != preds || listed.len() != incoming.len() {
                        errors.push(error(format!(
                            "phi {} in {} lists {:?}, predecessors are {:?}",
                            dst, block.id, listed, preds
                        )));
                    }
                }
                _ => seen_non_phi = true,
            }
        }
    }

    let mut defined = HashSet::new();
    for op in kernel.ops() {
        if let Some(dst) = op.def() {
            if (dst.0 as usize) >= kernel.reg_count() {
                errors.push(error(format!("{} has no register metadata", dst)));
            }
            if !defined.insert(dst) {
                errors.push(error(format!("{} is defined more than once", dst)));
            }
        }
    }
    for block in &kernel.blocks {
        for op in &block.ops {
            for used in op.uses() {
                if !defined.contains(&used) {
                    errors.push(error(format!(
                        "{} is used in {} but never defined",
                        used, block.id
                    )));
                }
            }
            if let KIROp::Load { array, .. } | KIROp::Store { array, .. } = op {
                if kernel.param(array).is_none() {
                    errors.push(error(format!(
                        "{} accesses unknown parameter '{}'",
                        block.id, array
                    )));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
