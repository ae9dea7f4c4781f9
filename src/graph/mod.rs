//! Computation graphs: topological linearization of a tensor DAG, gradient
//! graph synthesis, and the parallel executor.

mod backward;
mod executor;
mod forward;

use crate::core::arena::Context;
use crate::core::tensor::{Op, TensorId};
use crate::error::{Error, Result};

/// Capacity bound on `nodes` and on `leafs`.
pub const MAX_NODES: usize = 4096;

/// An executable linearization of a tensor DAG.
///
/// `nodes` lists every tensor with an op (or a gradient link), parents
/// before children; `leafs` lists plain inputs and constants. `grads` runs
/// parallel to `nodes`.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub(crate) nodes: Vec<TensorId>,
    pub(crate) grads: Vec<Option<TensorId>>,
    pub(crate) leafs: Vec<TensorId>,

    /// Worker count for `compute`. Must be at least 1.
    pub n_threads: usize,

    pub(crate) work: Option<TensorId>,
    pub(crate) work_size: usize,

    pub(crate) perf_runs: u32,
    pub(crate) perf_time_us: u64,
}

impl Graph {
    /// Linearize the DAG rooted at `root` (depth-first parent visit; the
    /// root comes out last).
    pub fn build_forward(ctx: &Context, root: TensorId) -> Result<Graph> {
        let mut graph = Graph {
            n_threads: 1,
            ..Graph::default()
        };
        graph.visit_parents(ctx, root)?;
        if !graph.nodes.is_empty() {
            // the last added node is always the starting point
            debug_assert_eq!(graph.nodes.last(), Some(&root));
        }
        Ok(graph)
    }

    /// Add the DAG rooted at `tensor` to an existing graph, skipping
    /// already-visited tensors.
    pub fn build_forward_expand(&mut self, ctx: &Context, tensor: TensorId) -> Result<()> {
        self.visit_parents(ctx, tensor)
    }

    fn visit_parents(&mut self, ctx: &Context, node: TensorId) -> Result<()> {
        if self.nodes.contains(&node) || self.leafs.contains(&node) {
            return Ok(());
        }

        let t = ctx.tensor(node);
        let (src0, src1, opt) = (t.src0, t.src1, t.opt);
        if let Some(s) = src0 {
            self.visit_parents(ctx, s)?;
        }
        if let Some(s) = src1 {
            self.visit_parents(ctx, s)?;
        }
        for s in opt.into_iter().flatten() {
            self.visit_parents(ctx, s)?;
        }

        let t = ctx.tensor(node);
        if t.op == Op::None && t.grad.is_none() {
            // plain input or constant, not part of the gradient graph
            if self.leafs.len() >= MAX_NODES {
                return Err(Error::GraphCapacity(MAX_NODES));
            }
            self.leafs.push(node);
        } else {
            if self.nodes.len() >= MAX_NODES {
                return Err(Error::GraphCapacity(MAX_NODES));
            }
            self.nodes.push(node);
            self.grads.push(t.grad);
        }
        Ok(())
    }

    /// Synthesize the gradient graph: walk `nodes` in reverse accumulating
    /// each node's adjoints, then materialize every parameter's gradient
    /// computation into a copy of this graph.
    ///
    /// With `keep` the gradient tensors are first detached (duplicated) so
    /// that in-place accumulation in the backward graph cannot corrupt this
    /// one.
    pub fn build_backward(&mut self, ctx: &mut Context, keep: bool) -> Result<Graph> {
        assert!(!self.nodes.is_empty());

        let mut result = self.clone();

        if keep {
            for i in 0..self.nodes.len() {
                let id = self.nodes[i];
                if ctx.tensor(id).grad.is_some() {
                    let detached = ctx.dup_tensor(id)?;
                    ctx.tensor_mut(id).grad = Some(detached);
                    self.grads[i] = Some(detached);
                }
            }
        }

        for i in (0..self.nodes.len()).rev() {
            let id = self.nodes[i];
            // detached gradients tolerate in-place accumulation
            if ctx.tensor(id).grad.is_some() {
                backward::compute_backward(ctx, id, keep)?;
            }
        }

        for i in (0..self.nodes.len()).rev() {
            let id = self.nodes[i];
            if ctx.tensor(id).is_param {
                let grad = ctx.tensor(id).grad.expect("params always carry a gradient");
                result.build_forward_expand(ctx, grad)?;
            }
        }

        Ok(result)
    }

    /// Zero every gradient tensor recorded in this graph.
    pub fn reset(&self, ctx: &mut Context) {
        for grad in self.grads.iter().flatten() {
            ctx.set_zero(*grad);
        }
    }

    pub fn nodes(&self) -> &[TensorId] {
        &self.nodes
    }

    pub fn leafs(&self) -> &[TensorId] {
        &self.leafs
    }

    pub fn grads(&self) -> &[Option<TensorId>] {
        &self.grads
    }

    pub fn perf_runs(&self) -> u32 {
        self.perf_runs
    }

    pub fn perf_time_us(&self) -> u64 {
        self.perf_time_us
    }

    /// True when `node` is listed in this graph.
    pub fn find(&self, node: TensorId) -> bool {
        self.nodes.contains(&node)
    }

    /// The node whose gradient tensor is `node`, if any.
    pub fn get_parent(&self, ctx: &Context, node: TensorId) -> Option<TensorId> {
        self.nodes
            .iter()
            .copied()
            .find(|&p| ctx.tensor(p).grad == Some(node))
    }
}
