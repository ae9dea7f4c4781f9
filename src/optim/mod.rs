//! Gradient-based optimizers driving the graph executor: Adam and L-BFGS
//! with a backtracking line search.

mod adam;
mod lbfgs;

use crate::core::arena::Context;
use crate::core::tensor::TensorId;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::viz;

pub use lbfgs::Linesearch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptResult {
    Converged,
    DidNotConverge,
}

/// Reasons a backtracking line search can give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinesearchError {
    InvalidParameters,
    MinimumStep,
    MaximumStep,
    MaximumIterations,
    Fail,
}

#[derive(Debug, Clone)]
pub struct AdamParams {
    pub n_iter: usize,
    pub alpha: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    /// stop when `|fx - fx_prev| / fx` falls below this
    pub eps_f: f32,
    pub eps_g: f32,
}

#[derive(Debug, Clone)]
pub struct LbfgsParams {
    /// number of correction pairs kept
    pub m: usize,
    /// 0 means no iteration cap
    pub n_iter: usize,
    pub max_linesearch: usize,
    pub eps: f32,
    pub ftol: f32,
    pub wolfe: f32,
    pub min_step: f32,
    pub max_step: f32,
    pub linesearch: Linesearch,
}

#[derive(Debug, Clone)]
pub enum OptKind {
    Adam(AdamParams),
    Lbfgs(LbfgsParams),
}

#[derive(Debug, Clone)]
pub struct OptParams {
    pub n_threads: usize,
    /// window of past function values for the delta convergence test
    /// (0 disables it)
    pub past: usize,
    pub delta: f32,
    /// consecutive non-improving iterations tolerated (0 disables)
    pub max_no_improvement: usize,
    pub print_forward_graph: bool,
    pub print_backward_graph: bool,
    pub kind: OptKind,
}

impl OptParams {
    pub fn default_adam() -> Self {
        Self {
            n_threads: 1,
            past: 0,
            delta: 1e-5,
            max_no_improvement: 100,
            print_forward_graph: false,
            print_backward_graph: false,
            kind: OptKind::Adam(AdamParams {
                n_iter: 10000,
                alpha: 0.001,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                eps_f: 1e-5,
                eps_g: 1e-3,
            }),
        }
    }

    pub fn default_lbfgs() -> Self {
        Self {
            n_threads: 1,
            past: 0,
            delta: 1e-5,
            max_no_improvement: 0,
            print_forward_graph: false,
            print_backward_graph: false,
            kind: OptKind::Lbfgs(LbfgsParams {
                m: 6,
                n_iter: 100,
                max_linesearch: 20,
                eps: 1e-5,
                ftol: 1e-4,
                wolfe: 0.9,
                min_step: 1e-20,
                max_step: 1e20,
                linesearch: Linesearch::StrongWolfe,
            }),
        }
    }
}

/// Minimize the scalar tensor `f` over every parameter reachable from it.
///
/// Builds the forward and backward graphs, then runs the configured
/// optimizer; the same context holds the graphs and all optimizer-visible
/// tensors.
pub fn opt(ctx: &mut Context, params: OptParams, f: TensorId) -> Result<OptResult> {
    let mut gf = Graph::build_forward(ctx, f)?;
    let mut gb = gf.build_backward(ctx, false)?;

    let result = match &params.kind {
        OptKind::Adam(a) => adam::optimize(ctx, &params, &a.clone(), f, &mut gf, &mut gb),
        OptKind::Lbfgs(l) => lbfgs::optimize(ctx, &params, &l.clone(), f, &mut gf, &mut gb),
    };

    if params.print_forward_graph {
        viz::graph_print(ctx, &gf);
    }
    if params.print_backward_graph {
        viz::graph_print(ctx, &gb);
    }

    result
}

/// Trainable tensors of the forward graph, with their total element count.
pub(crate) fn collect_params(ctx: &Context, gf: &Graph) -> (Vec<TensorId>, usize) {
    let mut ps = Vec::new();
    let mut nx = 0;
    for &id in gf.nodes() {
        if ctx.tensor(id).is_param() {
            nx += ctx.tensor(id).nelements();
            ps.push(id);
        }
    }
    (ps, nx)
}

pub(crate) fn get_params(ctx: &Context, ps: &[TensorId], x: &mut [f32]) {
    let mut i = 0;
    for &p in ps {
        for j in 0..ctx.tensor(p).nelements() {
            x[i] = ctx.get_f32_1d(p, j);
            i += 1;
        }
    }
}

pub(crate) fn set_params(ctx: &mut Context, ps: &[TensorId], x: &[f32]) {
    let mut i = 0;
    for &p in ps {
        for j in 0..ctx.tensor(p).nelements() {
            ctx.set_f32_1d(p, j, x[i]);
            i += 1;
        }
    }
}

pub(crate) fn get_grads(ctx: &Context, ps: &[TensorId], g: &mut [f32]) {
    let mut i = 0;
    for &p in ps {
        let grad = ctx.tensor(p).grad().expect("params always carry a gradient");
        for j in 0..ctx.tensor(p).nelements() {
            g[i] = ctx.get_f32_1d(grad, j);
            i += 1;
        }
    }
}

/// One forward+backward evaluation: zero the gradients, seed `df/df = 1`,
/// run the backward graph and read back the function value.
pub(crate) fn eval(
    ctx: &mut Context,
    gf: &Graph,
    gb: &mut Graph,
    f: TensorId,
    f_grad: TensorId,
) -> Result<f32> {
    gf.reset(ctx);
    ctx.set_f32(f_grad, 1.0);
    gb.compute(ctx)?;
    Ok(ctx.get_f32_1d(f, 0))
}

pub(crate) fn loss_grad(ctx: &Context, f: TensorId) -> Result<TensorId> {
    if !ctx.tensor(f).is_scalar() {
        return Err(Error::InvalidConfig("optimized function must be scalar".into()));
    }
    ctx.tensor(f)
        .grad()
        .ok_or_else(|| Error::InvalidConfig("optimized function has no gradient".into()))
}
