//! L-BFGS with a backtracking line search (Armijo / Wolfe / strong Wolfe).
//!
//! Based on the reference implementation in liblbfgs:
//! <https://github.com/chokkan/liblbfgs>

use log::debug;

use super::{collect_params, eval, get_grads, get_params, loss_grad, set_params};
use super::{LbfgsParams, LinesearchError, OptParams, OptResult};
use crate::core::arena::Context;
use crate::core::tensor::TensorId;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::kernels;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linesearch {
    Armijo,
    Wolfe,
    StrongWolfe,
}

struct IterationData {
    alpha: f32,
    ys: f32,
    s: Vec<f32>,
    y: Vec<f32>,
}

#[allow(clippy::too_many_arguments)]
fn linesearch_backtracking(
    ctx: &mut Context,
    lp: &LbfgsParams,
    x: &mut [f32],
    fx: &mut f32,
    g: &mut [f32],
    d: &[f32],
    step: &mut f32,
    xp: &[f32],
    f: TensorId,
    f_grad: TensorId,
    gf: &Graph,
    gb: &mut Graph,
    ps: &[TensorId],
) -> Result<usize> {
    const DEC: f32 = 0.5;
    const INC: f32 = 2.1;

    if *step <= 0.0 {
        return Err(Error::Linesearch(LinesearchError::InvalidParameters));
    }

    // initial gradient in the search direction; must be a descent direction
    let dginit = kernels::dot(g, d);
    if dginit > 0.0 {
        return Err(Error::Linesearch(LinesearchError::Fail));
    }

    let finit = *fx;
    let dgtest = lp.ftol * dginit;
    let mut count = 0usize;

    loop {
        x.copy_from_slice(xp);
        kernels::mad(x, d, *step);

        set_params(ctx, ps, x);
        *fx = eval(ctx, gf, gb, f, f_grad)?;
        get_grads(ctx, ps, g);

        count += 1;

        let width;
        if *fx > finit + *step * dgtest {
            width = DEC;
        } else {
            // Armijo condition holds
            if lp.linesearch == Linesearch::Armijo {
                return Ok(count);
            }
            let dg = kernels::dot(g, d);
            if dg < lp.wolfe * dginit {
                width = INC;
            } else {
                // curvature condition holds
                return Ok(count);
            }
        }

        if *step < lp.min_step {
            return Err(Error::Linesearch(LinesearchError::MinimumStep));
        }
        if *step > lp.max_step {
            return Err(Error::Linesearch(LinesearchError::MaximumStep));
        }
        if lp.max_linesearch <= count {
            return Err(Error::Linesearch(LinesearchError::MaximumIterations));
        }

        *step *= width;
    }
}

pub(super) fn optimize(
    ctx: &mut Context,
    params: &OptParams,
    lp: &LbfgsParams,
    f: TensorId,
    gf: &mut Graph,
    gb: &mut Graph,
) -> Result<OptResult> {
    if lp.linesearch != Linesearch::Armijo && (lp.wolfe <= lp.ftol || 1.0 <= lp.wolfe) {
        return Err(Error::InvalidWolfe);
    }

    let f_grad = loss_grad(ctx, f)?;

    gf.n_threads = params.n_threads;
    gb.n_threads = params.n_threads;

    let m = lp.m;

    let (ps, nx) = collect_params(ctx, gf);
    debug!("lbfgs: optimizing {} parameters in {} tensors", nx, ps.len());

    let mut x = vec![0.0f32; nx]; // current parameters
    let mut xp = vec![0.0f32; nx]; // previous parameters
    let mut g = vec![0.0f32; nx]; // current gradient
    let mut gp = vec![0.0f32; nx]; // previous gradient
    let mut d = vec![0.0f32; nx]; // search direction

    let mut pf = vec![0.0f32; params.past]; // past function values

    get_params(ctx, &ps, &mut x);

    let mut lm: Vec<IterationData> = (0..m)
        .map(|_| IterationData {
            alpha: 0.0,
            ys: 0.0,
            s: vec![0.0f32; nx],
            y: vec![0.0f32; nx],
        })
        .collect();

    // evaluate the function value and its gradient
    set_params(ctx, &ps, &x);
    let mut fx = eval(ctx, gf, gb, f, f_grad)?;
    get_grads(ctx, &ps, &mut g);

    if !pf.is_empty() {
        pf[0] = fx;
    }
    let mut fx_best = fx;

    // search direction = -gradient
    for (di, gi) in d.iter_mut().zip(&g) {
        *di = -gi;
    }

    let mut xnorm = kernels::norm(&x);
    let mut gnorm = kernels::norm(&g);
    if xnorm < 1.0 {
        xnorm = 1.0;
    }

    // already optimized
    if gnorm / xnorm <= lp.eps {
        return Ok(OptResult::Converged);
    }

    let mut step = 1.0 / kernels::norm(&d);

    let mut k = 1usize;
    let mut end = 0usize;
    let mut n_no_improvement = 0usize;

    loop {
        xp.copy_from_slice(&x);
        gp.copy_from_slice(&g);

        let ls = linesearch_backtracking(
            ctx, lp, &mut x, &mut fx, &mut g, &d, &mut step, &xp, f, f_grad, gf, gb, &ps,
        );

        if let Err(e) = ls {
            // line search failed: restore the previous point and bail
            x.copy_from_slice(&xp);
            g.copy_from_slice(&gp);
            set_params(ctx, &ps, &x);
            return Err(e);
        }

        xnorm = kernels::norm(&x);
        gnorm = kernels::norm(&g);

        debug!("lbfgs: iter {k}, f = {fx:.6}");

        if xnorm < 1.0 {
            xnorm = 1.0;
        }
        if gnorm / xnorm <= lp.eps {
            return Ok(OptResult::Converged);
        }

        // delta-based convergence test over a window of past values
        if !pf.is_empty() {
            if params.past <= k {
                let rate = (pf[k % params.past] - fx) / fx;
                if rate.abs() < params.delta {
                    return Ok(OptResult::Converged);
                }
            }
            pf[k % params.past] = fx;
        }

        if params.max_no_improvement > 0 {
            if fx < fx_best {
                fx_best = fx;
                n_no_improvement = 0;
            } else {
                n_no_improvement += 1;
                if n_no_improvement >= params.max_no_improvement {
                    return Ok(OptResult::Converged);
                }
            }
        }

        if lp.n_iter != 0 && lp.n_iter < k + 1 {
            return Ok(OptResult::DidNotConverge);
        }

        // s_{k+1} = x_{k+1} - x_k, y_{k+1} = g_{k+1} - g_k
        for i in 0..nx {
            lm[end].s[i] = x[i] - xp[i];
            lm[end].y[i] = g[i] - gp[i];
        }

        // ys = y's (1/rho), yy = y'y
        let ys = kernels::dot(&lm[end].y, &lm[end].s);
        let yy = kernels::dot(&lm[end].y, &lm[end].y);
        lm[end].ys = ys;

        // two-loop recursion for the new search direction
        // ref: https://en.wikipedia.org/wiki/Limited-memory_BFGS
        let bound = m.min(k);
        k += 1;
        end = (end + 1) % m;

        for (di, gi) in d.iter_mut().zip(&g) {
            *di = -gi;
        }

        let mut j = end;
        for _ in 0..bound {
            j = (j + m - 1) % m;
            lm[j].alpha = kernels::dot(&lm[j].s, &d) / lm[j].ys;
            let alpha = lm[j].alpha;
            kernels::mad(&mut d, &lm[j].y, -alpha);
        }

        kernels::scale(&mut d, ys / yy);

        for _ in 0..bound {
            let beta = kernels::dot(&lm[j].y, &d) / lm[j].ys;
            kernels::mad(&mut d, &lm[j].s, lm[j].alpha - beta);
            j = (j + 1) % m;
        }

        step = 1.0;
    }
}
