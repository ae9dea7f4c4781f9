//! Adam with bias-corrected first and second moments.
//!
//! ref: <https://arxiv.org/pdf/1412.6980.pdf>

use log::debug;

use super::{collect_params, eval, get_grads, get_params, loss_grad, set_params};
use super::{AdamParams, OptParams, OptResult};
use crate::core::arena::Context;
use crate::core::tensor::TensorId;
use crate::error::Result;
use crate::graph::Graph;
use crate::kernels;

pub(super) fn optimize(
    ctx: &mut Context,
    params: &OptParams,
    adam: &AdamParams,
    f: TensorId,
    gf: &mut Graph,
    gb: &mut Graph,
) -> Result<OptResult> {
    let f_grad = loss_grad(ctx, f)?;

    gf.n_threads = params.n_threads;
    gb.n_threads = params.n_threads;

    let (ps, nx) = collect_params(ctx, gf);
    debug!("adam: optimizing {} parameters in {} tensors", nx, ps.len());

    let (alpha, beta1, beta2, eps) = (adam.alpha, adam.beta1, adam.beta2, adam.eps);

    let mut x = vec![0.0f32; nx]; // parameter view
    let mut g1 = vec![0.0f32; nx]; // gradient
    let mut g2 = vec![0.0f32; nx]; // gradient squared
    let mut m = vec![0.0f32; nx]; // first moment
    let mut v = vec![0.0f32; nx]; // second moment
    let mut mh = vec![0.0f32; nx]; // first moment hat
    let mut vh = vec![0.0f32; nx]; // second moment hat

    let mut pf = vec![0.0f32; params.past]; // past function values

    get_params(ctx, &ps, &mut x);

    let mut fx_prev = eval(ctx, gf, gb, f, f_grad)?;
    if !pf.is_empty() {
        pf[0] = fx_prev;
    }

    let mut n_no_improvement = 0usize;
    let mut fx_best = fx_prev;

    for t in 0..adam.n_iter {
        get_grads(ctx, &ps, &mut g1);

        // m_t = beta1*m_{t-1} + (1 - beta1)*g_t
        kernels::scale(&mut m, beta1);
        kernels::mad(&mut m, &g1, 1.0 - beta1);

        for (g2i, g1i) in g2.iter_mut().zip(&g1) {
            *g2i = g1i * g1i;
        }

        // v_t = beta2*v_{t-1} + (1 - beta2)*g_t^2
        kernels::scale(&mut v, beta2);
        kernels::mad(&mut v, &g2, 1.0 - beta2);

        // x_t = x_{t-1} - alpha * m^hat / (sqrt(v^hat) + eps)
        mh.copy_from_slice(&m);
        vh.copy_from_slice(&v);

        kernels::scale(&mut mh, alpha / (1.0 - beta1.powi(t as i32 + 1)));
        kernels::scale(&mut vh, 1.0 / (1.0 - beta2.powi(t as i32 + 1)));

        for (mhi, vhi) in mh.iter_mut().zip(vh.iter_mut()) {
            *vhi = vhi.sqrt() + eps;
            *mhi /= *vhi;
        }
        for (xi, mhi) in x.iter_mut().zip(&mh) {
            *xi -= mhi;
        }

        set_params(ctx, &ps, &x);

        let fx = eval(ctx, gf, gb, f, f_grad)?;

        if ((fx - fx_prev) / fx).abs() < adam.eps_f {
            debug!("adam: converged at iteration {t}");
            return Ok(OptResult::Converged);
        }

        // delta-based convergence test over a window of past values
        if !pf.is_empty() {
            if params.past <= t {
                let rate = (pf[t % params.past] - fx) / fx;
                if rate.abs() < params.delta {
                    return Ok(OptResult::Converged);
                }
            }
            pf[t % params.past] = fx;
        }

        if params.max_no_improvement > 0 {
            if fx_best > fx {
                fx_best = fx;
                n_no_improvement = 0;
            } else {
                n_no_improvement += 1;
                if n_no_improvement >= params.max_no_improvement {
                    return Ok(OptResult::Converged);
                }
            }
        }

        fx_prev = fx;
    }

    Ok(OptResult::DidNotConverge)
}
