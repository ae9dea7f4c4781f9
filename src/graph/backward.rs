//! Reverse-mode gradient synthesis: for each node kind, append the adjoint
//! accumulation for its sources using the public op constructors.

use crate::core::arena::Context;
use crate::core::tensor::{Op, TensorId};
use crate::error::{Error, Result};

/// Accumulate the adjoints of `tensor`'s sources. `inplace` lets the
/// accumulation reuse gradient storage (safe only when the gradients were
/// detached from the forward graph).
pub(super) fn compute_backward(ctx: &mut Context, tensor: TensorId, inplace: bool) -> Result<()> {
    let t = ctx.tensor(tensor);
    let op = t.op;
    let grad = t.grad.expect("compute_backward requires a gradient");
    let src0 = t.src0;
    let src1 = t.src1;

    match op {
        Op::Dup => {
            if let Some(g) = grad_of(ctx, src0) {
                let acc = ctx.add_impl(g, grad, inplace)?;
                set_grad(ctx, src0, acc);
            }
        }
        Op::Add => {
            if let Some(g) = grad_of(ctx, src0) {
                let acc = ctx.add_impl(g, grad, inplace)?;
                set_grad(ctx, src0, acc);
            }
            if let Some(g) = grad_of(ctx, src1) {
                let acc = ctx.add_impl(g, grad, inplace)?;
                set_grad(ctx, src1, acc);
            }
        }
        Op::Sub => {
            if let Some(g) = grad_of(ctx, src0) {
                let acc = ctx.add_impl(g, grad, inplace)?;
                set_grad(ctx, src0, acc);
            }
            if let Some(g) = grad_of(ctx, src1) {
                let acc = ctx.sub_impl(g, grad, inplace)?;
                set_grad(ctx, src1, acc);
            }
        }
        Op::Mul => {
            if let Some(g) = grad_of(ctx, src0) {
                let contrib = ctx.mul(src1.unwrap(), grad)?;
                let acc = ctx.add_impl(g, contrib, inplace)?;
                set_grad(ctx, src0, acc);
            }
            if let Some(g) = grad_of(ctx, src1) {
                let contrib = ctx.mul(src0.unwrap(), grad)?;
                let acc = ctx.add_impl(g, contrib, inplace)?;
                set_grad(ctx, src1, acc);
            }
        }
        Op::Div => {
            if let Some(g) = grad_of(ctx, src0) {
                let contrib = ctx.div(grad, src1.unwrap())?;
                let acc = ctx.add_impl(g, contrib, inplace)?;
                set_grad(ctx, src0, acc);
            }
            if let Some(g) = grad_of(ctx, src1) {
                let quotient = ctx.div(tensor, src1.unwrap())?;
                let contrib = ctx.mul(grad, quotient)?;
                let acc = ctx.sub_impl(g, contrib, inplace)?;
                set_grad(ctx, src1, acc);
            }
        }
        Op::Sqr => {
            if let Some(g) = grad_of(ctx, src0) {
                let a = src0.unwrap();
                let two = ctx.new_f32(2.0)?;
                let two_rep = ctx.repeat(two, a)?;
                let prod = ctx.mul(a, grad)?;
                let contrib = ctx.mul(prod, two_rep)?;
                let acc = ctx.add_impl(g, contrib, inplace)?;
                set_grad(ctx, src0, acc);
            }
        }
        Op::Sqrt => {
            if let Some(g) = grad_of(ctx, src0) {
                let half = ctx.new_f32(0.5)?;
                let half_rep = ctx.repeat(half, tensor)?;
                let contrib = ctx.div(half_rep, tensor)?;
                let acc = ctx.add_impl(g, contrib, inplace)?;
                set_grad(ctx, src0, acc);
            }
        }
        Op::Sum => {
            if let Some(g) = grad_of(ctx, src0) {
                let contrib = ctx.repeat(grad, g)?;
                let acc = ctx.add_impl(g, contrib, inplace)?;
                set_grad(ctx, src0, acc);
            }
        }
        Op::Repeat => {
            if let Some(g) = grad_of(ctx, src0) {
                let contrib = ctx.sum(grad)?;
                let acc = ctx.add_impl(g, contrib, inplace)?;
                set_grad(ctx, src0, acc);
            }
        }
        Op::Abs => {
            if let Some(g) = grad_of(ctx, src0) {
                let sign = ctx.sgn(src0.unwrap())?;
                let contrib = ctx.mul(sign, grad)?;
                let acc = ctx.add_impl(g, contrib, inplace)?;
                set_grad(ctx, src0, acc);
            }
        }
        Op::Neg => {
            if let Some(g) = grad_of(ctx, src0) {
                let acc = ctx.sub_impl(g, grad, inplace)?;
                set_grad(ctx, src0, acc);
            }
        }
        Op::Relu => {
            if let Some(g) = grad_of(ctx, src0) {
                let mask = ctx.step(src0.unwrap())?;
                let contrib = ctx.mul(mask, grad)?;
                let acc = ctx.sub_impl(g, contrib, inplace)?;
                set_grad(ctx, src0, acc);
            }
        }
        // sgn/step have zero derivative almost everywhere
        Op::Sgn | Op::Step => {}
        Op::MulMat => {
            if grad_of(ctx, src0).is_some() {
                // needs an outer product
                return Err(Error::UnsupportedBackward(Op::MulMat));
            }
            if let Some(g) = grad_of(ctx, src1) {
                let a_t = ctx.transpose(src0.unwrap())?;
                let contrib = ctx.mul_mat(a_t, grad)?;
                let acc = ctx.add_impl(g, contrib, inplace)?;
                set_grad(ctx, src1, acc);
            }
        }
        Op::None => {}
        _ => return Err(Error::UnsupportedBackward(op)),
    }
    Ok(())
}

fn grad_of(ctx: &Context, t: Option<TensorId>) -> Option<TensorId> {
    t.and_then(|t| ctx.tensor(t).grad)
}

fn set_grad(ctx: &mut Context, t: Option<TensorId>, grad: TensorId) {
    ctx.tensor_mut(t.unwrap()).grad = Some(grad);
}
