//! Forward kernels, one per op kind. Every kernel honors the three-phase
//! contract: return immediately in INIT/FINALIZE unless it owns work-buffer
//! preparation or cross-worker reduction, partition output rows across
//! `nth` workers, and touch only its own slice of `dst`.

mod attention;
mod conv;
mod elementwise;
mod matmul;
mod reduce;
mod rows;

pub(crate) use matmul::mul_mat_use_blas;

use super::executor::ComputeParams;
use crate::core::arena::ArenaMem;
use crate::core::tensor::{Op, Tensor, TensorId};

/// Dispatch one phase of one node to its kernel.
pub(crate) fn forward(params: &ComputeParams, mem: &ArenaMem, ts: &[Tensor], node: TensorId) {
    let dst = &ts[node.index()];
    let src0 = dst.src0.map(|s| &ts[s.index()]);
    let src1 = dst.src1.map(|s| &ts[s.index()]);

    match dst.op {
        Op::Dup => elementwise::dup(params, mem, src0.unwrap(), dst),
        Op::Add => elementwise::add(params, mem, src0.unwrap(), src1.unwrap(), dst),
        Op::Sub => elementwise::sub(params, mem, src0.unwrap(), src1.unwrap(), dst),
        Op::Mul => elementwise::mul(params, mem, src0.unwrap(), src1.unwrap(), dst),
        Op::Div => elementwise::div(params, mem, src0.unwrap(), src1.unwrap(), dst),
        Op::Sqr => elementwise::sqr(params, mem, src0.unwrap(), dst),
        Op::Sqrt => elementwise::sqrt(params, mem, src0.unwrap(), dst),
        Op::Sum => reduce::sum(params, mem, src0.unwrap(), dst),
        Op::Mean => reduce::mean(params, mem, src0.unwrap(), dst),
        Op::Repeat => reduce::repeat(params, mem, src0.unwrap(), dst),
        Op::Abs => elementwise::abs(params, mem, src0.unwrap(), dst),
        Op::Sgn => elementwise::sgn(params, mem, src0.unwrap(), dst),
        Op::Neg => elementwise::neg(params, mem, src0.unwrap(), dst),
        Op::Step => elementwise::step(params, mem, src0.unwrap(), dst),
        Op::Relu => elementwise::relu(params, mem, src0.unwrap(), dst),
        Op::Gelu => elementwise::gelu(params, mem, src0.unwrap(), dst),
        Op::Norm => elementwise::norm(params, mem, src0.unwrap(), dst),
        Op::MulMat => matmul::mul_mat(params, mem, src0.unwrap(), src1.unwrap(), dst),
        Op::Scale => elementwise::scale(params, mem, src0.unwrap(), src1.unwrap(), dst),
        Op::Cpy => elementwise::dup(params, mem, src0.unwrap(), dst),
        Op::GetRows => rows::get_rows(params, mem, src0.unwrap(), src1.unwrap(), dst),
        Op::DiagMaskInf => rows::diag_mask_inf(params, mem, src0.unwrap(), src1.unwrap(), dst),
        Op::SoftMax => rows::soft_max(params, mem, src0.unwrap(), dst),
        Op::Rope => rows::rope(params, mem, src0.unwrap(), src1.unwrap(), dst),
        Op::Conv1D1S => conv::conv_1d(params, mem, src0.unwrap(), src1.unwrap(), dst, 1),
        Op::Conv1D2S => conv::conv_1d(params, mem, src0.unwrap(), src1.unwrap(), dst, 2),
        Op::FlashAttn => {
            let v = &ts[dst.opt[0].unwrap().index()];
            let flag = &ts[dst.opt[1].unwrap().index()];
            // SAFETY: the flag is a live 1-element I32 tensor
            let masked = unsafe { *mem.i32_ptr(flag.data) } != 0;
            attention::flash_attn(params, mem, src0.unwrap(), src1.unwrap(), v, masked, dst);
        }
        Op::FlashFF => {
            let b1 = &ts[dst.opt[0].unwrap().index()];
            let c0 = &ts[dst.opt[1].unwrap().index()];
            let c1 = &ts[dst.opt[2].unwrap().index()];
            attention::flash_ff(params, mem, src0.unwrap(), src1.unwrap(), b1, c0, c1, dst);
        }
        // views and leaves have nothing to compute
        Op::None | Op::Reshape | Op::View | Op::Permute | Op::Transpose => {}
    }
}
