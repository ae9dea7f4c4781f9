//! Reductions and tiling. Reductions run single-threaded so no cross-worker
//! accumulation is needed; per-row sums use f64 accumulators.

use crate::core::arena::ArenaMem;
use crate::core::tensor::Tensor;
use crate::graph::executor::{ComputeParams, Phase};
use crate::kernels;

const F32S: usize = std::mem::size_of::<f32>();

/// Reduce all elements of `src0` into the scalar `dst`.
pub(crate) fn sum(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    debug_assert_eq!(p.ith, 0);
    assert!(dst.is_scalar());
    assert_eq!(src0.nb[0], F32S);

    if p.phase != Phase::Compute {
        return;
    }

    let [ne00, ne01, ne02, ne03] = src0.ne;
    let [_, nb01, nb02, nb03] = src0.nb;

    // SAFETY: dst is a live scalar; row offsets bounded by shape
    unsafe {
        *mem.f32_ptr(dst.data) = 0.0;
        for i03 in 0..ne03 {
            for i02 in 0..ne02 {
                for i01 in 0..ne01 {
                    kernels::vec_sum_f32(
                        ne00,
                        mem.f32_ptr(dst.data),
                        mem.f32_ptr(src0.data + i01 * nb01 + i02 * nb02 + i03 * nb03),
                    );
                }
            }
        }
    }
}

/// Per-row mean along dimension 0 into `dst {1, ne1, ne2, ne3}`.
pub(crate) fn mean(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    debug_assert_eq!(p.ith, 0);
    assert_eq!(src0.nb[0], F32S);

    if p.phase != Phase::Compute {
        return;
    }

    let [ne00, ne01, ne02, ne03] = src0.ne;
    let [_, nb01, nb02, nb03] = src0.nb;

    assert_eq!(dst.ne[0], 1);
    assert_eq!(dst.ne[1], ne01);
    assert_eq!(dst.ne[2], ne02);
    assert_eq!(dst.ne[3], ne03);

    let [_, nb1, nb2, nb3] = dst.nb;

    for i03 in 0..ne03 {
        for i02 in 0..ne02 {
            for i01 in 0..ne01 {
                // SAFETY: one dst cell per src0 row, offsets bounded by shape
                unsafe {
                    let d = mem.f32_ptr(dst.data + i01 * nb1 + i02 * nb2 + i03 * nb3);
                    *d = 0.0;
                    kernels::vec_sum_f32(
                        ne00,
                        d,
                        mem.f32_ptr(src0.data + i01 * nb01 + i02 * nb02 + i03 * nb03),
                    );
                    *d /= ne00 as f32;
                }
            }
        }
    }
}

/// Tile `src0` across `dst`. Rank <= 2 only.
pub(crate) fn repeat(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    debug_assert_eq!(p.ith, 0);
    assert!(src0.can_repeat(dst));

    if p.phase != Phase::Compute {
        return;
    }

    assert!(src0.ne[2] == 1 && src0.ne[3] == 1);
    assert!(dst.ne[2] == 1 && dst.ne[3] == 1);

    let nc = dst.ne[0];
    let nr = dst.ne[1];
    let nc0 = src0.ne[0];
    let nr0 = src0.ne[1];
    // integer by the can_repeat precondition
    let ncr = nc / nc0;
    let nrr = nr / nr0;

    assert_eq!(dst.nb[0], F32S);
    assert_eq!(src0.nb[0], F32S);

    for i in 0..nrr {
        for j in 0..ncr {
            for k in 0..nr0 {
                // SAFETY: each (i, j, k) writes a distinct dst block
                unsafe {
                    kernels::vec_cpy_f32(
                        nc0,
                        mem.f32_ptr(dst.data + (i * nr0 + k) * dst.nb[1] + j * nc0 * dst.nb[0]),
                        mem.f32_ptr(src0.data + k * src0.nb[1]),
                    );
                }
            }
        }
    }
}
