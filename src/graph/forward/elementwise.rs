//! Elementwise kernels: dup/cpy, the four binaries, the unary family,
//! tabled GELU, per-row normalization and in-place scaling.

use half::f16;

use crate::core::arena::ArenaMem;
use crate::core::tensor::{DType, Tensor};
use crate::graph::executor::{ComputeParams, Phase};
use crate::kernels;

const F32S: usize = std::mem::size_of::<f32>();

/// Deep copy, including dtype conversion into `dst`'s layout. Shared by DUP
/// and CPY (for CPY, `dst` is a view of the destination tensor).
pub(crate) fn dup(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    debug_assert_eq!(p.ith, 0);
    debug_assert!(dst.is_contiguous());
    debug_assert_eq!(dst.nelements(), src0.nelements());

    if p.phase != Phase::Compute {
        return;
    }

    if src0.is_contiguous() && src0.dtype == dst.dtype {
        // SAFETY: both regions span nbytes; `copy` tolerates the aliased
        // in-place case
        unsafe {
            std::ptr::copy(mem.u8_ptr(src0.data), mem.u8_ptr(dst.data), dst.nbytes());
        }
        return;
    }

    let [ne00, ne01, ne02, ne03] = src0.ne;
    let [nb00, nb01, nb02, nb03] = src0.nb;

    assert_eq!(src0.dtype, DType::F32, "dup: only f32 sources support relayout");

    let mut id = 0usize;
    if nb00 == F32S {
        match dst.dtype {
            DType::F32 => {
                let rs = ne00 * nb00;
                for i03 in 0..ne03 {
                    for i02 in 0..ne02 {
                        for i01 in 0..ne01 {
                            let src_off = src0.data + i01 * nb01 + i02 * nb02 + i03 * nb03;
                            // SAFETY: row-aligned offsets inside both regions
                            unsafe {
                                std::ptr::copy(
                                    mem.u8_ptr(src_off),
                                    mem.u8_ptr(dst.data + id * rs),
                                    rs,
                                );
                            }
                            id += 1;
                        }
                    }
                }
            }
            DType::F16 => {
                for i03 in 0..ne03 {
                    for i02 in 0..ne02 {
                        for i01 in 0..ne01 {
                            for i00 in 0..ne00 {
                                let src_off = src0.data
                                    + i00 * nb00
                                    + i01 * nb01
                                    + i02 * nb02
                                    + i03 * nb03;
                                // SAFETY: element offsets inside both regions
                                unsafe {
                                    let v = *mem.f32_ptr(src_off);
                                    *mem.f16_ptr(dst.data).add(id) = f16::from_f32(v);
                                }
                                id += 1;
                            }
                        }
                    }
                }
            }
            _ => panic!("dup: unsupported destination dtype {:?}", dst.dtype),
        }
    } else {
        // strided source, element-at-a-time
        match dst.dtype {
            DType::F32 => {
                for i03 in 0..ne03 {
                    for i02 in 0..ne02 {
                        for i01 in 0..ne01 {
                            for i00 in 0..ne00 {
                                let src_off = src0.data
                                    + i00 * nb00
                                    + i01 * nb01
                                    + i02 * nb02
                                    + i03 * nb03;
                                // SAFETY: element offsets inside both regions
                                unsafe {
                                    *mem.f32_ptr(dst.data).add(id) = *mem.f32_ptr(src_off);
                                }
                                id += 1;
                            }
                        }
                    }
                }
            }
            DType::F16 => {
                for i03 in 0..ne03 {
                    for i02 in 0..ne02 {
                        for i01 in 0..ne01 {
                            for i00 in 0..ne00 {
                                let src_off = src0.data
                                    + i00 * nb00
                                    + i01 * nb01
                                    + i02 * nb02
                                    + i03 * nb03;
                                // SAFETY: element offsets inside both regions
                                unsafe {
                                    let v = *mem.f32_ptr(src_off);
                                    *mem.f16_ptr(dst.data).add(id) = f16::from_f32(v);
                                }
                                id += 1;
                            }
                        }
                    }
                }
            }
            _ => panic!("dup: unsupported destination dtype {:?}", dst.dtype),
        }
    }
}

/// Row-partitioned elementwise binary. When src1's dim-0 stride is not one
/// f32, falls back to per-element strided access.
fn binary_rows(
    p: &ComputeParams,
    mem: &ArenaMem,
    src0: &Tensor,
    src1: &Tensor,
    dst: &Tensor,
    f: unsafe fn(usize, *mut f32, *const f32, *const f32),
) {
    debug_assert!(src0.same_shape(src1) && src0.same_shape(dst));

    if p.phase != Phase::Compute {
        return;
    }

    let (ith, nth) = (p.ith, p.nth);
    let n = src0.nrows();
    let nc = src0.ne[0];

    let nb01 = src0.nb[1];
    let (nb10, nb11) = (src1.nb[0], src1.nb[1]);
    let nb1 = dst.nb[1];

    assert_eq!(dst.nb[0], F32S);
    assert_eq!(src0.nb[0], F32S);

    if nb10 == F32S {
        let j0 = (n / nth) * ith;
        let j1 = if ith == nth - 1 { n } else { (n / nth) * (ith + 1) };
        for j in j0..j1 {
            // SAFETY: workers own disjoint row ranges of dst
            unsafe {
                f(
                    nc,
                    mem.f32_ptr(dst.data + j * nb1),
                    mem.f32_ptr(src0.data + j * nb01),
                    mem.f32_ptr(src1.data + j * nb11),
                );
            }
        }
    } else {
        // src1 is not contiguous along dim 0
        for j in (ith..n).step_by(nth) {
            for i in 0..nc {
                // SAFETY: single elements, rows interleaved across workers
                unsafe {
                    f(
                        1,
                        mem.f32_ptr(dst.data + j * nb1).add(i),
                        mem.f32_ptr(src0.data + j * nb01).add(i),
                        mem.f32_ptr(src1.data + j * nb11 + i * nb10),
                    );
                }
            }
        }
    }
}

pub(crate) fn add(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, src1: &Tensor, dst: &Tensor) {
    binary_rows(p, mem, src0, src1, dst, kernels::vec_add_f32);
}

pub(crate) fn sub(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, src1: &Tensor, dst: &Tensor) {
    binary_rows(p, mem, src0, src1, dst, kernels::vec_sub_f32);
}

pub(crate) fn mul(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, src1: &Tensor, dst: &Tensor) {
    binary_rows(p, mem, src0, src1, dst, kernels::vec_mul_f32);
}

pub(crate) fn div(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, src1: &Tensor, dst: &Tensor) {
    binary_rows(p, mem, src0, src1, dst, kernels::vec_div_f32);
}

/// Single-threaded elementwise unary over rows.
fn unary_rows(
    p: &ComputeParams,
    mem: &ArenaMem,
    src0: &Tensor,
    dst: &Tensor,
    f: unsafe fn(usize, *mut f32, *const f32),
) {
    debug_assert_eq!(p.ith, 0);
    debug_assert!(src0.same_shape(dst));

    if p.phase != Phase::Compute {
        return;
    }

    let n = src0.nrows();
    let nc = src0.ne[0];

    assert_eq!(dst.nb[0], F32S);
    assert_eq!(src0.nb[0], F32S);

    for i in 0..n {
        // SAFETY: offsets bounded by shape; may alias for in-place nodes
        unsafe {
            f(
                nc,
                mem.f32_ptr(dst.data + i * dst.nb[1]),
                mem.f32_ptr(src0.data + i * src0.nb[1]),
            );
        }
    }
}

pub(crate) fn sqr(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    unary_rows(p, mem, src0, dst, kernels::vec_sqr_f32);
}

pub(crate) fn sqrt(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    unary_rows(p, mem, src0, dst, kernels::vec_sqrt_f32);
}

pub(crate) fn abs(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    unary_rows(p, mem, src0, dst, kernels::vec_abs_f32);
}

pub(crate) fn sgn(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    unary_rows(p, mem, src0, dst, kernels::vec_sgn_f32);
}

pub(crate) fn neg(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    unary_rows(p, mem, src0, dst, kernels::vec_neg_f32);
}

pub(crate) fn step(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    unary_rows(p, mem, src0, dst, kernels::vec_step_f32);
}

pub(crate) fn relu(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    unary_rows(p, mem, src0, dst, kernels::vec_relu_f32);
}

/// Tabled GELU, row-partitioned.
pub(crate) fn gelu(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    assert!(src0.is_contiguous());
    assert!(dst.is_contiguous());
    assert!(src0.same_shape(dst));

    if p.phase != Phase::Compute {
        return;
    }

    let (ith, nth) = (p.ith, p.nth);
    let nc = src0.ne[0];
    let nr = src0.nrows();

    let dr = (nr + nth - 1) / nth;
    let ir0 = dr * ith;
    let ir1 = (ir0 + dr).min(nr);

    for i1 in ir0..ir1 {
        // SAFETY: workers own disjoint row ranges of dst
        unsafe {
            kernels::vec_gelu_f32(
                nc,
                mem.f32_ptr(dst.data + i1 * dst.nb[1]),
                mem.f32_ptr(src0.data + i1 * src0.nb[1]),
            );
        }

        #[cfg(debug_assertions)]
        for k in 0..nc {
            // SAFETY: same row as above
            let x = unsafe { *mem.f32_ptr(dst.data + i1 * dst.nb[1]).add(k) };
            debug_assert!(!x.is_nan());
            debug_assert!(!x.is_infinite());
        }
    }
}

/// Per-row centre + RMS normalization, `eps = 1e-5`, f64 accumulators.
pub(crate) fn norm(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
    assert!(src0.same_shape(dst));
    assert_eq!(src0.nb[0], F32S);

    if p.phase != Phase::Compute {
        return;
    }

    let (ith, nth) = (p.ith, p.nth);
    let [ne00, ne01, ne02, ne03] = src0.ne;
    let [_, nb01, nb02, nb03] = src0.nb;
    let [_, nb1, nb2, nb3] = dst.nb;

    const EPS: f64 = 1e-5;

    for i03 in 0..ne03 {
        for i02 in 0..ne02 {
            for i01 in (ith..ne01).step_by(nth) {
                // SAFETY: rows interleaved across workers; offsets bounded
                // by shape
                unsafe {
                    let x = mem.f32_ptr(src0.data + i01 * nb01 + i02 * nb02 + i03 * nb03);
                    let y = mem.f32_ptr(dst.data + i01 * nb1 + i02 * nb2 + i03 * nb3);

                    let mut mean = 0.0f64;
                    for i00 in 0..ne00 {
                        mean += *x.add(i00) as f64;
                    }
                    mean /= ne00 as f64;

                    let mut sum2 = 0.0f64;
                    for i00 in 0..ne00 {
                        let v = *x.add(i00) as f64 - mean;
                        *y.add(i00) = v as f32;
                        sum2 += v * v;
                    }

                    let scale = (1.0 / (sum2 / ne00 as f64 + EPS).sqrt()) as f32;
                    kernels::scale_f32(ne00, y, scale);
                }
            }
        }
    }
}

/// Multiply rows of `dst` (a view of src0) by the scalar `src1`, in place.
pub(crate) fn scale(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, src1: &Tensor, dst: &Tensor) {
    assert!(src0.is_contiguous());
    assert!(dst.is_contiguous());
    assert!(src0.same_shape(dst));
    assert!(src1.is_scalar());

    if p.phase != Phase::Compute {
        return;
    }

    // SAFETY: src1 is a live scalar tensor
    let v = unsafe { *mem.f32_ptr(src1.data) };

    let (ith, nth) = (p.ith, p.nth);
    let nc = src0.ne[0];
    let nr = src0.nrows();

    let dr = (nr + nth - 1) / nth;
    let ir0 = dr * ith;
    let ir1 = (ir0 + dr).min(nr);

    for i1 in ir0..ir1 {
        // SAFETY: workers own disjoint row ranges of dst
        unsafe {
            kernels::scale_f32(nc, mem.f32_ptr(dst.data + i1 * dst.nb[1]), v);
        }
    }
}
