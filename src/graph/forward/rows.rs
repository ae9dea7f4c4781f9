//! Row-oriented kernels: gather, causal masking, tabled softmax and rotary
//! embedding.

use crate::core::arena::ArenaMem;
use crate::core::tensor::{DType, Tensor};
use crate::graph::executor::{ComputeParams, Phase};
use crate::kernels::{self, tables};

const F32S: usize = std::mem::size_of::<f32>();

/// Gather rows of `src0` selected by the I32 vector `src1` into F32 `dst`.
pub(crate) fn get_rows(
    p: &ComputeParams,
    mem: &ArenaMem,
    src0: &Tensor,
    src1: &Tensor,
    dst: &Tensor,
) {
    debug_assert_eq!(p.ith, 0);

    if p.phase != Phase::Compute {
        return;
    }

    let nc = src0.ne[0];
    let nr = src1.nelements();

    assert_eq!(dst.ne[0], nc);
    assert_eq!(dst.ne[1], nr);

    match src0.dtype {
        DType::F32 => {
            assert_eq!(src0.nb[0], F32S);
            for i in 0..nr {
                // SAFETY: the row index is produced by the caller; the
                // selected row lies inside src0's region
                unsafe {
                    let r = *mem.i32_ptr(src1.data).add(i) as usize;
                    kernels::vec_cpy_f32(
                        nc,
                        mem.f32_ptr(dst.data + i * dst.nb[1]),
                        mem.f32_ptr(src0.data + r * src0.nb[1]),
                    );
                }
            }
        }
        DType::F16 => {
            assert_eq!(src0.nb[0], std::mem::size_of::<u16>());
            for i in 0..nr {
                // SAFETY: as above, elementwise with widening
                unsafe {
                    let r = *mem.i32_ptr(src1.data).add(i) as usize;
                    let src = mem.f16_ptr(src0.data + r * src0.nb[1]);
                    let out = mem.f32_ptr(dst.data + i * dst.nb[1]);
                    for j in 0..nc {
                        *out.add(j) = (*src.add(j)).to_f32();
                    }
                }
            }
        }
        _ => panic!("get_rows: unsupported source dtype {:?}", src0.dtype),
    }
}

/// Causal mask, in place: `dst[.., j, i] = -inf` for `i > n_past + j`.
pub(crate) fn diag_mask_inf(
    p: &ComputeParams,
    mem: &ArenaMem,
    src0: &Tensor,
    src1: &Tensor,
    dst: &Tensor,
) {
    debug_assert_eq!(p.ith, 0);
    assert_eq!(src1.dtype, DType::I32);
    assert_eq!(src1.nelements(), 1);

    if p.phase != Phase::Compute {
        return;
    }

    // SAFETY: src1 is a live 1-element I32 tensor
    let n_past = unsafe { *mem.i32_ptr(src1.data) } as usize;

    let n = src0.nrows();
    let nc = src0.ne[0];
    let nr = src0.ne[1];
    let nz = n / nr;

    assert_eq!(dst.nb[0], F32S);
    assert_eq!(src0.nb[0], F32S);

    for k in 0..nz {
        for j in 0..nr {
            for i in n_past..nc {
                if i > n_past + j {
                    // SAFETY: offsets bounded by shape
                    unsafe {
                        *mem.f32_ptr(dst.data + k * dst.nb[2] + j * dst.nb[1] + i * dst.nb[0]) =
                            f32::NEG_INFINITY;
                    }
                }
            }
        }
    }
}

/// Per-row softmax, in place, through the f16 exp table. `-inf` inputs map
/// to exactly zero.
pub(crate) fn soft_max(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, dst: &Tensor) {
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
        // SAFETY: workers own disjoint row ranges; the op reads and writes
        // through dst only (it is a view of src0)
        unsafe {
            let row = mem.f32_ptr(dst.data + i1 * dst.nb[1]);

            #[cfg(debug_assertions)]
            for i in 0..nc {
                debug_assert!(!(*row.add(i)).is_nan());
            }

            let mut max = f32::NEG_INFINITY;
            for i in 0..nc {
                max = max.max(*row.add(i));
            }

            let mut sum = 0.0f64;
            for i in 0..nc {
                let v = *row.add(i);
                if v == f32::NEG_INFINITY {
                    *row.add(i) = 0.0;
                } else {
                    let e = tables::exp_lookup(v - max);
                    sum += e as f64;
                    *row.add(i) = e;
                }
            }

            debug_assert!(sum > 0.0);
            kernels::scale_f32(nc, row, (1.0 / sum) as f32);

            #[cfg(debug_assertions)]
            for i in 0..nc {
                debug_assert!(!(*row.add(i)).is_nan());
                debug_assert!(!(*row.add(i)).is_infinite());
            }
        }
    }
}

/// Rotary positional embedding, in place: pairs `(x0, x1)` in the first
/// `n_dims` elements of dim 0 are rotated by `theta = p * 10000^(-i/n_dims)`.
pub(crate) fn rope(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, src1: &Tensor, dst: &Tensor) {
    debug_assert_eq!(p.ith, 0);
    assert_eq!(src1.dtype, DType::I32);
    assert_eq!(src1.nelements(), 3);

    if p.phase != Phase::Compute {
        return;
    }

    // SAFETY: src1 is a live 3-element I32 tensor
    let (n_past, n_dims, mode) = unsafe {
        let q = mem.i32_ptr(src1.data);
        (*q as usize, *q.add(1) as usize, *q.add(2))
    };

    let [_, ne1, ne2, ne3] = src0.ne;
    let [nb0, nb1, nb2, nb3] = src0.nb;

    assert_eq!(nb0, F32S);

    let i2_start = if mode == 0 { 0 } else { n_past };
    for i3 in 0..ne3 {
        for i2 in i2_start..ne2 {
            let pos = if mode == 0 { n_past + i2 } else { i2 };
            for i1 in 0..ne1 {
                for i0 in (0..n_dims).step_by(2) {
                    let theta = 10000.0f64.powf(-(i0 as f64) / n_dims as f64);
                    let cos_theta = (pos as f64 * theta).cos();
                    let sin_theta = (pos as f64 * theta).sin();

                    let off = i3 * nb3 + i2 * nb2 + i1 * nb1 + i0 * nb0;
                    // SAFETY: pair offsets bounded by n_dims <= ne0; reads
                    // precede the aliased in-place writes
                    unsafe {
                        let src = mem.f32_ptr(src0.data + off);
                        let out = mem.f32_ptr(dst.data + off);

                        let x0 = *src as f64;
                        let x1 = *src.add(1) as f64;

                        *out = (x0 * cos_theta - x1 * sin_theta) as f32;
                        *out.add(1) = (x0 * sin_theta + x1 * cos_theta) as f32;
                    }
                }
            }
        }
    }
}
