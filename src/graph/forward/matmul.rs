//! Matrix multiply: the hot path. Three regimes:
//!
//! - *BLAS*: large contiguous operands go to `faer` in one call per
//!   `(i2, i3)` batch (feature `blas`).
//! - *Row*: src0 not transposed — parallelize over src0 rows, one vector
//!   dot per output cell. The f16·f32 pair pre-converts src1 to f16 in the
//!   work buffer during INIT so the inner loop runs f16·f16.
//! - *Column*: src0 transposed (`nb[0] > nb[1]`) — parallelize over src1
//!   columns, each worker accumulating into its own work-buffer slice;
//!   FINALIZE gathers the slices into dst.

use half::f16;

use crate::core::arena::ArenaMem;
use crate::core::tensor::{DType, Tensor};
use crate::graph::executor::{ComputeParams, Phase, CACHE_LINE_F32};
use crate::kernels;

const F32S: usize = std::mem::size_of::<f32>();
const F16S: usize = std::mem::size_of::<u16>();

/// Large contiguous products are worth the external sgemm.
pub(crate) fn mul_mat_use_blas(_src0: &Tensor, src1: &Tensor, dst: &Tensor) -> bool {
    cfg!(feature = "blas")
        && src1.is_contiguous()
        && dst.ne[0] >= 32
        && dst.ne[1] >= 32
        && src1.ne[0] >= 32
}

/// `D[i1][i0] = dot(Y_row_i1, X_row_i0)` for row-major `Y {m,k}`,
/// `X {n,k}`, `D {m,n}` — the sgemm(NoTrans, Trans) contract.
#[cfg(feature = "blas")]
unsafe fn sgemm_nt(m: usize, n: usize, k: usize, y: *const f32, x: *const f32, d: *mut f32) {
    use faer::mat;

    // Row-major inputs are column-major transposes; compute
    // D^T = X * Y^T in column-major, which lands exactly on row-major D.
    let xm = mat::from_raw_parts::<f32>(x, k, n, 1, k as isize);
    let ym = mat::from_raw_parts::<f32>(y, k, m, 1, k as isize);
    let dslice = std::slice::from_raw_parts_mut(d, n * m);
    let mut dm = mat::from_column_major_slice_mut::<f32>(dslice, n, m);
    dm.copy_from(xm.transpose() * ym);
}

pub(crate) fn mul_mat(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, src1: &Tensor, dst: &Tensor) {
    match src0.dtype {
        DType::F32 => mul_mat_f32(p, mem, src0, src1, dst),
        DType::F16 => mul_mat_f16_f32(p, mem, src0, src1, dst),
        _ => panic!("mul_mat: unsupported src0 dtype {:?}", src0.dtype),
    }
}

fn mul_mat_f32(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, src1: &Tensor, dst: &Tensor) {
    let [ne00, ne01, ne02, ne03] = src0.ne;
    let [ne10, ne11, _ne12, _ne13] = src1.ne;
    let [ne0, ne1, ne2, ne3] = dst.ne;
    let ne = ne0 * ne1 * ne2 * ne3;

    let [nb00, nb01, nb02, nb03] = src0.nb;
    let [nb10, nb11, nb12, nb13] = src1.nb;
    let [nb0, nb1, nb2, nb3] = dst.nb;

    let (ith, nth) = (p.ith, p.nth);

    assert_eq!(ne02, src1.ne[2]);
    assert_eq!(ne03, src1.ne[3]);
    assert_eq!(ne2, src1.ne[2]);
    assert_eq!(ne3, src1.ne[3]);

    // permuted src0 beyond a plain transpose is not supported
    assert!(nb00 == F32S || nb01 == F32S);

    // dst cannot be transposed or permuted
    assert_eq!(nb0, F32S);
    assert!(nb0 <= nb1 && nb1 <= nb2 && nb2 <= nb3);

    assert_eq!(ne0, ne01);
    assert_eq!(ne1, ne11);
    assert_eq!(ne2, ne02);
    assert_eq!(ne3, ne03);

    #[cfg(feature = "blas")]
    {
        if mul_mat_use_blas(src0, src1, dst) {
            assert!(src0.is_contiguous());
            assert_eq!(nb10, F32S);

            if ith != 0 || p.phase != Phase::Compute {
                return;
            }

            for i03 in 0..ne03 {
                for i02 in 0..ne02 {
                    // SAFETY: batch slices are disjoint and in-bounds; only
                    // worker 0 runs this branch
                    unsafe {
                        let x = mem.f32_ptr(src0.data + i02 * nb02 + i03 * nb03);
                        let y = mem.f32_ptr(src1.data + i02 * nb12 + i03 * nb13);
                        let d = mem.f32_ptr(dst.data + i02 * nb2 + i03 * nb3);
                        sgemm_nt(ne11, ne01, ne10, y, x, d);
                    }
                }
            }
            return;
        }
    }

    if p.phase == Phase::Init {
        if nb01 >= nb00 {
            return;
        }
        // the column regime accumulates into the work buffer; one worker
        // clears it before the compute phase (the barrier orders this)
        if ith == 0 {
            // SAFETY: the work buffer spans wsize bytes
            unsafe {
                std::ptr::write_bytes(mem.u8_ptr(p.wdata), 0, p.wsize);
            }
        }
        return;
    }

    if p.phase == Phase::Finalize {
        if nb01 >= nb00 {
            return;
        }

        // gather the per-worker partial sums into dst
        let dc = (ne + nth - 1) / nth;
        let ic0 = dc * ith;
        let ic1 = (ic0 + dc).min(ne);
        let len = ic1.saturating_sub(ic0);

        // SAFETY: each worker gathers a disjoint chunk of dst; all compute
        // writes happened before the phase barrier
        unsafe {
            let wdata = mem.f32_ptr(p.wdata);
            kernels::vec_cpy_f32(len, mem.f32_ptr(dst.data).add(ic0), wdata.add(ic0));
            for k in 1..nth {
                kernels::vec_acc_f32(
                    len,
                    mem.f32_ptr(dst.data).add(ic0),
                    wdata.add((ne + CACHE_LINE_F32) * k + ic0),
                );
            }
        }
        return;
    }

    if nb01 >= nb00 {
        // row regime: parallelize over src0 rows, vector dot per cell
        assert_eq!(nb10, F32S);

        let nr = ne01 * ne02 * ne03;
        let dr = (nr + nth - 1) / nth;
        let ir0 = dr * ith;
        let ir1 = (ir0 + dr).min(nr);

        for ir in ir0..ir1 {
            let i03 = ir / (ne02 * ne01);
            let i02 = (ir - i03 * ne02 * ne01) / ne01;
            let i01 = ir - i03 * ne02 * ne01 - i02 * ne01;

            for ic in 0..ne11 {
                // SAFETY: each (i01, ic) output cell is written by exactly
                // one worker
                unsafe {
                    let v = kernels::dot_f32(
                        ne00,
                        mem.f32_ptr(src0.data + i01 * nb01 + i02 * nb02 + i03 * nb03),
                        mem.f32_ptr(src1.data + ic * nb11 + i02 * nb12 + i03 * nb13),
                    );
                    *mem.f32_ptr(dst.data + i01 * nb0 + ic * nb1 + i02 * nb2 + i03 * nb3) = v;
                }
            }
        }
    } else {
        // column regime: parallelize over src1 columns; per-worker
        // accumulators in the work buffer, gathered in FINALIZE
        let nc = ne10;
        let dc = (nc + nth - 1) / nth;
        let ic0 = dc * ith;
        let ic1 = (ic0 + dc).min(nc);

        let wo = (ne + CACHE_LINE_F32) * ith;

        for i13 in 0..src1.ne[3] {
            for i12 in 0..src1.ne[2] {
                for i11 in 0..ne11 {
                    for ic in ic0..ic1 {
                        let i10 = ic;
                        let (i03, i02, i00) = (i13, i12, ic);
                        let (i1, i2, i3) = (i11, i12, i13);

                        debug_assert!(
                            F32S * (wo + i3 * ne2 * ne1 * ne0 + i2 * ne1 * ne0 + i1 * ne0 + ne01)
                                <= p.wsize
                        );

                        // SAFETY: each worker owns its wdata slice `wo`
                        unsafe {
                            kernels::mad_f32(
                                ne01,
                                mem.f32_ptr(p.wdata)
                                    .add(wo + i3 * ne2 * ne1 * ne0 + i2 * ne1 * ne0 + i1 * ne0),
                                mem.f32_ptr(src0.data + i00 * nb00 + i02 * nb02 + i03 * nb03),
                                *mem.f32_ptr(
                                    src1.data + i10 * nb10 + i11 * nb11 + i12 * nb12 + i13 * nb13,
                                ),
                            );
                        }
                    }
                }
            }
        }
    }
}

fn mul_mat_f16_f32(p: &ComputeParams, mem: &ArenaMem, src0: &Tensor, src1: &Tensor, dst: &Tensor) {
    let [ne00, ne01, ne02, ne03] = src0.ne;
    let [ne10, ne11, ne12, ne13] = src1.ne;
    let [ne0, ne1, ne2, ne3] = dst.ne;
    let ne = ne0 * ne1 * ne2 * ne3;

    let [nb00, nb01, nb02, nb03] = src0.nb;
    let [nb10, nb11, nb12, nb13] = src1.nb;
    let [nb0, nb1, nb2, nb3] = dst.nb;

    let (ith, nth) = (p.ith, p.nth);

    assert_eq!(ne02, ne12);
    assert_eq!(ne03, ne13);
    assert_eq!(ne2, ne12);
    assert_eq!(ne3, ne13);

    assert!(nb00 == F16S || nb01 == F16S);

    assert_eq!(nb0, F32S);
    assert!(nb0 <= nb1 && nb1 <= nb2 && nb2 <= nb3);

    assert_eq!(ne0, ne01);
    assert_eq!(ne1, ne11);
    assert_eq!(ne2, ne02);
    assert_eq!(ne3, ne03);

    #[cfg(feature = "blas")]
    {
        if mul_mat_use_blas(src0, src1, dst) {
            assert_eq!(nb10, F32S);

            if ith != 0 || p.phase != Phase::Compute {
                return;
            }

            for i03 in 0..ne03 {
                for i02 in 0..ne02 {
                    // widen src0 into the f32 work buffer, then sgemm
                    // SAFETY: wdata holds ne00*ne01 f32; only worker 0 here
                    unsafe {
                        let wdata = mem.f32_ptr(p.wdata);
                        let mut id = 0usize;
                        for i01 in 0..ne01 {
                            for i00 in 0..ne00 {
                                let h = *mem.f16_ptr(
                                    src0.data + i03 * nb03 + i02 * nb02 + i01 * nb01 + i00 * nb00,
                                );
                                *wdata.add(id) = h.to_f32();
                                id += 1;
                            }
                        }

                        let y = mem.f32_ptr(src1.data + i02 * nb12 + i03 * nb13);
                        let d = mem.f32_ptr(dst.data + i02 * nb2 + i03 * nb3);
                        sgemm_nt(ne11, ne01, ne10, y, wdata, d);
                    }
                }
            }
            return;
        }
    }

    if p.phase == Phase::Init {
        if nb01 >= nb00 {
            // pre-convert src1 to f16 so the row regime dots run f16·f16
            if ith == 0 {
                // SAFETY: wdata holds nelements(src1) f16; barrier orders
                // this before any compute-phase read
                unsafe {
                    let wdata = mem.f16_ptr(p.wdata);
                    let mut id = 0usize;
                    for i13 in 0..ne13 {
                        for i12 in 0..ne12 {
                            for i11 in 0..ne11 {
                                for i10 in 0..ne10 {
                                    let v = *mem.f32_ptr(
                                        src1.data
                                            + i13 * nb13
                                            + i12 * nb12
                                            + i11 * nb11
                                            + i10 * nb10,
                                    );
                                    *wdata.add(id) = f16::from_f32(v);
                                    id += 1;
                                }
                            }
                        }
                    }
                    debug_assert!(id * F16S <= p.wsize);
                }
            }
            return;
        }

        if ith == 0 {
            // SAFETY: the work buffer spans wsize bytes
            unsafe {
                std::ptr::write_bytes(mem.u8_ptr(p.wdata), 0, p.wsize);
            }
        }
        return;
    }

    if p.phase == Phase::Finalize {
        if nb01 >= nb00 {
            return;
        }

        // widen and gather the per-worker f16 partial sums into dst
        let dc = (ne + nth - 1) / nth;
        let ic0 = dc * ith;
        let ic1 = (ic0 + dc).min(ne);

        // SAFETY: disjoint dst chunks per worker
        unsafe {
            let wdata = mem.f16_ptr(p.wdata);
            let d = mem.f32_ptr(dst.data);
            for i in ic0..ic1 {
                *d.add(i) = (*wdata.add(i)).to_f32();
            }
            for k in 1..nth {
                for i in ic0..ic1 {
                    *d.add(i) += (*wdata.add((ne + CACHE_LINE_F32) * k + i)).to_f32();
                }
            }
        }
        return;
    }

    if nb01 >= nb00 {
        // row regime over pre-converted src1
        let nr = ne01 * ne02 * ne03;
        let dr = (nr + nth - 1) / nth;
        let ir0 = dr * ith;
        let ir1 = (ir0 + dr).min(nr);

        for ir in ir0..ir1 {
            let i03 = ir / (ne02 * ne01);
            let i02 = (ir - i03 * ne02 * ne01) / ne01;
            let i01 = ir - i03 * ne02 * ne01 - i02 * ne01;

            let (i13, i12) = (i03, i02);
            let (i0, i2, i3) = (i01, i02, i03);

            // SAFETY: each worker writes its own dst rows; wdata was filled
            // during INIT
            unsafe {
                let src0_row = mem.f16_ptr(src0.data + i01 * nb01 + i02 * nb02 + i03 * nb03);
                let src1_col = mem.f16_ptr(p.wdata).add((i13 * ne12 * ne11 + i12 * ne11) * ne00);
                let dst_col = mem.f32_ptr(dst.data + i0 * nb0 + i2 * nb2 + i3 * nb3);

                for ic in 0..ne11 {
                    let v = kernels::dot_f16(ne00, src0_row, src1_col.add(ic * ne00));
                    *dst_col.add(ic * ne0) = v;
                }
            }
        }
    } else {
        // column regime with f16 accumulators
        let nc = ne10;
        let dc = (nc + nth - 1) / nth;
        let ic0 = dc * ith;
        let ic1 = (ic0 + dc).min(nc);

        let wo = (ne + CACHE_LINE_F32) * ith;

        for i13 in 0..ne13 {
            for i12 in 0..ne12 {
                for i11 in 0..ne11 {
                    let (i1, i2, i3) = (i11, i12, i13);

                    // SAFETY: each worker owns its wdata slice `wo`
                    unsafe {
                        let dst_row = mem
                            .f16_ptr(p.wdata)
                            .add(wo + i3 * ne2 * ne1 * ne0 + i2 * ne1 * ne0 + i1 * ne0);

                        for ic in ic0..ic1 {
                            let i10 = ic;
                            let (i03, i02, i00) = (i13, i12, ic);

                            debug_assert!(
                                F16S * (wo
                                    + i3 * ne2 * ne1 * ne0
                                    + i2 * ne1 * ne0
                                    + i1 * ne0
                                    + ne01)
                                    <= p.wsize
                            );

                            let src0_col =
                                mem.f16_ptr(src0.data + i00 * nb00 + i02 * nb02 + i03 * nb03);
                            let src1_val = *mem.f32_ptr(
                                src1.data + i10 * nb10 + i11 * nb11 + i12 * nb12 + i13 * nb13,
                            );

                            kernels::mad_f16(ne01, dst_row, src0_col, src1_val);
                        }
                    }
                }
            }
        }
    }
}
