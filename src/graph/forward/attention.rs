//! Fused attention kernels. Each worker owns a scratch row `S` (plus an f16
//! copy in the f16 paths) inside the work buffer and a disjoint set of query
//! rows, so the whole op needs no cross-worker reduction.

use half::f16;

use crate::core::arena::ArenaMem;
use crate::core::tensor::{DType, Tensor};
use crate::graph::executor::{ComputeParams, Phase, CACHE_LINE_F32};
use crate::kernels::{self, tables};

const F32S: usize = std::mem::size_of::<f32>();
const F16S: usize = std::mem::size_of::<u16>();

/// Tabled softmax over the scratch row `s[0..m]`, in place.
///
/// # Safety
/// `s` must be valid for `m` reads and writes.
unsafe fn softmax_row(m: usize, s: *mut f32) {
    let mut max = f32::NEG_INFINITY;
    for i in 0..m {
        max = max.max(*s.add(i));
    }

    let mut sum = 0.0f64;
    for i in 0..m {
        let v = *s.add(i);
        if v == f32::NEG_INFINITY {
            *s.add(i) = 0.0;
        } else {
            let e = tables::exp_lookup(v - max);
            sum += e as f64;
            *s.add(i) = e;
        }
    }

    debug_assert!(sum > 0.0);
    kernels::scale_f32(m, s, (1.0 / sum) as f32);
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn flash_attn(
    p: &ComputeParams,
    mem: &ArenaMem,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    masked: bool,
    dst: &Tensor,
) {
    match q.dtype {
        DType::F32 => flash_attn_f32(p, mem, q, k, v, masked, dst),
        DType::F16 => flash_attn_f16(p, mem, q, k, v, masked, dst),
        _ => panic!("flash_attn: unsupported dtype {:?}", q.dtype),
    }
}

#[allow(clippy::too_many_arguments)]
fn flash_attn_f32(
    p: &ComputeParams,
    mem: &ArenaMem,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    masked: bool,
    dst: &Tensor,
) {
    let [neq0, neq1, neq2, neq3] = q.ne;
    let nek1 = k.ne[1];
    let nev1 = v.ne[1];

    let [ne0, ne1, _, _] = dst.ne;

    let [nbq0, nbq1, nbq2, nbq3] = q.nb;
    let [nbk0, nbk1, nbk2, nbk3] = k.nb;
    let [nbv0, nbv1, nbv2, nbv3] = v.nb;
    let [nb0, nb1, nb2, nb3] = dst.nb;

    let (ith, nth) = (p.ith, p.nth);

    let d = neq0;
    let n = neq1;
    let pk = nek1 - n; // past tokens already in K
    let m = pk + n;

    assert_eq!(ne0, d);
    assert_eq!(ne1, n);

    assert_eq!(nbq0, F32S);
    assert_eq!(nbk0, F32S);
    assert_eq!(nbv0, F32S);

    assert_eq!(k.ne[0], d);
    assert_eq!(nev1, d);

    assert_eq!(nb0, F32S);
    assert!(nb0 <= nb1 && nb1 <= nb2 && nb2 <= nb3);

    if p.phase != Phase::Compute {
        return;
    }

    // parallelize by q rows
    let nr = neq1 * neq2 * neq3;
    let dr = (nr + nth - 1) / nth;
    let ir0 = dr * ith;
    let ir1 = (ir0 + dr).min(nr);

    let scale = (1.0 / (d as f64).sqrt()) as f32;

    for ir in ir0..ir1 {
        let iq3 = ir / (neq2 * neq1);
        let iq2 = (ir - iq3 * neq2 * neq1) / neq1;
        let iq1 = ir - iq3 * neq2 * neq1 - iq2 * neq1;

        // SAFETY: `s` is this worker's private scratch row; all tensor
        // offsets are bounded by the shapes asserted above
        unsafe {
            let s = mem.f32_ptr(p.wdata).add(ith * (m + CACHE_LINE_F32));

            for ic in 0..nek1 {
                *s.add(ic) = kernels::dot_f32(
                    neq0,
                    mem.f32_ptr(k.data + ic * nbk1 + iq2 * nbk2 + iq3 * nbk3),
                    mem.f32_ptr(q.data + iq1 * nbq1 + iq2 * nbq2 + iq3 * nbq3),
                );
            }

            kernels::scale_f32(nek1, s, scale);

            if masked {
                for i in pk..m {
                    if i > pk + iq1 {
                        *s.add(i) = f32::NEG_INFINITY;
                    }
                }
            }

            softmax_row(m, s);

            for ic in 0..nev1 {
                *mem.f32_ptr(dst.data + ic * nb0 + iq1 * nb1 + iq2 * nb2 + iq3 * nb3) =
                    kernels::dot_f32(
                        nek1,
                        mem.f32_ptr(v.data + ic * nbv1 + iq2 * nbv2 + iq3 * nbv3),
                        s,
                    );
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn flash_attn_f16(
    p: &ComputeParams,
    mem: &ArenaMem,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    masked: bool,
    dst: &Tensor,
) {
    let [neq0, neq1, neq2, neq3] = q.ne;
    let nek1 = k.ne[1];
    let nev1 = v.ne[1];

    let [ne0, ne1, _, _] = dst.ne;

    let [nbq0, nbq1, nbq2, nbq3] = q.nb;
    let [nbk0, nbk1, nbk2, nbk3] = k.nb;
    let [nbv0, nbv1, nbv2, nbv3] = v.nb;
    let [nb0, nb1, nb2, nb3] = dst.nb;

    let (ith, nth) = (p.ith, p.nth);

    let d = neq0;
    let n = neq1;
    let pk = nek1 - n;
    let m = pk + n;

    assert_eq!(ne0, d);
    assert_eq!(ne1, n);

    assert_eq!(nbq0, F16S);
    assert_eq!(nbk0, F16S);
    assert_eq!(nbv0, F16S);

    assert_eq!(k.ne[0], d);
    assert_eq!(nev1, d);

    assert_eq!(nb0, F32S);
    assert!(nb0 <= nb1 && nb1 <= nb2 && nb2 <= nb3);

    if p.phase != Phase::Compute {
        return;
    }

    let nr = neq1 * neq2 * neq3;
    let dr = (nr + nth - 1) / nth;
    let ir0 = dr * ith;
    let ir1 = (ir0 + dr).min(nr);

    let scale = (1.0 / (d as f64).sqrt()) as f32;

    for ir in ir0..ir1 {
        let iq3 = ir / (neq2 * neq1);
        let iq2 = (ir - iq3 * neq2 * neq1) / neq1;
        let iq1 = ir - iq3 * neq2 * neq1 - iq2 * neq1;

        // SAFETY: as in the f32 variant; the scratch slice additionally
        // holds an f16 copy of the scores after the softmax
        unsafe {
            let s = mem.f32_ptr(p.wdata).add(ith * (2 * m + CACHE_LINE_F32));

            for ic in 0..nek1 {
                *s.add(ic) = kernels::dot_f16(
                    neq0,
                    mem.f16_ptr(k.data + ic * nbk1 + iq2 * nbk2 + iq3 * nbk3),
                    mem.f16_ptr(q.data + iq1 * nbq1 + iq2 * nbq2 + iq3 * nbq3),
                );
            }

            kernels::scale_f32(nek1, s, scale);

            if masked {
                for i in pk..m {
                    if i > pk + iq1 {
                        *s.add(i) = f32::NEG_INFINITY;
                    }
                }
            }

            softmax_row(m, s);

            let s16 = s.add(m) as *mut f16;
            for i in 0..m {
                *s16.add(i) = f16::from_f32(*s.add(i));
            }

            for ic in 0..nev1 {
                *mem.f32_ptr(dst.data + ic * nb0 + iq1 * nb1 + iq2 * nb2 + iq3 * nb3) =
                    kernels::dot_f16(
                        nek1,
                        mem.f16_ptr(v.data + ic * nbv1 + iq2 * nbv2 + iq3 * nbv3),
                        s16,
                    );
            }
        }
    }
}

/// `dst = gelu(a*b0' + b1)*c0' + c1` with f16 activations/weights and f32
/// biases.
#[allow(clippy::too_many_arguments)]
pub(crate) fn flash_ff(
    p: &ComputeParams,
    mem: &ArenaMem,
    a: &Tensor,
    b0: &Tensor,
    b1: &Tensor,
    c0: &Tensor,
    c1: &Tensor,
    dst: &Tensor,
) {
    assert_eq!(b0.dtype, DType::F16, "flash_ff: f16 weights only");

    let [nea0, nea1, nea2, nea3] = a.ne;
    let [neb00, neb01, _, _] = b0.ne;
    let [nec00, nec01, _, _] = c0.ne;

    let [ne0, ne1, ne2, _] = dst.ne;

    let [nba0, nba1, nba2, nba3] = a.nb;
    let [nbb00, nbb01, nbb02, nbb03] = b0.nb;
    let nbb10 = b1.nb[0];
    let [nbc00, nbc01, nbc02, nbc03] = c0.nb;
    let nbc10 = c1.nb[0];
    let [nb0, nb1, nb2, nb3] = dst.nb;

    let (ith, nth) = (p.ith, p.nth);

    let d = nea0;
    let m = neb01;

    assert_eq!(ne0, nea0);
    assert_eq!(ne1, nea1);
    assert_eq!(ne2, nea2);

    assert_eq!(nba0, F16S);
    assert_eq!(nbb00, F16S);
    assert_eq!(nbb10, F32S);
    assert_eq!(nbc00, F16S);
    assert_eq!(nbc10, F32S);

    assert_eq!(neb00, d);
    assert_eq!(b1.ne[0], m);
    assert_eq!(b1.ne[1], 1);

    assert_eq!(nec00, m);
    assert_eq!(nec01, d);
    assert_eq!(c1.ne[0], d);
    assert_eq!(c1.ne[1], 1);

    assert_eq!(nb0, F32S);
    assert!(nb0 <= nb1 && nb1 <= nb2 && nb2 <= nb3);

    if p.phase != Phase::Compute {
        return;
    }

    // parallelize by rows of `a`
    let nr = nea1 * nea2 * nea3;
    let dr = (nr + nth - 1) / nth;
    let ir0 = dr * ith;
    let ir1 = (ir0 + dr).min(nr);

    for ir in ir0..ir1 {
        let ia3 = ir / (nea2 * nea1);
        let ia2 = (ir - ia3 * nea2 * nea1) / nea1;
        let ia1 = ir - ia3 * nea2 * nea1 - ia2 * nea1;

        // SAFETY: `s` is this worker's private scratch row; offsets bounded
        // by the shapes asserted above
        unsafe {
            let s = mem.f32_ptr(p.wdata).add(ith * (2 * m + CACHE_LINE_F32));

            for ic in 0..neb01 {
                *s.add(ic) = kernels::dot_f16(
                    nea0,
                    mem.f16_ptr(b0.data + ic * nbb01 + ia2 * nbb02 + ia3 * nbb03),
                    mem.f16_ptr(a.data + ia1 * nba1 + ia2 * nba2 + ia3 * nba3),
                );
            }

            kernels::vec_add_f32(neb01, s, s, mem.f32_ptr(b1.data));

            let s16 = s.add(m) as *mut f16;
            for i in 0..m {
                *s16.add(i) = f16::from_f32(*s.add(i));
            }

            kernels::vec_gelu_f16(neb01, s16, s16);

            let (i1, i2, i3) = (ia1, ia2, ia3);

            for ic in 0..nec01 {
                *mem.f32_ptr(dst.data + ic * nb0 + i1 * nb1 + i2 * nb2 + i3 * nb3) =
                    kernels::dot_f16(
                        neb01,
                        mem.f16_ptr(c0.data + ic * nbc01 + i2 * nbc02 + i3 * nbc03),
                        s16,
                    );
            }

            kernels::vec_acc_f32(
                nec01,
                mem.f32_ptr(dst.data + i1 * nb1 + i2 * nb2 + i3 * nb3),
                mem.f32_ptr(c1.data),
            );
        }
    }
}
