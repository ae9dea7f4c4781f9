//! 1-D convolution, stride 1 or 2, odd kernel width. INIT repacks the
//! kernel bank and the zero-padded signal into 32-lane-padded work-buffer
//! layouts so the compute phase runs plain vector dots.

use half::f16;

use crate::core::arena::ArenaMem;
use crate::core::tensor::{up32, DType, Tensor};
use crate::graph::executor::{ComputeParams, Phase};
use crate::kernels;

const F32S: usize = std::mem::size_of::<f32>();
const F16S: usize = std::mem::size_of::<u16>();

pub(crate) fn conv_1d(
    p: &ComputeParams,
    mem: &ArenaMem,
    src0: &Tensor,
    src1: &Tensor,
    dst: &Tensor,
    stride: usize,
) {
    match (src0.dtype, src1.dtype) {
        (DType::F16, DType::F32) => conv_1d_f16_f32(p, mem, src0, src1, dst, stride),
        (DType::F32, DType::F32) => conv_1d_f32(p, mem, src0, src1, dst, stride),
        _ => panic!(
            "conv_1d: unsupported dtype pair {:?}/{:?}",
            src0.dtype, src1.dtype
        ),
    }
}

fn conv_1d_f16_f32(
    p: &ComputeParams,
    mem: &ArenaMem,
    src0: &Tensor,
    src1: &Tensor,
    dst: &Tensor,
    stride: usize,
) {
    assert_eq!(dst.dtype, DType::F32);

    let [ne00, ne01, ne02, _] = src0.ne;
    let [ne10, ne11, _, _] = src1.ne;

    let [nb00, nb01, nb02, _] = src0.nb;
    let [nb10, nb11, _, _] = src1.nb;

    let nb1 = dst.nb[1];

    let (ith, nth) = (p.ith, p.nth);

    let nk = ne00;
    let nh = nk / 2;
    let ew0 = up32(ne01);

    assert_eq!(ne00 % 2, 1, "conv_1d: kernel width must be odd");
    assert_eq!(nb00, F16S);
    assert_eq!(nb10, F32S);

    if p.phase == Phase::Init {
        // single-writer repack, ordered by the phase barrier
        if ith != 0 {
            return;
        }
        // SAFETY: wsize covers both repacked regions (sized in the
        // executor); worker 0 is the only writer during INIT
        unsafe {
            std::ptr::write_bytes(mem.u8_ptr(p.wdata), 0, p.wsize);
            let wdata = mem.f16_ptr(p.wdata);

            // kernel bank: lane-interleaved, one ew0-wide row per tap
            for i02 in 0..ne02 {
                for i01 in 0..ne01 {
                    let src = mem.f16_ptr(src0.data + i02 * nb02 + i01 * nb01);
                    let dst_data = wdata.add(i02 * ew0 * ne00);
                    for i00 in 0..ne00 {
                        *dst_data.add(i00 * ew0 + i01) = *src.add(i00);
                    }
                }
            }

            // signal: zero-padded by nh on both sides, widened to f16
            let wdata = wdata.add(ne02 * ew0 * ne00);
            for i11 in 0..ne11 {
                let src = mem.f32_ptr(src1.data + i11 * nb11);
                for i10 in 0..ne10 {
                    *wdata.add((i10 + nh) * ew0 + i11) = f16::from_f32(*src.add(i10));
                }
            }
        }
        return;
    }

    if p.phase == Phase::Finalize {
        return;
    }

    // one dst row per output channel
    let nr = ne02;
    let dr = (nr + nth - 1) / nth;
    let ir0 = dr * ith;
    let ir1 = (ir0 + dr).min(nr);

    for i1 in ir0..ir1 {
        // SAFETY: each worker owns disjoint dst rows; wdata reads were
        // published by the INIT barrier
        unsafe {
            let dst_data = mem.f32_ptr(dst.data + i1 * nb1);
            let wkernel = mem.f16_ptr(p.wdata).add(i1 * ew0 * ne00);
            let wsignal = mem.f16_ptr(p.wdata).add(ne02 * ew0 * ne00);

            let mut i0 = 0;
            while i0 < ne10 {
                let mut acc = 0.0f32;
                for k in 0..nk {
                    acc += kernels::dot_f16(
                        ew0,
                        wkernel.add(k * ew0),
                        wsignal.add((i0 + k) * ew0),
                    );
                }
                *dst_data.add(i0 / stride) = acc;
                i0 += stride;
            }
        }
    }
}

fn conv_1d_f32(
    p: &ComputeParams,
    mem: &ArenaMem,
    src0: &Tensor,
    src1: &Tensor,
    dst: &Tensor,
    stride: usize,
) {
    assert_eq!(dst.dtype, DType::F32);

    let [ne00, ne01, ne02, _] = src0.ne;
    let [ne10, ne11, _, _] = src1.ne;

    let [nb00, nb01, nb02, _] = src0.nb;
    let [nb10, nb11, _, _] = src1.nb;

    let nb1 = dst.nb[1];

    let (ith, nth) = (p.ith, p.nth);

    let nk = ne00;
    let nh = nk / 2;
    let ew0 = up32(ne01);

    assert_eq!(ne00 % 2, 1, "conv_1d: kernel width must be odd");
    assert_eq!(nb00, F32S);
    assert_eq!(nb10, F32S);

    if p.phase == Phase::Init {
        if ith != 0 {
            return;
        }
        // SAFETY: as in the f16 variant
        unsafe {
            std::ptr::write_bytes(mem.u8_ptr(p.wdata), 0, p.wsize);
            let wdata = mem.f32_ptr(p.wdata);

            for i02 in 0..ne02 {
                for i01 in 0..ne01 {
                    let src = mem.f32_ptr(src0.data + i02 * nb02 + i01 * nb01);
                    let dst_data = wdata.add(i02 * ew0 * ne00);
                    for i00 in 0..ne00 {
                        *dst_data.add(i00 * ew0 + i01) = *src.add(i00);
                    }
                }
            }

            let wdata = wdata.add(ne02 * ew0 * ne00);
            for i11 in 0..ne11 {
                let src = mem.f32_ptr(src1.data + i11 * nb11);
                for i10 in 0..ne10 {
                    *wdata.add((i10 + nh) * ew0 + i11) = *src.add(i10);
                }
            }
        }
        return;
    }

    if p.phase == Phase::Finalize {
        return;
    }

    let nr = ne02;
    let dr = (nr + nth - 1) / nth;
    let ir0 = dr * ith;
    let ir1 = (ir0 + dr).min(nr);

    for i1 in ir0..ir1 {
        // SAFETY: as in the f16 variant
        unsafe {
            let dst_data = mem.f32_ptr(dst.data + i1 * nb1);
            let wkernel = mem.f32_ptr(p.wdata).add(i1 * ew0 * ne00);
            let wsignal = mem.f32_ptr(p.wdata).add(ne02 * ew0 * ne00);

            let mut i0 = 0;
            while i0 < ne10 {
                let mut acc = 0.0f32;
                for k in 0..nk {
                    acc += kernels::dot_f32(
                        ew0,
                        wkernel.add(k * ew0),
                        wsignal.add((i0 + k) * ew0),
                    );
                }
                *dst_data.add(i0 / stride) = acc;
                i0 += stride;
            }
        }
    }
}
