#![allow(dead_code)]

use half::f16;
use tensorforge::{Context, DType, TensorId};

/// A context large enough for every test graph.
pub fn test_ctx() -> Context {
    Context::init(64 * 1024 * 1024).unwrap()
}

/// Create an F32 vector tensor from a slice.
pub fn tensor_1d(ctx: &mut Context, data: &[f32]) -> TensorId {
    let t = ctx.new_tensor_1d(DType::F32, data.len()).unwrap();
    ctx.data_f32_mut(t).copy_from_slice(data);
    t
}

/// Create an F32 matrix tensor `{ne0, ne1}` from row-major-by-ne1 data
/// (element `[i1][i0]` at index `i1*ne0 + i0`).
pub fn tensor_2d(ctx: &mut Context, ne0: usize, ne1: usize, data: &[f32]) -> TensorId {
    assert_eq!(data.len(), ne0 * ne1);
    let t = ctx.new_tensor_2d(DType::F32, ne0, ne1).unwrap();
    ctx.data_f32_mut(t).copy_from_slice(data);
    t
}

/// Create an F16 tensor from f32 values.
pub fn tensor_2d_f16(ctx: &mut Context, ne0: usize, ne1: usize, data: &[f32]) -> TensorId {
    assert_eq!(data.len(), ne0 * ne1);
    let t = ctx.new_tensor_2d(DType::F16, ne0, ne1).unwrap();
    for (dst, &v) in ctx.data_f16_mut(t).iter_mut().zip(data) {
        *dst = f16::from_f32(v);
    }
    t
}

/// Assert two f32 slices are element-wise close within a tolerance.
pub fn assert_f32_near(actual: &[f32], expected: &[f32], tolerance: f32, msg: &str) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "{}: length mismatch (actual={}, expected={})",
        msg,
        actual.len(),
        expected.len()
    );
    for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "{}: element [{}] mismatch: actual={}, expected={}, diff={}, tolerance={}",
            msg,
            i,
            a,
            e,
            (a - e).abs(),
            tolerance
        );
    }
}
