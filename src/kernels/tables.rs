//! Precomputed f16 lookup tables: one entry per 16-bit pattern (128 KiB
//! each) for GELU and exp. Built once, on first context init.

use half::f16;
use log::debug;
use once_cell::sync::Lazy;
use std::time::Instant;

const GELU_COEF_A: f64 = 0.044715;
const SQRT_2_OVER_PI: f64 = 0.797_884_560_802_865_4;

/// Reference GELU: `0.5*x*(1 + tanh(sqrt(2/pi)*x*(1 + 0.044715*x^2)))`.
pub fn gelu_ref(x: f32) -> f32 {
    let x = x as f64;
    (0.5 * x * (1.0 + (SQRT_2_OVER_PI * x * (1.0 + GELU_COEF_A * x * x)).tanh())) as f32
}

pub(crate) static GELU_TABLE: Lazy<Vec<f16>> = Lazy::new(|| {
    (0..=u16::MAX)
        .map(|bits| f16::from_f32(gelu_ref(f16::from_bits(bits).to_f32())))
        .collect()
});

pub(crate) static EXP_TABLE: Lazy<Vec<f16>> = Lazy::new(|| {
    (0..=u16::MAX)
        .map(|bits| f16::from_f32(f16::from_bits(bits).to_f32().exp()))
        .collect()
});

/// Force both tables. Called from `Context::init` so the first graph
/// execution does not pay the build cost.
pub(crate) fn ensure_init() {
    static DONE: Lazy<()> = Lazy::new(|| {
        let t0 = Instant::now();
        Lazy::force(&GELU_TABLE);
        Lazy::force(&EXP_TABLE);
        debug!(
            "GELU and exp tables initialized in {:.3} ms",
            t0.elapsed().as_secs_f64() * 1e3
        );
    });
    Lazy::force(&DONE);
}

/// Tabled GELU: index by the f16 bit pattern of `x`.
#[inline]
pub fn gelu_lookup(x: f32) -> f32 {
    GELU_TABLE[f16::from_f32(x).to_bits() as usize].to_f32()
}

#[inline]
pub(crate) fn gelu_lookup_f16(x: f16) -> f16 {
    GELU_TABLE[x.to_bits() as usize]
}

/// Tabled exp: index by the f16 bit pattern of `x`.
#[inline]
pub fn exp_lookup(x: f32) -> f32 {
    EXP_TABLE[f16::from_f32(x).to_bits() as usize].to_f32()
}
