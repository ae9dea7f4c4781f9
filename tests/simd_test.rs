use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tensorforge::kernels::{self, simd};

fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-4.0f32..4.0)).collect()
}

#[test]
fn dot_f32_matches_scalar_reference() {
    let mut rng = StdRng::seed_from_u64(42);
    // lengths straddling every unroll boundary
    for n in [0usize, 1, 3, 4, 7, 8, 15, 16, 17, 31, 32, 33, 64, 67, 129] {
        let x = random_vec(&mut rng, n);
        let y = random_vec(&mut rng, n);

        let expected = simd::dot_f32_scalar_ref(&x, &y);
        let got = kernels::dot(&x, &y);

        let tol = 1e-5 * expected.abs().max(1.0);
        assert!(
            (got - expected).abs() <= tol,
            "dot_f32 n={n}: got {got}, expected {expected}"
        );
    }
}

#[test]
fn dot_f16_matches_scalar_reference() {
    let mut rng = StdRng::seed_from_u64(7);
    for n in [1usize, 4, 8, 9, 16, 31, 33, 100] {
        let x: Vec<f16> = random_vec(&mut rng, n).iter().map(|&v| f16::from_f32(v)).collect();
        let y: Vec<f16> = random_vec(&mut rng, n).iter().map(|&v| f16::from_f32(v)).collect();

        let expected = simd::dot_f16_scalar_ref(&x, &y);
        // SAFETY: lengths match
        let got = unsafe { kernels::dot_f16(n, x.as_ptr(), y.as_ptr()) };

        let tol = 1e-3 * expected.abs().max(1.0);
        assert!(
            (got - expected).abs() <= tol,
            "dot_f16 n={n}: got {got}, expected {expected}"
        );
    }
}

#[test]
fn mad_f32_matches_scalar_reference() {
    let mut rng = StdRng::seed_from_u64(3);
    for n in [1usize, 5, 8, 13, 32, 50] {
        let x = random_vec(&mut rng, n);
        let mut y0 = random_vec(&mut rng, n);
        let mut y1 = y0.clone();
        let v = rng.gen_range(-2.0f32..2.0);

        simd::mad_f32_scalar_ref(&mut y0, &x, v);
        kernels::mad(&mut y1, &x, v);

        for i in 0..n {
            assert!(
                (y0[i] - y1[i]).abs() <= 1e-5,
                "mad n={n} element {i}: {} vs {}",
                y1[i],
                y0[i]
            );
        }
    }
}

#[test]
fn scale_matches_plain_multiply() {
    let mut rng = StdRng::seed_from_u64(11);
    for n in [1usize, 7, 8, 24, 41] {
        let y = random_vec(&mut rng, n);
        let v = rng.gen_range(-3.0f32..3.0);

        let expected: Vec<f32> = y.iter().map(|e| e * v).collect();
        let mut got = y.clone();
        kernels::scale(&mut got, v);

        for i in 0..n {
            assert!((got[i] - expected[i]).abs() <= 1e-6);
        }
    }
}

#[test]
fn fp16_roundtrip_relative_error() {
    // f32 -> f16 -> f32 within 2^-10 relative error across the normal range
    let mut rng = StdRng::seed_from_u64(99);
    for _ in 0..10_000 {
        let exp = rng.gen_range(-14i32..15);
        let mantissa = rng.gen_range(1.0f32..2.0);
        let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        let x = sign * mantissa * (exp as f32).exp2();

        let roundtrip = f16::from_f32(x).to_f32();
        assert!(
            (roundtrip - x).abs() <= x.abs() * (-10.0f32).exp2(),
            "roundtrip {x} -> {roundtrip}"
        );
    }
}

#[test]
fn fp16_special_values() {
    assert_eq!(f16::from_f32(0.0).to_bits(), 0);
    assert!(f16::from_f32(f32::NAN).is_nan());
    assert_eq!(f16::from_f32(f32::INFINITY).to_f32(), f32::INFINITY);
    assert_eq!(f16::from_f32(1e30).to_f32(), f32::INFINITY);
}

#[test]
fn gelu_table_tracks_reference() {
    let mut x = -6.0f32;
    while x <= 6.0 {
        let table = kernels::gelu_lookup(x);
        let exact = kernels::gelu_ref(x);
        assert!(
            (table - exact).abs() <= 8e-3,
            "gelu({x}): table {table}, exact {exact}"
        );
        x += 0.013;
    }
}

#[test]
fn exp_table_tracks_reference() {
    let mut x = -10.0f32;
    while x <= 2.0 {
        let table = kernels::exp_lookup(x);
        let exact = x.exp();
        // both the input and the table entry are quantized to f16
        let tol = 1e-2 * exact.max(1e-4);
        assert!(
            (table - exact).abs() <= tol,
            "exp({x}): table {table}, exact {exact}"
        );
        x += 0.017;
    }
}

#[test]
fn cpu_feature_queries_do_not_panic() {
    let _ = kernels::cpu_has_avx2();
    let _ = kernels::cpu_has_avx512();
    let _ = kernels::cpu_has_neon();
    let _ = kernels::cpu_has_fp16_va();
    let _ = kernels::cpu_has_wasm_simd();
    let _ = kernels::cpu_has_blas();
}
