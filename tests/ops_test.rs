mod common;

use common::{assert_f32_near, tensor_1d, tensor_2d, tensor_2d_f16, test_ctx};
use half::f16;
use tensorforge::kernels::gelu_lookup;
use tensorforge::{Context, DType, Graph, TensorId};

fn run(ctx: &mut Context, root: TensorId) {
    let mut graph = Graph::build_forward(ctx, root).unwrap();
    graph.compute(ctx).unwrap();
}

#[test]
fn mul_mat_2x3_times_3x2() {
    // effective A = [[1,2,3],[4,5,6]], B = [[7,8],[9,10],[11,12]]
    // (both stored with the inner dimension first)
    let mut ctx = test_ctx();
    let a = tensor_2d(&mut ctx, 3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = tensor_2d(&mut ctx, 3, 2, &[7.0, 9.0, 11.0, 8.0, 10.0, 12.0]);
    let c = ctx.mul_mat(a, b).unwrap();
    run(&mut ctx, c);

    assert_eq!(&ctx.tensor(c).ne()[..2], &[2, 2]);
    assert_f32_near(
        ctx.data_f32(c),
        &[58.0, 139.0, 64.0, 154.0],
        1e-4,
        "2x3 * 3x2",
    );
}

#[test]
fn mul_mat_rejects_inner_mismatch() {
    let mut ctx = test_ctx();
    let a = ctx.new_tensor_2d(DType::F32, 3, 2).unwrap();
    let b = ctx.new_tensor_2d(DType::F32, 4, 2).unwrap();
    assert!(ctx.mul_mat(a, b).is_err());
}

#[test]
fn mul_mat_f16_weights() {
    let mut ctx = test_ctx();
    let a = tensor_2d_f16(&mut ctx, 3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = tensor_2d(&mut ctx, 3, 2, &[7.0, 9.0, 11.0, 8.0, 10.0, 12.0]);
    let c = ctx.mul_mat(a, b).unwrap();
    run(&mut ctx, c);

    assert_f32_near(
        ctx.data_f32(c),
        &[58.0, 139.0, 64.0, 154.0],
        1e-2,
        "f16 weights",
    );
}

#[test]
fn mul_mat_transposed_src0_matches() {
    // A0 {2,3} arranged so transpose(A0) equals the A of the 2x3 case;
    // the transposed layout drives the column regime with its per-worker
    // accumulators
    let mut ctx = test_ctx();
    let a0 = tensor_2d(&mut ctx, 2, 3, &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    let at = ctx.transpose(a0).unwrap();
    let b = tensor_2d(&mut ctx, 3, 2, &[7.0, 9.0, 11.0, 8.0, 10.0, 12.0]);
    let c = ctx.mul_mat(at, b).unwrap();
    run(&mut ctx, c);

    assert_f32_near(
        ctx.data_f32(c),
        &[58.0, 139.0, 64.0, 154.0],
        1e-4,
        "transposed src0",
    );
}

#[test]
fn mul_mat_large_identity() {
    // 32x32 contiguous operands take the sgemm path when enabled
    let n = 32;
    let mut ctx = test_ctx();
    let a = ctx.new_tensor_2d(DType::F32, n, n).unwrap();
    for i in 0..n {
        ctx.set_f32_1d(a, i * n + i, 1.0);
    }
    let b_data: Vec<f32> = (0..n * n).map(|i| (i % 97) as f32 * 0.25 - 10.0).collect();
    let b = tensor_2d(&mut ctx, n, n, &b_data);

    let c = ctx.mul_mat(a, b).unwrap();
    run(&mut ctx, c);

    // dot(I_row_i0, B_row_i1) = B[i1][i0], so dst memory equals b memory
    assert_f32_near(ctx.data_f32(c), &b_data, 1e-5, "identity mul_mat");
}

#[test]
fn mul_mat_large_identity_f16() {
    let n = 32;
    let mut ctx = test_ctx();
    let a = ctx.new_tensor_2d(DType::F16, n, n).unwrap();
    for i in 0..n {
        ctx.data_f16_mut(a)[i * n + i] = f16::from_f32(1.0);
    }
    let b_data: Vec<f32> = (0..n * n).map(|i| (i % 31) as f32 * 0.5 - 7.0).collect();
    let b = tensor_2d(&mut ctx, n, n, &b_data);

    let c = ctx.mul_mat(a, b).unwrap();
    run(&mut ctx, c);

    assert_f32_near(ctx.data_f32(c), &b_data, 1e-2, "identity mul_mat f16");
}

#[test]
fn add_zero_is_identity_bitwise() {
    let mut ctx = test_ctx();
    let values = [1.0f32, -2.5, 0.1, 3.14159, -0.000123, 7e20];
    let x = tensor_1d(&mut ctx, &values);
    let zero = tensor_1d(&mut ctx, &[0.0; 6]);
    let y = ctx.add(x, zero).unwrap();
    run(&mut ctx, y);

    for (a, b) in ctx.data_f32(y).iter().zip(&values) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn sub_self_is_zero_and_double_negation_restores() {
    let mut ctx = test_ctx();
    let values = [1.5f32, -2.25, 0.75, -0.5];
    let x = tensor_1d(&mut ctx, &values);

    let d = ctx.sub(x, x).unwrap();
    let nn = ctx.neg(x).unwrap();
    let nn = ctx.neg(nn).unwrap();

    let mut graph = Graph::build_forward(&ctx, d).unwrap();
    graph.build_forward_expand(&ctx, nn).unwrap();
    graph.compute(&mut ctx).unwrap();

    assert_f32_near(ctx.data_f32(d), &[0.0; 4], 0.0, "x - x");
    assert_f32_near(ctx.data_f32(nn), &values, 0.0, "-(-x)");
}

#[test]
fn elementwise_binary_family() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[6.0, 9.0, -3.0]);
    let y = tensor_1d(&mut ctx, &[2.0, 3.0, 4.0]);

    let m = ctx.mul(x, y).unwrap();
    let d = ctx.div(x, y).unwrap();

    let mut graph = Graph::build_forward(&ctx, m).unwrap();
    graph.build_forward_expand(&ctx, d).unwrap();
    graph.compute(&mut ctx).unwrap();

    assert_f32_near(ctx.data_f32(m), &[12.0, 27.0, -12.0], 0.0, "mul");
    assert_f32_near(ctx.data_f32(d), &[3.0, 3.0, -0.75], 0.0, "div");
}

#[test]
fn unary_family() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[-2.0, 0.0, 3.0]);

    let a = ctx.abs(x).unwrap();
    let s = ctx.sgn(x).unwrap();
    let st = ctx.step(x).unwrap();
    let r = ctx.relu(x).unwrap();
    let q = ctx.sqr(x).unwrap();

    let mut graph = Graph::build_forward(&ctx, a).unwrap();
    for t in [s, st, r, q] {
        graph.build_forward_expand(&ctx, t).unwrap();
    }
    graph.compute(&mut ctx).unwrap();

    assert_f32_near(ctx.data_f32(a), &[2.0, 0.0, 3.0], 0.0, "abs");
    assert_f32_near(ctx.data_f32(s), &[-1.0, 0.0, 1.0], 0.0, "sgn");
    assert_f32_near(ctx.data_f32(st), &[0.0, 0.0, 1.0], 0.0, "step");
    assert_f32_near(ctx.data_f32(r), &[0.0, 0.0, 3.0], 0.0, "relu");
    assert_f32_near(ctx.data_f32(q), &[4.0, 0.0, 9.0], 0.0, "sqr");
}

#[test]
fn sqrt_of_squares() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[4.0, 9.0, 2.25]);
    let r = ctx.sqrt(x).unwrap();
    run(&mut ctx, r);
    assert_f32_near(ctx.data_f32(r), &[2.0, 3.0, 1.5], 1e-6, "sqrt");
}

#[test]
fn sum_reduces_all_elements() {
    let mut ctx = test_ctx();
    let x = tensor_2d(&mut ctx, 3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let s = ctx.sum(x).unwrap();
    run(&mut ctx, s);
    assert!(ctx.tensor(s).is_scalar());
    assert_eq!(ctx.get_f32_1d(s, 0), 21.0);
}

#[test]
fn sum_of_repeated_scalar() {
    let mut ctx = test_ctx();
    let s = ctx.new_f32(2.5).unwrap();
    let x = ctx.new_tensor_2d(DType::F32, 4, 3).unwrap();
    let r = ctx.repeat(s, x).unwrap();
    let total = ctx.sum(r).unwrap();
    run(&mut ctx, total);
    assert!((ctx.get_f32_1d(total, 0) - 2.5 * 12.0).abs() < 1e-4);
}

#[test]
fn mean_per_row() {
    let mut ctx = test_ctx();
    let x = tensor_2d(&mut ctx, 3, 2, &[1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
    let m = ctx.mean(x).unwrap();
    run(&mut ctx, m);
    assert_eq!(&ctx.tensor(m).ne()[..2], &[1, 2]);
    assert_f32_near(ctx.data_f32(m), &[2.0, 20.0], 1e-6, "mean");
}

#[test]
fn repeat_tiles_matrix() {
    let mut ctx = test_ctx();
    let a = tensor_2d(&mut ctx, 2, 2, &[1.0, 2.0, 3.0, 4.0]);
    let target = ctx.new_tensor_2d(DType::F32, 4, 4).unwrap();
    let r = ctx.repeat(a, target).unwrap();
    run(&mut ctx, r);

    assert_f32_near(
        ctx.data_f32(r),
        &[
            1.0, 2.0, 1.0, 2.0, //
            3.0, 4.0, 3.0, 4.0, //
            1.0, 2.0, 1.0, 2.0, //
            3.0, 4.0, 3.0, 4.0,
        ],
        0.0,
        "repeat tile",
    );
}

#[test]
fn repeat_same_shape_returns_source() {
    let mut ctx = test_ctx();
    let a = tensor_1d(&mut ctx, &[1.0, 2.0]);
    let b = tensor_1d(&mut ctx, &[0.0, 0.0]);
    let r = ctx.repeat(a, b).unwrap();
    assert_eq!(r, a);
}

#[test]
fn gelu_known_values() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[0.0, 1.0, -1.0, 3.0]);
    let g = ctx.gelu(x).unwrap();
    run(&mut ctx, g);

    let out = ctx.data_f32(g);
    assert_eq!(out[0], 0.0);
    assert!((out[1] - 0.8413).abs() < 1e-3);
    assert!((out[2] - (-0.1588)).abs() < 1e-3);
    assert!((out[3] - 2.9964).abs() < 1e-2);
}

#[test]
fn gelu_monotone_for_nonnegative_inputs() {
    let mut ctx = test_ctx();
    let grid: Vec<f32> = (0..=600).map(|i| i as f32 * 0.01).collect();
    let x = tensor_1d(&mut ctx, &grid);
    let g = ctx.gelu(x).unwrap();
    run(&mut ctx, g);

    let out = ctx.data_f32(g);
    for w in out.windows(2) {
        assert!(w[1] >= w[0] - 1e-6, "gelu not monotone: {} -> {}", w[0], w[1]);
    }
}

#[test]
fn norm_centers_and_scales_rows() {
    let mut ctx = test_ctx();
    let x = tensor_2d(&mut ctx, 4, 2, &[2.0, 4.0, 6.0, 8.0, -1.0, 1.0, -1.0, 1.0]);
    let n = ctx.norm(x).unwrap();
    run(&mut ctx, n);

    let out = ctx.data_f32(n);
    for row in out.chunks(4) {
        let mean: f32 = row.iter().sum::<f32>() / 4.0;
        let var: f32 = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5, "row mean {mean}");
        assert!((var - 1.0).abs() < 1e-3, "row variance {var}");
    }
}

#[test]
fn soft_max_of_one_two_three() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[1.0, 2.0, 3.0]);
    let s = ctx.soft_max(x).unwrap();
    run(&mut ctx, s);

    assert_f32_near(
        ctx.data_f32(s),
        &[0.0900, 0.2447, 0.6652],
        1e-4,
        "softmax [1,2,3]",
    );
}

#[test]
fn soft_max_rows_sum_to_one() {
    let mut ctx = test_ctx();
    let x = tensor_2d(
        &mut ctx,
        4,
        3,
        &[
            -5.0, 0.0, 5.0, 2.0, //
            1000.0, 1000.0, 1000.0, 1000.0, //
            -2.0, -4.0, 0.5, 0.25,
        ],
    );
    let s = ctx.soft_max(x).unwrap();
    run(&mut ctx, s);

    for row in ctx.data_f32(s).chunks(4) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "row sum {sum}");
        assert!(row.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}

#[test]
fn soft_max_maps_neg_infinity_to_zero() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[0.0, f32::NEG_INFINITY, 1.0]);
    let s = ctx.soft_max(x).unwrap();
    run(&mut ctx, s);

    let out = ctx.data_f32(s);
    assert_eq!(out[1], 0.0);
    assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-5);
}

#[test]
fn diag_mask_inf_upper_triangle() {
    let mut ctx = test_ctx();
    let x = tensor_2d(&mut ctx, 3, 3, &[1.0; 9]);
    let masked = ctx.diag_mask_inf(x, 0).unwrap();
    run(&mut ctx, masked);

    let out = ctx.data_f32(masked);
    for j in 0..3 {
        for i in 0..3 {
            let v = out[j * 3 + i];
            if i > j {
                assert_eq!(v, f32::NEG_INFINITY, "({j},{i}) should be masked");
            } else {
                assert_eq!(v, 1.0, "({j},{i}) should be kept");
            }
        }
    }
}

#[test]
fn diag_mask_inf_respects_n_past() {
    let mut ctx = test_ctx();
    let x = tensor_2d(&mut ctx, 4, 2, &[1.0; 8]);
    let masked = ctx.diag_mask_inf(x, 2).unwrap();
    run(&mut ctx, masked);

    let out = ctx.data_f32(masked);
    // row j keeps columns i <= 2 + j
    assert_eq!(&out[0..3], &[1.0, 1.0, 1.0]);
    assert_eq!(out[3], f32::NEG_INFINITY);
    assert_eq!(&out[4..8], &[1.0, 1.0, 1.0, 1.0]);
}

#[test]
fn scale_multiplies_in_place() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[1.0, -2.0, 4.0]);
    let half = ctx.new_f32(0.5).unwrap();
    let y = ctx.scale(x, half).unwrap();
    run(&mut ctx, y);

    assert_f32_near(ctx.data_f32(y), &[0.5, -1.0, 2.0], 0.0, "scale");
    // the result is a view of x
    assert_f32_near(ctx.data_f32(x), &[0.5, -1.0, 2.0], 0.0, "scale alias");
}

#[test]
fn cpy_converts_f32_to_f16() {
    let mut ctx = test_ctx();
    let a = tensor_1d(&mut ctx, &[0.5, -1.25, 3.0, 100.0]);
    let b = ctx.new_tensor_1d(DType::F16, 4).unwrap();
    let c = ctx.cpy(a, b).unwrap();
    run(&mut ctx, c);

    let out: Vec<f32> = ctx.data_f16(b).iter().map(|h| h.to_f32()).collect();
    assert_f32_near(&out, &[0.5, -1.25, 3.0, 100.0], 1e-2, "cpy f32->f16");
}

#[test]
fn dup_copies_storage() {
    let mut ctx = test_ctx();
    let a = tensor_1d(&mut ctx, &[1.0, 2.0, 3.0]);
    let d = ctx.dup(a).unwrap();
    run(&mut ctx, d);

    assert_f32_near(ctx.data_f32(d), &[1.0, 2.0, 3.0], 0.0, "dup");
    ctx.set_f32_1d(a, 0, 9.0);
    assert_eq!(ctx.get_f32_1d(d, 0), 1.0);
}

#[test]
fn get_rows_gathers() {
    let mut ctx = test_ctx();
    let a = tensor_2d(
        &mut ctx,
        3,
        4,
        &[
            0.0, 0.1, 0.2, //
            1.0, 1.1, 1.2, //
            2.0, 2.1, 2.2, //
            3.0, 3.1, 3.2,
        ],
    );
    let idx = ctx.new_tensor_1d(DType::I32, 2).unwrap();
    ctx.data_i32_mut(idx).copy_from_slice(&[2, 0]);

    let g = ctx.get_rows(a, idx).unwrap();
    run(&mut ctx, g);

    assert_eq!(&ctx.tensor(g).ne()[..2], &[3, 2]);
    assert_f32_near(
        ctx.data_f32(g),
        &[2.0, 2.1, 2.2, 0.0, 0.1, 0.2],
        0.0,
        "get_rows",
    );
}

#[test]
fn get_rows_f16_source() {
    let mut ctx = test_ctx();
    let a = tensor_2d_f16(&mut ctx, 2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let idx = ctx.new_tensor_1d(DType::I32, 2).unwrap();
    ctx.data_i32_mut(idx).copy_from_slice(&[1, 1]);

    let g = ctx.get_rows(a, idx).unwrap();
    run(&mut ctx, g);

    assert_f32_near(ctx.data_f32(g), &[3.0, 4.0, 3.0, 4.0], 1e-3, "get_rows f16");
}

#[test]
fn rope_rotates_pairs() {
    let mut ctx = test_ctx();
    // {dim=4, 1 row, 3 positions}
    let x = ctx.new_tensor_3d(DType::F32, 4, 1, 3).unwrap();
    let data: Vec<f32> = vec![
        1.0, 0.0, 2.0, 1.0, // position 0
        1.0, 0.0, 2.0, 1.0, // position 1
        0.5, -1.5, 1.0, 3.0, // position 2
    ];
    ctx.data_f32_mut(x).copy_from_slice(&data);

    let r = ctx.rope(x, 0, 4, 0).unwrap();
    run(&mut ctx, r);

    let out = ctx.data_f32(r).to_vec();

    // position 0 rotates by angle 0
    assert_f32_near(&out[0..4], &data[0..4], 1e-6, "rope position 0");

    // pair (x0, x1) at position p rotates by p * 10000^(-i0/4)
    let check = |pos: usize, pair: usize, x0: f32, x1: f32| {
        let theta = (pos as f64) * 10000f64.powf(-(2.0 * pair as f64) / 4.0);
        let (sin, cos) = theta.sin_cos();
        let e0 = (x0 as f64 * cos - x1 as f64 * sin) as f32;
        let e1 = (x0 as f64 * sin + x1 as f64 * cos) as f32;
        let base = pos * 4 + pair * 2;
        assert!((out[base] - e0).abs() < 1e-5, "pos {pos} pair {pair} lo");
        assert!((out[base + 1] - e1).abs() < 1e-5, "pos {pos} pair {pair} hi");
    };
    check(1, 0, 1.0, 0.0);
    check(1, 1, 2.0, 1.0);
    check(2, 0, 0.5, -1.5);
    check(2, 1, 1.0, 3.0);
}

#[test]
fn conv_1d_1s_matches_naive() {
    let mut ctx = test_ctx();
    let (nk, nc, nout, nlen) = (3usize, 2usize, 2usize, 5usize);

    let kernel_data: Vec<f32> = vec![
        // out channel 0: taps for in-channels 0 and 1
        0.5, 0.25, -0.5, //
        1.0, 0.0, 1.0, //
        // out channel 1
        -1.0, 2.0, 0.5, //
        0.25, 0.5, 0.75,
    ];
    let signal_data: Vec<f32> = vec![
        1.0, 2.0, 3.0, 4.0, 5.0, // in channel 0
        -1.0, 0.5, 0.0, -0.5, 1.0, // in channel 1
    ];

    let kernel = ctx.new_tensor_3d(DType::F32, nk, nc, nout).unwrap();
    ctx.data_f32_mut(kernel).copy_from_slice(&kernel_data);
    let signal = ctx.new_tensor_2d(DType::F32, nlen, nc).unwrap();
    ctx.data_f32_mut(signal).copy_from_slice(&signal_data);

    let out = ctx.conv_1d_1s(kernel, signal).unwrap();
    run(&mut ctx, out);

    // naive reference with zero padding
    let nh = nk / 2;
    let mut expected = vec![0.0f32; nlen * nout];
    for och in 0..nout {
        for i in 0..nlen {
            let mut acc = 0.0f32;
            for ich in 0..nc {
                for k in 0..nk {
                    let src_i = i as isize + k as isize - nh as isize;
                    if src_i < 0 || src_i >= nlen as isize {
                        continue;
                    }
                    let w = kernel_data[och * nc * nk + ich * nk + k];
                    acc += w * signal_data[ich * nlen + src_i as usize];
                }
            }
            expected[och * nlen + i] = acc;
        }
    }

    assert_eq!(&ctx.tensor(out).ne()[..2], &[nlen, nout]);
    assert_f32_near(ctx.data_f32(out), &expected, 1e-4, "conv_1d_1s");
}

#[test]
fn conv_1d_2s_halves_the_output() {
    let mut ctx = test_ctx();
    let (nk, nc, nout, nlen) = (3usize, 1usize, 1usize, 6usize);

    let kernel_data = vec![1.0f32, 2.0, 3.0];
    let signal_data = vec![1.0f32, 1.0, 2.0, 2.0, 3.0, 3.0];

    let kernel = ctx.new_tensor_3d(DType::F32, nk, nc, nout).unwrap();
    ctx.data_f32_mut(kernel).copy_from_slice(&kernel_data);
    let signal = ctx.new_tensor_2d(DType::F32, nlen, nc).unwrap();
    ctx.data_f32_mut(signal).copy_from_slice(&signal_data);

    let out = ctx.conv_1d_2s(kernel, signal).unwrap();
    run(&mut ctx, out);

    let nh = nk / 2;
    let mut expected = vec![0.0f32; nlen / 2];
    for i in (0..nlen).step_by(2) {
        let mut acc = 0.0f32;
        for k in 0..nk {
            let src_i = i as isize + k as isize - nh as isize;
            if src_i < 0 || src_i >= nlen as isize {
                continue;
            }
            acc += kernel_data[k] * signal_data[src_i as usize];
        }
        expected[i / 2] = acc;
    }

    assert_eq!(ctx.tensor(out).ne()[0], nlen / 2);
    assert_f32_near(ctx.data_f32(out), &expected, 1e-4, "conv_1d_2s");
}

#[test]
fn flash_attn_matches_naive() {
    let mut ctx = test_ctx();
    let (d, n) = (4usize, 3usize);

    let q_data: Vec<f32> = vec![
        0.1, 0.2, -0.1, 0.4, //
        0.5, -0.3, 0.2, 0.1, //
        -0.2, 0.4, 0.3, -0.5,
    ];
    let k_data: Vec<f32> = vec![
        0.3, 0.1, 0.2, -0.2, //
        -0.1, 0.4, 0.0, 0.3, //
        0.2, -0.2, 0.5, 0.1,
    ];
    // v stored transposed: {n, d}, row ic = output column ic over positions
    let v_data: Vec<f32> = vec![
        1.0, 2.0, 3.0, //
        -1.0, 0.5, 0.0, //
        0.25, 0.75, -0.25, //
        2.0, -2.0, 1.0,
    ];

    let q = ctx.new_tensor_4d(DType::F32, d, n, 1, 1).unwrap();
    ctx.data_f32_mut(q).copy_from_slice(&q_data);
    let k = ctx.new_tensor_4d(DType::F32, d, n, 1, 1).unwrap();
    ctx.data_f32_mut(k).copy_from_slice(&k_data);
    let v = ctx.new_tensor_4d(DType::F32, n, d, 1, 1).unwrap();
    ctx.data_f32_mut(v).copy_from_slice(&v_data);

    let out = ctx.flash_attn(q, k, v, false).unwrap();
    run(&mut ctx, out);

    // naive reference
    let scale = 1.0 / (d as f32).sqrt();
    let mut expected = vec![0.0f32; n * d];
    for iq in 0..n {
        let mut s: Vec<f32> = (0..n)
            .map(|ik| {
                (0..d)
                    .map(|e| k_data[ik * d + e] * q_data[iq * d + e])
                    .sum::<f32>()
                    * scale
            })
            .collect();
        let max = s.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for v in s.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in s.iter_mut() {
            *v /= sum;
        }
        for ic in 0..d {
            expected[iq * d + ic] = (0..n).map(|p| v_data[ic * n + p] * s[p]).sum();
        }
    }

    assert_f32_near(ctx.data_f32(out), &expected, 1e-3, "flash_attn");
}

#[test]
fn flash_attn_masked_first_row_sees_only_first_position() {
    let mut ctx = test_ctx();
    let (d, n) = (2usize, 3usize);

    let q = ctx.new_tensor_4d(DType::F32, d, n, 1, 1).unwrap();
    ctx.data_f32_mut(q)
        .copy_from_slice(&[0.3, -0.1, 0.2, 0.5, -0.4, 0.1]);
    let k = ctx.new_tensor_4d(DType::F32, d, n, 1, 1).unwrap();
    ctx.data_f32_mut(k)
        .copy_from_slice(&[0.1, 0.2, -0.3, 0.4, 0.5, -0.6]);
    let v = ctx.new_tensor_4d(DType::F32, n, d, 1, 1).unwrap();
    ctx.data_f32_mut(v)
        .copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    let out = ctx.flash_attn(q, k, v, true).unwrap();
    run(&mut ctx, out);

    // with everything after position 0 masked, row 0 is exactly v[:, 0]
    let got = ctx.data_f32(out);
    assert!((got[0] - 1.0).abs() < 1e-5);
    assert!((got[1] - 4.0).abs() < 1e-5);
}

#[test]
fn flash_ff_matches_naive() {
    let mut ctx = test_ctx();
    let (d, m) = (2usize, 3usize);

    let a_data = vec![0.5f32, -0.25];
    let b0_data = vec![0.5f32, 1.0, -0.5, 0.25, 1.5, -1.0]; // {d, m}
    let b1_data = vec![0.1f32, -0.2, 0.3];
    let c0_data = vec![1.0f32, 0.5, -0.5, 0.25, -1.0, 2.0]; // {m, d}
    let c1_data = vec![0.05f32, -0.1];

    let a = ctx.new_tensor_4d(DType::F16, d, 1, 1, 1).unwrap();
    for (dst, &v) in ctx.data_f16_mut(a).iter_mut().zip(&a_data) {
        *dst = f16::from_f32(v);
    }
    let b0 = ctx.new_tensor_4d(DType::F16, d, m, 1, 1).unwrap();
    for (dst, &v) in ctx.data_f16_mut(b0).iter_mut().zip(&b0_data) {
        *dst = f16::from_f32(v);
    }
    let b1 = tensor_1d(&mut ctx, &b1_data);
    let c0 = ctx.new_tensor_4d(DType::F16, m, d, 1, 1).unwrap();
    for (dst, &v) in ctx.data_f16_mut(c0).iter_mut().zip(&c0_data) {
        *dst = f16::from_f32(v);
    }
    let c1 = tensor_1d(&mut ctx, &c1_data);

    let out = ctx.flash_ff(a, b0, b1, c0, c1).unwrap();
    run(&mut ctx, out);

    // naive reference with the same tabled gelu
    let mut s = vec![0.0f32; m];
    for ic in 0..m {
        s[ic] = (0..d).map(|e| b0_data[ic * d + e] * a_data[e]).sum::<f32>() + b1_data[ic];
        s[ic] = gelu_lookup(s[ic]);
    }
    let mut expected = vec![0.0f32; d];
    for ic in 0..d {
        expected[ic] = (0..m).map(|j| c0_data[ic * m + j] * s[j]).sum::<f32>() + c1_data[ic];
    }

    assert_f32_near(&ctx.data_f32(out)[..d], &expected, 1e-2, "flash_ff");
}

#[test]
fn inplace_variants_alias_their_source() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[-1.0, 2.0, -3.0]);
    let y = ctx.relu_inplace(x).unwrap();
    run(&mut ctx, y);

    assert_f32_near(ctx.data_f32(x), &[0.0, 2.0, 0.0], 0.0, "relu_inplace");
}
