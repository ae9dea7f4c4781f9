mod common;

use common::{assert_f32_near, tensor_1d, tensor_2d, test_ctx};
use tensorforge::{Context, Error, Graph, Op, TensorId};

/// Run one forward+backward pass with `df/df = 1` and return the gradient
/// of `param`.
fn grad_of(ctx: &mut Context, f: TensorId, param: TensorId) -> Vec<f32> {
    let mut gf = Graph::build_forward(ctx, f).unwrap();
    let mut gb = gf.build_backward(ctx, false).unwrap();

    gf.reset(ctx);
    let f_grad = ctx.tensor(f).grad().unwrap();
    ctx.set_f32(f_grad, 1.0);
    gb.compute(ctx).unwrap();

    let g = ctx.tensor(param).grad().unwrap();
    ctx.data_f32(g).to_vec()
}

#[test]
fn sum_of_squared_distance_gradient() {
    // f = sum((x - 3)^2), x = [0, 1, 2]  =>  df/dx = 2(x - 3)
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[0.0, 1.0, 2.0]);
    ctx.set_param(x).unwrap();

    let c = ctx.new_f32(3.0).unwrap();
    let rep = ctx.repeat(c, x).unwrap();
    let diff = ctx.sub(x, rep).unwrap();
    let sq = ctx.sqr(diff).unwrap();
    let f = ctx.sum(sq).unwrap();

    let g = grad_of(&mut ctx, f, x);
    assert_f32_near(&g, &[-6.0, -4.0, -2.0], 1e-5, "d/dx sum((x-3)^2)");
}

#[test]
fn product_gradients_swap_factors() {
    // f = sum(x * y)  =>  df/dx = y, df/dy = x
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[1.0, 2.0, 3.0]);
    let y = tensor_1d(&mut ctx, &[4.0, 5.0, 6.0]);
    ctx.set_param(x).unwrap();
    ctx.set_param(y).unwrap();

    let p = ctx.mul(x, y).unwrap();
    let f = ctx.sum(p).unwrap();

    let gx = grad_of(&mut ctx, f, x);
    assert_f32_near(&gx, &[4.0, 5.0, 6.0], 1e-5, "df/dx");
    let gy = ctx.tensor(y).grad().unwrap();
    assert_f32_near(ctx.data_f32(gy), &[1.0, 2.0, 3.0], 1e-5, "df/dy");
}

#[test]
fn quotient_gradients() {
    // f = sum(x / y)  =>  df/dx = 1/y, df/dy = -x/y^2
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[1.0, 4.0]);
    let y = tensor_1d(&mut ctx, &[2.0, 4.0]);
    ctx.set_param(x).unwrap();
    ctx.set_param(y).unwrap();

    let q = ctx.div(x, y).unwrap();
    let f = ctx.sum(q).unwrap();

    let gx = grad_of(&mut ctx, f, x);
    assert_f32_near(&gx, &[0.5, 0.25], 1e-5, "df/dx");
    let gy = ctx.tensor(y).grad().unwrap();
    assert_f32_near(ctx.data_f32(gy), &[-0.25, -0.25], 1e-5, "df/dy");
}

#[test]
fn abs_gradient_is_sign() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[-2.0, 3.0, -0.5]);
    ctx.set_param(x).unwrap();

    let a = ctx.abs(x).unwrap();
    let f = ctx.sum(a).unwrap();

    let g = grad_of(&mut ctx, f, x);
    assert_f32_near(&g, &[-1.0, 1.0, -1.0], 1e-6, "d/dx sum(|x|)");
}

#[test]
fn sqrt_gradient() {
    // f = sum(sqrt(x))  =>  df/dx = 0.5 / sqrt(x)
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[1.0, 4.0, 16.0]);
    ctx.set_param(x).unwrap();

    let r = ctx.sqrt(x).unwrap();
    let f = ctx.sum(r).unwrap();

    let g = grad_of(&mut ctx, f, x);
    assert_f32_near(&g, &[0.5, 0.25, 0.125], 1e-5, "d/dx sum(sqrt(x))");
}

#[test]
fn neg_gradient_is_minus_one() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[1.0, -2.0]);
    ctx.set_param(x).unwrap();

    let n = ctx.neg(x).unwrap();
    let f = ctx.sum(n).unwrap();

    let g = grad_of(&mut ctx, f, x);
    assert_f32_near(&g, &[-1.0, -1.0], 1e-6, "d/dx sum(-x)");
}

#[test]
fn relu_gradient_accumulates_negated_step() {
    // the engine subtracts step(x)*grad into the relu adjoint
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[2.0, -1.0, 0.5]);
    ctx.set_param(x).unwrap();

    let r = ctx.relu(x).unwrap();
    let f = ctx.sum(r).unwrap();

    let g = grad_of(&mut ctx, f, x);
    assert_f32_near(&g, &[-1.0, 0.0, -1.0], 1e-6, "relu adjoint");
}

#[test]
fn repeat_gradient_sums_tiles() {
    // f = sum(repeat(x, target)) with a 6x tiling  =>  df/dx = 6
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[1.0]);
    ctx.set_param(x).unwrap();

    let target = tensor_2d(&mut ctx, 2, 3, &[0.0; 6]);
    let r = ctx.repeat(x, target).unwrap();
    let f = ctx.sum(r).unwrap();

    let g = grad_of(&mut ctx, f, x);
    assert_f32_near(&g, &[6.0], 1e-5, "repeat adjoint");
}

#[test]
fn mul_mat_gradient_flows_to_src1() {
    // f = sum(W x) with fixed W  =>  df/dx = column sums of W
    let mut ctx = test_ctx();
    let w = tensor_2d(&mut ctx, 2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let x = tensor_2d(&mut ctx, 2, 1, &[1.0, 1.0]);
    ctx.set_param(x).unwrap();

    let y = ctx.mul_mat(w, x).unwrap();
    let f = ctx.sum(y).unwrap();

    // rows of W are [1,2], [3,4], [5,6]; dst = W x has 3 cells, each cell
    // contributes its W row to df/dx
    let g = grad_of(&mut ctx, f, x);
    assert_f32_near(&g, &[9.0, 12.0], 1e-5, "mul_mat src1 adjoint");
}

#[test]
fn mul_mat_gradient_for_src0_is_unsupported() {
    let mut ctx = test_ctx();
    let w = tensor_2d(&mut ctx, 2, 3, &[0.5; 6]);
    ctx.set_param(w).unwrap();
    let x = tensor_2d(&mut ctx, 2, 1, &[1.0, 1.0]);

    let y = ctx.mul_mat(w, x).unwrap();
    let f = ctx.sum(y).unwrap();

    let mut gf = Graph::build_forward(&ctx, f).unwrap();
    let err = gf.build_backward(&mut ctx, false).unwrap_err();
    assert!(matches!(err, Error::UnsupportedBackward(Op::MulMat)));
}

#[test]
fn gelu_backward_is_unsupported() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[1.0]);
    ctx.set_param(x).unwrap();
    let g = ctx.gelu(x).unwrap();
    let f = ctx.sum(g).unwrap();

    let mut gf = Graph::build_forward(&ctx, f).unwrap();
    let err = gf.build_backward(&mut ctx, false).unwrap_err();
    assert!(matches!(err, Error::UnsupportedBackward(Op::Gelu)));
}

#[test]
fn soft_max_refuses_gradient_inputs_at_construction() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[1.0, 2.0]);
    ctx.set_param(x).unwrap();
    let err = ctx.soft_max(x).unwrap_err();
    assert!(matches!(err, Error::UnsupportedBackward(Op::SoftMax)));
}

#[test]
fn detached_backward_graph_keeps_forward_gradients() {
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[0.0, 1.0, 2.0]);
    ctx.set_param(x).unwrap();

    let c = ctx.new_f32(3.0).unwrap();
    let rep = ctx.repeat(c, x).unwrap();
    let diff = ctx.sub(x, rep).unwrap();
    let sq = ctx.sqr(diff).unwrap();
    let f = ctx.sum(sq).unwrap();

    let mut gf = Graph::build_forward(&ctx, f).unwrap();
    let mut gb = gf.build_backward(&mut ctx, true).unwrap();

    gf.reset(&mut ctx);
    let f_grad = ctx.tensor(f).grad().unwrap();
    ctx.set_f32(f_grad, 1.0);
    gb.compute(&mut ctx).unwrap();

    let g = ctx.tensor(x).grad().unwrap();
    assert_f32_near(ctx.data_f32(g), &[-6.0, -4.0, -2.0], 1e-5, "keep mode");
}

#[test]
fn gradients_accumulate_across_fanout() {
    // f = sum(x + x)  =>  df/dx = 2
    let mut ctx = test_ctx();
    let x = tensor_1d(&mut ctx, &[1.0, 2.0]);
    ctx.set_param(x).unwrap();

    let s = ctx.add(x, x).unwrap();
    let f = ctx.sum(s).unwrap();

    let g = grad_of(&mut ctx, f, x);
    assert_f32_near(&g, &[2.0, 2.0], 1e-5, "fan-out accumulation");
}
