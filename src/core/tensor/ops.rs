//! Op constructors. Each builds a node: checks shape preconditions, decides
//! whether the result participates in gradient computation, allocates the
//! result (fresh storage or an alias view) and wires the source links.
//!
//! Every op with a meaningful in-place form has two public constructors
//! (`add` / `add_inplace`) sharing one builder; the in-place form reuses the
//! source's storage and never allocates a gradient.

use super::tensor::{Op, TensorId};
use crate::core::arena::Context;
use crate::core::tensor::DType;
use crate::error::{Error, Result};

impl Context {
    fn check_same_shape(&self, a: TensorId, b: TensorId) -> Result<()> {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        if !ta.same_shape(tb) {
            return Err(Error::ShapeMismatch {
                expected: ta.shape().to_vec(),
                actual: tb.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Shared builder for elementwise unary ops.
    fn unary_impl(&mut self, op: Op, a: TensorId, inplace: bool) -> Result<TensorId> {
        let is_node = !inplace && self.tensor(a).grad.is_some();
        let result = if inplace {
            self.view_tensor(a)?
        } else {
            self.dup_tensor(a)?
        };
        let grad = if is_node {
            Some(self.dup_tensor(result)?)
        } else {
            None
        };
        let t = self.tensor_mut(result);
        t.op = op;
        t.grad = grad;
        t.src0 = Some(a);
        Ok(result)
    }

    /// Shared builder for same-shape elementwise binary ops.
    fn binary_impl(&mut self, op: Op, a: TensorId, b: TensorId, inplace: bool) -> Result<TensorId> {
        self.check_same_shape(a, b)?;
        let is_node =
            !inplace && (self.tensor(a).grad.is_some() || self.tensor(b).grad.is_some());
        let result = if inplace {
            self.view_tensor(a)?
        } else {
            self.dup_tensor(a)?
        };
        let grad = if is_node {
            Some(self.dup_tensor(result)?)
        } else {
            None
        };
        let t = self.tensor_mut(result);
        t.op = op;
        t.grad = grad;
        t.src0 = Some(a);
        t.src1 = Some(b);
        Ok(result)
    }

    pub fn dup(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Dup, a, false)
    }

    pub fn dup_inplace(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Dup, a, true)
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary_impl(Op::Add, a, b, false)
    }

    pub fn add_inplace(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary_impl(Op::Add, a, b, true)
    }

    pub(crate) fn add_impl(&mut self, a: TensorId, b: TensorId, inplace: bool) -> Result<TensorId> {
        self.binary_impl(Op::Add, a, b, inplace)
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary_impl(Op::Sub, a, b, false)
    }

    pub fn sub_inplace(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary_impl(Op::Sub, a, b, true)
    }

    pub(crate) fn sub_impl(&mut self, a: TensorId, b: TensorId, inplace: bool) -> Result<TensorId> {
        self.binary_impl(Op::Sub, a, b, inplace)
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary_impl(Op::Mul, a, b, false)
    }

    pub fn mul_inplace(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary_impl(Op::Mul, a, b, true)
    }

    pub fn div(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary_impl(Op::Div, a, b, false)
    }

    pub fn div_inplace(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.binary_impl(Op::Div, a, b, true)
    }

    pub fn sqr(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Sqr, a, false)
    }

    pub fn sqr_inplace(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Sqr, a, true)
    }

    pub fn sqrt(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Sqrt, a, false)
    }

    pub fn sqrt_inplace(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Sqrt, a, true)
    }

    pub fn abs(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Abs, a, false)
    }

    pub fn abs_inplace(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Abs, a, true)
    }

    pub fn sgn(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Sgn, a, false)
    }

    pub fn sgn_inplace(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Sgn, a, true)
    }

    pub fn neg(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Neg, a, false)
    }

    pub fn neg_inplace(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Neg, a, true)
    }

    pub fn step(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Step, a, false)
    }

    pub fn step_inplace(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Step, a, true)
    }

    pub fn relu(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Relu, a, false)
    }

    pub fn relu_inplace(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Relu, a, true)
    }

    pub fn gelu(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Gelu, a, false)
    }

    pub fn gelu_inplace(&mut self, a: TensorId) -> Result<TensorId> {
        self.unary_impl(Op::Gelu, a, true)
    }

    /// Reduce all elements to a single scalar of the same dtype.
    pub fn sum(&mut self, a: TensorId) -> Result<TensorId> {
        let is_node = self.tensor(a).grad.is_some();
        let dtype = self.tensor(a).dtype;
        let result = self.new_tensor_1d(dtype, 1)?;
        let grad = if is_node {
            Some(self.dup_tensor(result)?)
        } else {
            None
        };
        let t = self.tensor_mut(result);
        t.op = Op::Sum;
        t.grad = grad;
        t.src0 = Some(a);
        Ok(result)
    }

    /// Per-row mean along dimension 0; result shape `{1, ne1, ne2, ne3}`.
    pub fn mean(&mut self, a: TensorId) -> Result<TensorId> {
        let ta = self.tensor(a);
        if ta.grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::Mean));
        }
        let n_dims = ta.n_dims;
        let ne = [1, ta.ne[1], ta.ne[2], ta.ne[3]];
        let result = self.new_tensor(DType::F32, &ne[..n_dims])?;
        let t = self.tensor_mut(result);
        t.op = Op::Mean;
        t.src0 = Some(a);
        Ok(result)
    }

    /// Tile `a` so it covers the shape of `b`; every dimension of `b` must
    /// be a multiple of the corresponding dimension of `a`.
    pub fn repeat(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        if !ta.can_repeat(tb) {
            return Err(Error::ShapeMismatch {
                expected: tb.shape().to_vec(),
                actual: ta.shape().to_vec(),
            });
        }
        let is_node = ta.grad.is_some();
        if ta.same_shape(tb) && !is_node {
            return Ok(a);
        }

        let dtype = ta.dtype;
        let (n_dims, ne) = (tb.n_dims, tb.ne);
        let result = self.new_tensor(dtype, &ne[..n_dims])?;
        let grad = if is_node {
            Some(self.dup_tensor(result)?)
        } else {
            None
        };
        let t = self.tensor_mut(result);
        t.op = Op::Repeat;
        t.grad = grad;
        t.src0 = Some(a);
        Ok(result)
    }

    /// Per-row centre + RMS normalization along dimension 0.
    pub fn norm(&mut self, a: TensorId) -> Result<TensorId> {
        self.norm_impl(a, false)
    }

    pub fn norm_inplace(&mut self, a: TensorId) -> Result<TensorId> {
        self.norm_impl(a, true)
    }

    fn norm_impl(&mut self, a: TensorId, inplace: bool) -> Result<TensorId> {
        if !inplace && self.tensor(a).grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::Norm));
        }
        let result = if inplace {
            self.view_tensor(a)?
        } else {
            self.dup_tensor(a)?
        };
        let t = self.tensor_mut(result);
        t.op = Op::Norm;
        t.src0 = Some(a);
        Ok(result)
    }

    /// Matrix product over rows: `dst[i1][i0] = dot(a_row_i0, b_row_i1)`,
    /// inner dimension `ne[0]`. Result shape
    /// `{a.ne[1], b.ne[1], a.ne[2], b.ne[3]}`, always F32.
    pub fn mul_mat(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        if !ta.can_mul_mat(tb) {
            return Err(Error::ShapeMismatch {
                expected: ta.shape().to_vec(),
                actual: tb.shape().to_vec(),
            });
        }
        let is_node = ta.grad.is_some() || tb.grad.is_some();
        let ne = [ta.ne[1], tb.ne[1], ta.ne[2], tb.ne[3]];
        let n_dims = ta.n_dims.min(tb.n_dims);
        let result = self.new_tensor(DType::F32, &ne[..n_dims])?;
        let grad = if is_node {
            Some(self.dup_tensor(result)?)
        } else {
            None
        };
        let t = self.tensor_mut(result);
        t.op = Op::MulMat;
        t.grad = grad;
        t.src0 = Some(a);
        t.src1 = Some(b);
        Ok(result)
    }

    /// Multiply `a` in place by the scalar tensor `b`. The result is a view
    /// of `a`.
    pub fn scale(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.scale_impl(a, b, false)
    }

    pub fn scale_inplace(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.scale_impl(a, b, true)
    }

    fn scale_impl(&mut self, a: TensorId, b: TensorId, inplace: bool) -> Result<TensorId> {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        if !tb.is_scalar() {
            return Err(Error::ShapeMismatch {
                expected: vec![1],
                actual: tb.shape().to_vec(),
            });
        }
        if !ta.is_padded_1d() {
            return Err(Error::InvalidConfig("scale requires a padded-1d tensor".into()));
        }
        if !inplace && (ta.grad.is_some() || tb.grad.is_some()) {
            return Err(Error::UnsupportedBackward(Op::Scale));
        }
        // both forms alias the source until a backward pass exists
        let result = self.view_tensor(a)?;
        let t = self.tensor_mut(result);
        t.op = Op::Scale;
        t.src0 = Some(a);
        t.src1 = Some(b);
        Ok(result)
    }

    /// Copy `a` into the layout of `b` (converting dtype if they differ).
    /// The result is a view of `b`.
    pub fn cpy(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.cpy_impl(a, b, false)
    }

    pub fn cpy_inplace(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.cpy_impl(a, b, true)
    }

    fn cpy_impl(&mut self, a: TensorId, b: TensorId, inplace: bool) -> Result<TensorId> {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        if ta.nelements() != tb.nelements() {
            return Err(Error::ShapeMismatch {
                expected: ta.shape().to_vec(),
                actual: tb.shape().to_vec(),
            });
        }
        if !inplace && (ta.grad.is_some() || tb.grad.is_some()) {
            return Err(Error::UnsupportedBackward(Op::Cpy));
        }
        let result = self.view_tensor(b)?;
        let t = self.tensor_mut(result);
        t.op = Op::Cpy;
        t.src0 = Some(a);
        t.src1 = Some(b);
        Ok(result)
    }

    /// Gather rows of the matrix `a` selected by the I32 index vector `b`;
    /// result is F32 `{a.ne[0], b.ne[0]}`.
    pub fn get_rows(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        if !ta.is_matrix() || !tb.is_vector() || tb.dtype != DType::I32 {
            return Err(Error::InvalidConfig(
                "get_rows expects a matrix and an I32 index vector".into(),
            ));
        }
        if ta.grad.is_some() || tb.grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::GetRows));
        }
        let (ne0, nr) = (ta.ne[0], tb.ne[0]);
        let result = self.new_tensor_2d(DType::F32, ne0, nr)?;
        let t = self.tensor_mut(result);
        t.op = Op::GetRows;
        t.src0 = Some(a);
        t.src1 = Some(b);
        Ok(result)
    }

    /// Causal mask: set `dst[.., j, i] = -inf` for `i > n_past + j`, in
    /// place (the result is a view of `a`).
    pub fn diag_mask_inf(&mut self, a: TensorId, n_past: i32) -> Result<TensorId> {
        if self.tensor(a).grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::DiagMaskInf));
        }
        let result = self.view_tensor(a)?;
        let b = self.new_i32(n_past)?;
        let t = self.tensor_mut(result);
        t.op = Op::DiagMaskInf;
        t.src0 = Some(a);
        t.src1 = Some(b);
        Ok(result)
    }

    /// Per-row softmax, in place (the result is a view of `a`).
    pub fn soft_max(&mut self, a: TensorId) -> Result<TensorId> {
        if self.tensor(a).grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::SoftMax));
        }
        let result = self.view_tensor(a)?;
        let t = self.tensor_mut(result);
        t.op = Op::SoftMax;
        t.src0 = Some(a);
        Ok(result)
    }

    /// Rotary positional embedding over the first `n_dims` elements of
    /// dimension 0, in place. `mode == 0` offsets positions by `n_past`;
    /// otherwise rows below `n_past` are skipped.
    pub fn rope(&mut self, a: TensorId, n_past: i32, n_dims: i32, mode: i32) -> Result<TensorId> {
        if n_past < 0 {
            return Err(Error::InvalidConfig("rope: n_past must be >= 0".into()));
        }
        if self.tensor(a).grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::Rope));
        }
        let result = self.view_tensor(a)?;
        let b = self.new_tensor_1d(DType::I32, 3)?;
        {
            let params = self.data_i32_mut(b);
            params[0] = n_past;
            params[1] = n_dims;
            params[2] = mode;
        }
        let t = self.tensor_mut(result);
        t.op = Op::Rope;
        t.src0 = Some(a);
        t.src1 = Some(b);
        Ok(result)
    }

    /// 1-D convolution of the signal `b` `{ne10, nc}` with the kernel bank
    /// `a` `{nk, nc, nout}`, stride 1, odd kernel width. Result
    /// `{b.ne[0], a.ne[2]}` F32.
    pub fn conv_1d_1s(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.conv_1d_impl(a, b, Op::Conv1D1S)
    }

    /// Stride-2 variant; result `{b.ne[0]/2, a.ne[2]}` F32.
    pub fn conv_1d_2s(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        self.conv_1d_impl(a, b, Op::Conv1D2S)
    }

    fn conv_1d_impl(&mut self, a: TensorId, b: TensorId, op: Op) -> Result<TensorId> {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        if !tb.is_matrix() || ta.ne[1] != tb.ne[1] || ta.ne[3] != 1 {
            return Err(Error::ShapeMismatch {
                expected: ta.shape().to_vec(),
                actual: tb.shape().to_vec(),
            });
        }
        if ta.grad.is_some() || tb.grad.is_some() {
            return Err(Error::UnsupportedBackward(op));
        }
        let ne0 = if op == Op::Conv1D2S {
            tb.ne[0] / 2
        } else {
            tb.ne[0]
        };
        let ne1 = ta.ne[2];
        let result = self.new_tensor_2d(DType::F32, ne0, ne1)?;
        let t = self.tensor_mut(result);
        t.op = op;
        t.src0 = Some(a);
        t.src1 = Some(b);
        Ok(result)
    }

    /// Fused scaled dot-product attention over `q {D,N}`, `k {D,M}`,
    /// `v {M,D}` (v stored transposed); `scale = 1/sqrt(D)`. With `masked`
    /// the score matrix is causally masked before the softmax.
    pub fn flash_attn(
        &mut self,
        q: TensorId,
        k: TensorId,
        v: TensorId,
        masked: bool,
    ) -> Result<TensorId> {
        let (tq, tk) = (self.tensor(q), self.tensor(k));
        if !tk.can_mul_mat(tq) {
            return Err(Error::ShapeMismatch {
                expected: tk.shape().to_vec(),
                actual: tq.shape().to_vec(),
            });
        }
        if self.tensor(q).grad.is_some()
            || self.tensor(k).grad.is_some()
            || self.tensor(v).grad.is_some()
        {
            return Err(Error::UnsupportedBackward(Op::FlashAttn));
        }
        let ne = self.tensor(q).ne;
        let result = self.new_tensor(DType::F32, &ne)?;
        let flag = self.new_i32(masked as i32)?;
        let t = self.tensor_mut(result);
        t.op = Op::FlashAttn;
        t.src0 = Some(q);
        t.src1 = Some(k);
        t.opt[0] = Some(v);
        t.opt[1] = Some(flag);
        Ok(result)
    }

    /// Fused feed-forward block: `gelu(a*b0' + b1)*c0' + c1`.
    pub fn flash_ff(
        &mut self,
        a: TensorId,
        b0: TensorId,
        b1: TensorId,
        c0: TensorId,
        c1: TensorId,
    ) -> Result<TensorId> {
        let (tb0, ta) = (self.tensor(b0), self.tensor(a));
        if !tb0.can_mul_mat(ta) {
            return Err(Error::ShapeMismatch {
                expected: tb0.shape().to_vec(),
                actual: ta.shape().to_vec(),
            });
        }
        for t in [a, b0, b1, c0, c1] {
            if self.tensor(t).grad.is_some() {
                return Err(Error::UnsupportedBackward(Op::FlashFF));
            }
        }
        let ne = self.tensor(a).ne;
        let result = self.new_tensor(DType::F32, &ne)?;
        let t = self.tensor_mut(result);
        t.op = Op::FlashFF;
        t.src0 = Some(a);
        t.src1 = Some(b0);
        t.opt = [Some(b1), Some(c0), Some(c1)];
        Ok(result)
    }

    /// Mark a tensor as trainable and attach a same-shape gradient tensor.
    pub fn set_param(&mut self, t: TensorId) -> Result<()> {
        assert!(self.tensor(t).grad.is_none());
        let grad = self.dup_tensor(t)?;
        let tensor = self.tensor_mut(t);
        tensor.is_param = true;
        tensor.grad = Some(grad);
        Ok(())
    }
}
