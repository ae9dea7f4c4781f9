//! Shape-only operations: new headers that alias the source's data region.

use super::tensor::{Op, TensorId};
use crate::core::arena::Context;
use crate::core::tensor::MAX_DIMS;
use crate::error::{Error, Result};

impl Context {
    fn shape_err(&self, expected: &[usize], actual: &[usize]) -> Error {
        Error::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Reinterpret `a` with the shape of `b`. Both must be contiguous and
    /// hold the same number of elements; the result aliases `a`'s data.
    pub fn reshape(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        let (ta, tb) = (self.tensor(a), self.tensor(b));
        if !ta.is_contiguous() || !tb.is_contiguous() {
            return Err(Error::InvalidConfig("reshape requires contiguous tensors".into()));
        }
        if ta.nelements() != tb.nelements() {
            return Err(self.shape_err(ta.shape(), tb.shape()));
        }
        if ta.grad.is_some() || tb.grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::Reshape));
        }
        let (dtype, data) = (ta.dtype, ta.data);
        let (n_dims, ne) = (tb.n_dims, tb.ne);
        let result = self.new_tensor_impl(dtype, &ne[..n_dims], Some(data))?;
        let t = self.tensor_mut(result);
        t.op = Op::Reshape;
        t.src0 = Some(a);
        Ok(result)
    }

    pub fn reshape_2d(&mut self, a: TensorId, ne0: usize, ne1: usize) -> Result<TensorId> {
        self.reshape_dims(a, &[ne0, ne1])
    }

    pub fn reshape_3d(
        &mut self,
        a: TensorId,
        ne0: usize,
        ne1: usize,
        ne2: usize,
    ) -> Result<TensorId> {
        self.reshape_dims(a, &[ne0, ne1, ne2])
    }

    fn reshape_dims(&mut self, a: TensorId, ne: &[usize]) -> Result<TensorId> {
        let ta = self.tensor(a);
        if !ta.is_contiguous() {
            return Err(Error::InvalidConfig("reshape requires a contiguous tensor".into()));
        }
        if ta.nelements() != ne.iter().product::<usize>() {
            return Err(self.shape_err(ta.shape(), ne));
        }
        if ta.grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::Reshape));
        }
        let (dtype, data) = (ta.dtype, ta.data);
        let result = self.new_tensor_impl(dtype, ne, Some(data))?;
        let t = self.tensor_mut(result);
        t.op = Op::Reshape;
        t.src0 = Some(a);
        Ok(result)
    }

    /// 1-D window of `ne0` elements starting `offset` bytes into `a`'s data.
    /// Gradient propagation through views is not supported.
    pub fn view_1d(&mut self, a: TensorId, ne0: usize, offset: usize) -> Result<TensorId> {
        let ta = self.tensor(a);
        if ta.grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::View));
        }
        let (dtype, data) = (ta.dtype, ta.data);
        let result = self.new_tensor_impl(dtype, &[ne0], Some(data + offset))?;
        let t = self.tensor_mut(result);
        t.op = Op::View;
        t.src0 = Some(a);
        Ok(result)
    }

    /// 2-D window with a caller-chosen row stride `nb1` (bytes).
    pub fn view_2d(
        &mut self,
        a: TensorId,
        ne0: usize,
        ne1: usize,
        nb1: usize,
        offset: usize,
    ) -> Result<TensorId> {
        let ta = self.tensor(a);
        if ta.grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::View));
        }
        let (dtype, data) = (ta.dtype, ta.data);
        let result = self.new_tensor_impl(dtype, &[ne0, ne1], Some(data + offset))?;
        let t = self.tensor_mut(result);
        t.nb[1] = nb1;
        t.nb[2] = t.nb[1] * ne1;
        t.nb[3] = t.nb[2];
        t.op = Op::View;
        t.src0 = Some(a);
        Ok(result)
    }

    /// Reorder axes: source dimension `i` becomes result dimension
    /// `axes[i]`. Aliases data; rewrites `ne` and `nb`.
    pub fn permute(
        &mut self,
        a: TensorId,
        axis0: usize,
        axis1: usize,
        axis2: usize,
        axis3: usize,
    ) -> Result<TensorId> {
        let axes = [axis0, axis1, axis2, axis3];
        let mut seen = [false; MAX_DIMS];
        for &ax in &axes {
            if ax >= MAX_DIMS || seen[ax] {
                return Err(Error::InvalidConfig(format!("bad permutation {axes:?}")));
            }
            seen[ax] = true;
        }
        if self.tensor(a).grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::Permute));
        }

        let result = self.view_tensor(a)?;
        let src = self.tensor(a);
        let (src_ne, src_nb) = (src.ne, src.nb);

        let mut ne = [0usize; MAX_DIMS];
        let mut nb = [0usize; MAX_DIMS];
        for i in 0..MAX_DIMS {
            ne[axes[i]] = src_ne[i];
            nb[axes[i]] = src_nb[i];
        }

        let t = self.tensor_mut(result);
        t.ne = ne;
        t.nb = nb;
        t.op = Op::Permute;
        t.src0 = Some(a);
        Ok(result)
    }

    /// Swap dimensions 0 and 1. Aliases data.
    pub fn transpose(&mut self, a: TensorId) -> Result<TensorId> {
        if self.tensor(a).grad.is_some() {
            return Err(Error::UnsupportedBackward(Op::Transpose));
        }
        let result = self.view_tensor(a)?;
        let src = self.tensor(a);
        let (ne0, ne1) = (src.ne[0], src.ne[1]);
        let (nb0, nb1) = (src.nb[0], src.nb[1]);

        let t = self.tensor_mut(result);
        t.ne[0] = ne1;
        t.ne[1] = ne0;
        t.nb[0] = nb1;
        t.nb[1] = nb0;
        t.op = Op::Transpose;
        t.src0 = Some(a);
        Ok(result)
    }
}
