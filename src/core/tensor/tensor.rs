use half::f16;

use super::dtype::{DType, MAX_DIMS};
use crate::core::arena::Context;

/// Operation kind of a graph node. `None` marks a leaf (input, parameter or
/// constant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    None,
    Dup,
    Add,
    Sub,
    Mul,
    Div,
    Sqr,
    Sqrt,
    Sum,
    Mean,
    Repeat,
    Abs,
    Sgn,
    Neg,
    Step,
    Relu,
    Gelu,
    Norm,
    MulMat,
    Scale,
    Cpy,
    Reshape,
    View,
    Permute,
    Transpose,
    GetRows,
    DiagMaskInf,
    SoftMax,
    Rope,
    Conv1D1S,
    Conv1D2S,
    FlashAttn,
    FlashFF,
}

impl Op {
    pub fn label(&self) -> &'static str {
        match self {
            Op::None => "NONE",
            Op::Dup => "DUP",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Sqr => "SQR",
            Op::Sqrt => "SQRT",
            Op::Sum => "SUM",
            Op::Mean => "MEAN",
            Op::Repeat => "REPEAT",
            Op::Abs => "ABS",
            Op::Sgn => "SGN",
            Op::Neg => "NEG",
            Op::Step => "STEP",
            Op::Relu => "RELU",
            Op::Gelu => "GELU",
            Op::Norm => "NORM",
            Op::MulMat => "MUL_MAT",
            Op::Scale => "SCALE",
            Op::Cpy => "CPY",
            Op::Reshape => "RESHAPE",
            Op::View => "VIEW",
            Op::Permute => "PERMUTE",
            Op::Transpose => "TRANSPOSE",
            Op::GetRows => "GET_ROWS",
            Op::DiagMaskInf => "DIAG_MASK_INF",
            Op::SoftMax => "SOFT_MAX",
            Op::Rope => "ROPE",
            Op::Conv1D1S => "CONV_1D_1S",
            Op::Conv1D2S => "CONV_1D_2S",
            Op::FlashAttn => "FLASH_ATTN",
            Op::FlashFF => "FLASH_FF",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Op::None => "none",
            Op::Dup => "x",
            Op::Add => "x+y",
            Op::Sub => "x-y",
            Op::Mul => "x*y",
            Op::Div => "x/y",
            Op::Sqr => "x^2",
            Op::Sqrt => "sqrt(x)",
            Op::Sum => "sum(x)",
            Op::Mean => "sum(x)/n",
            Op::Repeat => "repeat(x)",
            Op::Abs => "abs(x)",
            Op::Sgn => "sgn(x)",
            Op::Neg => "-x",
            Op::Step => "step(x)",
            Op::Relu => "relu(x)",
            Op::Gelu => "gelu(x)",
            Op::Norm => "norm(x)",
            Op::MulMat => "X*Y",
            Op::Scale => "x*v",
            Op::Cpy => "x->y",
            Op::Reshape => "reshape(x)",
            Op::View => "view(x)",
            Op::Permute => "permute(x)",
            Op::Transpose => "transpose(x)",
            Op::GetRows => "get_rows(x)",
            Op::DiagMaskInf => "diag_mask_inf(x)",
            Op::SoftMax => "soft_max(x)",
            Op::Rope => "rope(x)",
            Op::Conv1D1S => "conv_1d_1s(x)",
            Op::Conv1D2S => "conv_1d_2s(x)",
            Op::FlashAttn => "flash_attn(x)",
            Op::FlashFF => "flash_ff(x)",
        }
    }
}

/// Handle to a tensor inside its owning [`Context`]. All tensor-to-tensor
/// edges (sources, gradients) are expressed with these handles, so a tensor
/// can never outlive its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub(crate) u32);

impl TensorId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Tensor header: a strided multi-dimensional view over a data region inside
/// the owning arena.
///
/// `ne` holds the number of elements per dimension (unused dimensions are 1)
/// and `nb` the byte stride per dimension. For contiguous tensors
/// `nb[0] == elem_size` and `nb[i] == nb[i-1] * ne[i-1]`; views produced by
/// permute/transpose break that relation.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub(crate) dtype: DType,
    pub(crate) n_dims: usize,
    pub(crate) ne: [usize; MAX_DIMS],
    pub(crate) nb: [usize; MAX_DIMS],

    pub(crate) op: Op,
    pub(crate) is_param: bool,

    pub(crate) grad: Option<TensorId>,
    pub(crate) src0: Option<TensorId>,
    pub(crate) src1: Option<TensorId>,
    pub(crate) opt: [Option<TensorId>; 3],

    /// Byte offset of the data region inside the arena. Views alias the
    /// region of their source.
    pub(crate) data: usize,

    pub(crate) perf_runs: u32,
    pub(crate) perf_time_us: u64,
}

impl Tensor {
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    pub fn ne(&self) -> &[usize; MAX_DIMS] {
        &self.ne
    }

    pub fn nb(&self) -> &[usize; MAX_DIMS] {
        &self.nb
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn is_param(&self) -> bool {
        self.is_param
    }

    pub fn grad(&self) -> Option<TensorId> {
        self.grad
    }

    pub fn src0(&self) -> Option<TensorId> {
        self.src0
    }

    pub fn src1(&self) -> Option<TensorId> {
        self.src1
    }

    pub fn opt(&self) -> &[Option<TensorId>; 3] {
        &self.opt
    }

    pub fn shape(&self) -> &[usize] {
        &self.ne[..self.n_dims]
    }

    pub fn perf_runs(&self) -> u32 {
        self.perf_runs
    }

    pub fn perf_time_us(&self) -> u64 {
        self.perf_time_us
    }

    pub fn nelements(&self) -> usize {
        self.ne[0] * self.ne[1] * self.ne[2] * self.ne[3]
    }

    pub fn nrows(&self) -> usize {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    pub fn elem_size(&self) -> usize {
        self.dtype.size()
    }

    pub fn nbytes(&self) -> usize {
        self.nelements() * self.elem_size()
    }

    pub fn is_scalar(&self) -> bool {
        self.ne[0] == 1 && self.ne[1] == 1 && self.ne[2] == 1 && self.ne[3] == 1
    }

    pub fn is_vector(&self) -> bool {
        self.ne[1] == 1 && self.ne[2] == 1 && self.ne[3] == 1
    }

    pub fn is_matrix(&self) -> bool {
        self.ne[2] == 1 && self.ne[3] == 1
    }

    pub fn is_contiguous(&self) -> bool {
        self.nb[0] == self.dtype.size()
            && self.nb[1] == self.nb[0] * self.ne[0]
            && self.nb[2] == self.nb[1] * self.ne[1]
            && self.nb[3] == self.nb[2] * self.ne[2]
    }

    /// Contiguous except possibly along dimension 1.
    pub fn is_padded_1d(&self) -> bool {
        self.nb[0] == self.dtype.size()
            && self.nb[2] == self.nb[1] * self.ne[1]
            && self.nb[3] == self.nb[2] * self.ne[2]
    }

    pub fn same_shape(&self, other: &Tensor) -> bool {
        self.ne == other.ne
    }

    /// Inner dimension and trailing batch dimensions must line up.
    pub fn can_mul_mat(&self, other: &Tensor) -> bool {
        self.ne[0] == other.ne[0] && self.ne[2] == other.ne[2] && self.ne[3] == other.ne[3]
    }

    /// True when `other` can be tiled with whole copies of `self`.
    pub fn can_repeat(&self, other: &Tensor) -> bool {
        other.ne[0] % self.ne[0] == 0
            && other.ne[1] % self.ne[1] == 0
            && other.ne[2] % self.ne[2] == 0
            && other.ne[3] % self.ne[3] == 0
    }
}

pub(crate) fn up32(n: usize) -> usize {
    (n + 31) & !31
}

// Element accessors. Linear indexing treats the data region as a flat array
// of elements, which matches how gradients and optimizer state are laid out.
impl Context {
    pub fn get_f32_1d(&self, t: TensorId, i: usize) -> f32 {
        let tensor = self.tensor(t);
        debug_assert!(i < tensor.nelements());
        let base = self.base_ptr();
        // SAFETY: `data + i*elem_size` is inside the tensor's region, which
        // was bounds-checked against the arena at allocation time.
        unsafe {
            let p = base.add(tensor.data);
            match tensor.dtype {
                DType::I8 => *(p as *const i8).add(i) as f32,
                DType::I16 => *(p as *const i16).add(i) as f32,
                DType::I32 => *(p as *const i32).add(i) as f32,
                DType::F16 => (*(p as *const f16).add(i)).to_f32(),
                DType::F32 => *(p as *const f32).add(i),
            }
        }
    }

    pub fn set_f32_1d(&mut self, t: TensorId, i: usize, value: f32) {
        let tensor = self.tensor(t);
        debug_assert!(i < tensor.nelements());
        let data = tensor.data;
        let dtype = tensor.dtype;
        let base = self.base_ptr();
        // SAFETY: see `get_f32_1d`.
        unsafe {
            let p = base.add(data);
            match dtype {
                DType::I8 => *(p as *mut i8).add(i) = value as i8,
                DType::I16 => *(p as *mut i16).add(i) = value as i16,
                DType::I32 => *(p as *mut i32).add(i) = value as i32,
                DType::F16 => *(p as *mut f16).add(i) = f16::from_f32(value),
                DType::F32 => *(p as *mut f32).add(i) = value,
            }
        }
    }

    pub fn get_i32_1d(&self, t: TensorId, i: usize) -> i32 {
        let tensor = self.tensor(t);
        debug_assert!(i < tensor.nelements());
        let base = self.base_ptr();
        // SAFETY: see `get_f32_1d`.
        unsafe {
            let p = base.add(tensor.data);
            match tensor.dtype {
                DType::I8 => *(p as *const i8).add(i) as i32,
                DType::I16 => *(p as *const i16).add(i) as i32,
                DType::I32 => *(p as *const i32).add(i),
                // The F16 path quantizes integers that do not fit in the
                // 11-bit significand.
                DType::F16 => (*(p as *const f16).add(i)).to_f32() as i32,
                DType::F32 => *(p as *const f32).add(i) as i32,
            }
        }
    }

    pub fn set_i32_1d(&mut self, t: TensorId, i: usize, value: i32) {
        let tensor = self.tensor(t);
        debug_assert!(i < tensor.nelements());
        let data = tensor.data;
        let dtype = tensor.dtype;
        let base = self.base_ptr();
        // SAFETY: see `get_f32_1d`.
        unsafe {
            let p = base.add(data);
            match dtype {
                DType::I8 => *(p as *mut i8).add(i) = value as i8,
                DType::I16 => *(p as *mut i16).add(i) = value as i16,
                DType::I32 => *(p as *mut i32).add(i) = value,
                DType::F16 => *(p as *mut f16).add(i) = f16::from_f32(value as f32),
                DType::F32 => *(p as *mut f32).add(i) = value as f32,
            }
        }
    }

    /// Set every element of `t` to `value`, converting to the tensor dtype.
    pub fn set_f32(&mut self, t: TensorId, value: f32) {
        let n = self.tensor(t).nelements();
        for i in 0..n {
            self.set_f32_1d(t, i, value);
        }
    }

    pub fn set_i32(&mut self, t: TensorId, value: i32) {
        let n = self.tensor(t).nelements();
        for i in 0..n {
            self.set_i32_1d(t, i, value);
        }
    }

    /// Zero the tensor's whole data region.
    pub fn set_zero(&mut self, t: TensorId) {
        let tensor = self.tensor(t);
        let (data, nbytes) = (tensor.data, tensor.nbytes());
        // SAFETY: the region [data, data + nbytes) belongs to this tensor.
        unsafe {
            std::ptr::write_bytes(self.base_ptr().add(data), 0, nbytes);
        }
    }

    /// Raw bytes of the tensor's data region.
    pub fn data_bytes(&self, t: TensorId) -> &[u8] {
        let tensor = self.tensor(t);
        // SAFETY: region is in-bounds and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.base_ptr().add(tensor.data), tensor.nbytes()) }
    }

    /// The tensor's elements as an `f32` slice. The tensor must be F32.
    pub fn data_f32(&self, t: TensorId) -> &[f32] {
        let tensor = self.tensor(t);
        assert_eq!(tensor.dtype, DType::F32);
        bytemuck::cast_slice(self.data_bytes(t))
    }

    pub fn data_f32_mut(&mut self, t: TensorId) -> &mut [f32] {
        let tensor = self.tensor(t);
        assert_eq!(tensor.dtype, DType::F32);
        let (data, nbytes) = (tensor.data, tensor.nbytes());
        // SAFETY: exclusive access through &mut self; region is in-bounds.
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(self.base_ptr().add(data), nbytes) };
        bytemuck::cast_slice_mut(bytes)
    }

    /// The tensor's elements as an `f16` slice. The tensor must be F16.
    pub fn data_f16(&self, t: TensorId) -> &[f16] {
        let tensor = self.tensor(t);
        assert_eq!(tensor.dtype, DType::F16);
        bytemuck::cast_slice(self.data_bytes(t))
    }

    pub fn data_f16_mut(&mut self, t: TensorId) -> &mut [f16] {
        let tensor = self.tensor(t);
        assert_eq!(tensor.dtype, DType::F16);
        let (data, nbytes) = (tensor.data, tensor.nbytes());
        // SAFETY: exclusive access through &mut self; region is in-bounds.
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(self.base_ptr().add(data), nbytes) };
        bytemuck::cast_slice_mut(bytes)
    }

    pub fn data_i32_mut(&mut self, t: TensorId) -> &mut [i32] {
        let tensor = self.tensor(t);
        assert_eq!(tensor.dtype, DType::I32);
        let (data, nbytes) = (tensor.data, tensor.nbytes());
        // SAFETY: exclusive access through &mut self; region is in-bounds.
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(self.base_ptr().add(data), nbytes) };
        bytemuck::cast_slice_mut(bytes)
    }
}
