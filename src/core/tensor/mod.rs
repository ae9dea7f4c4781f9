mod dtype;
mod ops;
mod tensor;
mod views;

pub use dtype::{DType, MAX_DIMS};
pub use tensor::{Op, Tensor, TensorId};

pub(crate) use tensor::up32;
