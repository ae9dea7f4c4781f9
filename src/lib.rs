//! TensorForge — an arena-backed tensor computation engine for CPU inference
//! and small-scale training.
//!
//! Callers build a directed acyclic graph of tensor operations inside a
//! [`Context`] (a bump-allocated arena that owns every tensor), linearize it
//! with [`Graph::build_forward`], and execute it on a fixed pool of worker
//! threads. Reverse-mode gradients are synthesized with
//! [`Graph::build_backward`], and two gradient-based optimizers (Adam,
//! L-BFGS) drive the graph executor for training.
//!
//! # Quick start
//!
//! ```
//! use tensorforge::{Context, DType, Graph};
//!
//! let mut ctx = Context::init(16 * 1024 * 1024).unwrap();
//! let a = ctx.new_tensor_2d(DType::F32, 3, 2).unwrap();
//! let b = ctx.new_tensor_2d(DType::F32, 3, 2).unwrap();
//! ctx.data_f32_mut(a).copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! ctx.data_f32_mut(b).copy_from_slice(&[7.0, 9.0, 11.0, 8.0, 10.0, 12.0]);
//!
//! let c = ctx.mul_mat(a, b).unwrap();
//! let mut graph = Graph::build_forward(&ctx, c).unwrap();
//! graph.compute(&mut ctx).unwrap();
//!
//! assert_eq!(ctx.data_f32(c), &[58.0, 139.0, 64.0, 154.0]);
//! ```
//!
//! # Execution model
//!
//! Every node passes through three phases (INIT, COMPUTE, FINALIZE) on the
//! worker pool; phase boundaries are total across workers. Operators declare
//! how many tasks they split into, and a single shared work buffer covers
//! per-worker scratch (matmul accumulators, convolution repacking, attention
//! score rows).
//!
//! # Numerics
//!
//! F16 is IEEE binary16 via the `half` crate. GELU and the softmax
//! exponential run through 65 536-entry lookup tables indexed by f16 bit
//! patterns. Large matrix products are routed to `faer` when the `blas`
//! feature (default) is enabled.

pub mod core;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod optim;
pub mod viz;

pub use crate::core::arena::Context;
pub use crate::core::tensor::{DType, Op, Tensor, TensorId};
pub use crate::error::{Error, Result};
pub use crate::graph::Graph;
pub use crate::optim::{OptParams, OptResult};
