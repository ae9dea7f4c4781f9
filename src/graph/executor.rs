//! The graph executor: a fixed pool of workers drives every node through
//! INIT, COMPUTE and FINALIZE in topological order. Phase boundaries are
//! total — no worker enters a phase before every worker has left the
//! previous one — which lets kernels stage work-buffer preparation in INIT
//! and cross-worker reduction in FINALIZE.

use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use log::debug;

use super::forward;
use super::Graph;
use crate::core::arena::Context;
use crate::core::tensor::{DType, Op};
use crate::error::{Error, Result};

pub(crate) const CACHE_LINE: usize = 64;
pub(crate) const CACHE_LINE_F32: usize = CACHE_LINE / std::mem::size_of::<f32>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Init,
    Compute,
    Finalize,
}

/// Per-invocation kernel parameters: the phase, this worker's index `ith`
/// out of `nth`, and the shared work buffer (arena offset + length).
pub(crate) struct ComputeParams {
    pub phase: Phase,
    pub ith: usize,
    pub nth: usize,
    pub wdata: usize,
    pub wsize: usize,
}

impl Graph {
    /// Execute every node of the graph on `self.n_threads` workers.
    ///
    /// The first call sizes and allocates the shared work buffer in `ctx`;
    /// later calls reuse it.
    pub fn compute(&mut self, ctx: &mut Context) -> Result<()> {
        if self.n_threads == 0 {
            return Err(Error::InvalidConfig(
                "graph.n_threads must be at least 1".into(),
            ));
        }
        let n_threads = self.n_threads;

        // Per-op task counts and the worst-case work-buffer size.
        let mut n_tasks = vec![0usize; self.nodes.len()];
        let mut work_size = 0usize;

        for (i, &id) in self.nodes.iter().enumerate() {
            let node = ctx.tensor(id);
            n_tasks[i] = match node.op {
                Op::None
                | Op::Dup
                | Op::Sqr
                | Op::Sqrt
                | Op::Sum
                | Op::Mean
                | Op::Repeat
                | Op::Abs
                | Op::Sgn
                | Op::Neg
                | Op::Step
                | Op::Relu
                | Op::Cpy
                | Op::Reshape
                | Op::View
                | Op::Permute
                | Op::Transpose
                | Op::GetRows
                | Op::DiagMaskInf
                | Op::Rope => 1,
                Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Gelu
                | Op::Norm
                | Op::Scale
                | Op::SoftMax => n_threads,
                Op::MulMat => {
                    let src0 = ctx.tensor(node.src0.unwrap());
                    let src1 = ctx.tensor(node.src1.unwrap());
                    let cur = if src0.nb[1] < src0.nb[0] {
                        // transposed src0: per-worker accumulators
                        node.nbytes() * n_threads
                    } else {
                        match (src0.dtype, src1.dtype) {
                            (DType::F16, DType::F32) => {
                                if forward::mul_mat_use_blas(src0, src1, node) {
                                    std::mem::size_of::<f32>() * src0.ne[0] * src0.ne[1]
                                } else {
                                    std::mem::size_of::<u16>() * src1.nelements()
                                }
                            }
                            (DType::F32, DType::F32) => 0,
                            _ => unreachable!("unsupported mul_mat dtype pair"),
                        }
                    };
                    work_size = work_size.max(cur);
                    n_threads
                }
                Op::Conv1D1S | Op::Conv1D2S => {
                    let src0 = ctx.tensor(node.src0.unwrap());
                    let src1 = ctx.tensor(node.src1.unwrap());
                    assert!(src0.ne[3] == 1 && src1.ne[2] == 1 && src1.ne[3] == 1);
                    let nk = src0.ne[0];
                    let ew0 = crate::core::tensor::up32(src0.ne[1]);
                    let elem = match (src0.dtype, src1.dtype) {
                        (DType::F16, DType::F32) => std::mem::size_of::<u16>(),
                        (DType::F32, DType::F32) => std::mem::size_of::<f32>(),
                        _ => unreachable!("unsupported conv dtype pair"),
                    };
                    let cur = elem * (nk * ew0 * src0.ne[2] + (2 * (nk / 2) + src1.ne[0]) * ew0);
                    work_size = work_size.max(cur);
                    n_threads
                }
                Op::FlashAttn | Op::FlashFF => {
                    let src1 = ctx.tensor(node.src1.unwrap());
                    // one score row plus its f16 copy per worker
                    let cur = 2 * std::mem::size_of::<f32>() * src1.ne[1] * n_threads;
                    work_size = work_size.max(cur);
                    n_threads
                }
            };
        }

        if let Some(work) = self.work {
            if work_size > ctx.tensor(work).nbytes() {
                return Err(Error::InvalidConfig(format!(
                    "work buffer too small: have {}, need {}",
                    ctx.tensor(work).nbytes(),
                    work_size
                )));
            }
        } else if work_size > 0 {
            self.work_size = work_size + CACHE_LINE * (n_threads - 1);
            debug!("allocating work buffer ({} bytes)", self.work_size);
            self.work = Some(ctx.new_tensor_1d(DType::I8, self.work_size)?);
        }

        let (wdata, wsize) = match self.work {
            Some(w) => {
                let t = ctx.tensor(w);
                (t.data, t.nbytes())
            }
            None => (0, 0),
        };

        let t_start = Instant::now();
        let mut elapsed_us = vec![0u64; self.nodes.len()];

        {
            let headers = ctx.tensors();
            let mem = ctx.mem();
            let nodes = &self.nodes;
            let tasks = &n_tasks;
            let barrier = Barrier::new(n_threads);

            thread::scope(|s| {
                for ith in 1..n_threads {
                    let (mem, barrier) = (&mem, &barrier);
                    s.spawn(move || {
                        for (i, &id) in nodes.iter().enumerate() {
                            let nth = tasks[i];
                            for phase in [Phase::Init, Phase::Compute, Phase::Finalize] {
                                if ith < nth {
                                    let params = ComputeParams {
                                        phase,
                                        ith,
                                        nth,
                                        wdata,
                                        wsize,
                                    };
                                    forward::forward(&params, mem, headers, id);
                                }
                                barrier.wait();
                            }
                        }
                    });
                }

                for (i, &id) in nodes.iter().enumerate() {
                    let t_node = Instant::now();
                    let nth = tasks[i];
                    for phase in [Phase::Init, Phase::Compute, Phase::Finalize] {
                        let params = ComputeParams {
                            phase,
                            ith: 0,
                            nth,
                            wdata,
                            wsize,
                        };
                        forward::forward(&params, &mem, headers, id);
                        barrier.wait();
                    }
                    elapsed_us[i] = t_node.elapsed().as_micros() as u64;
                }
            });
        }

        for (i, &id) in self.nodes.iter().enumerate() {
            let t = ctx.tensor_mut(id);
            t.perf_runs += 1;
            t.perf_time_us += elapsed_us[i];
        }

        self.perf_runs += 1;
        self.perf_time_us += t_start.elapsed().as_micros() as u64;
        Ok(())
    }
}
