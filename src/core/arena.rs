//! The context: a bump-allocated arena that owns every tensor header and
//! every tensor data region. Allocation only moves forward; memory is
//! reclaimed wholesale when the context is dropped.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

use half::f16;
use log::debug;

use super::tensor::{Op, Tensor, TensorId};
use crate::core::tensor::{DType, MAX_DIMS};
use crate::error::{Error, Result};
use crate::kernels::tables;

/// Alignment of every data region handed out by the arena.
pub const MEM_ALIGN: usize = 16;

/// Process-wide cap on simultaneously live contexts.
pub const MAX_CONTEXTS: usize = 64;

static CONTEXT_SLOTS: Mutex<[bool; MAX_CONTEXTS]> = Mutex::new([false; MAX_CONTEXTS]);

fn align_up(n: usize) -> usize {
    (n + MEM_ALIGN - 1) / MEM_ALIGN * MEM_ALIGN
}

/// Owned, 16-byte-aligned, zero-initialized memory region.
struct Region {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

impl Region {
    fn alloc_zeroed(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(MEM_ALIGN), MEM_ALIGN)
            .map_err(|e| Error::InvalidConfig(format!("bad arena size {size}: {e}")))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };
        Ok(Self { ptr, size, layout })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in `alloc_zeroed`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// SAFETY: the region is uniquely owned by its Context; moving it across
// threads moves ownership of the allocation with it.
unsafe impl Send for Region {}

/// A live arena plus the headers of every tensor allocated in it.
pub struct Context {
    region: Region,
    used: usize,
    pub(crate) tensors: Vec<Tensor>,
    slot: usize,
}

impl Context {
    /// Acquire a context slot and allocate an arena of `mem_size` bytes.
    ///
    /// The first call also populates the f16 GELU and exp lookup tables.
    /// Fails with [`Error::NoFreeContext`] when all [`MAX_CONTEXTS`] slots
    /// are taken; the caller is responsible for sizing `mem_size` so that
    /// graph construction does not run out of arena.
    pub fn init(mem_size: usize) -> Result<Self> {
        let slot = {
            let mut slots = CONTEXT_SLOTS.lock().unwrap();
            match slots.iter().position(|used| !used) {
                Some(i) => {
                    slots[i] = true;
                    i
                }
                None => return Err(Error::NoFreeContext),
            }
        };

        tables::ensure_init();

        let region = match Region::alloc_zeroed(mem_size) {
            Ok(r) => r,
            Err(e) => {
                CONTEXT_SLOTS.lock().unwrap()[slot] = false;
                return Err(e);
            }
        };

        debug!("context slot {slot} initialized, arena size {mem_size} bytes");

        Ok(Self {
            region,
            used: 0,
            tensors: Vec::new(),
            slot,
        })
    }

    /// Bytes bumped so far.
    pub fn used_mem(&self) -> usize {
        self.used
    }

    pub fn mem_size(&self) -> usize {
        self.region.size
    }

    pub fn n_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.index()]
    }

    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id.index()]
    }

    pub(crate) fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.region.ptr.as_ptr()
    }

    pub(crate) fn mem(&self) -> ArenaMem {
        ArenaMem {
            base: self.region.ptr.as_ptr(),
            len: self.region.size,
        }
    }

    fn alloc_data(&mut self, nbytes: usize) -> Result<usize> {
        let size = align_up(nbytes);
        if self.used + size > self.region.size {
            return Err(Error::OutOfArena {
                needed: size,
                available: self.region.size - self.used,
            });
        }
        let offset = self.used;
        self.used += size;
        Ok(offset)
    }

    /// Core tensor constructor. With `data == None` a fresh region is bump
    /// allocated (zero-initialized); with `Some(offset)` the header aliases
    /// an existing region (views).
    pub(crate) fn new_tensor_impl(
        &mut self,
        dtype: DType,
        ne: &[usize],
        data: Option<usize>,
    ) -> Result<TensorId> {
        assert!(!ne.is_empty() && ne.len() <= MAX_DIMS);

        let n_dims = ne.len();
        let mut ne4 = [1usize; MAX_DIMS];
        ne4[..n_dims].copy_from_slice(ne);

        let offset = match data {
            Some(offset) => offset,
            None => {
                let nbytes = ne4.iter().product::<usize>() * dtype.size();
                self.alloc_data(nbytes)?
            }
        };

        let mut nb = [0usize; MAX_DIMS];
        nb[0] = dtype.size();
        for i in 1..MAX_DIMS {
            nb[i] = nb[i - 1] * ne4[i - 1];
        }

        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(Tensor {
            dtype,
            n_dims,
            ne: ne4,
            nb,
            op: Op::None,
            is_param: false,
            grad: None,
            src0: None,
            src1: None,
            opt: [None; 3],
            data: offset,
            perf_runs: 0,
            perf_time_us: 0,
        });
        Ok(id)
    }

    pub fn new_tensor(&mut self, dtype: DType, ne: &[usize]) -> Result<TensorId> {
        self.new_tensor_impl(dtype, ne, None)
    }

    pub fn new_tensor_1d(&mut self, dtype: DType, ne0: usize) -> Result<TensorId> {
        self.new_tensor(dtype, &[ne0])
    }

    pub fn new_tensor_2d(&mut self, dtype: DType, ne0: usize, ne1: usize) -> Result<TensorId> {
        self.new_tensor(dtype, &[ne0, ne1])
    }

    pub fn new_tensor_3d(
        &mut self,
        dtype: DType,
        ne0: usize,
        ne1: usize,
        ne2: usize,
    ) -> Result<TensorId> {
        self.new_tensor(dtype, &[ne0, ne1, ne2])
    }

    pub fn new_tensor_4d(
        &mut self,
        dtype: DType,
        ne0: usize,
        ne1: usize,
        ne2: usize,
        ne3: usize,
    ) -> Result<TensorId> {
        self.new_tensor(dtype, &[ne0, ne1, ne2, ne3])
    }

    pub fn new_i32(&mut self, value: i32) -> Result<TensorId> {
        let t = self.new_tensor_1d(DType::I32, 1)?;
        self.set_i32(t, value);
        Ok(t)
    }

    pub fn new_f32(&mut self, value: f32) -> Result<TensorId> {
        let t = self.new_tensor_1d(DType::F32, 1)?;
        self.set_f32(t, value);
        Ok(t)
    }

    /// Fresh tensor with the same dtype and shape as `src` (data not copied).
    pub fn dup_tensor(&mut self, src: TensorId) -> Result<TensorId> {
        let t = self.tensor(src);
        let (dtype, n_dims, ne) = (t.dtype, t.n_dims, t.ne);
        self.new_tensor_impl(dtype, &ne[..n_dims], None)
    }

    /// New header aliasing the data region of `src`.
    pub fn view_tensor(&mut self, src: TensorId) -> Result<TensorId> {
        let t = self.tensor(src);
        let (dtype, n_dims, ne, nb, data) = (t.dtype, t.n_dims, t.ne, t.nb, t.data);
        let id = self.new_tensor_impl(dtype, &ne[..n_dims], Some(data))?;
        // carry over the source's strides so views of views keep working
        self.tensor_mut(id).nb = nb;
        Ok(id)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug!(
            "context slot {} freed, {} tensors, {} bytes used",
            self.slot,
            self.tensors.len(),
            self.used
        );
        CONTEXT_SLOTS.lock().unwrap()[self.slot] = false;
    }
}

/// Shared view of the arena memory used by kernels during `compute`.
///
/// Workers read source regions and write disjoint slices of destination
/// regions; the executor's phase barrier orders cross-thread access.
#[derive(Clone, Copy)]
pub(crate) struct ArenaMem {
    base: *mut u8,
    len: usize,
}

// SAFETY: kernels partition destination regions by worker index and only
// read shared source regions; the executor synchronizes phases with a
// barrier, so no two threads race on the same bytes.
unsafe impl Send for ArenaMem {}
unsafe impl Sync for ArenaMem {}

impl ArenaMem {
    #[inline]
    pub(crate) fn u8_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        // SAFETY: offset is within the allocation (checked at alloc time).
        unsafe { self.base.add(offset) }
    }

    #[inline]
    pub(crate) fn f32_ptr(&self, offset: usize) -> *mut f32 {
        self.u8_ptr(offset) as *mut f32
    }

    #[inline]
    pub(crate) fn f16_ptr(&self, offset: usize) -> *mut f16 {
        self.u8_ptr(offset) as *mut f16
    }

    #[inline]
    pub(crate) fn i32_ptr(&self, offset: usize) -> *mut i32 {
        self.u8_ptr(offset) as *mut i32
    }
}
