//! Host-side tensors and a fake device memory for the reference backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{KernelError, KernelResult};
use crate::runtime::DeviceAddress;
use crate::types::{round_to, DType, KernelFloat, TensorShape};

/// Largest integer magnitude an f32 holds exactly.
const MAX_EXACT_I32: u32 = 1 << 24;

/// Dense row-major tensor held in host memory.
///
/// Values are stored widened to `f32` and always hold numbers representable
/// in `dtype`; integer tensors hold whole numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: TensorShape,
    dtype: DType,
    data: Vec<f32>,
}

impl HostTensor {
    /// Wrap `data`, rounding every value to `dtype`.
    pub fn new(shape: TensorShape, dtype: DType, mut data: Vec<f32>) -> KernelResult<Self> {
        if data.len() != shape.numel() {
            return Err(KernelError::InvalidArgument(format!(
                "{} values supplied for shape {} ({} elements)",
                data.len(),
                shape,
                shape.numel()
            )));
        }
        for v in data.iter_mut() {
            *v = round_to(dtype, *v);
        }
        Ok(HostTensor { shape, dtype, data })
    }

    pub fn zeros(shape: TensorShape, dtype: DType) -> Self {
        let data = vec![0.0; shape.numel()];
        HostTensor { shape, dtype, data }
    }

    pub fn from_typed<T: KernelFloat>(shape: TensorShape, values: &[T]) -> KernelResult<Self> {
        Self::new(shape, T::DTYPE, values.iter().map(|v| v.to_f32()).collect())
    }

    /// Integer index tensor (position ids).
    pub fn from_i32(shape: TensorShape, values: &[i32]) -> KernelResult<Self> {
        if let Some(&v) = values.iter().find(|v| v.unsigned_abs() > MAX_EXACT_I32) {
            return Err(KernelError::InvalidArgument(format!(
                "integer {v} is not exactly representable on the host (limit ±{MAX_EXACT_I32})"
            )));
        }
        Self::new(shape, DType::I32, values.iter().map(|&v| v as f32).collect())
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn to_typed<T: KernelFloat>(&self) -> Vec<T> {
        self.data.iter().map(|&v| T::from_f32(v)).collect()
    }
}

/// Address-keyed arena standing in for device memory.
pub struct HostMemory {
    next: AtomicU64,
    buffers: Mutex<HashMap<DeviceAddress, HostTensor>>,
}

const BASE_ADDRESS: u64 = 0x1000;
const ALIGN: u64 = 0x100;

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemory {
    pub fn new() -> Self {
        HostMemory {
            next: AtomicU64::new(BASE_ADDRESS),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn buffers(&self) -> MutexGuard<'_, HashMap<DeviceAddress, HostTensor>> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `tensor` and return its address.
    pub fn alloc(&self, tensor: HostTensor) -> DeviceAddress {
        let bytes = (tensor.shape.numel() * tensor.dtype.size_bytes()) as u64;
        let span = bytes.div_ceil(ALIGN).max(1) * ALIGN;
        let addr = DeviceAddress(self.next.fetch_add(span, Ordering::Relaxed));
        self.buffers().insert(addr, tensor);
        addr
    }

    pub fn alloc_zeros(&self, shape: TensorShape, dtype: DType) -> DeviceAddress {
        self.alloc(HostTensor::zeros(shape, dtype))
    }

    /// Copy of the buffer at `addr`.
    pub fn read(&self, addr: DeviceAddress) -> KernelResult<HostTensor> {
        self.buffers()
            .get(&addr)
            .cloned()
            .ok_or_else(|| KernelError::InvalidArgument(format!("no buffer at {addr}")))
    }

    /// Overwrite the buffer at `addr`; shape and dtype must not change.
    pub fn write(&self, addr: DeviceAddress, tensor: HostTensor) -> KernelResult<()> {
        self.write_all(vec![(addr, tensor)])
    }

    /// Overwrite several buffers at once. Every target is checked before
    /// any is written, so on error no buffer has changed.
    pub fn write_all(&self, writes: Vec<(DeviceAddress, HostTensor)>) -> KernelResult<()> {
        let mut buffers = self.buffers();
        for (addr, tensor) in &writes {
            let slot = buffers
                .get(addr)
                .ok_or_else(|| KernelError::InvalidArgument(format!("no buffer at {addr}")))?;
            if slot.shape != tensor.shape || slot.dtype != tensor.dtype {
                return Err(KernelError::InvalidArgument(format!(
                    "buffer at {addr} is {}{}, cannot hold {}{}",
                    slot.dtype, slot.shape, tensor.dtype, tensor.shape
                )));
            }
        }
        for (addr, tensor) in writes {
            buffers.insert(addr, tensor);
        }
        Ok(())
    }

    pub fn free(&self, addr: DeviceAddress) -> Option<HostTensor> {
        self.buffers().remove(&addr)
    }

    pub fn len(&self) -> usize {
        self.buffers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
