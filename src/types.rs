//! Core element and shape types shared by the graph builder, the compiler
//! collaborators and the reference backend.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a graph tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
    I32,
    I64,
}

impl DType {
    /// Size in bytes per element.
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::I64 => 8,
        }
    }

    /// Whether the fused kernels accept this type for activations and weights.
    ///
    /// Only the two 16-bit floating formats are lowered to the accelerator.
    pub const fn is_low_precision_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }

    /// Suffix appended to typed vendor kernel identifiers (`rms_norm_ex_fwd_bf16`).
    pub const fn guid_suffix(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::I32 => "i32",
            Self::I64 => "i64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.guid_suffix())
    }
}

/// Ordered per-axis extents of a tensor.
///
/// Every derivation step produces a fresh value; shapes are never edited in
/// place once handed to the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorShape(Vec<usize>);

impl TensorShape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        TensorShape(dims.into())
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (1 for a rank-0 shape).
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Extent of `axis`, or `None` when out of range.
    pub fn axis(&self, axis: usize) -> Option<usize> {
        self.0.get(axis).copied()
    }

    pub fn last(&self) -> Option<usize> {
        self.0.last().copied()
    }

    /// Copy of this shape with `axis` replaced by `extent`.
    ///
    /// # Panics
    /// Panics if `axis >= rank`.
    pub fn with_axis(&self, axis: usize, extent: usize) -> Self {
        let mut dims = self.0.clone();
        dims[axis] = extent;
        TensorShape(dims)
    }

    /// Copy of this shape with a new axis of `extent` inserted before `axis`.
    ///
    /// # Panics
    /// Panics if `axis > rank`.
    pub fn inserted(&self, axis: usize, extent: usize) -> Self {
        let mut dims = self.0.clone();
        dims.insert(axis, extent);
        TensorShape(dims)
    }

    /// Row-major strides in elements.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.0.len()];
        for i in (0..self.0.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.0[i + 1];
        }
        strides
    }

    pub fn into_vec(self) -> Vec<usize> {
        self.0
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(dims: Vec<usize>) -> Self {
        TensorShape(dims)
    }
}

impl From<&[usize]> for TensorShape {
    fn from(dims: &[usize]) -> Self {
        TensorShape(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for TensorShape {
    fn from(dims: [usize; N]) -> Self {
        TensorShape(dims.to_vec())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Floating element stored in host buffers of the reference backend.
pub trait KernelFloat: Copy + Default + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl KernelFloat for f32 {
    const DTYPE: DType = DType::F32;

    #[inline(always)]
    fn to_f32(self) -> f32 { self }
    #[inline(always)]
    fn from_f32(v: f32) -> Self { v }
}

impl KernelFloat for half::f16 {
    const DTYPE: DType = DType::F16;

    #[inline(always)]
    fn to_f32(self) -> f32 { half::f16::to_f32(self) }
    #[inline(always)]
    fn from_f32(v: f32) -> Self { half::f16::from_f32(v) }
}

impl KernelFloat for half::bf16 {
    const DTYPE: DType = DType::BF16;

    #[inline(always)]
    fn to_f32(self) -> f32 { half::bf16::to_f32(self) }
    #[inline(always)]
    fn from_f32(v: f32) -> Self { half::bf16::from_f32(v) }
}

/// Round `v` to the nearest value representable in `dtype`.
///
/// Integer types pass through unchanged; they only ever carry indices.
#[inline]
pub fn round_to(dtype: DType, v: f32) -> f32 {
    match dtype {
        DType::F16 => half::f16::from_f32(v).to_f32(),
        DType::BF16 => half::bf16::from_f32(v).to_f32(),
        DType::F32 | DType::I32 | DType::I64 => v,
    }
}
