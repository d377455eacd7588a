//! Shape and parameter validation shared by the graph builders.
//!
//! All functions return `Result<T, String>`; callers map the message into
//! the `KernelError` variant that fits the violated contract.

use crate::types::TensorShape;

/// Validate that `shape` has at least `min_rank` axes.
#[inline]
pub fn validate_min_rank(shape: &TensorShape, min_rank: usize) -> Result<(), String> {
    if shape.rank() < min_rank {
        return Err(format!(
            "rank {} is below the required minimum {}",
            shape.rank(),
            min_rank
        ));
    }
    Ok(())
}

/// Validate that `shape` has exactly `rank` axes.
#[inline]
pub fn validate_rank(shape: &TensorShape, rank: usize) -> Result<(), String> {
    if shape.rank() != rank {
        return Err(format!("rank {} != {}", shape.rank(), rank));
    }
    Ok(())
}

/// Validate that every extent of `shape` is non-zero.
#[inline]
pub fn validate_non_empty(shape: &TensorShape) -> Result<(), String> {
    if let Some(axis) = shape.dims().iter().position(|&d| d == 0) {
        return Err(format!("axis {} of {} has zero extent", axis, shape));
    }
    Ok(())
}

/// Validate normalization epsilon (finite and strictly positive).
#[inline]
pub fn validate_epsilon(epsilon: f32) -> Result<(), String> {
    if !epsilon.is_finite() || epsilon <= 0.0 {
        return Err(format!("epsilon must be finite and > 0, got {}", epsilon));
    }
    Ok(())
}

/// Validate attention head geometry.
#[inline]
pub fn validate_head_geometry(head_dim: usize, head_count: usize) -> Result<(), String> {
    if head_dim == 0 || head_count == 0 {
        return Err(format!(
            "head_dim and head_count must be > 0, got head_dim={} head_count={}",
            head_dim, head_count
        ));
    }
    Ok(())
}

/// Validate that a rotary table's last axis can be split into two halves.
#[inline]
pub fn validate_rotary_dim(head_dim: usize) -> Result<(), String> {
    if head_dim % 2 != 0 {
        return Err(format!(
            "head_dim {} must be even for blockwise rotary embedding",
            head_dim
        ));
    }
    Ok(())
}

/// Multiply extents with overflow detection.
#[inline]
pub fn checked_product(dims: &[usize]) -> Result<usize, String> {
    dims.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d)
            .ok_or_else(|| format!("element count of {:?} overflows usize", dims))
    })
}
