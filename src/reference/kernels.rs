//! Scalar kernels of the reference interpreter.
//!
//! All arithmetic is done in `f32` (RMSNorm accumulates in `f64`); callers
//! round the results to the graph dtype afterwards.

use rayon::prelude::*;

use crate::compiler::graph::RotaryMode;
use crate::error::{KernelError, KernelResult};
use crate::types::TensorShape;

/// RMS normalization over the last axis.
///
/// Returns `(x / rms * scale, 1 / rms)` with `rms = sqrt(mean(x²) + eps)`.
pub fn rms_norm(x: &[f32], scale: &[f32], hidden: usize, eps: f32) -> (Vec<f32>, Vec<f32>) {
    let rows = x.len() / hidden;
    let mut out = vec![0.0f32; x.len()];
    let mut inv = vec![0.0f32; rows];

    for r in 0..rows {
        let in_row = &x[r * hidden..(r + 1) * hidden];
        let out_row = &mut out[r * hidden..(r + 1) * hidden];

        // Kahan summation of squares
        let mut sum_sq = 0.0f64;
        let mut compensation = 0.0f64;
        for &v in in_row {
            let v64 = v as f64;
            let y = v64 * v64 - compensation;
            let t = sum_sq + y;
            compensation = (t - sum_sq) - y;
            sum_sq = t;
        }

        let mean_sq = sum_sq / hidden as f64;
        let inv_rms = (1.0 / (mean_sq + eps as f64).sqrt()) as f32;
        for i in 0..hidden {
            out_row[i] = in_row[i] * inv_rms * scale[i];
        }
        inv[r] = inv_rms;
    }
    (out, inv)
}

/// `a[rows, k] × b` where `b` is `[n, k]` (`transpose_b`) or `[k, n]`.
/// Output rows are computed in parallel.
pub fn gemm(a: &[f32], b: &[f32], k: usize, n: usize, transpose_b: bool) -> Vec<f32> {
    let rows = a.len() / k;
    let mut out = vec![0.0f32; rows * n];
    out.par_chunks_exact_mut(n).enumerate().for_each(|(r, out_row)| {
        let a_row = &a[r * k..(r + 1) * k];
        for (j, o) in out_row.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            if transpose_b {
                let b_row = &b[j * k..(j + 1) * k];
                for p in 0..k {
                    acc += a_row[p] * b_row[p];
                }
            } else {
                for p in 0..k {
                    acc += a_row[p] * b[p * n + j];
                }
            }
            *o = acc;
        }
    });
    out
}

/// General axis permutation: output axis `i` is input axis `perm[i]`.
pub fn transpose(x: &[f32], shape: &TensorShape, perm: &[usize]) -> Vec<f32> {
    let in_strides = shape.strides();
    let out_dims: Vec<usize> = perm.iter().map(|&p| shape.dims()[p]).collect();
    let rank = out_dims.len();
    let mut out = Vec::with_capacity(x.len());
    let mut index = vec![0usize; rank];

    for _ in 0..x.len() {
        let src: usize = (0..rank).map(|i| index[i] * in_strides[perm[i]]).sum();
        out.push(x[src]);
        // odometer increment
        for axis in (0..rank).rev() {
            index[axis] += 1;
            if index[axis] < out_dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

/// Contiguous split of `axis` into chunks of `sizes`.
pub fn split(x: &[f32], shape: &TensorShape, axis: usize, sizes: &[usize]) -> Vec<Vec<f32>> {
    let dims = shape.dims();
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();
    let extent = dims[axis];

    let mut offset = 0;
    sizes
        .iter()
        .map(|&size| {
            let mut chunk = Vec::with_capacity(outer * size * inner);
            for o in 0..outer {
                let start = (o * extent + offset) * inner;
                chunk.extend_from_slice(&x[start..start + size * inner]);
            }
            offset += size;
            chunk
        })
        .collect()
}

/// Geometry of one rotary embedding call.
#[derive(Debug, Clone, Copy)]
pub struct RopeGeometry {
    /// `[batch, heads, seq_len, head_dim]` of the rotated tensor.
    pub batch: usize,
    pub heads: usize,
    pub seq_len: usize,
    pub head_dim: usize,
    /// Leading extent of the tables (1 broadcasts over batch).
    pub table_batch: usize,
    pub positions: usize,
    /// Whether position ids carry a batch axis.
    pub batched_ids: bool,
}

/// Rotary position embedding.
///
/// For token `(b, s)` the table row is `position_ids[b, s] + offset`; the
/// result is `x * cos + rotate(x) * sin` where `rotate` negates and swaps the
/// two members of each pair.
pub fn rope(
    x: &[f32],
    sin: &[f32],
    cos: &[f32],
    position_ids: &[f32],
    geo: &RopeGeometry,
    mode: RotaryMode,
    offset: usize,
) -> KernelResult<Vec<f32>> {
    let d = geo.head_dim;
    let mut out = vec![0.0f32; x.len()];

    for b in 0..geo.batch {
        let tb = if geo.table_batch == 1 { 0 } else { b };
        for s in 0..geo.seq_len {
            let id = if geo.batched_ids { position_ids[b * geo.seq_len + s] } else { position_ids[s] };
            if id < 0.0 || id.fract() != 0.0 {
                return Err(KernelError::InvalidArgument(format!(
                    "position id {id} at ({b}, {s}) is not a valid table row"
                )));
            }
            let pos = id as usize + offset;
            if pos >= geo.positions {
                return Err(KernelError::InvalidArgument(format!(
                    "position {pos} at ({b}, {s}) is outside the {}-row rotary table",
                    geo.positions
                )));
            }
            let row = (tb * geo.positions + pos) * d;
            let (c, sn) = (&cos[row..row + d], &sin[row..row + d]);

            for h in 0..geo.heads {
                let base = ((b * geo.heads + h) * geo.seq_len + s) * d;
                let xv = &x[base..base + d];
                let ov = &mut out[base..base + d];
                match mode {
                    RotaryMode::Blockwise => {
                        let half = d / 2;
                        for i in 0..half {
                            let (x1, x2) = (xv[i], xv[half + i]);
                            ov[i] = x1 * c[i] - x2 * sn[i];
                            ov[half + i] = x2 * c[half + i] + x1 * sn[half + i];
                        }
                    }
                    RotaryMode::Pairwise => {
                        for i in (0..d).step_by(2) {
                            let (x1, x2) = (xv[i], xv[i + 1]);
                            ov[i] = x1 * c[i] - x2 * sn[i];
                            ov[i + 1] = x2 * c[i + 1] + x1 * sn[i + 1];
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}
