//! Recipe cache key.
//!
//! A signature captures everything the graph topology depends on: operator
//! name, element type, every input shape and the hyper-parameters. Two
//! launches with equal signatures build identical graphs, so they may share
//! one compiled recipe.

use std::fmt;

use crate::compiler::graph::fnv1a;
use crate::types::{DType, TensorShape};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeSignature {
    pub op_name: &'static str,
    pub dtype: DType,
    /// Input shapes in slot order.
    pub inputs: Vec<TensorShape>,
    /// `f32::to_bits` of epsilon, so the key stays `Eq + Hash`.
    pub epsilon_bits: u32,
    pub head_dim: usize,
    pub head_count: usize,
}

impl ShapeSignature {
    pub fn new(
        op_name: &'static str,
        dtype: DType,
        inputs: Vec<TensorShape>,
        epsilon: f32,
        head_dim: usize,
        head_count: usize,
    ) -> Self {
        ShapeSignature {
            op_name,
            dtype,
            inputs,
            epsilon_bits: epsilon.to_bits(),
            head_dim,
            head_count,
        }
    }

    pub fn epsilon(&self) -> f32 {
        f32::from_bits(self.epsilon_bits)
    }

    /// Stable 64-bit digest, used to name graph dumps.
    pub fn digest(&self) -> u64 {
        fnv1a(self.to_string().as_bytes())
    }
}

impl fmt::Display for ShapeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>(", self.op_name, self.dtype)?;
        for (i, shape) in self.inputs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{shape}")?;
        }
        write!(
            f,
            ") eps={:#010x} head_dim={} head_count={}",
            self.epsilon_bits, self.head_dim, self.head_count
        )
    }
}
