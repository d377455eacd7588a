//! Fused RMSNorm + QKV projection + rotary embedding — graph builder.
//!
//! Builds the attention prologue of a LLaMA-style decoder layer as one
//! accelerator graph:
//!
//! ```text
//! src ──rmsnorm──▶ norm_out ──gemm(Wᵀ)──▶ qkv_out ──reshape──▶ [B, S, H+2KV, D]
//!                                                                   │ transpose [0,2,1,3]
//!                                                                   ▼
//!        value_states ◀── split(axis 1: H | KV | KV) ◀── [B, H+2KV, S, D]
//!                              │          │
//!                         q_states    k_states
//!                              │          │
//! sin, cos ──reshape──▶ [b, 1, P, D] ──┬──┴── position_ids
//!                              ▼          ▼
//!                        query_states key_states   (rope, blockwise, offset 0)
//! ```
//!
//! `kv_head_count` is never passed in; it is derived from the fused
//! projection width in `derive_kv_head_count`, the only place that formula
//! lives.

use crate::compiler::graph::{ComputeGraph, GraphNode, OpKind, RotaryMode};
use crate::compiler::signature::ShapeSignature;
use crate::error::{KernelError, KernelResult};
use crate::types::{DType, TensorShape};
use crate::validation::{
    checked_product, validate_epsilon, validate_head_geometry, validate_min_rank,
    validate_non_empty, validate_rank, validate_rotary_dim,
};

// ── Operator metadata ──────────────────────────────────────────────

pub const OP_NAME: &str = "fused_rms_qkv_rope";

pub const SRC: &str = "src";
pub const LN_SCALES: &str = "ln_scales";
pub const QKV_WEIGHTS: &str = "qkv_weights";
pub const SIN: &str = "sin";
pub const COS: &str = "cos";
pub const POSITION_IDS: &str = "position_ids";
pub const QUERY_STATES: &str = "query_states";
pub const KEY_STATES: &str = "key_states";
pub const VALUE_STATES: &str = "value_states";

/// Input slots as registered with the host framework.
pub const INPUT_NAMES: [&str; 6] = [SRC, LN_SCALES, QKV_WEIGHTS, COS, SIN, POSITION_IDS];
pub const OUTPUT_NAMES: [&str; 3] = [QUERY_STATES, KEY_STATES, VALUE_STATES];
pub const ATTR_NAMES: [&str; 3] = ["epsilon: float", "head_dim: int", "num_head: int"];

// ── Inputs ─────────────────────────────────────────────────────────

/// Scalar attributes of the operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HyperParams {
    /// RMSNorm stabilizer, finite and > 0.
    pub epsilon: f32,
    /// Per-head feature width; even.
    pub head_dim: usize,
    /// Number of query heads.
    pub head_count: usize,
}

impl HyperParams {
    pub fn new(epsilon: f32, head_dim: usize, head_count: usize) -> Self {
        HyperParams { epsilon, head_dim, head_count }
    }

    pub fn validate(&self) -> KernelResult<()> {
        validate_epsilon(self.epsilon).map_err(KernelError::ConfigError)?;
        validate_head_geometry(self.head_dim, self.head_count).map_err(KernelError::ConfigError)?;
        validate_rotary_dim(self.head_dim).map_err(KernelError::ConfigError)
    }
}

/// Shapes of the six operator inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FusedRmsQkvRopeShapes {
    /// `[batch.., seq_len, hidden]`
    pub src: TensorShape,
    /// `[hidden]`
    pub ln_scales: TensorShape,
    /// `[fused_hidden_size, hidden]`
    pub qkv_weights: TensorShape,
    /// `[b, positions, head_dim]` or `[b, positions, 1, head_dim]`
    pub sin: TensorShape,
    pub cos: TensorShape,
    /// `[seq_len]` or `[batch, seq_len]`
    pub position_ids: TensorShape,
}

impl FusedRmsQkvRopeShapes {
    /// Shapes in executor slot order (`src, ln_scales, qkv_weights, sin, cos, position_ids`).
    pub fn in_slot_order(&self) -> Vec<TensorShape> {
        vec![
            self.src.clone(),
            self.ln_scales.clone(),
            self.qkv_weights.clone(),
            self.sin.clone(),
            self.cos.clone(),
            self.position_ids.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputShapes {
    /// `[batch, head_count, seq_len, head_dim]`
    pub query: TensorShape,
    /// `[batch, kv_head_count, seq_len, head_dim]`
    pub key: TensorShape,
    /// Same as `key`.
    pub value: TensorShape,
}

impl OutputShapes {
    /// `(slot name, shape)` in output order.
    pub fn named(&self) -> [(&'static str, &TensorShape); 3] {
        [(QUERY_STATES, &self.query), (KEY_STATES, &self.key), (VALUE_STATES, &self.value)]
    }
}

// ── Derivation ─────────────────────────────────────────────────────

/// `kv_head_count = (fused_hidden_size - head_count*head_dim) / (2*head_dim)`.
///
/// Fails with `ConfigError` when the query heads do not fit in the fused
/// width, when the remainder is not a whole number of key/value head pairs,
/// or when no key/value head remains.
pub fn derive_kv_head_count(fused_hidden_size: usize, hyper: &HyperParams) -> KernelResult<usize> {
    validate_head_geometry(hyper.head_dim, hyper.head_count).map_err(KernelError::ConfigError)?;

    let query_width = hyper.head_count.checked_mul(hyper.head_dim).ok_or_else(|| {
        KernelError::ConfigError(format!(
            "head_count {} * head_dim {} overflows",
            hyper.head_count, hyper.head_dim
        ))
    })?;
    if query_width > fused_hidden_size {
        return Err(KernelError::ConfigError(format!(
            "head_count*head_dim = {} exceeds fused_hidden_size {}",
            query_width, fused_hidden_size
        )));
    }

    let remainder = fused_hidden_size - query_width;
    let pair_width = hyper.head_dim.checked_mul(2).ok_or_else(|| {
        KernelError::ConfigError(format!("2*head_dim overflows for head_dim {}", hyper.head_dim))
    })?;
    if remainder % pair_width != 0 {
        return Err(KernelError::ConfigError(format!(
            "fused_hidden_size {} leaves {} columns after the query heads, not a multiple of 2*head_dim = {}",
            fused_hidden_size, remainder, pair_width
        )));
    }

    let kv_head_count = remainder / pair_width;
    if kv_head_count == 0 {
        return Err(KernelError::ConfigError(format!(
            "fused_hidden_size {} leaves no room for key/value heads",
            fused_hidden_size
        )));
    }
    Ok(kv_head_count)
}

/// Axis extents established by `check_inputs`.
#[derive(Debug, Clone, Copy)]
struct Dims {
    batch: usize,
    seq_len: usize,
    fused_hidden_size: usize,
    kv_head_count: usize,
    /// Leading axis of the rotary tables (1 or `batch`).
    table_batch: usize,
    /// Rows of the rotary tables.
    positions: usize,
}

impl Dims {
    fn output_shapes(&self, hyper: &HyperParams) -> OutputShapes {
        let kv = TensorShape::from([self.batch, self.kv_head_count, self.seq_len, hyper.head_dim]);
        OutputShapes {
            query: TensorShape::from([self.batch, hyper.head_count, self.seq_len, hyper.head_dim]),
            key: kv.clone(),
            value: kv,
        }
    }
}

/// Check every input shape and derive the axis extents.
///
/// `src` is checked before `qkv_weights` is looked at.
fn check_inputs(shapes: &FusedRmsQkvRopeShapes, hyper: &HyperParams) -> KernelResult<Dims> {
    let src = &shapes.src;
    validate_min_rank(src, 3)
        .and_then(|_| validate_non_empty(src))
        .map_err(|e| KernelError::shape(SRC, format!("[batch.., seq_len, hidden] ({e})"), src.dims()))?;
    let rank = src.rank();
    let hidden = src.dims()[rank - 1];
    let seq_len = src.dims()[rank - 2];
    let batch = checked_product(&src.dims()[..rank - 2])
        .map_err(|e| KernelError::shape(SRC, e, src.dims()))?;

    if shapes.ln_scales.dims() != [hidden] {
        return Err(KernelError::shape(LN_SCALES, format!("[{hidden}]"), shapes.ln_scales.dims()));
    }

    let weights = &shapes.qkv_weights;
    validate_rank(weights, 2)
        .and_then(|_| validate_non_empty(weights))
        .map_err(|e| KernelError::shape(QKV_WEIGHTS, format!("[fused_hidden_size, {hidden}] ({e})"), weights.dims()))?;
    if weights.dims()[1] != hidden {
        return Err(KernelError::shape(QKV_WEIGHTS, format!("[fused_hidden_size, {hidden}]"), weights.dims()));
    }
    let fused_hidden_size = weights.dims()[0];

    hyper.validate()?;
    let kv_head_count = derive_kv_head_count(fused_hidden_size, hyper)?;

    if shapes.cos != shapes.sin {
        return Err(KernelError::shape(COS, format!("same shape as sin {}", shapes.sin), shapes.cos.dims()));
    }
    let table = shapes.sin.dims();
    let layout_ok = match *table {
        [b, p, d] | [b, p, 1, d] => (b == 1 || b == batch) && p > 0 && d == hyper.head_dim,
        _ => false,
    };
    if !layout_ok {
        return Err(KernelError::shape(
            SIN,
            format!(
                "[1|{batch}, positions, {d}] or [1|{batch}, positions, 1, {d}]",
                d = hyper.head_dim
            ),
            table,
        ));
    }
    let (table_batch, positions) = (table[0], table[1]);

    let ids = shapes.position_ids.dims();
    let ids_ok = ids == [seq_len] || ids == [batch, seq_len];
    if !ids_ok {
        return Err(KernelError::shape(
            POSITION_IDS,
            format!("[{seq_len}] or [{batch}, {seq_len}]"),
            ids,
        ));
    }

    Ok(Dims {
        batch,
        seq_len,
        fused_hidden_size,
        kv_head_count,
        table_batch,
        positions,
    })
}

/// Shape-inference hook: output shapes for the given inputs.
pub fn infer_output_shapes(shapes: &FusedRmsQkvRopeShapes, hyper: &HyperParams) -> KernelResult<OutputShapes> {
    check_inputs(shapes, hyper).map(|dims| dims.output_shapes(hyper))
}

/// Dtype-inference hook: every output takes the activation dtype.
pub fn infer_output_dtypes(src: DType) -> KernelResult<[DType; 3]> {
    check_dtype(src)?;
    Ok([src; 3])
}

fn check_dtype(dtype: DType) -> KernelResult<()> {
    if !dtype.is_low_precision_float() {
        return Err(KernelError::UnsupportedDType(dtype));
    }
    Ok(())
}

/// Recipe cache key for one launch.
pub fn shape_signature(shapes: &FusedRmsQkvRopeShapes, hyper: &HyperParams, dtype: DType) -> ShapeSignature {
    ShapeSignature::new(
        OP_NAME,
        dtype,
        shapes.in_slot_order(),
        hyper.epsilon,
        hyper.head_dim,
        hyper.head_count,
    )
}

// ── Builder ────────────────────────────────────────────────────────

/// A built graph together with its derived facts.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedRmsQkvRopeGraph {
    graph: ComputeGraph,
    output_shapes: OutputShapes,
    kv_head_count: usize,
    head_count: usize,
}

impl FusedRmsQkvRopeGraph {
    pub fn graph(&self) -> &ComputeGraph {
        &self.graph
    }

    pub fn into_graph(self) -> ComputeGraph {
        self.graph
    }

    pub fn nodes(&self) -> &[GraphNode] {
        self.graph.nodes()
    }

    pub fn output_shapes(&self) -> &OutputShapes {
        &self.output_shapes
    }

    pub fn kv_head_count(&self) -> usize {
        self.kv_head_count
    }

    /// Query heads per key/value head (grouped-query attention factor),
    /// rounded down.
    pub fn num_groups(&self) -> usize {
        self.head_count / self.kv_head_count
    }
}

#[derive(Debug, Clone)]
pub struct FusedRmsQkvRopeBuilder {
    prefix: String,
    rotary_mode: RotaryMode,
}

impl Default for FusedRmsQkvRopeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FusedRmsQkvRopeBuilder {
    pub fn new() -> Self {
        FusedRmsQkvRopeBuilder {
            prefix: format!("{OP_NAME}_"),
            rotary_mode: RotaryMode::Blockwise,
        }
    }

    /// Prefix for node names.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_rotary_mode(mut self, mode: RotaryMode) -> Self {
        self.rotary_mode = mode;
        self
    }

    /// Build the graph. All inputs are checked before the first node is
    /// created; on error no graph exists.
    pub fn build(
        &self,
        shapes: &FusedRmsQkvRopeShapes,
        hyper: &HyperParams,
        dtype: DType,
    ) -> KernelResult<FusedRmsQkvRopeGraph> {
        check_dtype(dtype)?;
        let dims = check_inputs(shapes, hyper)?;
        let output_shapes = dims.output_shapes(hyper);
        let (h, kv, d) = (hyper.head_count, dims.kv_head_count, hyper.head_dim);
        let (batch, seq) = (dims.batch, dims.seq_len);

        let mut g = ComputeGraph::new(&self.prefix, dtype);
        let src = g.add_input(SRC, shapes.src.clone(), dtype);
        let ln_scales = g.add_input(LN_SCALES, shapes.ln_scales.clone(), dtype);
        let qkv_weights = g.add_input(QKV_WEIGHTS, shapes.qkv_weights.clone(), dtype);
        let sin = g.add_input(SIN, shapes.sin.clone(), dtype);
        let cos = g.add_input(COS, shapes.cos.clone(), dtype);
        let position_ids = g.add_input(POSITION_IDS, shapes.position_ids.clone(), DType::I32);

        // 1. rmsnorm
        let last = shapes.src.rank() - 1;
        let norm_out = g.add_tensor("norm_out", shapes.src.clone(), dtype);
        let norm_var = g.add_tensor("norm_var", shapes.src.with_axis(last, 1), dtype);
        g.add_node(
            OpKind::RmsNorm { epsilon: hyper.epsilon },
            vec![src, ln_scales],
            vec![norm_out, norm_var],
            "rmsnorm",
        );

        // 2. gemm
        let qkv_out = g.add_tensor("qkv_out", shapes.src.with_axis(last, dims.fused_hidden_size), dtype);
        g.add_node(
            OpKind::Gemm { transpose_a: false, transpose_b: true },
            vec![norm_out, qkv_weights],
            vec![qkv_out],
            "gemm",
        );

        // 3. reshape
        let heads = h + 2 * kv;
        let reshape_out = g.add_tensor("reshape_out", TensorShape::from([batch, seq, heads, d]), dtype);
        g.add_node(OpKind::Reshape, vec![qkv_out], vec![reshape_out], "reshape");

        // 4. transpose
        let trans_out = g.add_tensor("trans_out", TensorShape::from([batch, heads, seq, d]), dtype);
        g.add_node(
            OpKind::Transpose { permutation: vec![0, 2, 1, 3] },
            vec![reshape_out],
            vec![trans_out],
            "transpose",
        );

        // 5. split
        let q_states = g.add_tensor("q_states", output_shapes.query.clone(), dtype);
        let k_states = g.add_tensor("k_states", output_shapes.key.clone(), dtype);
        let value_states = g.add_tensor(VALUE_STATES, output_shapes.value.clone(), dtype);
        g.add_node(
            OpKind::Split { axis: 1, sizes: vec![h, kv, kv] },
            vec![trans_out],
            vec![q_states, k_states, value_states],
            "split",
        );

        // 6. rotary tables to [b, 1, positions, d]
        let table_shape = TensorShape::from([dims.table_batch, 1, dims.positions, d]);
        let sin_sq = g.add_tensor("sin_squeezed", table_shape.clone(), dtype);
        let cos_sq = g.add_tensor("cos_squeezed", table_shape, dtype);
        g.add_node(OpKind::Reshape, vec![sin], vec![sin_sq], "sin_reshape");
        g.add_node(OpKind::Reshape, vec![cos], vec![cos_sq], "cos_reshape");

        // 7-8. rope on q and k
        let rope = OpKind::RotaryEmbedding { mode: self.rotary_mode, offset: 0 };
        let query_states = g.add_tensor(QUERY_STATES, output_shapes.query.clone(), dtype);
        g.add_node(rope.clone(), vec![q_states, sin_sq, cos_sq, position_ids], vec![query_states], "rope_q");
        let key_states = g.add_tensor(KEY_STATES, output_shapes.key.clone(), dtype);
        g.add_node(rope, vec![k_states, sin_sq, cos_sq, position_ids], vec![key_states], "rope_k");

        g.mark_output(query_states);
        g.mark_output(key_states);
        g.mark_output(value_states);

        log::debug!(
            "built {} graph: {} nodes, kv_head_count={}, outputs q={} k={} v={}",
            OP_NAME,
            g.num_nodes(),
            kv,
            output_shapes.query,
            output_shapes.key,
            output_shapes.value
        );

        Ok(FusedRmsQkvRopeGraph {
            graph: g,
            output_shapes,
            kv_head_count: kv,
            head_count: h,
        })
    }
}
