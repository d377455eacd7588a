//! CPU reference backend.
//!
//! Implements both collaborators of the kernel entry point on the host:
//! `ReferenceCompiler` checks every node the way a vendor graph compiler
//! would and yields a `ReferenceRecipe`; `ReferenceExecutor` runs that recipe
//! against buffers in a `HostMemory` arena. Used to test graph topology
//! numerically without an accelerator.

pub mod host;
pub mod kernels;

pub use host::{HostMemory, HostTensor};

use std::collections::HashMap;
use std::sync::Arc;

use crate::compiler::graph::{ComputeGraph, GraphNode, NodeId, OpKind, TensorId};
use crate::compiler::GraphCompiler;
use crate::error::{KernelError, KernelResult, VendorStatus};
use crate::runtime::{FusedRmsQkvRopeSlots, RecipeExecutor, StreamHandle};
use crate::types::{round_to, DType, TensorShape};

use kernels::RopeGeometry;

// ── Compiler ───────────────────────────────────────────────────────

/// Host graph compiler. Rejects nodes whose tensor shapes do not satisfy
/// their op kind.
#[derive(Debug, Default)]
pub struct ReferenceCompiler {
    created: Vec<NodeId>,
}

impl ReferenceCompiler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphCompiler for ReferenceCompiler {
    type Recipe = ReferenceRecipe;

    fn create_node(&mut self, graph: &ComputeGraph, node: &GraphNode) -> Result<(), VendorStatus> {
        if let Err(reason) = check_node(graph, node) {
            log::warn!("reference compiler rejected {} <{}>: {}", node.name, node.guid, reason);
            return Err(VendorStatus::FAIL);
        }
        self.created.push(node.id);
        Ok(())
    }

    fn finish(self, graph: &ComputeGraph) -> KernelResult<ReferenceRecipe> {
        if self.created.len() != graph.num_nodes() {
            return Err(KernelError::Internal(format!(
                "{} of {} nodes were created before compiling",
                self.created.len(),
                graph.num_nodes()
            )));
        }
        let order = graph.topological_sort()?;
        Ok(ReferenceRecipe {
            graph: graph.clone(),
            order,
        })
    }
}

fn shapes<'g>(graph: &'g ComputeGraph, ids: &[TensorId]) -> Result<Vec<&'g TensorShape>, String> {
    graph.shapes_of(ids).map_err(|e| e.to_string())
}

/// Shape rules per op kind.
fn check_node(graph: &ComputeGraph, node: &GraphNode) -> Result<(), String> {
    let (n_in, n_out) = node.kind.arity();
    if node.inputs.len() != n_in || n_out.map_or(false, |k| node.outputs.len() != k) {
        return Err(format!(
            "expected {n_in} inputs / {n_out:?} outputs, got {} / {}",
            node.inputs.len(),
            node.outputs.len()
        ));
    }
    let ins = shapes(graph, &node.inputs)?;
    let outs = shapes(graph, &node.outputs)?;

    match &node.kind {
        OpKind::RmsNorm { epsilon } => {
            let (x, scale) = (ins[0], ins[1]);
            let hidden = x.last().ok_or("rank-0 input")?;
            if scale.dims() != [hidden] || epsilon.is_nan() {
                return Err(format!("scale {scale} does not match input {x}"));
            }
            if outs[0] != x || *outs[1] != x.with_axis(x.rank() - 1, 1) {
                return Err(format!("outputs {} {} do not match input {x}", outs[0], outs[1]));
            }
        }
        OpKind::Gemm { transpose_a, transpose_b } => {
            let (a, b) = (ins[0], ins[1]);
            if *transpose_a || b.rank() != 2 || a.rank() < 2 {
                return Err(format!("unsupported gemm {a} x {b} (transpose_a={transpose_a})"));
            }
            let (k, n) = if *transpose_b { (b.dims()[1], b.dims()[0]) } else { (b.dims()[0], b.dims()[1]) };
            if a.last() != Some(k) || *outs[0] != a.with_axis(a.rank() - 1, n) {
                return Err(format!("gemm {a} x {b} cannot produce {}", outs[0]));
            }
        }
        OpKind::Reshape => {
            if ins[0].numel() != outs[0].numel() {
                return Err(format!("reshape {} → {} changes element count", ins[0], outs[0]));
            }
        }
        OpKind::Transpose { permutation } => {
            let mut seen = permutation.clone();
            seen.sort_unstable();
            if seen != (0..ins[0].rank()).collect::<Vec<_>>() {
                return Err(format!("{permutation:?} is not a permutation of {}", ins[0]));
            }
            let expected: Vec<usize> = permutation.iter().map(|&p| ins[0].dims()[p]).collect();
            if outs[0].dims() != expected.as_slice() {
                return Err(format!("transpose of {} cannot produce {}", ins[0], outs[0]));
            }
        }
        OpKind::Split { axis, sizes } => {
            let x = ins[0];
            if *axis >= x.rank() || sizes.iter().sum::<usize>() != x.dims()[*axis] {
                return Err(format!("split {sizes:?} on axis {axis} does not cover {x}"));
            }
            for (out, &size) in outs.iter().zip(sizes) {
                if **out != x.with_axis(*axis, size) {
                    return Err(format!("split chunk {out} should have {size} on axis {axis}"));
                }
            }
        }
        OpKind::RotaryEmbedding { .. } => {
            let (x, sin, cos, ids) = (ins[0], ins[1], ins[2], ins[3]);
            if x.rank() != 4 || sin != cos || sin.rank() != 4 || sin.dims()[1] != 1 {
                return Err(format!("rope input {x} with tables {sin} / {cos}"));
            }
            let (batch, seq, d) = (x.dims()[0], x.dims()[2], x.dims()[3]);
            if sin.dims()[3] != d || d % 2 != 0 || !(sin.dims()[0] == 1 || sin.dims()[0] == batch) {
                return Err(format!("rope tables {sin} do not fit input {x}"));
            }
            if ids.dims() != [seq] && ids.dims() != [batch, seq] {
                return Err(format!("position ids {ids} do not fit input {x}"));
            }
            if outs[0] != x {
                return Err(format!("rope output {} differs from input {x}", outs[0]));
            }
        }
    }
    Ok(())
}

// ── Recipe ─────────────────────────────────────────────────────────

/// A checked graph plus its execution order.
#[derive(Debug, Clone)]
pub struct ReferenceRecipe {
    graph: ComputeGraph,
    order: Vec<NodeId>,
}

impl ReferenceRecipe {
    pub fn graph(&self) -> &ComputeGraph {
        &self.graph
    }

    /// Interpret the graph. `inputs` is keyed by graph input name; the result
    /// is keyed by graph output name.
    pub fn execute(&self, inputs: &HashMap<String, HostTensor>) -> KernelResult<HashMap<String, HostTensor>> {
        let g = &self.graph;
        let mut values: Vec<Option<HostTensor>> = vec![None; g.num_tensors()];

        for &id in g.inputs() {
            let meta = g
                .tensor(id)
                .ok_or_else(|| KernelError::Internal(format!("dangling input {id:?}")))?;
            let tensor = inputs
                .get(&meta.name)
                .ok_or_else(|| KernelError::InvalidArgument(format!("missing input '{}'", meta.name)))?;
            if tensor.shape() != &meta.shape {
                return Err(KernelError::InvalidArgument(format!(
                    "input '{}' has shape {}, graph expects {}",
                    meta.name,
                    tensor.shape(),
                    meta.shape
                )));
            }
            values[id.0 as usize] = Some(HostTensor::new(meta.shape.clone(), meta.dtype, tensor.data().to_vec())?);
        }

        for &nid in &self.order {
            let node = g
                .node(nid)
                .ok_or_else(|| KernelError::Internal(format!("dangling node {nid:?}")))?;
            let args: Vec<&HostTensor> = node
                .inputs
                .iter()
                .map(|t| {
                    values[t.0 as usize]
                        .as_ref()
                        .ok_or_else(|| KernelError::Internal(format!("{} reads an unset tensor", node.name)))
                })
                .collect::<KernelResult<_>>()?;
            let results = eval_node(g, node, &args)?;
            for (&tid, data) in node.outputs.iter().zip(results) {
                let meta = g
                    .tensor(tid)
                    .ok_or_else(|| KernelError::Internal(format!("dangling output {tid:?}")))?;
                values[tid.0 as usize] = Some(HostTensor::new(meta.shape.clone(), meta.dtype, data)?);
            }
            log::trace!("executed {}", node.name);
        }

        g.outputs()
            .iter()
            .map(|&id| {
                let name = g.tensor(id).map(|t| t.name.clone()).unwrap_or_default();
                values[id.0 as usize]
                    .take()
                    .map(|t| (name, t))
                    .ok_or_else(|| KernelError::Internal(format!("output {id:?} was never written")))
            })
            .collect()
    }
}

fn eval_node(g: &ComputeGraph, node: &GraphNode, args: &[&HostTensor]) -> KernelResult<Vec<Vec<f32>>> {
    let x = args[0];
    let out = match &node.kind {
        OpKind::RmsNorm { epsilon } => {
            let hidden = x.shape().last().unwrap_or(1);
            let (y, inv) = kernels::rms_norm(x.data(), args[1].data(), hidden, *epsilon);
            vec![y, inv]
        }
        OpKind::Gemm { transpose_b, .. } => {
            let w = args[1].shape().dims();
            let (k, n) = if *transpose_b { (w[1], w[0]) } else { (w[0], w[1]) };
            vec![kernels::gemm(x.data(), args[1].data(), k, n, *transpose_b)]
        }
        OpKind::Reshape => vec![x.data().to_vec()],
        OpKind::Transpose { permutation } => vec![kernels::transpose(x.data(), x.shape(), permutation)],
        OpKind::Split { axis, sizes } => kernels::split(x.data(), x.shape(), *axis, sizes),
        OpKind::RotaryEmbedding { mode, offset } => {
            let (sin, cos, ids) = (args[1], args[2], args[3]);
            let dims = x.shape().dims();
            let geo = RopeGeometry {
                batch: dims[0],
                heads: dims[1],
                seq_len: dims[2],
                head_dim: dims[3],
                table_batch: sin.shape().dims()[0],
                positions: sin.shape().dims()[2],
                batched_ids: ids.shape().rank() == 2,
            };
            vec![kernels::rope(x.data(), sin.data(), cos.data(), ids.data(), &geo, *mode, *offset)?]
        }
    };

    let rounded = out
        .into_iter()
        .zip(&node.outputs)
        .map(|(mut data, &tid)| {
            let dtype = g.tensor(tid).map_or(DType::F32, |t| t.dtype);
            for v in data.iter_mut() {
                *v = round_to(dtype, *v);
            }
            data
        })
        .collect();
    Ok(rounded)
}

// ── Executor ───────────────────────────────────────────────────────

/// Runs `ReferenceRecipe`s against a shared `HostMemory`.
#[derive(Clone)]
pub struct ReferenceExecutor {
    memory: Arc<HostMemory>,
}

impl ReferenceExecutor {
    pub fn new(memory: Arc<HostMemory>) -> Self {
        ReferenceExecutor { memory }
    }

    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }
}

impl RecipeExecutor<ReferenceRecipe> for ReferenceExecutor {
    fn run(&self, recipe: &ReferenceRecipe, stream: StreamHandle, slots: &FusedRmsQkvRopeSlots) -> KernelResult<()> {
        slots.validate()?;
        let g = recipe.graph();

        let mut inputs = HashMap::new();
        for &id in g.inputs() {
            let name = &g
                .tensor(id)
                .ok_or_else(|| KernelError::Internal(format!("dangling input {id:?}")))?
                .name;
            let addr = slots
                .get(name)
                .ok_or_else(|| KernelError::Internal(format!("no slot for graph input '{name}'")))?;
            inputs.insert(name.clone(), self.memory.read(addr)?);
        }

        let mut outputs = recipe.execute(&inputs)?;
        let mut writes = Vec::with_capacity(g.outputs().len());
        for &id in g.outputs() {
            let name = &g
                .tensor(id)
                .ok_or_else(|| KernelError::Internal(format!("dangling output {id:?}")))?
                .name;
            let addr = slots
                .get(name)
                .ok_or_else(|| KernelError::Internal(format!("no slot for graph output '{name}'")))?;
            let tensor = outputs
                .remove(name)
                .ok_or_else(|| KernelError::Internal(format!("recipe produced no '{name}'")))?;
            writes.push((addr, tensor));
        }
        self.memory.write_all(writes)?;
        log::debug!("reference run of {} on stream {:?} done", g.prefix(), stream);
        Ok(())
    }
}
