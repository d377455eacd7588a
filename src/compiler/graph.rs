//! ComputeGraph — DAG handed to the accelerator graph compiler.
//!
//! The graph describes one fused kernel as an ordered list of typed nodes.
//! Each node reads input tensors and produces output tensors; tensors carry
//! shape metadata and def-use chains (single producer, multiple consumers).
//! Node order is the order in which the vendor compiler receives
//! node-creation calls.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::error::{KernelError, KernelResult};
use crate::types::{DType, TensorShape};

// ── Identifiers ────────────────────────────────────────────────────

/// Tensor handle, an index into the graph's tensor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TensorId(pub u32);

/// Node handle, an index into the graph's node list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u32);

// ── Tensor metadata ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorMeta {
    pub id: TensorId,
    /// Slot name; persistent tensors are bound to caller buffers by this name.
    pub name: String,
    pub shape: TensorShape,
    pub dtype: DType,
    /// Backed by a caller-provided buffer (graph input or output).
    pub persistent: bool,
    /// The node producing this tensor (None for graph inputs).
    pub producer: Option<NodeId>,
    pub consumers: Vec<NodeId>,
}

// ── Operation kinds ────────────────────────────────────────────────

/// Rotary embedding pairing scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RotaryMode {
    /// Rotate element `i` with `i + head_dim/2`.
    Blockwise,
    /// Rotate element `2i` with `2i + 1`.
    Pairwise,
}

/// Operations the graph can carry, with their parameter blobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OpKind {
    /// Root-mean-square normalization over the last axis.
    /// Inputs: (x, scale). Outputs: (y, inverse rms with last axis 1).
    RmsNorm { epsilon: f32 },
    /// Batched matrix multiply over the last two axes.
    Gemm { transpose_a: bool, transpose_b: bool },
    /// Reinterpret extents; the element order is unchanged.
    Reshape,
    Transpose { permutation: Vec<usize> },
    /// Contiguous split of `axis` into chunks of `sizes`.
    Split { axis: usize, sizes: Vec<usize> },
    /// Inputs: (x, sin, cos, position_ids).
    RotaryEmbedding { mode: RotaryMode, offset: usize },
}

impl OpKind {
    /// Vendor kernel identifier without the dtype suffix.
    pub fn base_guid(&self) -> &'static str {
        match self {
            OpKind::RmsNorm { .. } => "rms_norm_ex_fwd_",
            OpKind::Gemm { .. } => "gemm",
            OpKind::Reshape => "reshape",
            OpKind::Transpose { .. } => "transpose",
            OpKind::Split { .. } => "split",
            OpKind::RotaryEmbedding { .. } => "rotary_pos_embedding_fwd_",
        }
    }

    /// Whether the vendor exposes one kernel per element type.
    pub fn is_typed(&self) -> bool {
        matches!(self, OpKind::RmsNorm { .. } | OpKind::RotaryEmbedding { .. })
    }

    /// Full vendor kernel identifier for `dtype`.
    pub fn guid(&self, dtype: DType) -> String {
        if self.is_typed() {
            format!("{}{}", self.base_guid(), dtype.guid_suffix())
        } else {
            self.base_guid().to_string()
        }
    }

    /// Expected (inputs, outputs) arity.
    pub fn arity(&self) -> (usize, Option<usize>) {
        match self {
            OpKind::RmsNorm { .. } => (2, Some(2)),
            OpKind::Gemm { .. } => (2, Some(1)),
            OpKind::Reshape | OpKind::Transpose { .. } => (1, Some(1)),
            OpKind::Split { sizes, .. } => (1, Some(sizes.len())),
            OpKind::RotaryEmbedding { .. } => (4, Some(1)),
        }
    }
}

// ── Graph node ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub kind: OpKind,
    /// Input tensors (order matches `OpKind` semantics).
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    /// Node name as registered with the vendor graph.
    pub name: String,
    /// Vendor kernel identifier.
    pub guid: String,
}

// ── ComputeGraph ───────────────────────────────────────────────────

/// Ordered DAG of nodes for a single fused kernel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeGraph {
    /// Prefix shared by every node name.
    prefix: String,
    /// Element type of the floating tensors; selects typed kernels.
    dtype: DType,
    nodes: Vec<GraphNode>,
    tensors: Vec<TensorMeta>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
}

impl ComputeGraph {
    pub fn new(prefix: &str, dtype: DType) -> Self {
        ComputeGraph {
            prefix: prefix.to_string(),
            dtype,
            nodes: Vec::new(),
            tensors: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Allocate an intermediate tensor.
    pub fn add_tensor(&mut self, name: &str, shape: TensorShape, dtype: DType) -> TensorId {
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(TensorMeta {
            id,
            name: name.to_string(),
            shape,
            dtype,
            persistent: false,
            producer: None,
            consumers: Vec::new(),
        });
        id
    }

    /// Allocate a tensor bound to a caller buffer and register it as a graph input.
    pub fn add_input(&mut self, name: &str, shape: TensorShape, dtype: DType) -> TensorId {
        let id = self.add_tensor(name, shape, dtype);
        self.tensors[id.0 as usize].persistent = true;
        self.inputs.push(id);
        id
    }

    /// Mark an existing tensor as a graph output bound to a caller buffer.
    pub fn mark_output(&mut self, id: TensorId) {
        if let Some(t) = self.tensor_mut(id) {
            t.persistent = true;
            self.outputs.push(id);
        }
    }

    /// Append a node. Updates def-use chains.
    pub fn add_node(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
        label: &str,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);

        for &tid in &outputs {
            if let Some(t) = self.tensor_mut(tid) {
                t.producer = Some(id);
            }
        }
        for &tid in &inputs {
            if let Some(t) = self.tensor_mut(tid) {
                t.consumers.push(id);
            }
        }

        let guid = kind.guid(self.dtype);
        self.nodes.push(GraphNode {
            id,
            kind,
            inputs,
            outputs,
            name: format!("{}{}", self.prefix, label),
            guid,
        });
        id
    }

    pub fn tensor(&self, id: TensorId) -> Option<&TensorMeta> {
        self.tensors.get(id.0 as usize)
    }

    fn tensor_mut(&mut self, id: TensorId) -> Option<&mut TensorMeta> {
        self.tensors.get_mut(id.0 as usize)
    }

    /// Look up a tensor by slot name.
    pub fn tensor_by_name(&self, name: &str) -> Option<&TensorMeta> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(id.0 as usize)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn tensors(&self) -> &[TensorMeta] {
        &self.tensors
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Shapes of the given tensors, in order.
    pub fn shapes_of(&self, ids: &[TensorId]) -> KernelResult<Vec<&TensorShape>> {
        ids.iter()
            .map(|&id| {
                self.tensor(id)
                    .map(|t| &t.shape)
                    .ok_or_else(|| KernelError::Internal(format!("dangling tensor {:?}", id)))
            })
            .collect()
    }

    /// Build def-use chains: TensorId → (producer, consumers).
    pub fn def_use_chains(&self) -> HashMap<TensorId, (Option<NodeId>, Vec<NodeId>)> {
        self.tensors
            .iter()
            .map(|t| (t.id, (t.producer, t.consumers.clone())))
            .collect()
    }

    /// Topological order of nodes (Kahn's algorithm, ties broken by node id).
    pub fn topological_sort(&self) -> KernelResult<Vec<NodeId>> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<NodeId>> = vec![Vec::new(); n];

        for node in &self.nodes {
            for &tid in &node.inputs {
                if let Some(producer) = self.tensor(tid).and_then(|t| t.producer) {
                    adj[producer.0 as usize].push(node.id);
                    in_degree[node.id.0 as usize] += 1;
                }
            }
        }

        let mut queue: Vec<NodeId> = (0..n)
            .filter(|&i| in_degree[i] == 0)
            .map(|i| NodeId(i as u32))
            .collect();
        let mut result = Vec::with_capacity(n);
        let mut head = 0;

        while head < queue.len() {
            let current = queue[head];
            head += 1;
            result.push(current);
            for &next in &adj[current.0 as usize] {
                let deg = &mut in_degree[next.0 as usize];
                *deg -= 1;
                if *deg == 0 {
                    queue.push(next);
                }
            }
        }

        if result.len() != n {
            return Err(KernelError::Internal(format!(
                "graph has a cycle: sorted {} of {} nodes",
                result.len(),
                n
            )));
        }
        Ok(result)
    }

    /// Check structural well-formedness:
    /// - every referenced tensor exists and arities match the op kind;
    /// - every tensor is produced at most once and graph inputs never;
    /// - every graph output has a producer;
    /// - nodes are listed in dependency order and the graph is acyclic.
    pub fn validate(&self) -> KernelResult<()> {
        let mut produced = vec![0usize; self.tensors.len()];

        for node in &self.nodes {
            let (n_in, n_out) = node.kind.arity();
            if node.inputs.len() != n_in || n_out.map_or(false, |k| node.outputs.len() != k) {
                return Err(KernelError::Internal(format!(
                    "node {} has {} inputs / {} outputs, expected {} / {:?}",
                    node.name,
                    node.inputs.len(),
                    node.outputs.len(),
                    n_in,
                    n_out
                )));
            }
            for &tid in &node.inputs {
                let t = self.tensor(tid).ok_or_else(|| {
                    KernelError::Internal(format!("node {} reads dangling {:?}", node.name, tid))
                })?;
                if let Some(producer) = t.producer {
                    if producer >= node.id {
                        return Err(KernelError::Internal(format!(
                            "node {} reads {} before it is produced",
                            node.name, t.name
                        )));
                    }
                }
            }
            for &tid in &node.outputs {
                let slot = produced.get_mut(tid.0 as usize).ok_or_else(|| {
                    KernelError::Internal(format!("node {} writes dangling {:?}", node.name, tid))
                })?;
                *slot += 1;
            }
        }

        for t in &self.tensors {
            if produced[t.id.0 as usize] > 1 {
                return Err(KernelError::Internal(format!(
                    "tensor {} has {} producers",
                    t.name, produced[t.id.0 as usize]
                )));
            }
        }
        for &id in &self.inputs {
            if produced[id.0 as usize] != 0 {
                return Err(KernelError::Internal(format!("graph input {:?} is produced", id)));
            }
        }
        for &id in &self.outputs {
            if produced[id.0 as usize] != 1 {
                return Err(KernelError::Internal(format!("graph output {:?} has no producer", id)));
            }
        }

        self.topological_sort().map(|_| ())
    }

    /// Stable structural hash over node kinds, wiring, and tensor metadata.
    pub fn fingerprint(&self) -> u64 {
        let desc = format!(
            "{}|{:?}|{:?}|{:?}|{:?}|{:?}",
            self.prefix, self.dtype, self.nodes, self.tensors, self.inputs, self.outputs
        );
        fnv1a(desc.as_bytes())
    }

    /// Pretty JSON description, used for graph dumps.
    pub fn to_json(&self) -> KernelResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// 64-bit FNV-1a.
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

impl fmt::Display for ComputeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "ComputeGraph {}: {} nodes, {} tensors ({})",
            self.prefix,
            self.nodes.len(),
            self.tensors.len(),
            self.dtype
        )?;
        let describe = |ids: &[TensorId]| -> String {
            ids.iter()
                .map(|t| match self.tensor(*t) {
                    Some(m) => format!("{}{}", m.name, m.shape),
                    None => "?".to_string(),
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        for node in &self.nodes {
            writeln!(
                f,
                "  [{:>2}] {} <{}> : ({}) → ({})",
                node.id.0,
                node.name,
                node.guid,
                describe(&node.inputs),
                describe(&node.outputs)
            )?;
        }
        Ok(())
    }
}
