//! Graph compiler layer — lowering a `ComputeGraph` into an executable recipe.
//!
//! The vendor compiler is an external collaborator. It receives one
//! node-creation call per `GraphNode`, in graph order, and then produces an
//! opaque recipe. Compiled recipes are memoized by `ShapeSignature`.
//!
//! # Pipeline
//!
//! ```text
//! shapes + HyperParams → ComputeGraph → GraphCompiler::create_node ×N
//!                                              ↓
//!                           RecipeCache ← GraphCompiler::finish → Recipe
//! ```

pub mod cache;
pub mod graph;
pub mod signature;

pub use cache::{CacheSource, RecipeCache};
pub use graph::{ComputeGraph, GraphNode, NodeId, OpKind, RotaryMode, TensorId, TensorMeta};
pub use signature::ShapeSignature;

use crate::error::{KernelError, KernelResult, VendorStatus};

/// Vendor graph compiler seen from this crate.
///
/// One instance compiles one graph; `finish` consumes it.
pub trait GraphCompiler {
    /// Compiled, executable form of the graph.
    type Recipe: Send + Sync;

    /// Register one node with the vendor graph. Returns the raw vendor status
    /// on failure.
    fn create_node(&mut self, graph: &ComputeGraph, node: &GraphNode) -> Result<(), VendorStatus>;

    /// Compile every node registered so far into a recipe.
    fn finish(self, graph: &ComputeGraph) -> KernelResult<Self::Recipe>;
}

/// Hand every node of `graph` to `compiler` in order, then compile.
///
/// The first failing node aborts compilation with
/// `KernelError::GraphConstruction`; nothing is retried.
pub fn compile_graph<C: GraphCompiler>(mut compiler: C, graph: &ComputeGraph) -> KernelResult<C::Recipe> {
    for (step, node) in graph.nodes().iter().enumerate() {
        if let Err(status) = compiler.create_node(graph, node) {
            log::debug!("node {} ({}) rejected with {}", node.name, node.guid, status);
            return Err(KernelError::GraphConstruction {
                step,
                name: node.name.clone(),
                status,
            });
        }
    }
    compiler.finish(graph)
}
