//! hpu-graph-kernels: graph construction for fused accelerator kernels.
//!
//! This crate builds the compute graph of the fused **RMSNorm + QKV
//! projection + rotary position embedding** operator and drives it through
//! pluggable collaborators:
//! - **Graph builder**: derives every intermediate shape and emits an ordered,
//!   strongly-typed node sequence (`ops::fused_rms_qkv_rope`)
//! - **Graph compiler**: `GraphCompiler` trait, one node-creation call per node
//! - **Recipe cache**: at most one compilation per shape signature
//! - **Executor**: `RecipeExecutor` trait with a fixed slot record
//! - **Reference backend**: CPU implementation of both collaborators
//!
//! # Quick Start
//!
//! ```ignore
//! use hpu_graph_kernels::{FusedRmsQkvRopeKernel, HostMemory, KernelConfig};
//!
//! let memory = Arc::new(HostMemory::new());
//! let kernel = FusedRmsQkvRopeKernel::reference(memory.clone(), KernelConfig::from_env()?);
//! let report = kernel.launch(&shapes, DType::BF16, &hyper, StreamHandle(0), &slots)?;
//! ```

pub mod compiler;
pub mod config;
pub mod error;
pub mod kernel;
pub mod ops;
pub mod reference;
pub mod runtime;
pub mod types;
pub mod validation;

pub use compiler::{
    compile_graph, CacheSource, ComputeGraph, GraphCompiler, GraphNode, NodeId, OpKind,
    RecipeCache, RotaryMode, ShapeSignature, TensorId, TensorMeta,
};
pub use config::KernelConfig;
pub use error::{KernelError, KernelResult, VendorStatus};
pub use kernel::{allocate_outputs, FusedRmsQkvRopeKernel, LaunchReport};
pub use ops::fused_rms_qkv_rope::{
    derive_kv_head_count, infer_output_dtypes, infer_output_shapes, shape_signature,
    FusedRmsQkvRopeBuilder, FusedRmsQkvRopeGraph, FusedRmsQkvRopeShapes, HyperParams,
    OutputShapes,
};
pub use reference::{HostMemory, HostTensor, ReferenceCompiler, ReferenceExecutor, ReferenceRecipe};
pub use runtime::{DeviceAddress, FusedRmsQkvRopeSlots, RecipeExecutor, StreamHandle};
pub use types::{DType, KernelFloat, TensorShape};
