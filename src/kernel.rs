//! `fused_rms_qkv_rope` operator entry point.
//!
//! Glues the pieces together for one launch: dtype dispatch, shape
//! inference, recipe lookup (build + compile on a miss), then execution on
//! the caller's stream.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compiler::graph::ComputeGraph;
use crate::compiler::signature::ShapeSignature;
use crate::compiler::{compile_graph, CacheSource, GraphCompiler, RecipeCache};
use crate::config::KernelConfig;
use crate::error::KernelResult;
use crate::ops::fused_rms_qkv_rope::{
    infer_output_dtypes, infer_output_shapes, shape_signature, FusedRmsQkvRopeBuilder,
    FusedRmsQkvRopeShapes, HyperParams, OutputShapes, OP_NAME,
};
use crate::reference::{HostMemory, ReferenceCompiler, ReferenceExecutor};
use crate::runtime::{FusedRmsQkvRopeSlots, RecipeExecutor, StreamHandle};
use crate::types::DType;

/// What a launch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    /// Shapes the output slots were expected to hold.
    pub output_shapes: OutputShapes,
    /// Whether the recipe was reused or compiled by this launch.
    pub cache_source: CacheSource,
}

/// Output buffer shapes for the tensor allocator, checked against `dtype`.
pub fn allocate_outputs(
    shapes: &FusedRmsQkvRopeShapes,
    hyper: &HyperParams,
    dtype: DType,
) -> KernelResult<OutputShapes> {
    infer_output_dtypes(dtype)?;
    infer_output_shapes(shapes, hyper)
}

type CompilerFactory<C> = Box<dyn Fn() -> C + Send + Sync>;

pub struct FusedRmsQkvRopeKernel<C: GraphCompiler, E> {
    new_compiler: CompilerFactory<C>,
    executor: E,
    cache: RecipeCache<C::Recipe>,
    builder: FusedRmsQkvRopeBuilder,
    config: KernelConfig,
}

impl FusedRmsQkvRopeKernel<ReferenceCompiler, ReferenceExecutor> {
    /// Kernel backed by the CPU reference backend.
    pub fn reference(memory: Arc<HostMemory>, config: KernelConfig) -> Self {
        Self::new(ReferenceCompiler::new, ReferenceExecutor::new(memory), config)
    }
}

impl<C, E> FusedRmsQkvRopeKernel<C, E>
where
    C: GraphCompiler,
    E: RecipeExecutor<C::Recipe>,
{
    /// `new_compiler` creates one compiler instance per graph.
    pub fn new<F>(new_compiler: F, executor: E, config: KernelConfig) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        FusedRmsQkvRopeKernel {
            new_compiler: Box::new(new_compiler),
            executor,
            cache: RecipeCache::new(),
            builder: FusedRmsQkvRopeBuilder::new(),
            config,
        }
    }

    pub fn with_builder(mut self, builder: FusedRmsQkvRopeBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn cache(&self) -> &RecipeCache<C::Recipe> {
        &self.cache
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Run the operator once.
    ///
    /// Inputs and slots are checked before any graph is built. The recipe is
    /// looked up by shape signature unless caching is disabled.
    pub fn launch(
        &self,
        shapes: &FusedRmsQkvRopeShapes,
        dtype: DType,
        hyper: &HyperParams,
        stream: StreamHandle,
        slots: &FusedRmsQkvRopeSlots,
    ) -> KernelResult<LaunchReport> {
        let output_shapes = allocate_outputs(shapes, hyper, dtype)?;
        slots.validate()?;

        let signature = shape_signature(shapes, hyper, dtype);
        let (recipe, cache_source) = if self.config.recipe_cache {
            self.cache
                .get_or_compile(&signature, || self.compile(shapes, hyper, dtype, &signature))?
        } else {
            (Arc::new(self.compile(shapes, hyper, dtype, &signature)?), CacheSource::Compiled)
        };

        self.executor.run(&recipe, stream, slots)?;
        Ok(LaunchReport {
            output_shapes,
            cache_source,
        })
    }

    fn compile(
        &self,
        shapes: &FusedRmsQkvRopeShapes,
        hyper: &HyperParams,
        dtype: DType,
        signature: &ShapeSignature,
    ) -> KernelResult<C::Recipe> {
        let built = self.builder.build(shapes, hyper, dtype)?;
        let graph = built.graph();
        if self.config.verify_graph {
            graph.validate()?;
        }
        if let Some(dir) = &self.config.dump_graph_dir {
            if let Err(e) = dump_graph(dir, graph, signature) {
                log::warn!("failed to dump graph for {signature}: {e}");
            }
        }
        log::info!(
            "compiling {} ({} nodes) for device {}",
            signature,
            graph.num_nodes(),
            self.config.device_id
        );
        compile_graph((self.new_compiler)(), graph)
    }
}

/// Write `graph` as JSON to `dir/<op>_<digest>.json`.
fn dump_graph(dir: &Path, graph: &ComputeGraph, signature: &ShapeSignature) -> KernelResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_{:016x}.json", OP_NAME, signature.digest()));
    fs::write(&path, graph.to_json()?)?;
    log::debug!("graph dumped to {}", path.display());
    Ok(path)
}
