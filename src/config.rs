//! Runtime configuration for kernel launches.
//!
//! Defaults are sensible for production; every field can be overridden from
//! the environment (`KernelConfig::from_env`) or programmatically via the
//! `with_*` setters.

use std::env;
use std::path::PathBuf;

use crate::error::{KernelError, KernelResult};

/// Device ordinal override.
pub const ENV_DEVICE: &str = "HPU_GRAPH_KERNELS_DEVICE";
/// Device ordinal as exported by the host framework's launcher.
pub const ENV_FRAMEWORK_DEVICE: &str = "FLAGS_selected_intel_hpus";
/// `0`/`false`/`off` disables recipe memoization.
pub const ENV_RECIPE_CACHE: &str = "HPU_GRAPH_KERNELS_RECIPE_CACHE";
/// `1`/`true`/`on` validates graph topology before compiling.
pub const ENV_VERIFY_GRAPH: &str = "HPU_GRAPH_KERNELS_VERIFY_GRAPH";
/// Directory receiving a JSON dump of every newly compiled graph.
pub const ENV_DUMP_GRAPH: &str = "HPU_GRAPH_KERNELS_DUMP_GRAPH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Accelerator ordinal the recipes are compiled for.
    pub device_id: u32,
    /// Memoize compiled recipes by shape signature.
    pub recipe_cache: bool,
    /// Run `ComputeGraph::validate` before handing a graph to the compiler.
    pub verify_graph: bool,
    /// Where to write graph dumps; `None` disables dumping.
    pub dump_graph_dir: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            recipe_cache: true,
            verify_graph: cfg!(debug_assertions),
            dump_graph_dir: None,
        }
    }
}

impl KernelConfig {
    /// Defaults overlaid with whatever the process environment sets.
    pub fn from_env() -> KernelResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production,
    /// a map in tests).
    pub fn from_lookup<F>(lookup: F) -> KernelResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let device = lookup(ENV_DEVICE).or_else(|| lookup(ENV_FRAMEWORK_DEVICE));
        if let Some(value) = device {
            let value = value.trim();
            config.device_id = value.parse::<u32>().map_err(|_| {
                KernelError::ConfigError(format!("invalid device ordinal '{value}'"))
            })?;
        }
        if let Some(value) = lookup(ENV_RECIPE_CACHE) {
            config.recipe_cache = parse_flag(ENV_RECIPE_CACHE, &value)?;
        }
        if let Some(value) = lookup(ENV_VERIFY_GRAPH) {
            config.verify_graph = parse_flag(ENV_VERIFY_GRAPH, &value)?;
        }
        if let Some(value) = lookup(ENV_DUMP_GRAPH) {
            let value = value.trim();
            if !value.is_empty() {
                config.dump_graph_dir = Some(PathBuf::from(value));
            }
        }

        log::debug!("kernel config: {config:?}");
        Ok(config)
    }

    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_recipe_cache(mut self, enable: bool) -> Self {
        self.recipe_cache = enable;
        self
    }

    pub fn with_verify_graph(mut self, enable: bool) -> Self {
        self.verify_graph = enable;
        self
    }

    pub fn with_dump_graph_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dump_graph_dir = dir;
        self
    }
}

fn parse_flag(key: &str, value: &str) -> KernelResult<bool> {
    let value = value.trim();
    if value == "1"
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("yes")
    {
        return Ok(true);
    }
    if value == "0"
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("no")
    {
        return Ok(false);
    }
    Err(KernelError::ConfigError(format!(
        "{key}: expected a boolean flag, got '{value}'"
    )))
}
