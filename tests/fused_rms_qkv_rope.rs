//! End-to-end tests of the fused RMSNorm + QKV + RoPE operator on the CPU
//! reference backend.
//!
//! Every launch goes through the full path: shape inference → graph build →
//! node-by-node compilation → recipe cache → execution against host buffers.
//! Results are compared with a direct per-token computation that never
//! touches the graph.

use std::sync::Arc;
use std::thread;

use hpu_graph_kernels::types::round_to;
use hpu_graph_kernels::{
    CacheSource, ComputeGraph, DType, DeviceAddress, FusedRmsQkvRopeBuilder, FusedRmsQkvRopeKernel,
    FusedRmsQkvRopeShapes, FusedRmsQkvRopeSlots, GraphCompiler, GraphNode, HostMemory, HostTensor,
    HyperParams, KernelConfig, KernelError, KernelResult, RecipeExecutor, RotaryMode, StreamHandle,
    TensorShape, VendorStatus,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ═══════════════════════════════════════════════════════════════════════
// Test problem
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
struct Case {
    batch: usize,
    seq: usize,
    hidden: usize,
    head_dim: usize,
    head_count: usize,
    kv_head_count: usize,
    positions: usize,
}

impl Case {
    fn fused(&self) -> usize {
        (self.head_count + 2 * self.kv_head_count) * self.head_dim
    }

    fn hyper(&self) -> HyperParams {
        HyperParams::new(1e-6, self.head_dim, self.head_count)
    }

    fn shapes(&self) -> FusedRmsQkvRopeShapes {
        let table = TensorShape::from([1, self.positions, 1, self.head_dim]);
        FusedRmsQkvRopeShapes {
            src: TensorShape::from([self.batch, self.seq, self.hidden]),
            ln_scales: TensorShape::from([self.hidden]),
            qkv_weights: TensorShape::from([self.fused(), self.hidden]),
            sin: table.clone(),
            cos: table,
            position_ids: TensorShape::from([self.batch, self.seq]),
        }
    }
}

/// Deterministic pseudo-random values in `[-scale, scale]`.
fn values(n: usize, seed: u64, scale: f32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15) | 1;
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            ((state >> 40) as f32 / (1u64 << 24) as f32 * 2.0 - 1.0) * scale
        })
        .collect()
}

/// Host-side inputs, already rounded to the launch dtype.
struct Inputs {
    src: Vec<f32>,
    scale: Vec<f32>,
    weights: Vec<f32>,
    sin: Vec<f32>,
    cos: Vec<f32>,
    ids: Vec<i32>,
}

fn inputs(case: &Case, dtype: DType) -> Inputs {
    let round = |v: Vec<f32>| v.into_iter().map(|x| round_to(dtype, x)).collect::<Vec<_>>();
    let d = case.head_dim;
    let half = d / 2;
    let mut sin = Vec::with_capacity(case.positions * d);
    let mut cos = Vec::with_capacity(case.positions * d);
    for p in 0..case.positions {
        for i in 0..d {
            let inv_freq = 10000f64.powf(-2.0 * (i % half) as f64 / d as f64);
            let angle = p as f64 * inv_freq;
            sin.push(angle.sin() as f32);
            cos.push(angle.cos() as f32);
        }
    }
    let ids = (0..case.batch * case.seq)
        .map(|t| ((t / case.seq) * 2 + t % case.seq) as i32)
        .collect();
    Inputs {
        src: round(values(case.batch * case.seq * case.hidden, 1, 1.0)),
        scale: round(values(case.hidden, 2, 1.0).into_iter().map(|v| 1.0 + 0.25 * v).collect()),
        weights: round(values(case.fused() * case.hidden, 3, 0.25)),
        sin: round(sin),
        cos: round(cos),
        ids,
    }
}

/// Query, key and value computed token by token in f64.
fn direct(case: &Case, x: &Inputs, mode: RotaryMode) -> [Vec<f32>; 3] {
    let (h, kv, d, hid) = (case.head_count, case.kv_head_count, case.head_dim, case.hidden);
    let mut q = vec![0.0; case.batch * h * case.seq * d];
    let mut k = vec![0.0; case.batch * kv * case.seq * d];
    let mut v = vec![0.0; case.batch * kv * case.seq * d];

    for b in 0..case.batch {
        for s in 0..case.seq {
            let row = &x.src[(b * case.seq + s) * hid..][..hid];
            let ms: f64 = row.iter().map(|&r| (r as f64).powi(2)).sum::<f64>() / hid as f64;
            let inv = 1.0 / (ms + 1e-6).sqrt();
            let normed: Vec<f64> = row.iter().zip(&x.scale).map(|(&r, &g)| r as f64 * inv * g as f64).collect();
            let proj: Vec<f64> = (0..case.fused())
                .map(|f| (0..hid).map(|c| normed[c] * x.weights[f * hid + c] as f64).sum())
                .collect();

            let p = x.ids[b * case.seq + s] as usize;
            let (sn, cs) = (&x.sin[p * d..][..d], &x.cos[p * d..][..d]);
            let rotate = |head: &[f64]| -> Vec<f64> {
                let mut out = vec![0.0; d];
                let pairs: Vec<(usize, usize)> = match mode {
                    RotaryMode::Blockwise => (0..d / 2).map(|i| (i, i + d / 2)).collect(),
                    RotaryMode::Pairwise => (0..d / 2).map(|i| (2 * i, 2 * i + 1)).collect(),
                };
                for (i, j) in pairs {
                    out[i] = head[i] * cs[i] as f64 - head[j] * sn[i] as f64;
                    out[j] = head[j] * cs[j] as f64 + head[i] * sn[j] as f64;
                }
                out
            };

            for head in 0..h + 2 * kv {
                let block = &proj[head * d..(head + 1) * d];
                let (dst, idx, rotated) = if head < h {
                    (&mut q, (b * h + head) * case.seq + s, rotate(block))
                } else if head < h + kv {
                    (&mut k, (b * kv + head - h) * case.seq + s, rotate(block))
                } else {
                    (&mut v, (b * kv + head - h - kv) * case.seq + s, block.to_vec())
                };
                for (o, val) in dst[idx * d..(idx + 1) * d].iter_mut().zip(rotated) {
                    *o = val as f32;
                }
            }
        }
    }
    [q, k, v]
}

/// Buffers for one launch.
fn bind(memory: &HostMemory, case: &Case, x: &Inputs, dtype: DType) -> FusedRmsQkvRopeSlots {
    let shapes = case.shapes();
    let out = hpu_graph_kernels::allocate_outputs(&shapes, &case.hyper(), dtype).unwrap();
    let host = |shape: &TensorShape, data: &[f32]| memory.alloc(HostTensor::new(shape.clone(), dtype, data.to_vec()).unwrap());
    FusedRmsQkvRopeSlots {
        src: host(&shapes.src, &x.src),
        ln_scales: host(&shapes.ln_scales, &x.scale),
        qkv_weights: host(&shapes.qkv_weights, &x.weights),
        sin: host(&shapes.sin, &x.sin),
        cos: host(&shapes.cos, &x.cos),
        position_ids: memory.alloc(HostTensor::from_i32(shapes.position_ids.clone(), &x.ids).unwrap()),
        query_states: memory.alloc_zeros(out.query, dtype),
        key_states: memory.alloc_zeros(out.key, dtype),
        value_states: memory.alloc_zeros(out.value, dtype),
    }
}

fn read(memory: &HostMemory, addr: DeviceAddress) -> Vec<f32> {
    memory.read(addr).unwrap().into_data()
}

fn assert_close(name: &str, got: &[f32], want: &[f32], tol: f32) {
    assert_eq!(got.len(), want.len(), "{name}: length");
    for (i, (&g, &w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= tol * (1.0 + w.abs()),
            "{name}[{i}]: got {g}, want {w} (tol {tol})"
        );
    }
}

fn check_against_direct(case: Case, dtype: DType, mode: RotaryMode, tol: f32) {
    init_logging();
    let memory = Arc::new(HostMemory::new());
    let kernel = FusedRmsQkvRopeKernel::reference(Arc::clone(&memory), KernelConfig::default().with_verify_graph(true))
        .with_builder(FusedRmsQkvRopeBuilder::new().with_rotary_mode(mode));
    let x = inputs(&case, dtype);
    let slots = bind(&memory, &case, &x, dtype);

    let report = kernel
        .launch(&case.shapes(), dtype, &case.hyper(), StreamHandle(7), &slots)
        .unwrap();
    assert_eq!(report.cache_source, CacheSource::Compiled);
    assert_eq!(report.output_shapes.query.dims(), &[case.batch, case.head_count, case.seq, case.head_dim]);

    let [q, k, v] = direct(&case, &x, mode);
    assert_close("query", &read(&memory, slots.query_states), &q, tol);
    assert_close("key", &read(&memory, slots.key_states), &k, tol);
    assert_close("value", &read(&memory, slots.value_states), &v, tol);
}

// ═══════════════════════════════════════════════════════════════════════
// Numerics
// ═══════════════════════════════════════════════════════════════════════

const SMALL: Case = Case {
    batch: 2,
    seq: 5,
    hidden: 16,
    head_dim: 4,
    head_count: 2,
    kv_head_count: 1,
    positions: 8,
};

const GQA: Case = Case {
    batch: 1,
    seq: 6,
    hidden: 32,
    head_dim: 8,
    head_count: 4,
    kv_head_count: 2,
    positions: 16,
};

#[test]
fn test_f16_matches_direct_computation() {
    check_against_direct(SMALL, DType::F16, RotaryMode::Blockwise, 1e-2);
}

#[test]
fn test_bf16_grouped_query_matches_direct_computation() {
    check_against_direct(GQA, DType::BF16, RotaryMode::Blockwise, 5e-2);
}

#[test]
fn test_pairwise_rotary_mode() {
    check_against_direct(SMALL, DType::F16, RotaryMode::Pairwise, 1e-2);
}

#[test]
fn test_position_outside_table_fails_at_execution() {
    let memory = Arc::new(HostMemory::new());
    let kernel = FusedRmsQkvRopeKernel::reference(Arc::clone(&memory), KernelConfig::default());
    let mut x = inputs(&SMALL, DType::F16);
    x.ids[3] = SMALL.positions as i32;
    let slots = bind(&memory, &SMALL, &x, DType::F16);
    let err = kernel
        .launch(&SMALL.shapes(), DType::F16, &SMALL.hyper(), StreamHandle(0), &slots)
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidArgument(_)), "{err}");
}

#[test]
fn test_misshapen_output_buffer_leaves_other_outputs_untouched() {
    let memory = Arc::new(HostMemory::new());
    let kernel = FusedRmsQkvRopeKernel::reference(Arc::clone(&memory), KernelConfig::default());
    let x = inputs(&SMALL, DType::F16);

    for _ in 0..10 {
        let mut slots = bind(&memory, &SMALL, &x, DType::F16);
        slots.value_states = memory.alloc_zeros(TensorShape::from([1, 2, 8, 3]), DType::F16);
        let err = kernel
            .launch(&SMALL.shapes(), DType::F16, &SMALL.hyper(), StreamHandle(0), &slots)
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidArgument(_)), "{err}");
        assert!(read(&memory, slots.query_states).iter().all(|&v| v == 0.0));
        assert!(read(&memory, slots.key_states).iter().all(|&v| v == 0.0));
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Caching
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_second_launch_reuses_recipe_and_is_reproducible() {
    init_logging();
    let memory = Arc::new(HostMemory::new());
    let kernel = FusedRmsQkvRopeKernel::reference(Arc::clone(&memory), KernelConfig::default());
    let x = inputs(&SMALL, DType::BF16);
    let a = bind(&memory, &SMALL, &x, DType::BF16);
    let b = bind(&memory, &SMALL, &x, DType::BF16);

    let first = kernel.launch(&SMALL.shapes(), DType::BF16, &SMALL.hyper(), StreamHandle(0), &a).unwrap();
    let second = kernel.launch(&SMALL.shapes(), DType::BF16, &SMALL.hyper(), StreamHandle(1), &b).unwrap();
    assert_eq!(first.cache_source, CacheSource::Compiled);
    assert_eq!(second.cache_source, CacheSource::Memory);
    assert_eq!(first.output_shapes, second.output_shapes);
    assert_eq!(read(&memory, a.query_states), read(&memory, b.query_states));
    assert_eq!(read(&memory, a.key_states), read(&memory, b.key_states));
    assert_eq!(read(&memory, a.value_states), read(&memory, b.value_states));

    // f16 is a different signature
    let c = bind(&memory, &SMALL, &inputs(&SMALL, DType::F16), DType::F16);
    let third = kernel.launch(&SMALL.shapes(), DType::F16, &SMALL.hyper(), StreamHandle(0), &c).unwrap();
    assert_eq!(third.cache_source, CacheSource::Compiled);
    assert_eq!((kernel.cache().hits(), kernel.cache().misses(), kernel.cache().len()), (1, 2, 2));
}

#[test]
fn test_concurrent_launches_compile_once() {
    init_logging();
    let memory = Arc::new(HostMemory::new());
    let kernel = Arc::new(FusedRmsQkvRopeKernel::reference(Arc::clone(&memory), KernelConfig::default()));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let kernel = Arc::clone(&kernel);
            let memory = Arc::clone(&memory);
            thread::spawn(move || {
                let x = inputs(&GQA, DType::BF16);
                let slots = bind(&memory, &GQA, &x, DType::BF16);
                kernel
                    .launch(&GQA.shapes(), DType::BF16, &GQA.hyper(), StreamHandle(i), &slots)
                    .unwrap();
                read(&memory, slots.query_states)
            })
        })
        .collect();

    let results: Vec<Vec<f32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().all(|r| r == &results[0]));
    assert_eq!(kernel.cache().misses(), 1);
    assert_eq!(kernel.cache().hits(), 5);
}

// ═══════════════════════════════════════════════════════════════════════
// Compiler failures
// ═══════════════════════════════════════════════════════════════════════

/// Rejects the first node whose name ends with `reject`.
struct RejectingCompiler {
    reject: &'static str,
}

impl GraphCompiler for RejectingCompiler {
    type Recipe = ();

    fn create_node(&mut self, _graph: &ComputeGraph, node: &GraphNode) -> Result<(), VendorStatus> {
        if node.name.ends_with(self.reject) {
            return Err(VendorStatus(3));
        }
        Ok(())
    }

    fn finish(self, _graph: &ComputeGraph) -> KernelResult<()> {
        Ok(())
    }
}

struct UnreachableExecutor;

impl RecipeExecutor<()> for UnreachableExecutor {
    fn run(&self, _recipe: &(), _stream: StreamHandle, _slots: &FusedRmsQkvRopeSlots) -> KernelResult<()> {
        Err(KernelError::Execution("executor must not run".into()))
    }
}

#[test]
fn test_node_rejection_is_fatal_and_not_cached() {
    let kernel = FusedRmsQkvRopeKernel::new(
        || RejectingCompiler { reject: "_transpose" },
        UnreachableExecutor,
        KernelConfig::default(),
    );
    let memory = HostMemory::new();
    let slots = bind(&memory, &SMALL, &inputs(&SMALL, DType::F16), DType::F16);

    for _ in 0..2 {
        let err = kernel
            .launch(&SMALL.shapes(), DType::F16, &SMALL.hyper(), StreamHandle(0), &slots)
            .unwrap_err();
        match err {
            KernelError::GraphConstruction { step, name, status } => {
                assert_eq!(step, 3);
                assert_eq!(name, "fused_rms_qkv_rope_transpose");
                assert_eq!(status, VendorStatus(3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
    assert!(kernel.cache().is_empty());
    assert_eq!(kernel.cache().misses(), 2);
}
