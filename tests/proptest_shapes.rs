//! Property-based tests for graph construction and shape derivation.
//!
//! Uses proptest to verify invariants that must hold for all inputs:
//! - kv_head_count reconstructs the fused projection width exactly
//! - non-reducible widths are configuration errors
//! - output shapes follow [batch, heads, seq_len, head_dim]
//! - building is deterministic
//! - the reference compiler accepts every built graph

use proptest::prelude::*;

use hpu_graph_kernels::{
    compile_graph, derive_kv_head_count, infer_output_shapes, DType, FusedRmsQkvRopeBuilder,
    FusedRmsQkvRopeShapes, HyperParams, KernelError, OpKind, ReferenceCompiler, TensorShape,
};

/// A consistent problem description.
#[derive(Debug, Clone)]
struct Problem {
    lead: Vec<usize>,
    seq: usize,
    hidden: usize,
    head_dim: usize,
    head_count: usize,
    kv_head_count: usize,
    positions: usize,
    batched_tables: bool,
    batched_ids: bool,
    squeezed_tables: bool,
}

impl Problem {
    fn batch(&self) -> usize {
        self.lead.iter().product()
    }

    fn fused(&self) -> usize {
        (self.head_count + 2 * self.kv_head_count) * self.head_dim
    }

    fn hyper(&self) -> HyperParams {
        HyperParams::new(1e-5, self.head_dim, self.head_count)
    }

    fn shapes(&self) -> FusedRmsQkvRopeShapes {
        let mut src = self.lead.clone();
        src.extend([self.seq, self.hidden]);
        let b = if self.batched_tables { self.batch() } else { 1 };
        let table = if self.squeezed_tables {
            TensorShape::from([b, self.positions, self.head_dim])
        } else {
            TensorShape::from([b, self.positions, 1, self.head_dim])
        };
        let ids = if self.batched_ids {
            TensorShape::from([self.batch(), self.seq])
        } else {
            TensorShape::from([self.seq])
        };
        FusedRmsQkvRopeShapes {
            src: TensorShape::from(src),
            ln_scales: TensorShape::from([self.hidden]),
            qkv_weights: TensorShape::from([self.fused(), self.hidden]),
            sin: table.clone(),
            cos: table,
            position_ids: ids,
        }
    }
}

fn arb_problem() -> impl Strategy<Value = Problem> {
    (
        prop::collection::vec(1usize..4, 1..3),
        1usize..16,
        1usize..64,
        (1usize..9).prop_map(|h| h * 2),
        1usize..9,
        1usize..5,
        1usize..32,
        any::<(bool, bool, bool)>(),
    )
        .prop_map(
            |(lead, seq, hidden, head_dim, head_count, kv_head_count, positions, flags)| Problem {
                lead,
                seq,
                hidden,
                head_dim,
                head_count,
                kv_head_count,
                positions,
                batched_tables: flags.0,
                batched_ids: flags.1,
                squeezed_tables: flags.2,
            },
        )
}

proptest! {
    /// head_count*head_dim + 2*kv_head_count*head_dim == fused_hidden_size.
    #[test]
    fn prop_kv_head_count_reconstructs_width(
        head_dim in 1usize..64,
        head_count in 1usize..32,
        kv in 1usize..16,
    ) {
        let fused = (head_count + 2 * kv) * head_dim;
        let hyper = HyperParams::new(1e-6, head_dim, head_count);
        let derived = derive_kv_head_count(fused, &hyper).unwrap();
        prop_assert_eq!(derived, kv);
        prop_assert_eq!(head_count * head_dim + 2 * derived * head_dim, fused);
    }

    /// Widths that do not reduce to whole kv heads are rejected, never rounded.
    #[test]
    fn prop_non_reducible_width_is_config_error(
        head_dim in 1usize..32,
        head_count in 1usize..16,
        fused in 1usize..2048,
    ) {
        let hyper = HyperParams::new(1e-6, head_dim, head_count);
        let q = head_count * head_dim;
        let reducible = fused > q && (fused - q) % (2 * head_dim) == 0;
        match derive_kv_head_count(fused, &hyper) {
            Ok(kv) => {
                prop_assert!(reducible);
                prop_assert_eq!(q + 2 * kv * head_dim, fused);
            }
            Err(e) => {
                prop_assert!(!reducible);
                prop_assert!(matches!(e, KernelError::ConfigError(_)));
            }
        }
    }

    /// Builder output shapes match the closed form and shape inference.
    #[test]
    fn prop_output_shapes(p in arb_problem()) {
        let built = FusedRmsQkvRopeBuilder::new()
            .build(&p.shapes(), &p.hyper(), DType::BF16)
            .unwrap();
        let out = built.output_shapes();
        let batch = p.batch();
        prop_assert_eq!(out.query.dims(), &[batch, p.head_count, p.seq, p.head_dim][..]);
        prop_assert_eq!(out.key.dims(), &[batch, p.kv_head_count, p.seq, p.head_dim][..]);
        prop_assert_eq!(&out.key, &out.value);
        prop_assert_eq!(built.kv_head_count(), p.kv_head_count);
        prop_assert_eq!(&infer_output_shapes(&p.shapes(), &p.hyper()).unwrap(), out);
    }

    /// Same inputs, same graph.
    #[test]
    fn prop_build_is_deterministic(p in arb_problem()) {
        let builder = FusedRmsQkvRopeBuilder::new();
        let a = builder.build(&p.shapes(), &p.hyper(), DType::F16).unwrap();
        let b = builder.build(&p.shapes(), &p.hyper(), DType::F16).unwrap();
        prop_assert_eq!(a.graph().fingerprint(), b.graph().fingerprint());
        let kinds = |g: &hpu_graph_kernels::FusedRmsQkvRopeGraph| -> Vec<OpKind> {
            g.nodes().iter().map(|n| n.kind.clone()).collect()
        };
        prop_assert_eq!(kinds(&a), kinds(&b));
        prop_assert_eq!(a, b);
    }

    /// Every built graph is well formed and accepted node by node.
    #[test]
    fn prop_reference_compiler_accepts_built_graphs(p in arb_problem()) {
        let built = FusedRmsQkvRopeBuilder::new()
            .build(&p.shapes(), &p.hyper(), DType::BF16)
            .unwrap();
        prop_assert!(built.graph().validate().is_ok());
        prop_assert_eq!(built.nodes().len(), 9);
        prop_assert!(compile_graph(ReferenceCompiler::new(), built.graph()).is_ok());
    }

    /// Query heads wider than the projection never yield a graph.
    #[test]
    fn prop_oversized_query_heads_rejected(p in arb_problem(), extra in 1usize..8) {
        let mut hyper = p.hyper();
        hyper.head_count = p.fused() / p.head_dim + extra;
        let err = FusedRmsQkvRopeBuilder::new()
            .build(&p.shapes(), &hyper, DType::BF16)
            .unwrap_err();
        prop_assert!(matches!(err, KernelError::ConfigError(_)));
    }
}
