//! Fused operator graph builders.

pub mod fused_rms_qkv_rope;

pub use fused_rms_qkv_rope::{
    derive_kv_head_count, infer_output_dtypes, infer_output_shapes, FusedRmsQkvRopeBuilder,
    FusedRmsQkvRopeGraph, FusedRmsQkvRopeShapes, HyperParams, OutputShapes,
};
