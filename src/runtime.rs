//! Recipe execution seam.
//!
//! The executor is an external collaborator: it runs a compiled recipe on a
//! device stream against caller-owned buffers. Buffers are passed through a
//! fixed slot record instead of a name-keyed map.

use std::fmt;

use crate::error::{KernelError, KernelResult};
use crate::ops::fused_rms_qkv_rope::{
    COS, KEY_STATES, LN_SCALES, POSITION_IDS, QKV_WEIGHTS, QUERY_STATES, SIN, SRC, VALUE_STATES,
};

/// Opaque device buffer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub const NULL: DeviceAddress = DeviceAddress(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque device stream handle supplied by the host framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub u64);

/// Buffer bindings for one `fused_rms_qkv_rope` execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusedRmsQkvRopeSlots {
    pub src: DeviceAddress,
    pub ln_scales: DeviceAddress,
    pub qkv_weights: DeviceAddress,
    pub sin: DeviceAddress,
    pub cos: DeviceAddress,
    pub position_ids: DeviceAddress,
    pub query_states: DeviceAddress,
    pub key_states: DeviceAddress,
    pub value_states: DeviceAddress,
}

impl FusedRmsQkvRopeSlots {
    /// `(slot name, address)` pairs, inputs first, for vendor APIs that take a
    /// name map.
    pub fn bindings(&self) -> [(&'static str, DeviceAddress); 9] {
        [
            (SRC, self.src),
            (LN_SCALES, self.ln_scales),
            (QKV_WEIGHTS, self.qkv_weights),
            (SIN, self.sin),
            (COS, self.cos),
            (POSITION_IDS, self.position_ids),
            (QUERY_STATES, self.query_states),
            (KEY_STATES, self.key_states),
            (VALUE_STATES, self.value_states),
        ]
    }

    /// Address bound to `name`, if it is one of the nine slots.
    pub fn get(&self, name: &str) -> Option<DeviceAddress> {
        self.bindings()
            .into_iter()
            .find(|(slot, _)| *slot == name)
            .map(|(_, addr)| addr)
    }

    /// Reject null bindings.
    pub fn validate(&self) -> KernelResult<()> {
        match self.bindings().into_iter().find(|(_, addr)| addr.is_null()) {
            Some((name, _)) => Err(KernelError::InvalidArgument(format!("slot '{name}' is bound to a null address"))),
            None => Ok(()),
        }
    }
}

/// Runs compiled recipes of type `R`.
pub trait RecipeExecutor<R>: Send + Sync {
    fn run(&self, recipe: &R, stream: StreamHandle, slots: &FusedRmsQkvRopeSlots) -> KernelResult<()>;
}
