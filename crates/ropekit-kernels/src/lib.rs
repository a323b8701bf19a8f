//! Rotary position embedding kernels for ropekit.
//!
//! The CPU kernel rotates the query and key projections of every token in
//! place, using a precomputed cos/sin table row selected by each token's
//! position. Work fans out across tokens on the rayon pool; every
//! `(token, head, pair)` unit writes disjoint memory.

pub mod cpu;
pub mod rotary_embedding;

pub use cpu::rope::{
    CosSinCache, FusedQkvLayout, LaunchPlan, RotaryScalar, StridedRowsMut, head_offset,
    positions_from_shape, rotate_fused_qkv_in_place, rotate_fused_qkv_in_place_with,
    rotate_in_place, rotate_in_place_with,
};
pub use ropekit_common::{ParallelConfig, Result, RotaryConfig, RotaryError, RotaryStyle};
pub use rotary_embedding::RotaryEmbedding;
