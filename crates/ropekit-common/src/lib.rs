//! Common types for the ropekit rotary position embedding kernels.
//!
//! This crate owns the pieces shared by every kernel backend: the error
//! taxonomy raised at the entry boundary, the pairing style enum, and the
//! configuration layer (serde types plus environment overrides).

pub mod config;
pub mod error;
pub mod style;

pub use config::{
    DEFAULT_MAX_LANES_PER_TOKEN, DEFAULT_MIN_TOKENS_PER_TASK, DEFAULT_SERIAL_THRESHOLD,
    ParallelConfig, RotaryConfig,
};
pub use error::{Result, RotaryError, TensorRole};
pub use style::RotaryStyle;
