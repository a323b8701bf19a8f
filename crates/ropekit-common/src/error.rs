//! Error types for rotary embedding calls.
//!
//! Every variant describes a caller precondition. They are raised once at the
//! entry boundary, before any buffer is written; the per-element rotation
//! loop has no error path.

use std::fmt;

use thiserror::Error;

/// Which operand of a rotary call an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    Query,
    Key,
    Positions,
    CosSinCache,
    FusedQkv,
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Query => "query",
            Self::Key => "key",
            Self::Positions => "positions",
            Self::CosSinCache => "cos/sin cache",
            Self::FusedQkv => "fused qkv",
        };
        f.write_str(name)
    }
}

/// Precondition violations detected before a rotary call mutates anything.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotaryError {
    #[error("rot_dim must be greater than zero")]
    ZeroRotaryDim,

    #[error("rot_dim must be even, got {rot_dim}")]
    OddRotaryDim { rot_dim: usize },

    #[error("head_size must be greater than zero")]
    ZeroHeadSize,

    #[error("rot_dim {rot_dim} exceeds head_size {head_size}")]
    RotaryDimExceedsHead { rot_dim: usize, head_size: usize },

    #[error("{role} shape {shape:?} is invalid: {reason}")]
    InvalidShape { role: TensorRole, shape: Vec<usize>, reason: String },

    #[error("{role} row width {width} is not a multiple of head_size {head_size}")]
    WidthNotMultipleOfHead { role: TensorRole, width: usize, head_size: usize },

    #[error("{role} token stride {stride} is smaller than its row extent {width}")]
    StrideTooSmall { role: TensorRole, stride: usize, width: usize },

    #[error("{role} buffer holds {len} elements but {required} are addressed")]
    BufferTooShort { role: TensorRole, len: usize, required: usize },

    #[error(
        "cos/sin cache holds {len} elements, expected {max_position} rows of {rot_dim}"
    )]
    CacheSizeMismatch { len: usize, max_position: usize, rot_dim: usize },

    #[error("positions hold {got} entries but the query has {expected} tokens")]
    PositionCountMismatch { expected: usize, got: usize },

    #[error("query has {query} tokens but key has {key}")]
    TokenCountMismatch { query: usize, key: usize },

    #[error(
        "position {position} at token {token} is outside the cache range [0, {max_position})"
    )]
    PositionOutOfRange { token: usize, position: i64, max_position: usize },

    #[error(
        "fused sections overlap: query [{q_start}, {q_end}) and key [{k_start}, {k_end})"
    )]
    OverlappingSections { q_start: usize, q_end: usize, k_start: usize, k_end: usize },

    #[error("unknown rotary style {0:?} (expected \"neox\" or \"gptj\")")]
    UnknownStyle(String),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Config { var: &'static str, value: String, reason: String },
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, RotaryError>;

impl RotaryError {
    /// Shorthand for [`RotaryError::InvalidShape`].
    pub fn invalid_shape(role: TensorRole, shape: &[usize], reason: impl Into<String>) -> Self {
        Self::InvalidShape { role, shape: shape.to_vec(), reason: reason.into() }
    }

    /// `true` for errors caused by the position sequence rather than shapes.
    pub fn is_position_error(&self) -> bool {
        matches!(self, Self::PositionOutOfRange { .. } | Self::PositionCountMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_operand() {
        let err = RotaryError::StrideTooSmall { role: TensorRole::Key, stride: 4, width: 8 };
        assert_eq!(err.to_string(), "key token stride 4 is smaller than its row extent 8");

        let err = RotaryError::BufferTooShort { role: TensorRole::Query, len: 3, required: 8 };
        assert!(err.to_string().starts_with("query buffer"));
    }

    #[test]
    fn position_errors_are_classified() {
        let err = RotaryError::PositionOutOfRange { token: 2, position: -1, max_position: 16 };
        assert!(err.is_position_error());
        assert!(err.to_string().contains("token 2"));
        assert!(!RotaryError::ZeroHeadSize.is_position_error());
    }

    #[test]
    fn invalid_shape_helper_copies_shape() {
        let err = RotaryError::invalid_shape(TensorRole::CosSinCache, &[4, 3], "odd");
        assert_eq!(
            err,
            RotaryError::InvalidShape {
                role: TensorRole::CosSinCache,
                shape: vec![4, 3],
                reason: "odd".into(),
            }
        );
    }
}
