//! Entry-boundary validation and launch resolution.
//!
//! Everything the hot loop relies on is checked here, once per call. A plan
//! only exists for inputs whose every addressed index is in bounds.

use ropekit_common::{ParallelConfig, Result, RotaryError, RotaryStyle, TensorRole};

use super::layout::{CosSinCache, FusedQkvLayout, RowGeometry};

/// Resolved shape and work distribution of one rotary call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub style: RotaryStyle,
    pub num_tokens: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub rot_dim: usize,
    /// `rot_dim / 2`.
    pub embed_dim: usize,
    /// Token stride of the query rows; equals the row width for a single token.
    pub query_stride: usize,
    /// Token stride of the key rows; equals the row width for a single token.
    pub key_stride: usize,
    /// Elements of the query buffer the call touches.
    pub query_span: usize,
    /// Elements of the key buffer the call touches.
    pub key_span: usize,
    /// Parallel lanes one token's work would be spread over on a device.
    pub lanes_per_token: usize,
    /// Rotated pairs across all tokens, query and key.
    pub total_pairs: usize,
    pub min_tokens_per_task: usize,
    pub serial: bool,
}

/// One validated operand: its rows, head count and addressed span.
struct Operand {
    rows: RowGeometry,
    heads: usize,
    span: usize,
}

impl LaunchPlan {
    /// Validate separate query and key buffers and resolve the launch.
    pub fn resolve<T>(
        positions: &[i64],
        query: RowGeometry,
        key: RowGeometry,
        head_size: usize,
        cache: &CosSinCache<'_, T>,
        style: RotaryStyle,
        parallel: &ParallelConfig,
    ) -> Result<Self> {
        check_head(head_size, cache.rot_dim())?;
        let query = check_operand(TensorRole::Query, query.with_effective_stride(), head_size)?;
        let key = check_operand(TensorRole::Key, key.with_effective_stride(), head_size)?;
        if query.rows.num_tokens != key.rows.num_tokens {
            return Err(RotaryError::TokenCountMismatch {
                query: query.rows.num_tokens,
                key: key.rows.num_tokens,
            });
        }
        check_positions(positions, query.rows.num_tokens, cache.max_position())?;

        Self::build(style, &query, &key, head_size, cache.rot_dim(), parallel)
    }

    /// Validate a fused QKV buffer and resolve the launch.
    ///
    /// `qkv` describes the whole buffer; the sections come from `layout`.
    pub fn resolve_fused<T>(
        positions: &[i64],
        qkv: RowGeometry,
        layout: &FusedQkvLayout,
        head_size: usize,
        cache: &CosSinCache<'_, T>,
        style: RotaryStyle,
        parallel: &ParallelConfig,
    ) -> Result<Self> {
        let qkv = qkv.with_effective_stride();
        check_head(head_size, cache.rot_dim())?;
        check_rank(TensorRole::FusedQkv, &qkv)?;
        if layout.overlaps() {
            return Err(RotaryError::OverlappingSections {
                q_start: layout.query.start,
                q_end: layout.query.end,
                k_start: layout.key.start,
                k_end: layout.key.end,
            });
        }
        if layout.extent() > qkv.width {
            return Err(RotaryError::invalid_shape(
                TensorRole::FusedQkv,
                &[qkv.num_tokens, qkv.width],
                format!("sections end at {} past the row width", layout.extent()),
            ));
        }
        let span = check_extent(TensorRole::FusedQkv, &qkv)?;

        let section = |range: &std::ops::Range<usize>| RowGeometry {
            rank: 2,
            num_tokens: qkv.num_tokens,
            width: range.len(),
            token_stride: qkv.token_stride,
            len: qkv.len.saturating_sub(range.start),
        };
        let query = check_operand(TensorRole::Query, section(&layout.query), head_size)?;
        let key = check_operand(TensorRole::Key, section(&layout.key), head_size)?;
        check_positions(positions, qkv.num_tokens, cache.max_position())?;

        let mut plan = Self::build(style, &query, &key, head_size, cache.rot_dim(), parallel)?;
        plan.query_span = span;
        plan.key_span = span;
        Ok(plan)
    }

    fn build(
        style: RotaryStyle,
        query: &Operand,
        key: &Operand,
        head_size: usize,
        rot_dim: usize,
        parallel: &ParallelConfig,
    ) -> Result<Self> {
        let num_tokens = query.rows.num_tokens;
        let embed_dim = rot_dim / 2;
        let total_pairs = (query.heads + key.heads)
            .checked_mul(embed_dim)
            .and_then(|per_token| per_token.checked_mul(num_tokens))
            .ok_or_else(|| {
                RotaryError::invalid_shape(
                    TensorRole::Query,
                    &[num_tokens, query.rows.width],
                    "rotated pair count overflows usize",
                )
            })?;
        let lanes_per_token = query
            .heads
            .max(key.heads)
            .saturating_mul(embed_dim)
            .min(parallel.max_lanes_per_token)
            .max(1);
        Ok(Self {
            style,
            num_tokens,
            num_heads: query.heads,
            num_kv_heads: key.heads,
            head_size,
            rot_dim,
            embed_dim,
            query_stride: query.rows.token_stride,
            key_stride: key.rows.token_stride,
            query_span: query.span,
            key_span: key.span,
            lanes_per_token,
            total_pairs,
            min_tokens_per_task: parallel.min_tokens_per_task.max(1),
            serial: parallel.runs_serial(total_pairs),
        })
    }
}

fn check_head(head_size: usize, rot_dim: usize) -> Result<()> {
    if head_size == 0 {
        return Err(RotaryError::ZeroHeadSize);
    }
    if rot_dim > head_size {
        return Err(RotaryError::RotaryDimExceedsHead { rot_dim, head_size });
    }
    Ok(())
}

fn check_rank(role: TensorRole, rows: &RowGeometry) -> Result<()> {
    if rows.rank < 2 {
        return Err(RotaryError::InvalidShape {
            role,
            shape: vec![rows.width; rows.rank],
            reason: "expected [num_tokens, width] or [batch, seq_len, width]".into(),
        });
    }
    if rows.width == 0 {
        return Err(RotaryError::InvalidShape {
            role,
            shape: vec![rows.num_tokens, rows.width],
            reason: "row width must be non-zero".into(),
        });
    }
    Ok(())
}

/// Check that the rows fit in the buffer, returning the addressed span.
///
/// Expects a geometry from [`RowGeometry::with_effective_stride`], so the
/// stride is only checked when there is more than one token.
fn check_extent(role: TensorRole, rows: &RowGeometry) -> Result<usize> {
    if rows.token_stride < rows.width {
        return Err(RotaryError::StrideTooSmall {
            role,
            stride: rows.token_stride,
            width: rows.width,
        });
    }
    let Some(required) = rows.required_len() else {
        return Err(RotaryError::invalid_shape(
            role,
            &[rows.num_tokens, rows.width],
            format!("token stride {} overflows the addressable range", rows.token_stride),
        ));
    };
    if rows.len < required {
        return Err(RotaryError::BufferTooShort { role, len: rows.len, required });
    }
    Ok(required)
}

fn check_operand(role: TensorRole, rows: RowGeometry, head_size: usize) -> Result<Operand> {
    check_rank(role, &rows)?;
    if !rows.width.is_multiple_of(head_size) {
        return Err(RotaryError::WidthNotMultipleOfHead { role, width: rows.width, head_size });
    }
    let span = check_extent(role, &rows)?;
    Ok(Operand { rows, heads: rows.width / head_size, span })
}

fn check_positions(positions: &[i64], num_tokens: usize, max_position: usize) -> Result<()> {
    if positions.len() != num_tokens {
        return Err(RotaryError::PositionCountMismatch {
            expected: num_tokens,
            got: positions.len(),
        });
    }
    let out_of_range = positions
        .iter()
        .enumerate()
        .find(|&(_, &p)| usize::try_from(p).map_or(true, |p| p >= max_position));
    if let Some((token, &position)) = out_of_range {
        return Err(RotaryError::PositionOutOfRange { token, position, max_position });
    }
    Ok(())
}
