//! In-place rotary position embedding (RoPE) for query and key projections.
//!
//! For every token `t` with position `p = positions[t]`, the cache row
//! `cache[p]` supplies `rot_dim / 2` cosines and `rot_dim / 2` sines. Each
//! query head and each key head then has its first `rot_dim` elements rotated
//! pairwise:
//!
//!   `x' = x * cos - y * sin`
//!   `y' = y * cos + x * sin`
//!
//! The pairing of `(x, y)` depends on [`RotaryStyle`]: contiguous halves for
//! GPT-NeoX, adjacent elements for GPT-J. Elements past `rot_dim` in a head
//! pass through untouched.
//!
//! All shape, stride and position checks run once in [`LaunchPlan`]; a call
//! that returns an error has not written anything.

mod dispatch;
mod layout;
mod pairing;
mod plan;
mod scalar;

pub use layout::{
    CosSinCache, FusedQkvLayout, RowGeometry, StridedRowsMut, head_offset, positions_from_shape,
};
pub use pairing::{GptJPairing, NeoxPairing, Pairing, apply_rotary_pair};
pub use plan::LaunchPlan;
pub use scalar::RotaryScalar;

use ropekit_common::{ParallelConfig, Result, RotaryStyle};

/// Rotate `query` and `key` in place using the process-wide [`ParallelConfig`].
///
/// * `positions`: one cache row index per token (`[num_tokens]` or a
///   flattened `[batch, seq_len]`)
/// * `query`: `[.., num_tokens, num_heads * head_size]` with its own token stride
/// * `key`: `[.., num_tokens, num_kv_heads * head_size]` with its own token stride
/// * `head_size`: per-head width; the rotated span is `cache.rot_dim()`
pub fn rotate_in_place<T: RotaryScalar>(
    positions: &[i64],
    query: StridedRowsMut<'_, T>,
    key: StridedRowsMut<'_, T>,
    head_size: usize,
    cache: &CosSinCache<'_, T>,
    style: RotaryStyle,
) -> Result<()> {
    rotate_in_place_with(positions, query, key, head_size, cache, style, ParallelConfig::global())
}

/// [`rotate_in_place`] with an explicit work distribution.
pub fn rotate_in_place_with<T: RotaryScalar>(
    positions: &[i64],
    query: StridedRowsMut<'_, T>,
    key: StridedRowsMut<'_, T>,
    head_size: usize,
    cache: &CosSinCache<'_, T>,
    style: RotaryStyle,
    parallel: &ParallelConfig,
) -> Result<()> {
    let plan = LaunchPlan::resolve(
        positions,
        query.geometry(),
        key.geometry(),
        head_size,
        cache,
        style,
        parallel,
    )?;
    log_launch("rotary", &plan);

    let (query, key) = (query.into_data(), key.into_data());
    match style {
        RotaryStyle::Neox => {
            dispatch::run_separate::<T, NeoxPairing>(positions, query, key, cache, &plan);
        }
        RotaryStyle::GptJ => {
            dispatch::run_separate::<T, GptJPairing>(positions, query, key, cache, &plan);
        }
    }
    Ok(())
}

/// Rotate the query and key sections of a fused QKV buffer in place, using
/// the process-wide [`ParallelConfig`].
///
/// `qkv` rows hold the query at `layout.query` and the key at `layout.key`;
/// anything else in the row (the value section, padding) is left alone.
pub fn rotate_fused_qkv_in_place<T: RotaryScalar>(
    positions: &[i64],
    qkv: StridedRowsMut<'_, T>,
    layout: &FusedQkvLayout,
    head_size: usize,
    cache: &CosSinCache<'_, T>,
    style: RotaryStyle,
) -> Result<()> {
    rotate_fused_qkv_in_place_with(
        positions,
        qkv,
        layout,
        head_size,
        cache,
        style,
        ParallelConfig::global(),
    )
}

/// [`rotate_fused_qkv_in_place`] with an explicit work distribution.
pub fn rotate_fused_qkv_in_place_with<T: RotaryScalar>(
    positions: &[i64],
    qkv: StridedRowsMut<'_, T>,
    layout: &FusedQkvLayout,
    head_size: usize,
    cache: &CosSinCache<'_, T>,
    style: RotaryStyle,
    parallel: &ParallelConfig,
) -> Result<()> {
    let plan = LaunchPlan::resolve_fused(
        positions,
        qkv.geometry(),
        layout,
        head_size,
        cache,
        style,
        parallel,
    )?;
    log_launch("fused rotary", &plan);

    let qkv = qkv.into_data();
    match style {
        RotaryStyle::Neox => {
            dispatch::run_fused::<T, NeoxPairing>(positions, qkv, layout, cache, &plan);
        }
        RotaryStyle::GptJ => {
            dispatch::run_fused::<T, GptJPairing>(positions, qkv, layout, cache, &plan);
        }
    }
    Ok(())
}

fn log_launch(op: &str, plan: &LaunchPlan) {
    log::debug!(
        "{op} dispatch: style={}, tokens={}, heads={}, kv_heads={}, head_size={}, rot_dim={}, {}",
        plan.style,
        plan.num_tokens,
        plan.num_heads,
        plan.num_kv_heads,
        plan.head_size,
        plan.rot_dim,
        if plan.serial { "serial" } else { "parallel" },
    );
    log::trace!(
        "{op} launch: lanes_per_token={}, total_pairs={}, min_tokens_per_task={}",
        plan.lanes_per_token,
        plan.total_pairs,
        plan.min_tokens_per_task,
    );
}
