//! Per-token rotation and the parallel driver.

use rayon::prelude::*;

use super::layout::{CosSinCache, FusedQkvLayout, head_offset};
use super::pairing::{Pairing, apply_rotary_pair};
use super::plan::LaunchPlan;
use super::scalar::RotaryScalar;

/// Rotate every `(head, rot_offset)` pair of one token, query heads first,
/// then key heads.
///
/// `token_idx` is the token's row within `query`/`key`: the absolute token
/// index when whole buffers are passed, `0` when a single row is.
#[inline]
pub(crate) fn rotate_token<T: RotaryScalar, P: Pairing>(
    query: &mut [T],
    key: &mut [T],
    token_idx: usize,
    cos: &[T],
    sin: &[T],
    plan: &LaunchPlan,
) {
    let embed_dim = plan.embed_dim;

    for i in 0..plan.num_heads * embed_dim {
        let head_idx = i / embed_dim;
        let rot_offset = i % embed_dim;
        let base = head_offset(token_idx, plan.query_stride, head_idx, plan.head_size);
        apply_rotary_pair::<T, P>(query, base, cos, sin, rot_offset, embed_dim);
    }

    for i in 0..plan.num_kv_heads * embed_dim {
        let head_idx = i / embed_dim;
        let rot_offset = i % embed_dim;
        let base = head_offset(token_idx, plan.key_stride, head_idx, plan.head_size);
        apply_rotary_pair::<T, P>(key, base, cos, sin, rot_offset, embed_dim);
    }
}

#[allow(clippy::cast_sign_loss)]
#[inline]
fn cache_row<'c, T>(cache: &CosSinCache<'c, T>, position: i64) -> (&'c [T], &'c [T]) {
    // Non-negative and below max_position: checked by the plan.
    cache.row(position as usize)
}

/// Rotate separate query and key buffers.
pub(crate) fn run_separate<T: RotaryScalar, P: Pairing>(
    positions: &[i64],
    query: &mut [T],
    key: &mut [T],
    cache: &CosSinCache<'_, T>,
    plan: &LaunchPlan,
) {
    if plan.num_tokens == 0 {
        return;
    }
    let query = &mut query[..plan.query_span];
    let key = &mut key[..plan.key_span];

    if plan.serial {
        for (token_idx, &position) in positions.iter().enumerate() {
            let (cos, sin) = cache_row(cache, position);
            rotate_token::<T, P>(query, key, token_idx, cos, sin, plan);
        }
        return;
    }

    query
        .par_chunks_mut(plan.query_stride)
        .zip(key.par_chunks_mut(plan.key_stride))
        .zip(positions.par_iter())
        .with_min_len(plan.min_tokens_per_task)
        .for_each(|((q_row, k_row), &position)| {
            let (cos, sin) = cache_row(cache, position);
            rotate_token::<T, P>(q_row, k_row, 0, cos, sin, plan);
        });
}

/// Rotate the query and key sections of a fused QKV buffer.
pub(crate) fn run_fused<T: RotaryScalar, P: Pairing>(
    positions: &[i64],
    qkv: &mut [T],
    layout: &FusedQkvLayout,
    cache: &CosSinCache<'_, T>,
    plan: &LaunchPlan,
) {
    if plan.num_tokens == 0 {
        return;
    }
    let qkv = &mut qkv[..plan.query_span];
    let rotate_row = |row: &mut [T], position: i64| {
        let (cos, sin) = cache_row(cache, position);
        let (q_row, k_row) = layout.split_row(row);
        rotate_token::<T, P>(q_row, k_row, 0, cos, sin, plan);
    };

    if plan.serial {
        qkv.chunks_mut(plan.query_stride)
            .zip(positions)
            .for_each(|(row, &position)| rotate_row(row, position));
        return;
    }

    qkv.par_chunks_mut(plan.query_stride)
        .zip(positions.par_iter())
        .with_min_len(plan.min_tokens_per_task)
        .for_each(|(row, &position)| rotate_row(row, position));
}
