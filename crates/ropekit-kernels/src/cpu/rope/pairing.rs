//! Pairing policies and the per-pair rotation.
//!
//! Each style is a zero-sized type so the dispatch compiles one specialized
//! loop per style; nothing in the hot path branches on the style.

use ropekit_common::RotaryStyle;

use super::scalar::RotaryScalar;

/// Maps a rotation offset within `[0, embed_dim)` onto the two element
/// indices it rotates, relative to the start of a head.
pub trait Pairing: Send + Sync + 'static {
    const STYLE: RotaryStyle;

    /// `(x_index, y_index)` for `rot_offset`.
    fn pair(rot_offset: usize, embed_dim: usize) -> (usize, usize);

    /// Index into the cos and sin halves of a cache row.
    #[inline(always)]
    fn table_index(rot_offset: usize) -> usize {
        rot_offset
    }
}

/// GPT-NeoX style: contiguous halves.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeoxPairing;

impl Pairing for NeoxPairing {
    const STYLE: RotaryStyle = RotaryStyle::Neox;

    #[inline(always)]
    fn pair(rot_offset: usize, embed_dim: usize) -> (usize, usize) {
        (rot_offset, embed_dim + rot_offset)
    }
}

/// GPT-J style: interleaved adjacent pairs.
///
/// The table index is `x_index / 2`, which is `rot_offset` again.
#[derive(Debug, Clone, Copy, Default)]
pub struct GptJPairing;

impl Pairing for GptJPairing {
    const STYLE: RotaryStyle = RotaryStyle::GptJ;

    #[inline(always)]
    fn pair(rot_offset: usize, _embed_dim: usize) -> (usize, usize) {
        (2 * rot_offset, 2 * rot_offset + 1)
    }
}

/// Rotate one pair of the head starting at `head_base` in `buf`, in place.
///
/// `cos` and `sin` are the two halves of the cache row selected for the
/// token. Indices are guaranteed in bounds by entry validation.
#[inline(always)]
pub fn apply_rotary_pair<T: RotaryScalar, P: Pairing>(
    buf: &mut [T],
    head_base: usize,
    cos: &[T],
    sin: &[T],
    rot_offset: usize,
    embed_dim: usize,
) {
    let (x_index, y_index) = P::pair(rot_offset, embed_dim);
    let table = P::table_index(rot_offset);
    let (x_index, y_index) = (head_base + x_index, head_base + y_index);
    debug_assert!(y_index < buf.len());

    let (x, y) = T::rotate(buf[x_index], buf[y_index], cos[table], sin[table]);
    buf[x_index] = x;
    buf[y_index] = y;
}
