//! Buffer views and index resolution.
//!
//! Buffers are addressed as "base + token * stride + intra-token offset"
//! rather than through multi-dimensional indexing, so a view can sit inside
//! a larger fused tensor.

use std::ops::Range;

use ropekit_common::{Result, RotaryError, TensorRole};

/// Flat offset of the first element of head `head_idx` of token `token_idx`.
#[inline(always)]
#[must_use]
pub const fn head_offset(
    token_idx: usize,
    token_stride: usize,
    head_idx: usize,
    head_size: usize,
) -> usize {
    token_idx * token_stride + head_idx * head_size
}

/// Shape metadata of a row-strided buffer, detached from its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowGeometry {
    /// Rank of the logical shape the view was built from.
    pub rank: usize,
    pub num_tokens: usize,
    /// Size of the last axis.
    pub width: usize,
    /// Distance between consecutive tokens, in elements.
    pub token_stride: usize,
    /// Number of elements in the backing slice.
    pub len: usize,
}

impl RowGeometry {
    /// Elements addressed by the view: the final row ends at `width`.
    ///
    /// `None` when the extent does not fit in `usize`.
    #[must_use]
    pub fn required_len(&self) -> Option<usize> {
        match self.num_tokens {
            0 => Some(0),
            n => (n - 1).checked_mul(self.token_stride)?.checked_add(self.width),
        }
    }

    /// The same geometry with the stride replaced by `width` when it is never
    /// stepped over (at most one token).
    #[must_use]
    pub fn with_effective_stride(self) -> Self {
        if self.num_tokens <= 1 { Self { token_stride: self.width, ..self } } else { self }
    }
}

/// Mutable view of `[.., num_tokens, width]` rows spaced `token_stride` apart.
#[derive(Debug)]
pub struct StridedRowsMut<'a, T> {
    data: &'a mut [T],
    rank: usize,
    num_tokens: usize,
    width: usize,
    token_stride: usize,
}

impl<'a, T> StridedRowsMut<'a, T> {
    /// Densely packed `[num_tokens, width]` rows.
    pub fn packed(data: &'a mut [T], num_tokens: usize, width: usize) -> Self {
        Self { data, rank: 2, num_tokens, width, token_stride: width }
    }

    /// View built from a logical shape such as `[num_tokens, width]` or
    /// `[batch, seq_len, width]`. Leading axes collapse into tokens.
    pub fn from_shape(data: &'a mut [T], shape: &[usize]) -> Self {
        let (num_tokens, width) = match shape.split_last() {
            Some((&width, leading)) => (leading.iter().product(), width),
            None => (0, 0),
        };
        Self { data, rank: shape.len(), num_tokens, width, token_stride: width }
    }

    /// Override the distance between consecutive tokens.
    #[must_use]
    pub fn with_token_stride(mut self, token_stride: usize) -> Self {
        self.token_stride = token_stride;
        self
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn token_stride(&self) -> usize {
        self.token_stride
    }

    pub fn geometry(&self) -> RowGeometry {
        RowGeometry {
            rank: self.rank,
            num_tokens: self.num_tokens,
            width: self.width,
            token_stride: self.token_stride,
            len: self.data.len(),
        }
    }

    pub(crate) fn into_data(self) -> &'a mut [T] {
        self.data
    }
}

/// Flatten positions shaped `[num_tokens]` or `[batch, seq_len]` into one
/// index per token, row-major.
pub fn positions_from_shape<'p>(positions: &'p [i64], shape: &[usize]) -> Result<&'p [i64]> {
    if !matches!(shape.len(), 1 | 2) {
        return Err(RotaryError::invalid_shape(
            TensorRole::Positions,
            shape,
            "expected [num_tokens] or [batch, seq_len]",
        ));
    }
    let expected: usize = shape.iter().product();
    if positions.len() != expected {
        return Err(RotaryError::invalid_shape(
            TensorRole::Positions,
            shape,
            format!("shape covers {expected} tokens but {} positions were given", positions.len()),
        ));
    }
    Ok(positions)
}

/// Read-only `[max_position, rot_dim]` table; each row holds `rot_dim / 2`
/// cosines followed by `rot_dim / 2` sines.
#[derive(Debug, Clone, Copy)]
pub struct CosSinCache<'a, T> {
    data: &'a [T],
    max_position: usize,
    rot_dim: usize,
}

impl<'a, T> CosSinCache<'a, T> {
    /// Wrap a flat table whose rows are `rot_dim` wide.
    pub fn new(data: &'a [T], rot_dim: usize) -> Result<Self> {
        check_rot_dim(rot_dim)?;
        if !data.len().is_multiple_of(rot_dim) {
            return Err(RotaryError::CacheSizeMismatch {
                len: data.len(),
                max_position: data.len() / rot_dim,
                rot_dim,
            });
        }
        Ok(Self { data, max_position: data.len() / rot_dim, rot_dim })
    }

    /// Wrap a table with an explicit `[max_position, rot_dim]` shape.
    pub fn from_shape(data: &'a [T], shape: &[usize]) -> Result<Self> {
        let &[max_position, rot_dim] = shape else {
            return Err(RotaryError::invalid_shape(
                TensorRole::CosSinCache,
                shape,
                "expected [max_position, rot_dim]",
            ));
        };
        check_rot_dim(rot_dim)?;
        if data.len() != max_position * rot_dim {
            return Err(RotaryError::CacheSizeMismatch { len: data.len(), max_position, rot_dim });
        }
        Ok(Self { data, max_position, rot_dim })
    }

    pub fn max_position(&self) -> usize {
        self.max_position
    }

    pub fn rot_dim(&self) -> usize {
        self.rot_dim
    }

    /// Half of `rot_dim`: the number of rotated pairs per head.
    pub fn embed_dim(&self) -> usize {
        self.rot_dim / 2
    }

    /// Cosine and sine halves of the row for `position`.
    #[inline]
    pub fn row(&self, position: usize) -> (&'a [T], &'a [T]) {
        let data: &'a [T] = self.data;
        let start = position * self.rot_dim;
        data[start..start + self.rot_dim].split_at(self.rot_dim / 2)
    }
}

fn check_rot_dim(rot_dim: usize) -> Result<()> {
    if rot_dim == 0 {
        return Err(RotaryError::ZeroRotaryDim);
    }
    if !rot_dim.is_multiple_of(2) {
        return Err(RotaryError::OddRotaryDim { rot_dim });
    }
    Ok(())
}

/// Where the query and key sections sit inside each row of a fused QKV buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedQkvLayout {
    pub query: Range<usize>,
    pub key: Range<usize>,
}

impl FusedQkvLayout {
    pub fn new(query: Range<usize>, key: Range<usize>) -> Self {
        Self { query, key }
    }

    /// The usual packed `[q | k | v]` row with `num_heads` query heads and
    /// `num_kv_heads` key and value heads.
    pub fn packed(num_heads: usize, num_kv_heads: usize, head_size: usize) -> Self {
        let q_width = num_heads * head_size;
        let kv_width = num_kv_heads * head_size;
        Self { query: 0..q_width, key: q_width..q_width + kv_width }
    }

    /// Row width of the packed layout including the value section.
    pub fn packed_row_width(num_heads: usize, num_kv_heads: usize, head_size: usize) -> usize {
        (num_heads + 2 * num_kv_heads) * head_size
    }

    /// End of the furthest section within a row.
    pub fn extent(&self) -> usize {
        self.query.end.max(self.key.end)
    }

    pub fn overlaps(&self) -> bool {
        self.query.start < self.key.end && self.key.start < self.query.end
    }

    /// Split one row into its query and key sections.
    ///
    /// The layout must already be validated: sections are non-empty,
    /// disjoint, and end within `row`.
    pub(crate) fn split_row<'r, T>(&self, row: &'r mut [T]) -> (&'r mut [T], &'r mut [T]) {
        if self.query.start < self.key.start {
            let (head, tail) = row.split_at_mut(self.key.start);
            (&mut head[self.query.clone()], &mut tail[..self.key.len()])
        } else {
            let (head, tail) = row.split_at_mut(self.query.start);
            (&mut tail[..self.query.len()], &mut head[self.key.clone()])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_offset_honours_stride() {
        assert_eq!(head_offset(0, 12, 0, 4), 0);
        assert_eq!(head_offset(0, 12, 2, 4), 8);
        // Stride wider than num_heads * head_size (fused buffer).
        assert_eq!(head_offset(3, 20, 1, 4), 64);
    }

    #[test]
    fn from_shape_collapses_leading_axes() {
        let mut data = vec![0.0f32; 2 * 3 * 8];
        let view = StridedRowsMut::from_shape(&mut data, &[2, 3, 8]);
        let g = view.geometry();
        assert_eq!((g.rank, g.num_tokens, g.width, g.token_stride), (3, 6, 8, 8));
        assert_eq!(g.required_len(), Some(48));
    }

    #[test]
    fn required_len_excludes_trailing_padding() {
        let mut data = vec![0.0f32; 64];
        let view = StridedRowsMut::packed(&mut data, 3, 8).with_token_stride(24);
        assert_eq!(view.geometry().required_len(), Some(2 * 24 + 8));
        let empty = RowGeometry { rank: 2, num_tokens: 0, width: 8, token_stride: 24, len: 0 };
        assert_eq!(empty.required_len(), Some(0));
    }

    #[test]
    fn required_len_reports_overflow() {
        let huge = RowGeometry {
            rank: 2,
            num_tokens: 3,
            width: 4,
            token_stride: usize::MAX / 2 + 1,
            len: 12,
        };
        assert_eq!(huge.required_len(), None);
        // A single token never steps over its stride.
        assert_eq!(RowGeometry { num_tokens: 1, ..huge }.required_len(), Some(4));
    }

    #[test]
    fn effective_stride_ignores_single_token_strides() {
        let g = RowGeometry { rank: 2, num_tokens: 1, width: 8, token_stride: 0, len: 8 };
        assert_eq!(g.with_effective_stride().token_stride, 8);
        let g = RowGeometry { num_tokens: 2, token_stride: 3, len: 11, ..g };
        assert_eq!(g.with_effective_stride(), g);
    }

    #[test]
    fn empty_shape_has_no_tokens() {
        let mut data: Vec<f32> = vec![];
        let g = StridedRowsMut::from_shape(&mut data, &[]).geometry();
        assert_eq!((g.rank, g.num_tokens, g.width), (0, 0, 0));
    }

    #[test]
    fn positions_accept_flat_and_batched_shapes() {
        let positions = [0i64, 1, 2, 5, 6, 7];
        assert_eq!(positions_from_shape(&positions, &[6]).unwrap(), &positions);
        assert_eq!(positions_from_shape(&positions, &[2, 3]).unwrap().len(), 6);
        assert!(matches!(
            positions_from_shape(&positions, &[2, 2]),
            Err(RotaryError::InvalidShape { role: TensorRole::Positions, .. })
        ));
        assert!(matches!(
            positions_from_shape(&positions, &[1, 2, 3]),
            Err(RotaryError::InvalidShape { role: TensorRole::Positions, .. })
        ));
    }

    #[test]
    fn cache_rows_split_into_cos_and_sin() {
        let table = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let cache = CosSinCache::new(&table, 4).unwrap();
        assert_eq!(cache.max_position(), 2);
        assert_eq!(cache.embed_dim(), 2);
        let (cos, sin) = cache.row(1);
        assert_eq!(cos, &[5.0, 6.0]);
        assert_eq!(sin, &[7.0, 8.0]);
    }

    #[test]
    fn cache_rejects_bad_dimensions() {
        let table = [0.0f32; 6];
        assert_eq!(CosSinCache::new(&table, 0).unwrap_err(), RotaryError::ZeroRotaryDim);
        assert_eq!(
            CosSinCache::new(&table, 3).unwrap_err(),
            RotaryError::OddRotaryDim { rot_dim: 3 }
        );
        assert!(matches!(
            CosSinCache::new(&table, 4),
            Err(RotaryError::CacheSizeMismatch { len: 6, rot_dim: 4, .. })
        ));
        assert!(matches!(
            CosSinCache::from_shape(&table, &[6]),
            Err(RotaryError::InvalidShape { role: TensorRole::CosSinCache, .. })
        ));
        assert!(matches!(
            CosSinCache::from_shape(&table, &[2, 2]),
            Err(RotaryError::CacheSizeMismatch { len: 6, max_position: 2, rot_dim: 2 })
        ));
        assert!(CosSinCache::from_shape(&table, &[3, 2]).is_ok());
    }

    #[test]
    fn packed_layout_places_key_after_query() {
        let layout = FusedQkvLayout::packed(4, 2, 8);
        assert_eq!(layout.query, 0..32);
        assert_eq!(layout.key, 32..48);
        assert_eq!(FusedQkvLayout::packed_row_width(4, 2, 8), 64);
        assert_eq!(layout.extent(), 48);
        assert!(!layout.overlaps());
        assert!(FusedQkvLayout::new(0..8, 4..12).overlaps());
    }

    #[test]
    fn split_row_handles_either_order() {
        let mut row: Vec<u32> = (0..10).collect();
        let layout = FusedQkvLayout::new(6..10, 0..4);
        let (q, k) = layout.split_row(&mut row);
        assert_eq!(q, &[6, 7, 8, 9]);
        assert_eq!(k, &[0, 1, 2, 3]);

        let layout = FusedQkvLayout::new(0..2, 2..6);
        let (q, k) = layout.split_row(&mut row);
        assert_eq!(q, &[0, 1]);
        assert_eq!(k, &[2, 3, 4, 5]);
    }
}
