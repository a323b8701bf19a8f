//! Attention-layer wrapper around the rotary kernel.
//!
//! Owns a precomputed cos/sin table plus the per-layer parameters, so model
//! code calls `forward(positions, query, key)` without re-plumbing them.

use ropekit_common::{ParallelConfig, Result, RotaryConfig, RotaryError, RotaryStyle, TensorRole};

use crate::cpu::rope::{
    CosSinCache, FusedQkvLayout, RotaryScalar, StridedRowsMut, rotate_fused_qkv_in_place_with,
    rotate_in_place_with,
};

/// Rotary position embedding for one attention layer.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding<T> {
    cos_sin_cache: Vec<T>,
    max_position: usize,
    rot_dim: usize,
    head_size: usize,
    style: RotaryStyle,
    parallel: ParallelConfig,
}

impl<T: RotaryScalar> RotaryEmbedding<T> {
    /// Build from a flat `[max_position, rot_dim]` table.
    pub fn new(cos_sin_cache: Vec<T>, rot_dim: usize, config: &RotaryConfig) -> Result<Self> {
        config.validate()?;
        let (max_position, rot_dim) = {
            let cache = CosSinCache::new(&cos_sin_cache, rot_dim)?;
            (cache.max_position(), cache.rot_dim())
        };
        if rot_dim > config.head_size {
            return Err(RotaryError::RotaryDimExceedsHead { rot_dim, head_size: config.head_size });
        }
        log::debug!(
            "rotary embedding: head_size={}, rot_dim={rot_dim}, max_position={max_position}, style={}",
            config.head_size,
            config.style,
        );
        Ok(Self {
            cos_sin_cache,
            max_position,
            rot_dim,
            head_size: config.head_size,
            style: config.style,
            parallel: config.parallel.clone(),
        })
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn rot_dim(&self) -> usize {
        self.rot_dim
    }

    pub fn max_position(&self) -> usize {
        self.max_position
    }

    pub fn style(&self) -> RotaryStyle {
        self.style
    }

    pub fn parallel(&self) -> &ParallelConfig {
        &self.parallel
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    fn cache(&self) -> Result<CosSinCache<'_, T>> {
        CosSinCache::from_shape(&self.cos_sin_cache, &[self.max_position, self.rot_dim])
    }

    /// Rotate strided query and key views in place.
    pub fn forward(
        &self,
        positions: &[i64],
        query: StridedRowsMut<'_, T>,
        key: StridedRowsMut<'_, T>,
    ) -> Result<()> {
        rotate_in_place_with(
            positions,
            query,
            key,
            self.head_size,
            &self.cache()?,
            self.style,
            &self.parallel,
        )
    }

    /// Rotate densely packed `[num_tokens, heads * head_size]` buffers, one
    /// row per entry of `positions`.
    pub fn forward_packed(&self, positions: &[i64], query: &mut [T], key: &mut [T]) -> Result<()> {
        let num_tokens = positions.len();
        if num_tokens == 0 {
            return match (query.is_empty(), key.is_empty()) {
                (true, true) => Ok(()),
                (false, _) => Err(no_positions(TensorRole::Query, query.len())),
                (_, false) => Err(no_positions(TensorRole::Key, key.len())),
            };
        }
        let query_width = packed_width(TensorRole::Query, query.len(), num_tokens)?;
        let key_width = packed_width(TensorRole::Key, key.len(), num_tokens)?;
        self.forward(
            positions,
            StridedRowsMut::packed(query, num_tokens, query_width),
            StridedRowsMut::packed(key, num_tokens, key_width),
        )
    }

    /// Rotate the query and key sections of a fused QKV buffer in place.
    pub fn forward_fused(
        &self,
        positions: &[i64],
        qkv: StridedRowsMut<'_, T>,
        layout: &FusedQkvLayout,
    ) -> Result<()> {
        rotate_fused_qkv_in_place_with(
            positions,
            qkv,
            layout,
            self.head_size,
            &self.cache()?,
            self.style,
            &self.parallel,
        )
    }
}

fn no_positions(role: TensorRole, len: usize) -> RotaryError {
    RotaryError::invalid_shape(role, &[len], "buffer holds data but no positions were given")
}

fn packed_width(role: TensorRole, len: usize, num_tokens: usize) -> Result<usize> {
    if !len.is_multiple_of(num_tokens) {
        return Err(RotaryError::invalid_shape(
            role,
            &[len],
            format!("{len} elements do not split into {num_tokens} token rows"),
        ));
    }
    Ok(len / num_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(head_size: usize, style: RotaryStyle) -> RotaryConfig {
        RotaryConfig::new(head_size, style).with_parallel(ParallelConfig::serial())
    }

    #[test]
    fn construction_validates_table() {
        assert!(matches!(
            RotaryEmbedding::new(vec![0.0f32; 6], 4, &config(8, RotaryStyle::Neox)),
            Err(RotaryError::CacheSizeMismatch { .. })
        ));
        assert!(matches!(
            RotaryEmbedding::new(vec![0.0f32; 16], 8, &config(4, RotaryStyle::Neox)),
            Err(RotaryError::RotaryDimExceedsHead { rot_dim: 8, head_size: 4 })
        ));
        assert_eq!(
            RotaryEmbedding::new(vec![0.0f32; 8], 4, &config(0, RotaryStyle::Neox)).unwrap_err(),
            RotaryError::ZeroHeadSize
        );

        let rope = RotaryEmbedding::new(vec![0.0f32; 16], 4, &config(8, RotaryStyle::GptJ)).unwrap();
        assert_eq!(rope.max_position(), 4);
        assert_eq!(rope.rot_dim(), 4);
        assert_eq!(rope.head_size(), 8);
        assert_eq!(rope.style(), RotaryStyle::GptJ);
        assert!(rope.parallel().force_serial);
    }

    #[test]
    fn forward_packed_derives_widths() {
        // Row 0: identity. Row 1: quarter turn.
        let table = vec![1.0f32, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        let rope = RotaryEmbedding::new(table, 4, &config(4, RotaryStyle::Neox)).unwrap();

        let mut q = vec![1.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0];
        let mut k = vec![1.0f32, 0.0, 0.0, 1.0];
        rope.forward_packed(&[1], &mut q, &mut k).unwrap();
        assert_eq!(q, vec![0.0, -1.0, 1.0, 0.0, 0.0, -1.0, 1.0, 0.0]);
        assert_eq!(k, vec![0.0, -1.0, 1.0, 0.0]);
    }

    #[test]
    fn forward_packed_rejects_ragged_rows() {
        let rope = RotaryEmbedding::new(vec![0.0f32; 8], 4, &config(4, RotaryStyle::Neox)).unwrap();
        let mut q = vec![0.0f32; 7];
        let mut k = vec![0.0f32; 8];
        assert!(matches!(
            rope.forward_packed(&[0, 1], &mut q, &mut k),
            Err(RotaryError::InvalidShape { role: TensorRole::Query, .. })
        ));
    }

    #[test]
    fn forward_packed_with_no_tokens_is_a_noop() {
        let rope = RotaryEmbedding::new(vec![0.0f32; 8], 4, &config(4, RotaryStyle::Neox)).unwrap();
        let mut q: Vec<f32> = vec![];
        let mut k: Vec<f32> = vec![];
        assert!(rope.forward_packed(&[], &mut q, &mut k).is_ok());

        let mut q = vec![0.0f32; 4];
        assert!(matches!(
            rope.forward_packed(&[], &mut q, &mut k),
            Err(RotaryError::InvalidShape { role: TensorRole::Query, .. })
        ));
    }
}
