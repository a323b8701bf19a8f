//! Element types the rotary kernel operates on.

use std::fmt::Debug;

use half::{bf16, f16};

/// A floating-point element stored in query, key and cos/sin buffers.
///
/// The provided [`RotaryScalar::rotate`] widens to `f32` and rounds once on
/// store; native float types override it.
pub trait RotaryScalar: Copy + Send + Sync + PartialEq + Debug + 'static {
    fn from_f32(v: f32) -> Self;

    fn to_f32(self) -> f32;

    /// Rotate the pair `(x, y)` by the angle whose cosine and sine are given:
    /// `(x * cos - y * sin, y * cos + x * sin)`.
    #[inline(always)]
    fn rotate(x: Self, y: Self, cos: Self, sin: Self) -> (Self, Self) {
        let (x2, y2) = f32::rotate(x.to_f32(), y.to_f32(), cos.to_f32(), sin.to_f32());
        (Self::from_f32(x2), Self::from_f32(y2))
    }
}

impl RotaryScalar for f32 {
    #[inline(always)]
    fn rotate(x: Self, y: Self, cos: Self, sin: Self) -> (Self, Self) {
        (x * cos - y * sin, y * cos + x * sin)
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl RotaryScalar for f64 {
    #[inline(always)]
    fn rotate(x: Self, y: Self, cos: Self, sin: Self) -> (Self, Self) {
        (x * cos - y * sin, y * cos + x * sin)
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        f64::from(v)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }
}

macro_rules! impl_half_scalar {
    ($ty:ty) => {
        impl RotaryScalar for $ty {
            #[inline]
            fn from_f32(v: f32) -> Self {
                <$ty>::from_f32(v)
            }

            #[inline]
            fn to_f32(self) -> f32 {
                <$ty>::to_f32(self)
            }
        }
    };
}

impl_half_scalar!(f16);
impl_half_scalar!(bf16);
