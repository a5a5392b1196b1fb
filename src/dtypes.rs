//! Module for data type related traits. Contains [Dtype], the bound every
//! buffer element type must satisfy.

/// The element type of parameter, gradient, and accumulator buffers.
///
/// Bundles [num_traits::Float] with the marker bounds the rest of the crate
/// needs so that signatures stay short. Implemented for [f32] and [f64].
pub trait Dtype:
    'static
    + Copy
    + Clone
    + Default
    + std::fmt::Debug
    + std::fmt::Display
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + std::marker::Unpin
    + num_traits::Float
    + num_traits::FromPrimitive
{
}

macro_rules! dtype {
    ($type:ty) => {
        impl Dtype for $type {}
    };
}

dtype!(f32);
dtype!(f64);
