//! Optimizers that mutate parameter buffers in place given their gradients.
//!
//! # Initializing
//!
//! [RMSprop] provides a [Default] configuration and a way to specify all
//! relevant hyperparameters through [RMSpropConfig]:
//!
//! ```rust
//! # use rmsgrad::prelude::*;
//! let w = Tensor::<f32>::zeros(&[4]);
//! let opt = RMSprop::new(vec![w], RMSpropConfig {
//!     lr: 1e-3,
//!     momentum: 0.9,
//!     ..Default::default()
//! }).unwrap();
//! ```
//!
//! # Updating parameters
//!
//! Attach gradients to the parameters, then call [Optimizer::step]. A group
//! configured with [Kernel::Foreach] runs the batched engine instead of the
//! per-parameter one; both compute identical values.

mod optimizer;
mod rmsprop;

pub use optimizer::{
    Kernel, OptimError, Optimizer, ParamGroup, ParamState, StateDict, StateSnapshot, StateStore,
};
pub use rmsprop::{RMSprop, RMSpropConfig};
