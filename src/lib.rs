//! RMSprop parameter updates over caller-owned buffers, with two
//! numerically equivalent execution strategies: a per-parameter scalar
//! kernel and a batched foreach kernel.
//!
//! ```rust
//! use rmsgrad::prelude::*;
//! use ndarray::arr1;
//!
//! let w = Tensor::from_data(arr1(&[1.0f32, 2.0]).into_dyn());
//! let mut opt = RMSprop::new(vec![w.clone()], RMSpropConfig {
//!     lr: 1e-3,
//!     momentum: 0.9,
//!     ..Default::default()
//! })?;
//!
//! // One iteration: the caller computes gradients, the optimizer applies
//! // the update in place through the shared handle.
//! w.set_dense_grad(arr1(&[0.1, -0.3]).into_dyn());
//! opt.step()?;
//! opt.zero_grad();
//! # Ok::<(), rmsgrad::optim::OptimError>(())
//! ```

pub mod autograd;
pub mod dtypes;
pub mod optim;
pub mod tensor;
pub mod unique_id;

pub mod prelude {
    pub use crate::dtypes::Dtype;
    pub use crate::optim::{
        Kernel, OptimError, Optimizer, ParamGroup, RMSprop, RMSpropConfig, StateDict,
    };
    pub use crate::tensor::{Grad, SparseGrad, Tensor};
    pub use crate::unique_id::{HasUniqueId, UniqueId};
}
