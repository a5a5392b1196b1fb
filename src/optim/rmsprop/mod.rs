mod foreach_kernel;
mod scalar_kernel;

use std::cell::Ref;
use std::collections::HashMap;

use ndarray::ArrayD;

use crate::autograd;
use crate::dtypes::Dtype;
use crate::tensor::{Grad, Tensor};
use crate::unique_id::HasUniqueId;

use super::optimizer::{
    Kernel, OptimError, Optimizer, ParamGroup, ParamState, StateDict, StateSnapshot, StateStore,
};

use foreach_kernel::ForeachKernel;
use scalar_kernel::ScalarKernel;

/// Configuration of hyperparameters for [RMSprop].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RMSpropConfig<E> {
    /// Learning rate. Defaults to `1e-2`.
    pub lr: E,

    /// Smoothing constant for the running averages. Defaults to `0.99`.
    pub alpha: E,

    /// Term added to the denominator for numerical stability. Defaults to
    /// `1e-8`.
    pub eps: E,

    /// L2 penalty added to the gradient before the update. Defaults to `0`.
    pub weight_decay: E,

    /// Momentum factor. A velocity buffer is kept per parameter whenever
    /// this is positive. Defaults to `0`.
    pub momentum: E,

    /// Normalize by an estimate of the gradient's variance instead of the
    /// raw second moment. Defaults to `false`.
    pub centered: bool,

    /// Which update engine runs this group. `None` resolves to
    /// [Kernel::Scalar]; the batched engine is opt-in only. Defaults to
    /// `None`.
    pub kernel: Option<Kernel>,
}

impl<E: Dtype> Default for RMSpropConfig<E> {
    fn default() -> Self {
        Self {
            lr: E::from_f64(1e-2).unwrap(),
            alpha: E::from_f64(0.99).unwrap(),
            eps: E::from_f64(1e-8).unwrap(),
            weight_decay: E::zero(),
            momentum: E::zero(),
            centered: false,
            kernel: None,
        }
    }
}

impl<E: Dtype> RMSpropConfig<E> {
    pub(crate) fn validate(&self) -> Result<(), OptimError> {
        if self.lr < E::zero() {
            return Err(OptimError::InvalidArgument(format!(
                "Invalid learning rate: {}",
                self.lr
            )));
        }
        if self.eps < E::zero() {
            return Err(OptimError::InvalidArgument(format!(
                "Invalid epsilon value: {}",
                self.eps
            )));
        }
        if self.momentum < E::zero() {
            return Err(OptimError::InvalidArgument(format!(
                "Invalid momentum value: {}",
                self.momentum
            )));
        }
        if self.weight_decay < E::zero() {
            return Err(OptimError::InvalidArgument(format!(
                "Invalid weight_decay value: {}",
                self.weight_decay
            )));
        }
        if self.alpha < E::zero() {
            return Err(OptimError::InvalidArgument(format!(
                "Invalid alpha value: {}",
                self.alpha
            )));
        }
        Ok(())
    }

    fn uses_momentum(&self) -> bool {
        self.momentum > E::zero()
    }
}

/// One group's worth of aligned buffer handles, gathered by
/// [RMSprop::step] and handed to an update engine.
///
/// `grad_avgs` is aligned with `params` when the group is centered and
/// empty otherwise; likewise `momentum_bufs` when momentum is positive.
pub(super) struct GroupBatch<'a, E: Dtype> {
    pub params: &'a [Tensor<E>],
    pub grads: &'a [&'a ArrayD<E>],
    pub square_avgs: &'a [Tensor<E>],
    pub grad_avgs: &'a [Tensor<E>],
    pub momentum_bufs: &'a [Tensor<E>],
}

/// An update engine: one of two interchangeable realizations of the
/// elementwise RMSprop formula. Engines write through the batch's handles
/// in place and never reallocate a buffer.
pub(super) trait RMSpropKernel<E: Dtype> {
    fn update(cfg: &RMSpropConfig<E>, batch: &GroupBatch<'_, E>) -> Result<(), OptimError>;
}

/// RMSprop as described in
/// [Hinton, 2012](http://www.cs.toronto.edu/%7Etijmen/csc321/slides/lecture_slides_lec6.pdf),
/// with optional momentum and the centered variant from
/// [Graves, 2013](https://arxiv.org/abs/1308.0850).
///
/// The square root of the accumulator is taken *before* epsilon is added,
/// so the effective learning rate is `lr / (sqrt(v) + eps)`. Near-zero
/// gradients therefore see steps bounded by `lr / eps` rather than
/// `lr / sqrt(eps)`.
///
/// Each parameter group can run through one of two update engines selected
/// by [RMSpropConfig::kernel]: the scalar engine updates one parameter at a
/// time, the foreach engine applies each step of the formula across the
/// whole group at once. Both compute identical values.
///
/// # Example Usage
///
/// ```rust
/// use rmsgrad::prelude::*;
/// use ndarray::arr1;
///
/// let w = Tensor::from_data(arr1(&[1.0f64, -2.0]).into_dyn());
/// let mut opt = RMSprop::new(vec![w.clone()], RMSpropConfig::default()).unwrap();
///
/// w.set_dense_grad(arr1(&[0.5, 0.5]).into_dyn());
/// opt.step().unwrap();
/// assert_ne!(w.array()[[0]], 1.0);
/// ```
///
/// A step fails with [OptimError::UnsupportedOperation] if any gradient is
/// sparse. Parameters updated by earlier groups in the same call stay
/// updated; there is no rollback.
#[derive(Debug)]
pub struct RMSprop<E: Dtype> {
    groups: Vec<ParamGroup<E, RMSpropConfig<E>>>,
    state: StateStore<E>,
}

impl<E: Dtype> RMSprop<E> {
    /// Constructs an optimizer over one group holding `params`.
    ///
    /// Fails with [OptimError::InvalidArgument] if any hyperparameter is
    /// negative or `params` is empty.
    pub fn new(params: Vec<Tensor<E>>, cfg: RMSpropConfig<E>) -> Result<Self, OptimError> {
        if params.is_empty() {
            return Err(OptimError::InvalidArgument(
                "optimizer got an empty parameter list".to_string(),
            ));
        }
        let mut opt = Self {
            groups: Vec::new(),
            state: StateStore::default(),
        };
        opt.add_param_group(ParamGroup { params, cfg })?;
        Ok(opt)
    }

    /// Appends a parameter group with its own hyperparameters.
    ///
    /// Fails with [OptimError::InvalidArgument] if the group's config is
    /// invalid or any of its parameters is already managed by this
    /// optimizer.
    pub fn add_param_group(
        &mut self,
        group: ParamGroup<E, RMSpropConfig<E>>,
    ) -> Result<(), OptimError> {
        group.cfg.validate()?;
        for (i, param) in group.params.iter().enumerate() {
            let seen_before = self
                .groups
                .iter()
                .flat_map(|g| g.params.iter())
                .chain(group.params[..i].iter())
                .any(|other| other.id() == param.id());
            if seen_before {
                return Err(OptimError::InvalidArgument(
                    "some parameters appear in more than one parameter group".to_string(),
                ));
            }
        }
        self.groups.push(group);
        Ok(())
    }

    pub fn param_groups(&self) -> &[ParamGroup<E, RMSpropConfig<E>>] {
        &self.groups
    }

    /// Read access to the per-parameter accumulators, e.g. for host-side
    /// checkpointing.
    pub fn state(&self) -> &StateStore<E> {
        &self.state
    }

    /// Performs a single optimization step over every group.
    ///
    /// Parameters without a gradient are skipped. A sparse gradient fails
    /// the call with [OptimError::UnsupportedOperation]; groups processed
    /// earlier in the same call stay updated.
    pub fn step(&mut self) -> Result<(), OptimError> {
        self.run_step()
    }

    /// Like [RMSprop::step], but first invokes `closure` and returns its
    /// value as the loss. Gradient tracking is enabled for the closure call
    /// only; the update pass itself runs with tracking disabled.
    pub fn step_with<F>(&mut self, closure: F) -> Result<E, OptimError>
    where
        F: FnOnce() -> E,
    {
        let loss = {
            let _tracking = autograd::enable_grad();
            closure()
        };
        self.run_step()?;
        Ok(loss)
    }

    /// Clears the gradient slot of every managed parameter.
    pub fn zero_grad(&mut self) {
        for group in &self.groups {
            for param in &group.params {
                param.clear_grad();
            }
        }
    }

    pub fn learning_rate(&self) -> E {
        self.groups[0].cfg.lr
    }

    pub fn set_learning_rate(&mut self, lr: E) {
        for group in &mut self.groups {
            group.cfg.lr = lr;
        }
    }

    /// Snapshots every parameter's accumulators, keyed by flat parameter
    /// position.
    pub fn state_dict(&self) -> StateDict<E> {
        let mut entries = HashMap::new();
        let flat = self.groups.iter().flat_map(|g| g.params.iter());
        for (pos, param) in flat.enumerate() {
            if let Some(state) = self.state.get(param.id()) {
                entries.insert(
                    pos,
                    StateSnapshot {
                        step: state.step,
                        square_avg: state.square_avg.array(),
                        grad_avg: state.grad_avg.as_ref().map(|t| t.array()),
                        momentum_buf: state.momentum_buf.as_ref().map(|t| t.array()),
                    },
                );
            }
        }
        StateDict { entries }
    }

    /// Restores accumulators from a [StateDict] saved by a matching
    /// optimizer.
    ///
    /// Every entry is validated against the parameter it lands on before
    /// anything is written: shapes must match the parameter exactly, and
    /// the optional buffers must agree with the target group's
    /// `centered`/`momentum` options. A bad entry fails the whole call with
    /// [OptimError::InvalidArgument] and leaves the store untouched.
    pub fn load_state_dict(&mut self, dict: &StateDict<E>) -> Result<(), OptimError> {
        let flat: Vec<(Tensor<E>, RMSpropConfig<E>)> = self
            .groups
            .iter()
            .flat_map(|g| g.params.iter().map(move |p| (p.clone(), g.cfg)))
            .collect();

        let mut pending = Vec::with_capacity(dict.entries.len());
        for (&pos, snap) in &dict.entries {
            let (param, cfg) = flat.get(pos).ok_or_else(|| {
                OptimError::InvalidArgument(format!(
                    "state entry {pos} has no matching parameter"
                ))
            })?;
            let shape = param.shape();
            if snap.square_avg.shape() != shape {
                return Err(OptimError::InvalidArgument(format!(
                    "square_avg for parameter {pos} has shape {:?}, expected {:?}",
                    snap.square_avg.shape(),
                    shape
                )));
            }
            let grad_avg = validate_optional_buffer(
                "grad_avg",
                pos,
                &shape,
                cfg.centered,
                snap.grad_avg.as_ref(),
            )?;
            let momentum_buf = validate_optional_buffer(
                "momentum_buffer",
                pos,
                &shape,
                cfg.uses_momentum(),
                snap.momentum_buf.as_ref(),
            )?;
            pending.push((
                param.id(),
                ParamState {
                    step: snap.step,
                    square_avg: Tensor::from_data(snap.square_avg.clone()),
                    grad_avg: grad_avg.map(|a| Tensor::from_data(a.clone())),
                    momentum_buf: momentum_buf.map(|a| Tensor::from_data(a.clone())),
                },
            ));
        }
        for (id, state) in pending {
            self.state.insert(id, state);
        }
        Ok(())
    }

    fn run_step(&mut self) -> Result<(), OptimError> {
        let _frozen = autograd::no_grad();
        for group in self.groups.iter() {
            let cfg = &group.cfg;

            let mut params: Vec<Tensor<E>> = Vec::new();
            let mut grads: Vec<Ref<'_, ArrayD<E>>> = Vec::new();
            let mut square_avgs: Vec<Tensor<E>> = Vec::new();
            let mut grad_avgs: Vec<Tensor<E>> = Vec::new();
            let mut momentum_bufs: Vec<Tensor<E>> = Vec::new();

            for param in &group.params {
                {
                    let slot = param.grad_slot();
                    match &*slot {
                        None => continue,
                        Some(Grad::Sparse(_)) => {
                            return Err(OptimError::UnsupportedOperation(
                                "RMSprop does not support sparse gradients".to_string(),
                            ));
                        }
                        Some(Grad::Dense(_)) => {}
                    }
                }
                let Ok(dense) = Ref::filter_map(param.grad_slot(), |slot| match slot {
                    Some(Grad::Dense(values)) => Some(values),
                    _ => None,
                }) else {
                    continue;
                };

                let entry = self
                    .state
                    .get_or_init(param, cfg.centered, cfg.uses_momentum())?;
                entry.step += 1;

                square_avgs.push(entry.square_avg.clone());
                if let Some(grad_avg) = &entry.grad_avg {
                    grad_avgs.push(grad_avg.clone());
                }
                if let Some(momentum_buf) = &entry.momentum_buf {
                    momentum_bufs.push(momentum_buf.clone());
                }
                params.push(param.clone());
                grads.push(dense);
            }

            let kernel = cfg.kernel.unwrap_or(Kernel::Scalar);
            log::debug!(
                "rmsprop: updating {} parameter(s) via {:?} kernel",
                params.len(),
                kernel
            );

            let grad_views: Vec<&ArrayD<E>> = grads.iter().map(|g| &**g).collect();
            let batch = GroupBatch {
                params: &params,
                grads: &grad_views,
                square_avgs: &square_avgs,
                grad_avgs: &grad_avgs,
                momentum_bufs: &momentum_bufs,
            };
            match kernel {
                Kernel::Scalar => ScalarKernel::update(cfg, &batch)?,
                Kernel::Foreach => ForeachKernel::update(cfg, &batch)?,
            }
        }
        Ok(())
    }
}

fn validate_optional_buffer<'a, E: Dtype>(
    name: &str,
    pos: usize,
    shape: &[usize],
    required: bool,
    buffer: Option<&'a ArrayD<E>>,
) -> Result<Option<&'a ArrayD<E>>, OptimError> {
    match (required, buffer) {
        (true, Some(values)) => {
            if values.shape() != shape {
                return Err(OptimError::InvalidArgument(format!(
                    "{name} for parameter {pos} has shape {:?}, expected {:?}",
                    values.shape(),
                    shape
                )));
            }
            Ok(Some(values))
        }
        (true, None) => Err(OptimError::InvalidArgument(format!(
            "state entry {pos} is missing its {name}"
        ))),
        (false, Some(_)) => Err(OptimError::InvalidArgument(format!(
            "state entry {pos} carries a {name} its group does not use"
        ))),
        (false, None) => Ok(None),
    }
}

impl<E: Dtype> Optimizer<E> for RMSprop<E> {
    fn step(&mut self) -> Result<(), OptimError> {
        RMSprop::step(self)
    }

    fn zero_grad(&mut self) {
        RMSprop::zero_grad(self)
    }

    fn learning_rate(&self) -> E {
        RMSprop::learning_rate(self)
    }

    fn set_learning_rate(&mut self, lr: E) {
        RMSprop::set_learning_rate(self, lr)
    }
}
