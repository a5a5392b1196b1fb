use std::collections::hash_map::Entry;
use std::collections::HashMap;

use ndarray::ArrayD;

use crate::dtypes::Dtype;
use crate::tensor::Tensor;
use crate::unique_id::{HasUniqueId, UniqueId};

/// Errors surfaced by optimizer construction and [Optimizer::step].
///
/// Nothing is retried or downgraded: a failed construction leaves no
/// optimizer behind, and a failed step leaves any parameters processed
/// earlier in the same call updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimError {
    /// A hyperparameter or a restored state entry violated its contract.
    InvalidArgument(String),
    /// The step encountered input the update engines cannot process.
    UnsupportedOperation(String),
    /// The selected update engine cannot run in the current execution mode.
    IncompatibleMode(String),
}

impl std::fmt::Display for OptimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(msg)
            | Self::UnsupportedOperation(msg)
            | Self::IncompatibleMode(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for OptimError {}

/// Selects which update engine a parameter group runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Apply the update formula to one parameter at a time.
    Scalar,
    /// Apply each step of the formula across the whole batch of parameters
    /// before moving to the next step.
    Foreach,
}

/// An ordered set of parameters sharing one hyperparameter configuration.
#[derive(Debug, Clone)]
pub struct ParamGroup<E: Dtype, C> {
    pub params: Vec<Tensor<E>>,
    pub cfg: C,
}

/// Per-parameter accumulators, created lazily on the first step that
/// processes the parameter.
///
/// The buffers are handles into storage owned by the [StateStore]; their
/// shapes are pinned to the parameter's shape at creation and never change.
#[derive(Debug, Clone)]
pub struct ParamState<E: Dtype> {
    /// Number of updates applied to this parameter so far.
    pub step: u64,
    /// Running average of the squared gradient, zero-initialized.
    pub square_avg: Tensor<E>,
    /// Running average of the gradient. Present iff the group is centered.
    pub grad_avg: Option<Tensor<E>>,
    /// Velocity buffer. Present iff the group's momentum is positive.
    pub momentum_buf: Option<Tensor<E>>,
}

/// Owns every parameter's accumulators, keyed by parameter identity.
///
/// Entries are created on first use and mutated in place on every later
/// step; they live until the store itself is dropped.
#[derive(Debug)]
pub struct StateStore<E: Dtype> {
    entries: HashMap<UniqueId, ParamState<E>>,
}

impl<E: Dtype> Default for StateStore<E> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<E: Dtype> StateStore<E> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: UniqueId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: UniqueId) -> Option<&ParamState<E>> {
        self.entries.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (UniqueId, &ParamState<E>)> {
        self.entries.iter().map(|(id, state)| (*id, state))
    }

    pub(crate) fn insert(&mut self, id: UniqueId, state: ParamState<E>) {
        self.entries.insert(id, state);
    }

    /// Fetches the entry for `param`, creating a zeroed one if none exists.
    ///
    /// An existing entry must still match the parameter's shape and the
    /// group's `centered`/`momentum` options; a mismatch means the entry was
    /// tampered with or restored incorrectly.
    pub(crate) fn get_or_init(
        &mut self,
        param: &Tensor<E>,
        centered: bool,
        momentum: bool,
    ) -> Result<&mut ParamState<E>, OptimError> {
        match self.entries.entry(param.id()) {
            Entry::Occupied(entry) => {
                let state = entry.into_mut();
                if state.square_avg.shape() != param.shape() {
                    return Err(OptimError::InvalidArgument(format!(
                        "state for parameter {:?} has shape {:?}, expected {:?}",
                        param.id(),
                        state.square_avg.shape(),
                        param.shape()
                    )));
                }
                if state.grad_avg.is_some() != centered || state.momentum_buf.is_some() != momentum
                {
                    return Err(OptimError::InvalidArgument(format!(
                        "state for parameter {:?} does not match its group options",
                        param.id()
                    )));
                }
                Ok(state)
            }
            Entry::Vacant(slot) => {
                log::trace!(
                    "initializing optimizer state for parameter {:?} (centered={centered}, momentum={momentum})",
                    param.id()
                );
                Ok(slot.insert(ParamState {
                    step: 0,
                    square_avg: Tensor::zeros_like(param),
                    grad_avg: centered.then(|| Tensor::zeros_like(param)),
                    momentum_buf: momentum.then(|| Tensor::zeros_like(param)),
                }))
            }
        }
    }
}

/// A value snapshot of one parameter's accumulators, detached from the
/// store's storage.
#[derive(Debug, Clone)]
pub struct StateSnapshot<E: Dtype> {
    pub step: u64,
    pub square_avg: ArrayD<E>,
    pub grad_avg: Option<ArrayD<E>>,
    pub momentum_buf: Option<ArrayD<E>>,
}

/// A serializable snapshot of an optimizer's per-parameter state.
///
/// Entries are keyed by the parameter's position in the optimizer's flat
/// parameter order (groups in order, parameters in order within each
/// group), so a dict saved from one process can be restored in another
/// where ids differ.
#[derive(Debug, Clone, Default)]
pub struct StateDict<E: Dtype> {
    pub entries: HashMap<usize, StateSnapshot<E>>,
}

/// The interface optimizers expose to training loops.
pub trait Optimizer<E: Dtype> {
    /// Performs a single optimization step over every parameter group.
    fn step(&mut self) -> Result<(), OptimError>;

    /// Clears the gradient slot of every managed parameter.
    fn zero_grad(&mut self);

    /// The first group's learning rate.
    fn learning_rate(&self) -> E;

    /// Sets the learning rate of every group.
    fn set_learning_rate(&mut self, lr: E);
}
