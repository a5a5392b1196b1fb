//! Dense buffer handles shared between the caller and the optimizer.
//!
//! A [Tensor] is a cheaply clonable handle to a mutable numeric array plus a
//! gradient slot. Clones share storage and keep the same [UniqueId], which is
//! how optimizer state stays attached to a parameter across steps.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use ndarray::{ArrayD, IxDyn};

use crate::dtypes::Dtype;
use crate::unique_id::{unique_id, HasUniqueId, UniqueId};

/// A gradient as attached to a parameter before a step.
#[derive(Debug, Clone)]
pub enum Grad<E: Dtype> {
    /// Dense values, same shape as the parameter.
    Dense(ArrayD<E>),
    /// Coordinate-format sparse values. The update engines reject these;
    /// the variant exists so providers can hand one over and get a proper
    /// error instead of silently densified math.
    Sparse(SparseGrad<E>),
}

impl<E: Dtype> Grad<E> {
    pub fn shape(&self) -> &[usize] {
        match self {
            Grad::Dense(values) => values.shape(),
            Grad::Sparse(coo) => &coo.shape,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Grad::Sparse(_))
    }
}

/// Coordinate-format sparse gradient: one multi-index per stored value.
#[derive(Debug, Clone)]
pub struct SparseGrad<E: Dtype> {
    pub shape: Vec<usize>,
    pub indices: Vec<Vec<usize>>,
    pub values: Vec<E>,
}

/// A mutable numeric buffer of arbitrary shape with an attached gradient
/// slot.
///
/// The caller owns the buffer; the optimizer only ever writes through the
/// handle, in place. [Tensor::clone] is shallow and preserves identity.
#[derive(Debug)]
pub struct Tensor<E: Dtype> {
    id: UniqueId,
    pub(crate) data: Rc<RefCell<ArrayD<E>>>,
    grad: Rc<RefCell<Option<Grad<E>>>>,
}

impl<E: Dtype> Clone for Tensor<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            data: Rc::clone(&self.data),
            grad: Rc::clone(&self.grad),
        }
    }
}

impl<E: Dtype> Tensor<E> {
    /// Wraps an owned array in a fresh handle.
    pub fn from_data(data: ArrayD<E>) -> Self {
        Self {
            id: unique_id(),
            data: Rc::new(RefCell::new(data)),
            grad: Rc::new(RefCell::new(None)),
        }
    }

    /// An all-zero tensor of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::from_data(ArrayD::zeros(IxDyn(shape)))
    }

    /// An all-zero tensor shaped like `other`. The new handle has its own
    /// identity and storage.
    pub fn zeros_like(other: &Tensor<E>) -> Self {
        Self::from_data(ArrayD::zeros(other.data.borrow().raw_dim()))
    }

    /// A 0-dimensional tensor holding a single value.
    pub fn scalar(value: E) -> Self {
        Self::from_data(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn shape(&self) -> Vec<usize> {
        self.data.borrow().shape().to_vec()
    }

    pub fn numel(&self) -> usize {
        self.data.borrow().len()
    }

    /// A snapshot copy of the current values.
    pub fn array(&self) -> ArrayD<E> {
        self.data.borrow().clone()
    }

    pub(crate) fn borrow(&self) -> Ref<'_, ArrayD<E>> {
        self.data.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, ArrayD<E>> {
        self.data.borrow_mut()
    }

    /// Attaches a gradient, replacing any previous one.
    ///
    /// # Panics
    /// If the gradient's shape does not match the parameter's shape.
    pub fn set_grad(&self, grad: Grad<E>) {
        assert_eq!(
            grad.shape(),
            self.data.borrow().shape(),
            "gradient shape must match parameter shape"
        );
        *self.grad.borrow_mut() = Some(grad);
    }

    /// Attaches a dense gradient, replacing any previous one.
    pub fn set_dense_grad(&self, values: ArrayD<E>) {
        self.set_grad(Grad::Dense(values));
    }

    /// A snapshot copy of the attached gradient, if any.
    pub fn grad(&self) -> Option<Grad<E>> {
        self.grad.borrow().clone()
    }

    pub(crate) fn grad_slot(&self) -> Ref<'_, Option<Grad<E>>> {
        self.grad.borrow()
    }

    /// Detaches the gradient, leaving the slot empty.
    pub fn clear_grad(&self) {
        *self.grad.borrow_mut() = None;
    }
}

impl<E: Dtype> HasUniqueId for Tensor<E> {
    fn id(&self) -> UniqueId {
        self.id
    }
}

impl<E: Dtype> From<ArrayD<E>> for Tensor<E> {
    fn from(data: ArrayD<E>) -> Self {
        Self::from_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_clone_shares_storage_and_id() {
        let t = Tensor::from_data(arr1(&[1.0f32, 2.0]).into_dyn());
        let u = t.clone();
        assert_eq!(t.id(), u.id());
        u.borrow_mut()[[0]] = 5.0;
        assert_eq!(t.array()[[0]], 5.0);
    }

    #[test]
    fn test_zeros_like_is_independent() {
        let t = Tensor::<f64>::zeros(&[2, 3]);
        let z = Tensor::zeros_like(&t);
        assert_eq!(z.shape(), vec![2, 3]);
        assert_ne!(t.id(), z.id());
        z.borrow_mut()[[0, 0]] = 1.0;
        assert_eq!(t.array()[[0, 0]], 0.0);
    }

    #[test]
    #[should_panic(expected = "gradient shape must match")]
    fn test_set_grad_rejects_shape_mismatch() {
        let t = Tensor::<f32>::zeros(&[3]);
        t.set_dense_grad(ArrayD::zeros(IxDyn(&[4])));
    }

    #[test]
    fn test_grad_slot_roundtrip() {
        let t = Tensor::<f32>::zeros(&[2]);
        assert!(t.grad().is_none());
        t.set_dense_grad(arr1(&[0.5f32, -0.5]).into_dyn());
        match t.grad() {
            Some(Grad::Dense(g)) => assert_eq!(g[[1]], -0.5),
            other => panic!("expected dense grad, got {other:?}"),
        }
        t.clear_grad();
        assert!(t.grad().is_none());
    }
}
