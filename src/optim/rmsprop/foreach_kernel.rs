use ndarray::{ArrayD, Zip};

use crate::autograd;
use crate::dtypes::Dtype;
use crate::optim::optimizer::OptimError;

use super::{GroupBatch, RMSpropConfig, RMSpropKernel};

/// Applies each step of the update formula across every parameter in the
/// batch before moving on to the next step.
///
/// The per-element arithmetic is written identically to the scalar kernel,
/// so the two engines produce the same values; only the traversal order over
/// parameters differs.
pub(super) struct ForeachKernel;

impl<E: Dtype> RMSpropKernel<E> for ForeachKernel {
    fn update(cfg: &RMSpropConfig<E>, batch: &GroupBatch<'_, E>) -> Result<(), OptimError> {
        if autograd::is_tracing() {
            return Err(OptimError::IncompatibleMode(
                "foreach kernel is not available while a trace is being captured".to_string(),
            ));
        }
        if batch.params.is_empty() {
            return Ok(());
        }

        let n = batch.params.len();
        let one = E::one();

        // The caller's gradients are never mutated; weight decay works on a
        // temporary copy.
        let decayed: Option<Vec<ArrayD<E>>> = (cfg.weight_decay != E::zero()).then(|| {
            (0..n)
                .map(|i| {
                    let p = batch.params[i].borrow();
                    Zip::from(batch.grads[i])
                        .and(&*p)
                        .map_collect(|&g, &p| g + cfg.weight_decay * p)
                })
                .collect()
        });
        let grads: Vec<&ArrayD<E>> = match &decayed {
            Some(list) => list.iter().collect(),
            None => batch.grads.to_vec(),
        };

        for i in 0..n {
            let mut sa = batch.square_avgs[i].borrow_mut();
            Zip::from(&mut *sa).and(grads[i]).for_each(|sa, &g| {
                *sa = cfg.alpha * *sa + (one - cfg.alpha) * (g * g);
            });
        }

        let mut avgs: Vec<ArrayD<E>> = Vec::with_capacity(n);
        if cfg.centered {
            for i in 0..n {
                let mut ga = batch.grad_avgs[i].borrow_mut();
                Zip::from(&mut *ga).and(grads[i]).for_each(|ga, &g| {
                    *ga = cfg.alpha * *ga + (one - cfg.alpha) * g;
                });
            }
            for i in 0..n {
                let sa = batch.square_avgs[i].borrow();
                let ga = batch.grad_avgs[i].borrow();
                avgs.push(
                    Zip::from(&*sa)
                        .and(&*ga)
                        .map_collect(|&sa, &ga| (sa - ga * ga).sqrt() + cfg.eps),
                );
            }
        } else {
            for i in 0..n {
                let sa = batch.square_avgs[i].borrow();
                avgs.push(sa.mapv(|sa| sa.sqrt() + cfg.eps));
            }
        }

        if cfg.momentum > E::zero() {
            for i in 0..n {
                let mut buf = batch.momentum_bufs[i].borrow_mut();
                Zip::from(&mut *buf)
                    .and(grads[i])
                    .and(&avgs[i])
                    .for_each(|buf, &g, &avg| {
                        *buf = cfg.momentum * *buf + g / avg;
                    });
            }
            for i in 0..n {
                let mut p = batch.params[i].borrow_mut();
                let buf = batch.momentum_bufs[i].borrow();
                Zip::from(&mut *p).and(&*buf).for_each(|p, &buf| {
                    *p = *p - cfg.lr * buf;
                });
            }
        } else {
            for i in 0..n {
                let mut p = batch.params[i].borrow_mut();
                Zip::from(&mut *p)
                    .and(grads[i])
                    .and(&avgs[i])
                    .for_each(|p, &g, &avg| {
                        *p = *p - cfg.lr * (g / avg);
                    });
            }
        }
        Ok(())
    }
}
