use ndarray::Zip;

use crate::dtypes::Dtype;
use crate::optim::optimizer::OptimError;

use super::{GroupBatch, RMSpropConfig, RMSpropKernel};

/// Updates one parameter at a time, fusing the whole formula into a single
/// elementwise pass over that parameter's buffers.
pub(super) struct ScalarKernel;

impl<E: Dtype> RMSpropKernel<E> for ScalarKernel {
    fn update(cfg: &RMSpropConfig<E>, batch: &GroupBatch<'_, E>) -> Result<(), OptimError> {
        let one = E::one();
        let wd = cfg.weight_decay;
        for i in 0..batch.params.len() {
            let mut p = batch.params[i].borrow_mut();
            let g = batch.grads[i];
            let mut sa = batch.square_avgs[i].borrow_mut();
            match (cfg.centered, cfg.momentum > E::zero()) {
                (false, false) => {
                    Zip::from(&mut *p).and(g).and(&mut *sa).for_each(|p, &g0, sa| {
                        let g = decayed(g0, *p, wd);
                        *sa = cfg.alpha * *sa + (one - cfg.alpha) * (g * g);
                        let avg = sa.sqrt() + cfg.eps;
                        *p = *p - cfg.lr * (g / avg);
                    });
                }
                (true, false) => {
                    let mut ga = batch.grad_avgs[i].borrow_mut();
                    Zip::from(&mut *p)
                        .and(g)
                        .and(&mut *sa)
                        .and(&mut *ga)
                        .for_each(|p, &g0, sa, ga| {
                            let g = decayed(g0, *p, wd);
                            *sa = cfg.alpha * *sa + (one - cfg.alpha) * (g * g);
                            *ga = cfg.alpha * *ga + (one - cfg.alpha) * g;
                            let avg = (*sa - *ga * *ga).sqrt() + cfg.eps;
                            *p = *p - cfg.lr * (g / avg);
                        });
                }
                (false, true) => {
                    let mut buf = batch.momentum_bufs[i].borrow_mut();
                    Zip::from(&mut *p)
                        .and(g)
                        .and(&mut *sa)
                        .and(&mut *buf)
                        .for_each(|p, &g0, sa, buf| {
                            let g = decayed(g0, *p, wd);
                            *sa = cfg.alpha * *sa + (one - cfg.alpha) * (g * g);
                            let avg = sa.sqrt() + cfg.eps;
                            *buf = cfg.momentum * *buf + g / avg;
                            *p = *p - cfg.lr * *buf;
                        });
                }
                (true, true) => {
                    let mut ga = batch.grad_avgs[i].borrow_mut();
                    let mut buf = batch.momentum_bufs[i].borrow_mut();
                    Zip::from(&mut *p)
                        .and(g)
                        .and(&mut *sa)
                        .and(&mut *ga)
                        .and(&mut *buf)
                        .for_each(|p, &g0, sa, ga, buf| {
                            let g = decayed(g0, *p, wd);
                            *sa = cfg.alpha * *sa + (one - cfg.alpha) * (g * g);
                            *ga = cfg.alpha * *ga + (one - cfg.alpha) * g;
                            let avg = (*sa - *ga * *ga).sqrt() + cfg.eps;
                            *buf = cfg.momentum * *buf + g / avg;
                            *p = *p - cfg.lr * *buf;
                        });
                }
            }
        }
        Ok(())
    }
}

#[inline]
fn decayed<E: Dtype>(g: E, p: E, weight_decay: E) -> E {
    if weight_decay != E::zero() {
        g + weight_decay * p
    } else {
        g
    }
}
