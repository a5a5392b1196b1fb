use ndarray::{arr1, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use rmsgrad::autograd;
use rmsgrad::optim::{ParamState, StateSnapshot};
use rmsgrad::prelude::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn random_array(rng: &mut StdRng, shape: &[usize]) -> ArrayD<f64> {
    let len: usize = shape.iter().product();
    let data: Vec<f64> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    ArrayD::from_shape_vec(IxDyn(shape), data).expect("shape matches data")
}

fn assert_close(got: &ArrayD<f64>, want: &ArrayD<f64>) {
    assert_eq!(got.shape(), want.shape());
    for (x, y) in got.iter().zip(want.iter()) {
        let tol = 1e-9 + 1e-6 * y.abs();
        assert!((x - y).abs() <= tol, "got {x}, expected {y}");
    }
}

/// Runs five steps over a mixed-shape batch under the given kernel and
/// returns the final parameters and square averages.
fn run_trajectory(
    cfg: RMSpropConfig<f64>,
    kernel: Kernel,
    seed: u64,
    steps: usize,
) -> (Vec<ArrayD<f64>>, Vec<ArrayD<f64>>) {
    let shapes: [&[usize]; 4] = [&[3], &[2, 2], &[4], &[5]];
    let mut rng = StdRng::seed_from_u64(seed);
    let params: Vec<Tensor<f64>> = shapes
        .iter()
        .map(|s| Tensor::from_data(random_array(&mut rng, s)))
        .collect();
    let cfg = RMSpropConfig {
        kernel: Some(kernel),
        ..cfg
    };
    let mut opt = RMSprop::new(params.clone(), cfg).expect("valid config");
    for _ in 0..steps {
        for (param, shape) in params.iter().zip(shapes.iter()) {
            param.set_dense_grad(random_array(&mut rng, shape));
        }
        opt.step().expect("step");
    }
    let square_avgs = params
        .iter()
        .map(|p| {
            opt.state()
                .get(p.id())
                .expect("state entry")
                .square_avg
                .array()
        })
        .collect();
    (params.iter().map(Tensor::array).collect(), square_avgs)
}

fn assert_engines_agree(cfg: RMSpropConfig<f64>, seed: u64) {
    let (scalar_params, scalar_sq) = run_trajectory(cfg, Kernel::Scalar, seed, 5);
    let (foreach_params, foreach_sq) = run_trajectory(cfg, Kernel::Foreach, seed, 5);
    for (got, want) in foreach_params.iter().zip(scalar_params.iter()) {
        assert_close(got, want);
    }
    for (got, want) in foreach_sq.iter().zip(scalar_sq.iter()) {
        assert_close(got, want);
    }
}

#[test]
fn scalar_and_foreach_agree_plain() {
    init_logging();
    assert_engines_agree(RMSpropConfig::default(), 0);
}

#[test]
fn scalar_and_foreach_agree_with_momentum() {
    assert_engines_agree(
        RMSpropConfig {
            momentum: 0.9,
            ..Default::default()
        },
        1,
    );
}

#[test]
fn scalar_and_foreach_agree_centered() {
    assert_engines_agree(
        RMSpropConfig {
            centered: true,
            ..Default::default()
        },
        2,
    );
}

#[test]
fn scalar_and_foreach_agree_with_weight_decay() {
    assert_engines_agree(
        RMSpropConfig {
            weight_decay: 0.3,
            ..Default::default()
        },
        3,
    );
}

#[test]
fn scalar_and_foreach_agree_all_options() {
    assert_engines_agree(
        RMSpropConfig {
            momentum: 0.9,
            centered: true,
            weight_decay: 0.1,
            ..Default::default()
        },
        4,
    );
}

#[test]
fn sparse_gradient_aborts_without_rollback() {
    init_logging();
    let early = Tensor::from_data(arr1(&[1.0f64]).into_dyn());
    let dense = Tensor::from_data(arr1(&[1.0f64, 1.0]).into_dyn());
    let sparse = Tensor::from_data(arr1(&[1.0f64, 1.0]).into_dyn());

    let mut opt = RMSprop::new(vec![early.clone()], RMSpropConfig::default()).expect("valid");
    opt.add_param_group(ParamGroup {
        params: vec![dense.clone(), sparse.clone()],
        cfg: RMSpropConfig::default(),
    })
    .expect("distinct group");

    early.set_dense_grad(arr1(&[1.0]).into_dyn());
    dense.set_dense_grad(arr1(&[1.0, 1.0]).into_dyn());
    sparse.set_grad(Grad::Sparse(SparseGrad {
        shape: vec![2],
        indices: vec![vec![0]],
        values: vec![1.0],
    }));

    let err = opt.step().unwrap_err();
    assert!(matches!(err, OptimError::UnsupportedOperation(_)), "{err}");

    // The earlier group was already applied and stays applied.
    assert_ne!(early.array()[[0]], 1.0);
    // The failing group never reached its engine.
    assert_eq!(dense.array(), arr1(&[1.0, 1.0]).into_dyn());
    assert_eq!(sparse.array(), arr1(&[1.0, 1.0]).into_dyn());
    // No state was created for the sparse parameter.
    assert!(opt.state().get(sparse.id()).is_none());
    // The dense parameter of the failing group was gathered before the
    // abort: its entry exists but its accumulator was never written.
    let gathered: &ParamState<f64> = opt.state().get(dense.id()).expect("entry");
    assert_eq!(gathered.step, 1);
    assert_eq!(
        gathered.square_avg.array(),
        ArrayD::zeros(IxDyn(&[2]))
    );
}

#[test]
fn foreach_refuses_to_run_while_tracing() {
    let param = Tensor::from_data(arr1(&[1.0f64]).into_dyn());
    let mut opt = RMSprop::new(
        vec![param.clone()],
        RMSpropConfig {
            kernel: Some(Kernel::Foreach),
            ..Default::default()
        },
    )
    .expect("valid");
    param.set_dense_grad(arr1(&[1.0]).into_dyn());

    {
        let _capturing = autograd::trace();
        let err = opt.step().unwrap_err();
        assert!(matches!(err, OptimError::IncompatibleMode(_)), "{err}");
        assert_eq!(param.array()[[0]], 1.0);
    }

    // Outside the trace the same optimizer works.
    opt.step().expect("step");
    assert_ne!(param.array()[[0]], 1.0);
}

#[test]
fn unspecified_kernel_resolves_to_scalar() {
    // The scalar engine has no tracing restriction, so a default-kernel
    // group stepping successfully under a trace shows where `None` lands.
    let param = Tensor::from_data(arr1(&[1.0f64]).into_dyn());
    let mut opt = RMSprop::new(vec![param.clone()], RMSpropConfig::default()).expect("valid");
    param.set_dense_grad(arr1(&[1.0]).into_dyn());

    let _capturing = autograd::trace();
    opt.step().expect("step");
    assert_ne!(param.array()[[0]], 1.0);
}

#[test]
fn foreach_with_no_gradients_is_a_no_op() {
    let param = Tensor::from_data(arr1(&[1.0f64]).into_dyn());
    let mut opt = RMSprop::new(
        vec![param.clone()],
        RMSpropConfig {
            kernel: Some(Kernel::Foreach),
            ..Default::default()
        },
    )
    .expect("valid");
    opt.step().expect("step");
    assert_eq!(param.array()[[0]], 1.0);
    assert!(opt.state().is_empty());
}

#[test]
fn closure_runs_with_gradient_tracking_enabled() {
    let param = Tensor::from_data(arr1(&[1.0f64]).into_dyn());
    let mut opt = RMSprop::new(vec![param.clone()], RMSpropConfig::default()).expect("valid");

    let _frozen = autograd::no_grad();
    assert!(!autograd::is_grad_enabled());

    let p = param.clone();
    let loss = opt
        .step_with(|| {
            assert!(autograd::is_grad_enabled());
            p.set_dense_grad(arr1(&[2.0]).into_dyn());
            0.25
        })
        .expect("step");

    assert_eq!(loss, 0.25);
    assert!(!autograd::is_grad_enabled());
    assert_ne!(param.array()[[0]], 1.0);
}

#[test]
fn state_dict_roundtrip_resumes_identically() {
    init_logging();
    let cfg = RMSpropConfig {
        momentum: 0.9,
        centered: true,
        ..Default::default()
    };
    let mut rng = StdRng::seed_from_u64(7);
    let shape: &[usize] = &[3];

    let param = Tensor::from_data(random_array(&mut rng, shape));
    let mut opt = RMSprop::new(vec![param.clone()], cfg).expect("valid");
    for _ in 0..3 {
        param.set_dense_grad(random_array(&mut rng, shape));
        opt.step().expect("step");
    }

    let dict = opt.state_dict();
    let resumed = Tensor::from_data(param.array());
    let mut opt2 = RMSprop::new(vec![resumed.clone()], cfg).expect("valid");
    opt2.load_state_dict(&dict).expect("load");

    let next_grad = random_array(&mut rng, shape);
    param.set_dense_grad(next_grad.clone());
    resumed.set_dense_grad(next_grad);
    opt.step().expect("step");
    opt2.step().expect("step");

    assert_close(&resumed.array(), &param.array());
    let step_original = opt.state().get(param.id()).expect("state").step;
    let step_resumed = opt2.state().get(resumed.id()).expect("state").step;
    assert_eq!(step_original, 4);
    assert_eq!(step_resumed, 4);
}

#[test]
fn load_state_dict_validates_entries() {
    let cfg = RMSpropConfig {
        centered: true,
        ..Default::default()
    };
    let param = Tensor::<f64>::zeros(&[2]);
    let mut opt = RMSprop::new(vec![param], cfg).expect("valid");

    let bad_shape = StateDict {
        entries: [(
            0,
            StateSnapshot {
                step: 1,
                square_avg: ArrayD::zeros(IxDyn(&[3])),
                grad_avg: Some(ArrayD::zeros(IxDyn(&[3]))),
                momentum_buf: None,
            },
        )]
        .into_iter()
        .collect(),
    };
    assert!(matches!(
        opt.load_state_dict(&bad_shape),
        Err(OptimError::InvalidArgument(_))
    ));

    let missing_grad_avg = StateDict {
        entries: [(
            0,
            StateSnapshot {
                step: 1,
                square_avg: ArrayD::zeros(IxDyn(&[2])),
                grad_avg: None,
                momentum_buf: None,
            },
        )]
        .into_iter()
        .collect(),
    };
    assert!(matches!(
        opt.load_state_dict(&missing_grad_avg),
        Err(OptimError::InvalidArgument(_))
    ));

    let stray_momentum = StateDict {
        entries: [(
            0,
            StateSnapshot {
                step: 1,
                square_avg: ArrayD::zeros(IxDyn(&[2])),
                grad_avg: Some(ArrayD::zeros(IxDyn(&[2]))),
                momentum_buf: Some(ArrayD::zeros(IxDyn(&[2]))),
            },
        )]
        .into_iter()
        .collect(),
    };
    assert!(matches!(
        opt.load_state_dict(&stray_momentum),
        Err(OptimError::InvalidArgument(_))
    ));

    let out_of_range = StateDict {
        entries: [(
            9,
            StateSnapshot {
                step: 1,
                square_avg: ArrayD::zeros(IxDyn(&[2])),
                grad_avg: Some(ArrayD::zeros(IxDyn(&[2]))),
                momentum_buf: None,
            },
        )]
        .into_iter()
        .collect(),
    };
    assert!(matches!(
        opt.load_state_dict(&out_of_range),
        Err(OptimError::InvalidArgument(_))
    ));

    // Nothing was written by the rejected loads.
    assert!(opt.state().is_empty());
}

#[test]
fn zero_grad_clears_every_group() {
    let a = Tensor::<f64>::zeros(&[2]);
    let b = Tensor::<f64>::zeros(&[2]);
    let mut opt = RMSprop::new(vec![a.clone()], RMSpropConfig::default()).expect("valid");
    opt.add_param_group(ParamGroup {
        params: vec![b.clone()],
        cfg: RMSpropConfig {
            lr: 1e-3,
            ..Default::default()
        },
    })
    .expect("distinct group");

    a.set_dense_grad(ArrayD::zeros(IxDyn(&[2])));
    b.set_dense_grad(ArrayD::zeros(IxDyn(&[2])));
    opt.zero_grad();
    assert!(a.grad().is_none());
    assert!(b.grad().is_none());
}

#[test]
fn learning_rate_accessors_touch_every_group() {
    let a = Tensor::<f64>::zeros(&[1]);
    let b = Tensor::<f64>::zeros(&[1]);
    let mut opt = RMSprop::new(vec![a], RMSpropConfig::default()).expect("valid");
    opt.add_param_group(ParamGroup {
        params: vec![b],
        cfg: RMSpropConfig {
            lr: 0.5,
            ..Default::default()
        },
    })
    .expect("distinct group");

    assert_eq!(opt.learning_rate(), 1e-2);
    opt.set_learning_rate(3e-4);
    assert_eq!(opt.learning_rate(), 3e-4);
    for group in opt.param_groups() {
        assert_eq!(group.cfg.lr, 3e-4);
    }
}

#[test]
fn optimizer_trait_object_drives_a_step() {
    let param = Tensor::from_data(arr1(&[1.0f64]).into_dyn());
    let mut opt = RMSprop::new(vec![param.clone()], RMSpropConfig::default()).expect("valid");

    param.set_dense_grad(arr1(&[1.0]).into_dyn());
    let dyn_opt: &mut dyn Optimizer<f64> = &mut opt;
    dyn_opt.step().expect("step");
    dyn_opt.zero_grad();

    assert_ne!(param.array()[[0]], 1.0);
    assert!(param.grad().is_none());
}

#[test]
fn groups_keep_their_own_hyperparameters() {
    let fast = Tensor::from_data(arr1(&[1.0f64]).into_dyn());
    let slow = Tensor::from_data(arr1(&[1.0f64]).into_dyn());
    let mut opt = RMSprop::new(
        vec![fast.clone()],
        RMSpropConfig {
            lr: 0.1,
            ..Default::default()
        },
    )
    .expect("valid");
    opt.add_param_group(ParamGroup {
        params: vec![slow.clone()],
        cfg: RMSpropConfig {
            lr: 1e-4,
            kernel: Some(Kernel::Foreach),
            ..Default::default()
        },
    })
    .expect("distinct group");

    fast.set_dense_grad(arr1(&[1.0]).into_dyn());
    slow.set_dense_grad(arr1(&[1.0]).into_dyn());
    opt.step().expect("step");

    let fast_delta = (1.0 - fast.array()[[0]]).abs();
    let slow_delta = (1.0 - slow.array()[[0]]).abs();
    assert!(fast_delta > slow_delta * 100.0);
}
