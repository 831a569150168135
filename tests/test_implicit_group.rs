//! Two implicit components in feedback, converged by the block Gauss-Seidel solvers.

use float_cmp::assert_approx_eq;
use mdao::{
    dist::Comm, Component, Error, Group, IndepVarComp, LinearBlockGs, LinearMode,
    NonlinearBlockGs, SetupError, SolverOptions, SolverState, VarSpec, VectorKind,
};
use rstest::rstest;
use test_models::{
    connect_coupled, coupled_implicit_group, coupled_solver_options, run_on, CoupledComp, Fault,
    FaultyComp, InOutArrayComp, SliceSumComp, COUPLINGS,
};

const SCALE: f64 = 0.1;
const BIAS: f64 = 1.0;

fn comp() -> CoupledComp {
    CoupledComp::new(SCALE, BIAS)
}

/// Values of `kind` for every output of the components at `paths`, in [`COUPLINGS`] order.
fn outputs(model: &Group, paths: &[&str], kind: VectorKind) -> Vec<Vec<f64>> {
    paths
        .iter()
        .map(|path| {
            COUPLINGS
                .iter()
                .map(|(output, _, _)| model.vector(&format!("{path}.{output}"), kind).unwrap()[0])
                .collect()
        })
        .collect()
}

fn fill_outputs(model: &mut Group, paths: &[&str], kind: VectorKind, value: f64) {
    for path in paths {
        for (output, _, _) in COUPLINGS {
            model
                .vector_mut(&format!("{path}.{output}"), kind)
                .unwrap()
                .fill(value);
        }
    }
}

fn assert_all_approx(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert_approx_eq!(f64, *a, *e, epsilon = 1e-12);
    }
}

/// Sweeps needed for the slowest pair, contracting by `(scale * k)^2` per sweep, to reduce the
/// residual by `rtol`, plus one.
fn iteration_bound() -> usize {
    let k = COUPLINGS.iter().map(|(_, _, k)| *k).fold(0.0, f64::max);
    let contraction = (SCALE * k).powi(2);
    let sweeps = coupled_solver_options().rtol.ln() / contraction.ln();
    sweeps.ceil() as usize + 1
}

#[rstest]
#[case(1)]
#[case(2)]
fn test_nonlinear_block_gs(#[case] ranks: usize) {
    let iterations = run_on(ranks, |comm| {
        let mut model = coupled_implicit_group(comp());
        model.setup(&comm).unwrap();

        let report = model.run_solve_nonlinear().unwrap();
        assert_eq!(report.solver, "NLBGS");
        assert_eq!(report.state, SolverState::Converged);
        assert!(report.iterations > 1);
        assert!(report.iterations <= iteration_bound());

        for values in outputs(&model, &["C1", "C2"], VectorKind::Outputs) {
            assert_all_approx(&values, &comp().coupled_solution());
        }
        report.iterations
    });

    // Replicated residuals are counted once, so every rank count sees the same norms.
    let serial = run_on(1, |comm| {
        let mut model = coupled_implicit_group(comp());
        model.setup(&comm).unwrap();
        model.run_solve_nonlinear().unwrap().iterations
    });
    assert!(iterations.iter().all(|n| *n == serial[0]));
}

#[test_log::test]
fn test_run_model_idempotent() {
    let mut model = coupled_implicit_group(comp());
    model.setup(&Comm::serial()).unwrap();

    model.run_solve_nonlinear().unwrap();
    let first = outputs(&model, &["C1", "C2"], VectorKind::Outputs);
    model.run_solve_nonlinear().unwrap();
    let second = outputs(&model, &["C1", "C2"], VectorKind::Outputs);

    for (a, b) in first.iter().zip(&second) {
        assert_all_approx(a, b);
    }

    model.run_apply_nonlinear().unwrap();
    for values in outputs(&model, &["C1", "C2"], VectorKind::Residuals) {
        assert_all_approx(&values, &[0.0; 4]);
    }
}

#[rstest]
#[case(1, LinearMode::Fwd)]
#[case(1, LinearMode::Rev)]
#[case(2, LinearMode::Fwd)]
#[case(2, LinearMode::Rev)]
fn test_linear_block_gs(#[case] ranks: usize, #[case] mode: LinearMode) {
    let (rhs, solution) = match mode {
        LinearMode::Fwd => (VectorKind::DResiduals, VectorKind::DOutputs),
        LinearMode::Rev => (VectorKind::DOutputs, VectorKind::DResiduals),
    };
    run_on(ranks, |comm| {
        let mut model = coupled_implicit_group(comp());
        model.setup(&comm).unwrap();
        model.run_solve_nonlinear().unwrap();

        fill_outputs(&mut model, &["C1", "C2"], rhs, 1.0);
        let report = model.run_solve_linear(mode).unwrap();
        assert_eq!(report.solver, "LNBGS");
        assert_eq!(report.state, SolverState::Converged);

        for values in outputs(&model, &["C1", "C2"], solution) {
            assert_all_approx(&values, &comp().coupled_unit_response());
        }
        for values in outputs(&model, &["C1", "C2"], rhs) {
            assert_eq!(values, [1.0; 4]);
        }
    });
}

#[test]
fn test_apply_linear_reproduces_rhs() {
    let mut model = coupled_implicit_group(comp());
    model.setup(&Comm::serial()).unwrap();

    let response = comp().coupled_unit_response();
    for path in ["C1", "C2"] {
        for ((output, _, _), value) in COUPLINGS.iter().zip(response) {
            model
                .vector_mut(&format!("{path}.{output}"), VectorKind::DOutputs)
                .unwrap()[0] = value;
        }
    }
    model.run_apply_linear(LinearMode::Fwd).unwrap();
    for values in outputs(&model, &["C1", "C2"], VectorKind::DResiduals) {
        assert_all_approx(&values, &[1.0; 4]);
    }
}

#[rstest]
#[case::error(true)]
#[case::warning(false)]
fn test_nonlinear_non_convergence(#[case] err_on_non_converge: bool) {
    // Coupling coefficients above one make the fixed-point iteration diverge.
    let mut model = coupled_implicit_group(CoupledComp::new(1.0, BIAS));
    model.set_nonlinear_solver(NonlinearBlockGs::new(
        SolverOptions::default()
            .with_maxiter(5)
            .with_err_on_non_converge(err_on_non_converge),
    ));
    model.setup(&Comm::serial()).unwrap();

    match model.run_solve_nonlinear() {
        Err(Error::Convergence {
            solver,
            path,
            iterations,
            ..
        }) => {
            assert!(err_on_non_converge);
            assert_eq!(solver, "NLBGS");
            assert_eq!(path, "model");
            assert_eq!(iterations, 5);
        }
        Ok(report) => {
            assert!(!err_on_non_converge);
            assert_eq!(report.state, SolverState::MaxIter);
            assert_eq!(report.iterations, 5);
        }
        Err(err) => panic!("unexpected error: {err}"),
    }
}

#[test]
fn test_linear_non_convergence() {
    let mut model = coupled_implicit_group(CoupledComp::new(1.0, BIAS));
    model.set_linear_solver(LinearBlockGs::new(
        SolverOptions::default()
            .with_maxiter(3)
            .with_err_on_non_converge(true),
    ));
    model.setup(&Comm::serial()).unwrap();

    fill_outputs(&mut model, &["C1", "C2"], VectorKind::DResiduals, 1.0);
    assert!(matches!(
        model.run_solve_linear(LinearMode::Fwd),
        Err(Error::Convergence {
            solver: "LNBGS",
            iterations: 3,
            ..
        })
    ));
}

#[test_log::test]
fn test_relaxation() {
    let mut model = coupled_implicit_group(comp());
    model.set_nonlinear_solver(NonlinearBlockGs::new(
        coupled_solver_options()
            .with_maxiter(500)
            .with_relaxation(0.5),
    ));
    model.setup(&Comm::serial()).unwrap();

    let report = model.run_solve_nonlinear().unwrap();
    assert_eq!(report.state, SolverState::Converged);
    for values in outputs(&model, &["C1", "C2"], VectorKind::Outputs) {
        assert_all_approx(&values, &comp().coupled_solution());
    }
}

#[test_log::test]
fn test_nested_group_connections() {
    // Connections declared on the root between two components of `sub` are resolved by `sub`.
    let mut sub = Group::new();
    sub.add_subsystem("C1", Component::implicit(comp()))
        .add_subsystem("C2", Component::implicit(comp()))
        .set_nonlinear_solver(NonlinearBlockGs::new(coupled_solver_options()))
        .set_linear_solver(LinearBlockGs::new(coupled_solver_options()));

    let mut model = Group::new();
    model.add_subsystem("sub", sub);
    connect_coupled(&mut model, "sub.C1", "sub.C2");
    model.setup(&Comm::serial()).unwrap();

    model.run_solve_nonlinear().unwrap();
    for values in outputs(&model, &["sub.C1", "sub.C2"], VectorKind::Outputs) {
        assert_all_approx(&values, &comp().coupled_solution());
    }

    fill_outputs(&mut model, &["sub.C1", "sub.C2"], VectorKind::DOutputs, 1.0);
    model.run_solve_linear(LinearMode::Rev).unwrap();
    for values in outputs(&model, &["sub.C1", "sub.C2"], VectorKind::DResiduals) {
        assert_all_approx(&values, &comp().coupled_unit_response());
    }
}

/// `indep.x` feeding `F`.
fn faulty_model(faulty: FaultyComp) -> Group {
    let mut model = Group::new();
    model
        .add_subsystem(
            "indep",
            Component::explicit(IndepVarComp::new().with_output("x", VarSpec::scalar())),
        )
        .add_subsystem("F", Component::explicit(faulty))
        .connect("indep.x", "F.x");
    model
}

fn assert_failed_on_rank_1(fault: Fault, result: Result<(), Error>) {
    match (fault, result) {
        (Fault::Error, Err(Error::Compute { path, rank, message })) => {
            assert_eq!(path, "F");
            assert_eq!(rank, 1);
            assert_eq!(message, "injected failure");
        }
        (Fault::NotANumber, Err(Error::Numerical { path, variable, rank })) => {
            assert_eq!(path, "F");
            assert_eq!(variable, "y");
            assert_eq!(rank, 1);
        }
        (_, other) => panic!("unexpected outcome: {other:?}"),
    }
}

#[rstest]
#[case::compute_error(Fault::Error)]
#[case::not_a_number(Fault::NotANumber)]
fn test_failure_on_one_rank(#[case] fault: Fault) {
    let results = run_on(2, |comm| {
        let mut model = faulty_model(FaultyComp::new(1, fault));
        model.setup(&comm).unwrap();
        // The group stays usable: a second run fails the same way on every rank.
        let first = model.run_solve_nonlinear().map(drop);
        let second = model.run_solve_nonlinear().map(drop);
        (first, second)
    });

    // Every rank unwinds with the failure of rank 1.
    for (first, second) in results {
        assert_failed_on_rank_1(fault, first);
        assert_failed_on_rank_1(fault, second);
    }
}

#[rstest]
#[case::compute_error(Fault::Error)]
#[case::not_a_number(Fault::NotANumber)]
fn test_run_after_failure(#[case] fault: Fault) {
    let results = run_on(2, |comm| {
        let mut model = faulty_model(FaultyComp::new(1, fault).while_negative());
        model.setup(&comm).unwrap();

        model.set("indep.x", &[-1.0]).unwrap();
        let failed = model.run_solve_nonlinear().map(drop);

        model.set("indep.x", &[2.0]).unwrap();
        model.run_solve_nonlinear().unwrap();
        (failed, model.get("F.y").unwrap().to_vec())
    });

    for (failed, y) in results {
        assert_failed_on_rank_1(fault, failed);
        assert_eq!(y, vec![2.0]);
    }
}

/// `indep.x` and the coupled pair, unconnected.
fn unconnected() -> Group {
    let mut model = Group::new();
    model
        .add_subsystem(
            "indep",
            Component::explicit(IndepVarComp::new().with_output("x", VarSpec::scalar())),
        )
        .add_subsystem("C1", Component::implicit(comp()))
        .add_subsystem("C2", Component::implicit(comp()));
    model
}

#[rstest]
#[case::multiple_sources(
    |m: &mut Group| {
        m.connect("indep.x", "C2.a").connect("C1.w", "C2.a");
    },
    SetupError::MultipleSources {
        target: "C2.a".to_owned(),
        first: "indep.x".to_owned(),
        second: "C1.w".to_owned(),
    },
)]
#[case::self_connection(
    |m: &mut Group| {
        m.connect("C1.w", "C1.a");
    },
    SetupError::SelfConnection {
        output: "C1.w".to_owned(),
        input: "C1.a".to_owned(),
    },
)]
#[case::unresolved(
    |m: &mut Group| {
        m.connect("C1.nope", "C2.a");
    },
    SetupError::UnresolvedConnection("C1.nope".to_owned()),
)]
#[case::unknown_component(
    |m: &mut Group| {
        m.connect("C3.w", "C2.a");
    },
    SetupError::UnresolvedConnection("C3.w".to_owned()),
)]
#[case::not_an_output(
    |m: &mut Group| {
        m.connect("C1.a", "C2.a");
    },
    SetupError::NotAnOutput("C1.a".to_owned()),
)]
#[case::not_an_input(
    |m: &mut Group| {
        m.connect("C1.w", "C2.w");
    },
    SetupError::NotAnInput("C2.w".to_owned()),
)]
#[case::duplicate_subsystem(
    |m: &mut Group| {
        m.add_subsystem("C1", Component::implicit(comp()));
    },
    SetupError::DuplicateSubsystem {
        group: "model".to_owned(),
        name: "C1".to_owned(),
    },
)]
#[case::invalid_name(
    |m: &mut Group| {
        m.add_subsystem("a.b", Component::implicit(comp()));
    },
    SetupError::InvalidName("a.b".to_owned()),
)]
#[case::shape_mismatch(
    |m: &mut Group| {
        m.add_subsystem("A", Component::explicit(InOutArrayComp::new(3)))
            .add_subsystem("B", Component::explicit(InOutArrayComp::new(4)))
            .connect("A.outvec", "B.invec");
    },
    SetupError::ShapeMismatch {
        variable: "B.invec".to_owned(),
        expected: 3,
        found: 4,
    },
)]
#[case::src_index_out_of_range(
    |m: &mut Group| {
        m.add_subsystem("S", Component::explicit(SliceSumComp))
            .connect("indep.x", "S.x");
    },
    SetupError::SourceIndexOutOfRange {
        variable: "S.x".to_owned(),
        index: 1,
        len: 1,
    },
)]
#[case::invalid_solver_option(
    |m: &mut Group| {
        m.set_nonlinear_solver(NonlinearBlockGs::new(SolverOptions::default().with_maxiter(0)));
    },
    SetupError::InvalidOption {
        component: "NLBGS".to_owned(),
        message: "maxiter must be at least 1".to_owned(),
    },
)]
fn test_setup_errors(#[case] build: fn(&mut Group), #[case] expected: SetupError) {
    let mut model = unconnected();
    build(&mut model);
    match model.setup(&Comm::serial()) {
        Err(Error::Setup(err)) => assert_eq!(err, expected),
        other => panic!("expected {expected:?}, got {other:?}"),
    }
}

#[test]
fn test_topology_change_requires_setup() {
    let mut model = coupled_implicit_group(comp());
    assert!(matches!(
        model.run_solve_nonlinear(),
        Err(Error::Setup(SetupError::NotSetUp))
    ));

    model.setup(&Comm::serial()).unwrap();
    assert!(model.is_set_up());
    model.run_solve_nonlinear().unwrap();

    model.add_subsystem(
        "extra",
        Component::explicit(IndepVarComp::new().with_output("x", VarSpec::scalar())),
    );
    assert!(!model.is_set_up());
    assert!(matches!(
        model.run_apply_nonlinear(),
        Err(Error::Setup(SetupError::NotSetUp))
    ));

    model.setup(&Comm::serial()).unwrap();
    model.run_solve_nonlinear().unwrap();
    for values in outputs(&model, &["C1", "C2"], VectorKind::Outputs) {
        assert_all_approx(&values, &comp().coupled_solution());
    }
}

#[test]
fn test_variable_access() {
    let mut model = coupled_implicit_group(comp());
    model.setup(&Comm::serial()).unwrap();

    assert_eq!(model.get("C1.w").unwrap(), [1.0]);
    model.set("C1.a", &[2.5]).unwrap();
    assert_eq!(model.get("C1.a").unwrap(), [2.5]);

    assert!(matches!(
        model.get("C1.nope"),
        Err(Error::UnknownVariable(path)) if path == "C1.nope"
    ));
    assert!(matches!(
        model.set("C1.w", &[1.0, 2.0]),
        Err(Error::SizeMismatch {
            expected: 1,
            found: 2,
            ..
        })
    ));
}
