use crate::{
    group::{BlockSystem, TransferKind},
    vector::VectorKind,
    Error, SetupError,
};

use super::{Monitor, NonlinearSolver, SolveReport, SolverOptions};

/// Nonlinear block Gauss-Seidel.
///
/// Each sweep transfers inputs into every subsystem and solves it, in declaration order. The
/// norm of the group residuals is checked after every sweep.
#[derive(Clone, Debug, Default)]
pub struct NonlinearBlockGs {
    pub options: SolverOptions,
}

impl NonlinearBlockGs {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl NonlinearSolver for NonlinearBlockGs {
    fn name(&self) -> &'static str {
        "NLBGS"
    }

    fn validate(&self) -> Result<(), SetupError> {
        self.options.validate(self.name())
    }

    fn solve(&mut self, system: &mut BlockSystem) -> Result<SolveReport, Error> {
        self.validate()?;
        let path = system.path().to_owned();
        let mut monitor = Monitor::new(self.name(), &path, &self.options);

        system.apply_nonlinear()?;
        monitor.start(system.norm(VectorKind::Residuals)?);

        while monitor.is_iterating() {
            sweep(system, self.options.relaxation)?;
            system.apply_nonlinear()?;
            monitor.update(system.norm(VectorKind::Residuals)?);
        }
        monitor.finish()
    }
}

/// Solves each subsystem once, in order, without checking the residuals.
#[derive(Clone, Copy, Debug, Default)]
pub struct NonlinearRunOnce;

impl NonlinearSolver for NonlinearRunOnce {
    fn name(&self) -> &'static str {
        "NL: RUNONCE"
    }

    fn solve(&mut self, system: &mut BlockSystem) -> Result<SolveReport, Error> {
        sweep(system, 1.0)?;
        Ok(SolveReport::run_once(self.name()))
    }
}

fn sweep(system: &mut BlockSystem, relaxation: f64) -> Result<(), Error> {
    for child in 0..system.len() {
        system.transfer_in(child, TransferKind::Nonlinear)?;
        let old = (relaxation != 1.0).then(|| system.snapshot(child, VectorKind::Outputs));
        system.solve_nonlinear_child(child)?;
        if let Some(old) = old {
            system.relax(child, VectorKind::Outputs, &old, relaxation);
        }
    }
    Ok(())
}
