use crate::{
    group::{BlockSystem, TransferKind},
    vector::VectorKind,
    Error, LinearMode, SetupError,
};

use super::{LinearSolver, Monitor, SolveReport, SolverOptions};

/// Linear block Gauss-Seidel.
///
/// Forward mode visits the subsystems in declaration order, reverse mode in the opposite order.
/// Each visit solves the subsystem for the right-hand side minus the contributions of the other
/// subsystems, and updates its part of the solution by the relaxed increment.
#[derive(Clone, Debug, Default)]
pub struct LinearBlockGs {
    pub options: SolverOptions,
}

impl LinearBlockGs {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl LinearSolver for LinearBlockGs {
    fn name(&self) -> &'static str {
        "LNBGS"
    }

    fn validate(&self) -> Result<(), SetupError> {
        self.options.validate(self.name())
    }

    fn solve(&mut self, system: &mut BlockSystem, mode: LinearMode) -> Result<SolveReport, Error> {
        self.validate()?;
        let rhs = Rhs::save(system, mode);

        let path = system.path().to_owned();
        let mut monitor = Monitor::new(self.name(), &path, &self.options);
        let result = (|| -> Result<(), Error> {
            monitor.start(residual_norm(system, &rhs)?);
            while monitor.is_iterating() {
                sweep(system, &rhs, self.options.relaxation)?;
                monitor.update(residual_norm(system, &rhs)?);
            }
            Ok(())
        })();

        rhs.restore(system);
        result.and_then(|_| monitor.finish())
    }
}

/// Sweeps each subsystem once, without checking the residuals.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearRunOnce;

impl LinearSolver for LinearRunOnce {
    fn name(&self) -> &'static str {
        "LN: RUNONCE"
    }

    fn solve(&mut self, system: &mut BlockSystem, mode: LinearMode) -> Result<SolveReport, Error> {
        let rhs = Rhs::save(system, mode);
        let result = sweep(system, &rhs, 1.0);
        rhs.restore(system);
        result.map(|_| SolveReport::run_once(self.name()))
    }
}

/// The right-hand side of a linear solve, saved per subsystem.
struct Rhs {
    mode: LinearMode,
    values: Vec<Vec<f64>>,
}

impl Rhs {
    /// Save the right-hand side and zero the solution vector.
    fn save(system: &mut BlockSystem, mode: LinearMode) -> Self {
        let rhs = Self {
            mode,
            values: (0..system.len())
                .map(|child| system.snapshot(child, Self::rhs_kind(mode)))
                .collect(),
        };
        for child in 0..system.len() {
            system.fill(child, Self::solution_kind(mode), 0.0);
        }
        rhs
    }

    fn restore(&self, system: &mut BlockSystem) {
        for (child, values) in self.values.iter().enumerate() {
            system.restore(child, self.kind(), values);
        }
    }

    fn kind(&self) -> VectorKind {
        Self::rhs_kind(self.mode)
    }

    fn rhs_kind(mode: LinearMode) -> VectorKind {
        match mode {
            LinearMode::Fwd => VectorKind::DResiduals,
            LinearMode::Rev => VectorKind::DOutputs,
        }
    }

    fn solution_kind(mode: LinearMode) -> VectorKind {
        match mode {
            LinearMode::Fwd => VectorKind::DOutputs,
            LinearMode::Rev => VectorKind::DResiduals,
        }
    }
}

/// `|b - A x|` over the whole group. Leaves the residual in the right-hand side vector.
fn residual_norm(system: &mut BlockSystem, rhs: &Rhs) -> Result<f64, Error> {
    system.apply_linear(rhs.mode)?;
    for (child, b) in rhs.values.iter().enumerate() {
        system.subtract_from(child, rhs.kind(), b);
    }
    system.norm(rhs.kind())
}

fn sweep(system: &mut BlockSystem, rhs: &Rhs, relaxation: f64) -> Result<(), Error> {
    let solution = Rhs::solution_kind(rhs.mode);
    let visit = |system: &mut BlockSystem, child: usize| -> Result<(), Error> {
        system.subtract_from(child, rhs.kind(), &rhs.values[child]);
        let old = system.snapshot(child, solution);
        system.fill(child, solution, 0.0);
        system.solve_linear_child(child, rhs.mode)?;
        system.apply_increment(child, solution, &old, relaxation);
        Ok(())
    };

    match rhs.mode {
        LinearMode::Fwd => {
            for child in 0..system.len() {
                system.transfer_in(child, TransferKind::Linear)?;
                system.apply_linear_child(child, LinearMode::Fwd)?;
                visit(system, child)?;
            }
        }
        LinearMode::Rev => {
            for child in (0..system.len()).rev() {
                system.apply_linear_child(child, LinearMode::Rev)?;
                system.transfer_rev_into(child)?;
                visit(system, child)?;
                // Refresh d_inputs for the subsystems upstream.
                system.apply_linear_child(child, LinearMode::Rev)?;
            }
        }
    }
    Ok(())
}
