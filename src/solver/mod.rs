//! Solvers attached to groups.
//!
//! A group owns one [`NonlinearSolver`] and one [`LinearSolver`]. Both operate on the group's
//! [`BlockSystem`], visiting its subsystems in declaration order.

use crate::{group::BlockSystem, Error, LinearMode, SetupError};

mod linear_block_gs;
mod nonlinear_block_gs;

pub use linear_block_gs::{LinearBlockGs, LinearRunOnce};
pub use nonlinear_block_gs::{NonlinearBlockGs, NonlinearRunOnce};

pub trait NonlinearSolver: Send {
    fn name(&self) -> &'static str;

    /// Check the configuration before the solver is used.
    fn validate(&self) -> Result<(), SetupError> {
        Ok(())
    }

    /// Drive the residuals of `system` to zero.
    fn solve(&mut self, system: &mut BlockSystem) -> Result<SolveReport, Error>;
}

pub trait LinearSolver: Send {
    fn name(&self) -> &'static str;

    fn validate(&self) -> Result<(), SetupError> {
        Ok(())
    }

    /// Solve the linear system of `system` for the right-hand side held in its derivative
    /// vectors: `d_residuals` in forward mode, `d_outputs` in reverse mode. The solution is written
    /// to the other vector and the right-hand side is left untouched.
    fn solve(&mut self, system: &mut BlockSystem, mode: LinearMode) -> Result<SolveReport, Error>;
}

/// Iteration controls shared by the iterative solvers.
#[derive(Clone, Debug, PartialEq)]
pub struct SolverOptions {
    /// Maximum number of sweeps.
    pub maxiter: usize,
    /// Absolute residual norm below which the solver has converged.
    pub atol: f64,
    /// Residual norm, relative to the initial one, below which the solver has converged.
    pub rtol: f64,
    /// Report non-convergence as an [`Error::Convergence`] instead of a warning.
    pub err_on_non_converge: bool,
    /// Fraction of each sweep's update that is applied, in `(0, 1]`.
    pub relaxation: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            maxiter: 10,
            atol: 1e-10,
            rtol: 1e-10,
            err_on_non_converge: false,
            relaxation: 1.0,
        }
    }
}

impl SolverOptions {
    pub fn with_maxiter(mut self, maxiter: usize) -> Self {
        self.maxiter = maxiter;
        self
    }

    pub fn with_atol(mut self, atol: f64) -> Self {
        self.atol = atol;
        self
    }

    pub fn with_rtol(mut self, rtol: f64) -> Self {
        self.rtol = rtol;
        self
    }

    pub fn with_err_on_non_converge(mut self, err_on_non_converge: bool) -> Self {
        self.err_on_non_converge = err_on_non_converge;
        self
    }

    pub fn with_relaxation(mut self, relaxation: f64) -> Self {
        self.relaxation = relaxation;
        self
    }

    pub fn validate(&self, solver: &str) -> Result<(), SetupError> {
        let invalid = |message: &str| SetupError::InvalidOption {
            component: solver.to_owned(),
            message: message.to_owned(),
        };
        if self.maxiter == 0 {
            return Err(invalid("maxiter must be at least 1"));
        }
        if !(self.atol.is_finite() && self.atol >= 0.0) {
            return Err(invalid("atol must be finite and non-negative"));
        }
        if !(self.rtol.is_finite() && self.rtol >= 0.0) {
            return Err(invalid("rtol must be finite and non-negative"));
        }
        if !(self.relaxation > 0.0 && self.relaxation <= 1.0) {
            return Err(invalid("relaxation must be in (0, 1]"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverState {
    Init,
    Iterating,
    Converged,
    /// The residual norm became non-finite.
    Diverged,
    MaxIter,
}

/// Outcome of a solve.
#[derive(Clone, Debug, PartialEq)]
pub struct SolveReport {
    pub solver: &'static str,
    pub iterations: usize,
    /// Final absolute residual norm; `None` for solvers that don't measure it.
    pub abs_norm: Option<f64>,
    pub rel_norm: Option<f64>,
    pub state: SolverState,
}

impl SolveReport {
    /// Report of a solver that runs a single sweep without measuring residuals.
    pub(crate) fn run_once(solver: &'static str) -> Self {
        Self {
            solver,
            iterations: 1,
            abs_norm: None,
            rel_norm: None,
            state: SolverState::Converged,
        }
    }
}

/// Convergence bookkeeping of an iterative solve.
pub(crate) struct Monitor<'a> {
    solver: &'static str,
    path: &'a str,
    options: &'a SolverOptions,
    norm0: f64,
    abs: f64,
    rel: f64,
    iterations: usize,
    state: SolverState,
}

impl<'a> Monitor<'a> {
    pub fn new(solver: &'static str, path: &'a str, options: &'a SolverOptions) -> Self {
        Self {
            solver,
            path,
            options,
            norm0: 0.0,
            abs: 0.0,
            rel: 0.0,
            iterations: 0,
            state: SolverState::Init,
        }
    }

    /// Record the norm before the first sweep.
    pub fn start(&mut self, norm0: f64) {
        self.norm0 = if norm0 == 0.0 { 1.0 } else { norm0 };
        self.abs = norm0;
        self.rel = norm0 / self.norm0;
        log::debug!("{} {} 0 ; {:e} {:e}", self.path, self.solver, self.abs, self.rel);
        self.state = if !norm0.is_finite() {
            SolverState::Diverged
        } else if norm0 < self.options.atol {
            SolverState::Converged
        } else {
            SolverState::Iterating
        };
    }

    pub fn is_iterating(&self) -> bool {
        self.state == SolverState::Iterating
    }

    /// Record the norm after a sweep.
    pub fn update(&mut self, norm: f64) {
        self.iterations += 1;
        self.abs = norm;
        self.rel = norm / self.norm0;
        log::debug!(
            "{} {} {} ; {:e} {:e}",
            self.path,
            self.solver,
            self.iterations,
            self.abs,
            self.rel
        );
        self.state = if !norm.is_finite() {
            SolverState::Diverged
        } else if self.abs < self.options.atol || self.rel < self.options.rtol {
            SolverState::Converged
        } else if self.iterations >= self.options.maxiter {
            SolverState::MaxIter
        } else {
            SolverState::Iterating
        };
    }

    pub fn finish(self) -> Result<SolveReport, Error> {
        let report = SolveReport {
            solver: self.solver,
            iterations: self.iterations,
            abs_norm: Some(self.abs),
            rel_norm: Some(self.rel),
            state: self.state,
        };
        match self.state {
            SolverState::Converged => {
                log::info!(
                    "{} {} converged in {} iterations",
                    self.path,
                    self.solver,
                    self.iterations
                );
                Ok(report)
            }
            _ if self.options.err_on_non_converge => Err(Error::Convergence {
                solver: self.solver,
                path: self.path.to_owned(),
                iterations: self.iterations,
                abs: self.abs,
                rel: self.rel,
            }),
            _ => {
                log::warn!(
                    "{} {} failed to converge in {} iterations ({:?})",
                    self.path,
                    self.solver,
                    self.iterations,
                    self.state
                );
                Ok(report)
            }
        }
    }
}
