//! The `mdao` crate couples numerical components into hierarchical models and drives them to a
//! consistent state with block Gauss-Seidel solvers. Variables may be partitioned across the ranks
//! of a communicator; the data transfers between components are resolved once at setup and work
//! the same whatever the partitioning.
//!
//! ## Examples
//!
//! ### A distributed consumer of a replicated array
//!
//! ```rust
//! use mdao::{
//!     Component, ComponentOptions, ComputeResult, Declarations, ExplicitComponent, Group,
//!     SetupError, VarSpec, Vector,
//! };
//! use mdao::dist::{partition::evenly_distrib_idxs, Comm};
//!
//! /// Doubles the slice of `x` held by this rank.
//! struct Double(usize);
//!
//! impl ExplicitComponent for Double {
//!     fn options(&self) -> ComponentOptions {
//!         ComponentOptions::distributed()
//!     }
//!
//!     fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
//!         let (sizes, offsets) = evenly_distrib_idxs(decl.comm().size(), self.0);
//!         let rank = decl.comm().rank();
//!         let start = offsets[rank] as i64;
//!         let indices = start..start + sizes[rank] as i64;
//!         decl.add_input("x", VarSpec::vector(sizes[rank]).with_src_indices(indices))?;
//!         decl.add_output("y", VarSpec::vector(sizes[rank]))
//!     }
//!
//!     fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
//!         for (y, x) in outputs["y"].iter_mut().zip(&inputs["x"]) {
//!             *y = 2.0 * x;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut model = Group::new();
//! model
//!     .add_subsystem("src", Component::explicit(mdao::IndepVarComp::new().with_output(
//!         "x",
//!         VarSpec::vector(4).with_val([1.0, 2.0, 3.0, 4.0]),
//!     )))
//!     .add_subsystem("double", Component::explicit(Double(4)))
//!     .connect("src.x", "double.x");
//!
//! // Without a distributed backend the component falls back to replicated storage.
//! let report = model.setup(&Comm::serial()).unwrap();
//! assert_eq!(report.diagnostics.len(), 1);
//!
//! model.run_solve_nonlinear().unwrap();
//! assert_eq!(model.get("double.y").unwrap(), &[2.0, 4.0, 6.0, 8.0]);
//! ```
#![doc = document_features::document_features!()]
#![deny(clippy::all)]

pub mod component;
pub mod diagnostics;
pub mod group;
mod indep_var;
pub mod solver;
pub mod transfer;
pub mod variable;
pub mod vector;

pub use component::{
    Component, ComponentOptions, ComputeError, ComputeResult, ExplicitComponent,
    ImplicitComponent,
};
pub use diagnostics::{Diagnostic, SetupReport};
pub use group::{BlockSystem, Group, System, TransferKind};
pub use indep_var::IndepVarComp;
pub use solver::{
    LinearBlockGs, LinearRunOnce, LinearSolver, NonlinearBlockGs, NonlinearRunOnce,
    NonlinearSolver, SolveReport, SolverOptions, SolverState,
};
pub use variable::{Declarations, Role, VarSpec};
pub use vector::{VarId, Vector, VectorKind};

pub use mdao_dist as dist;

/// Direction of a linear solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinearMode {
    /// Propagate perturbations from inputs to outputs.
    Fwd,
    /// Propagate sensitivities from outputs back to inputs.
    Rev,
}

/// Malformed models, detected while setting up.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    #[error("Variable '{name}' is declared more than once in component '{component}'")]
    DuplicateVariable { component: String, name: String },

    #[error("Subsystem '{name}' is added more than once to group '{group}'")]
    DuplicateSubsystem { group: String, name: String },

    #[error("Invalid name '{0}': names must be non-empty and may not contain '.'")]
    InvalidName(String),

    #[error("Shape mismatch for '{variable}': expected {expected} entries, found {found}")]
    ShapeMismatch {
        variable: String,
        expected: usize,
        found: usize,
    },

    #[error("Source index {index} of '{variable}' is out of range for a source of length {len}")]
    SourceIndexOutOfRange {
        variable: String,
        index: i64,
        len: usize,
    },

    #[error("Output '{0}' cannot declare source indices")]
    SourceIndicesOnOutput(String),

    #[error("Connection endpoint '{0}' does not exist")]
    UnresolvedConnection(String),

    #[error("Connection source '{0}' is not an output")]
    NotAnOutput(String),

    #[error("Connection target '{0}' is not an input")]
    NotAnInput(String),

    #[error("Input '{target}' is connected to both '{first}' and '{second}'")]
    MultipleSources {
        target: String,
        first: String,
        second: String,
    },

    #[error("Cannot connect '{output}' to '{input}' within the same component")]
    SelfConnection { output: String, input: String },

    #[error("Invalid option for '{component}': {message}")]
    InvalidOption { component: String, message: String },

    #[error("Ranks disagree on the declarations of '{0}'")]
    InconsistentDeclaration(String),

    #[error("The model has not been set up since its topology last changed")]
    NotSetUp,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Comm(#[from] mdao_dist::CommError),

    #[error("Component '{path}' failed on rank {rank}: {message}")]
    Compute {
        path: String,
        rank: usize,
        message: String,
    },

    #[error("Component '{path}' produced a non-finite value in '{variable}' on rank {rank}")]
    Numerical {
        path: String,
        variable: String,
        rank: usize,
    },

    #[error(
        "Solver {solver} in '{path}' failed to converge after {iterations} iterations \
         (abs = {abs:e}, rel = {rel:e})"
    )]
    Convergence {
        solver: &'static str,
        path: String,
        iterations: usize,
        abs: f64,
        rel: f64,
    },

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Expected {expected} values for '{variable}', found {found}")]
    SizeMismatch {
        variable: String,
        expected: usize,
        found: usize,
    },
}
