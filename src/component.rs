//! Leaf systems: the traits user code implements and the wrapper that owns their vectors.

use std::sync::Arc;

use mdao_dist::{Comm, CommError};

use crate::{
    diagnostics::{self, Diagnostic},
    variable::{Declarations, Role, VarMeta},
    vector::{Layout, Vector, VectorKind},
    Error, LinearMode, SetupError,
};

/// Failure reported by user code.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ComputeError {
    message: String,
}

impl ComputeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<CommError> for ComputeError {
    fn from(err: CommError) -> Self {
        Self::new(err.to_string())
    }
}

pub type ComputeResult = Result<(), ComputeError>;

/// Per-component process allocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComponentOptions {
    /// Partition the component's variables across the ranks it runs on.
    pub distributed: bool,
    /// Run on at most this many ranks of the parent communicator.
    pub max_procs: Option<usize>,
    /// Set when `distributed` came from the deprecated property.
    distributed_property: bool,
}

impl ComponentOptions {
    pub fn distributed() -> Self {
        Self {
            distributed: true,
            ..Self::default()
        }
    }

    /// The `distributed` property of older releases. Setup translates it into the `distributed`
    /// option and reports a [`Diagnostic::DeprecatedOption`].
    #[deprecated(note = "use `ComponentOptions::distributed` instead")]
    pub fn with_distributed_property(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self.distributed_property = true;
        self
    }

    pub fn with_max_procs(mut self, max_procs: usize) -> Self {
        self.max_procs = Some(max_procs);
        self
    }

    fn validate(&self, path: &str) -> Result<(), SetupError> {
        match self.max_procs {
            Some(0) => Err(SetupError::InvalidOption {
                component: path.to_owned(),
                message: "max_procs must be at least 1".to_owned(),
            }),
            _ => Ok(()),
        }
    }
}

/// A component whose outputs are explicit functions of its inputs.
///
/// Its residual is `R(u) = u - f(inputs)`.
pub trait ExplicitComponent: Send {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::default()
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError>;

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult;

    /// Jacobian-vector product of `f`.
    ///
    /// In forward mode add `J * d_inputs` to `d_outputs`; in reverse mode add
    /// `J^T * d_outputs` to `d_inputs`.
    fn compute_jacvec_product(
        &self,
        _inputs: &Vector,
        _d_inputs: &mut Vector,
        _d_outputs: &mut Vector,
        _mode: LinearMode,
    ) -> ComputeResult {
        Err(ComputeError::new("compute_jacvec_product is not implemented"))
    }
}

/// A component defined by its residuals.
pub trait ImplicitComponent: Send {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::default()
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError>;

    fn apply_nonlinear(&self, inputs: &Vector, outputs: &Vector, residuals: &mut Vector)
        -> ComputeResult;

    /// Drive the residuals to zero. Returning `None` takes a single Newton step through
    /// [`ImplicitComponent::solve_linear`].
    fn solve_nonlinear(&self, _inputs: &Vector, _outputs: &mut Vector) -> Option<ComputeResult> {
        None
    }

    /// Jacobian-vector product of the residuals.
    ///
    /// In forward mode compute `d_residuals` from `d_inputs` and `d_outputs`; in reverse mode
    /// compute `d_inputs` and `d_outputs` from `d_residuals`. Outgoing vectors arrive zeroed.
    fn apply_linear(
        &self,
        inputs: &Vector,
        outputs: &Vector,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        d_residuals: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult;

    /// Invert the residual Jacobian. In forward mode solve for `d_outputs` given `d_residuals`,
    /// in reverse mode the other way around.
    fn solve_linear(
        &self,
        d_outputs: &mut Vector,
        d_residuals: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult;
}

enum Kind {
    Explicit(Box<dyn ExplicitComponent>),
    Implicit(Box<dyn ImplicitComponent>),
}

impl Kind {
    fn options(&self) -> ComponentOptions {
        match self {
            Kind::Explicit(c) => c.options(),
            Kind::Implicit(c) => c.options(),
        }
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        match self {
            Kind::Explicit(c) => c.setup(decl),
            Kind::Implicit(c) => c.setup(decl),
        }
    }
}

#[derive(Debug, Default)]
struct Vectors {
    inputs: Vector,
    outputs: Vector,
    residuals: Vector,
    d_inputs: Vector,
    d_outputs: Vector,
    d_residuals: Vector,
    scratch_outputs: Vector,
    scratch_residuals: Vector,
}

impl Vectors {
    fn allocate(vars: &[VarMeta]) -> Self {
        let layout = |role| {
            Arc::new(Layout::new(
                vars.iter()
                    .filter(|var| var.role == role)
                    .map(|var| (var.name.as_str(), var.size())),
            ))
        };
        let inputs_layout = layout(Role::Input);
        let outputs_layout = layout(Role::Output);

        let initial = |layout: &Arc<Layout>| {
            let mut vector = Vector::zeros(layout.clone());
            for var in vars {
                if let Some(slot) = vector.get_mut(&var.name) {
                    slot.copy_from_slice(&var.initial);
                }
            }
            vector
        };

        Self {
            inputs: initial(&inputs_layout),
            outputs: initial(&outputs_layout),
            residuals: Vector::zeros(outputs_layout.clone()),
            d_inputs: Vector::zeros(inputs_layout),
            d_outputs: Vector::zeros(outputs_layout.clone()),
            d_residuals: Vector::zeros(outputs_layout.clone()),
            scratch_outputs: Vector::zeros(outputs_layout.clone()),
            scratch_residuals: Vector::zeros(outputs_layout),
        }
    }

    fn get(&self, kind: VectorKind) -> &Vector {
        match kind {
            VectorKind::Inputs => &self.inputs,
            VectorKind::Outputs => &self.outputs,
            VectorKind::Residuals => &self.residuals,
            VectorKind::DInputs => &self.d_inputs,
            VectorKind::DOutputs => &self.d_outputs,
            VectorKind::DResiduals => &self.d_residuals,
        }
    }

    fn get_mut(&mut self, kind: VectorKind) -> &mut Vector {
        match kind {
            VectorKind::Inputs => &mut self.inputs,
            VectorKind::Outputs => &mut self.outputs,
            VectorKind::Residuals => &mut self.residuals,
            VectorKind::DInputs => &mut self.d_inputs,
            VectorKind::DOutputs => &mut self.d_outputs,
            VectorKind::DResiduals => &mut self.d_residuals,
        }
    }
}

/// Local outcome of a leaf evaluation, before ranks agree on it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Failure {
    Compute(String),
    NonFinite(String),
}

impl Failure {
    pub(crate) fn into_error(self, path: &str, rank: usize) -> Error {
        match self {
            Failure::Compute(message) => Error::Compute {
                path: path.to_owned(),
                rank,
                message,
            },
            Failure::NonFinite(variable) => Error::Numerical {
                path: path.to_owned(),
                variable,
                rank,
            },
        }
    }
}

impl From<ComputeError> for Failure {
    fn from(err: ComputeError) -> Self {
        Failure::Compute(err.message)
    }
}

/// A leaf of the model hierarchy.
pub struct Component {
    kind: Kind,
    path: String,
    comm: Option<Comm>,
    distributed: bool,
    vars: Vec<VarMeta>,
    vectors: Vectors,
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("path", &self.path)
            .field("active", &self.is_active())
            .field("distributed", &self.distributed)
            .finish()
    }
}

impl Component {
    pub fn explicit(component: impl ExplicitComponent + 'static) -> Self {
        Self::new(Kind::Explicit(Box::new(component)))
    }

    pub fn implicit(component: impl ImplicitComponent + 'static) -> Self {
        Self::new(Kind::Implicit(Box::new(component)))
    }

    fn new(kind: Kind) -> Self {
        Self {
            kind,
            path: String::new(),
            comm: None,
            distributed: false,
            vars: Vec::new(),
            vectors: Vectors::default(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The communicator this component runs on, `None` where it is not active.
    pub fn comm(&self) -> Option<&Comm> {
        self.comm.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.comm.is_some()
    }

    /// Whether the variables are actually partitioned across ranks.
    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn vector(&self, kind: VectorKind) -> &Vector {
        self.vectors.get(kind)
    }

    pub fn vector_mut(&mut self, kind: VectorKind) -> &mut Vector {
        self.vectors.get_mut(kind)
    }

    pub(crate) fn meta(&self, name: &str) -> Option<&VarMeta> {
        self.vars.iter().find(|var| var.name == name)
    }

    /// Whether this rank's values count towards global norms. Replicated data is only counted on
    /// the first rank of the component.
    pub(crate) fn owns_norm(&self) -> bool {
        self.comm
            .as_ref()
            .is_some_and(|comm| self.distributed || comm.rank() == 0)
    }

    /// Allocate the component on `parent` and collect its declarations from every rank.
    pub(crate) fn setup(
        &mut self,
        path: String,
        parent: &Comm,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<(), Error> {
        self.path = path;
        let options = self.kind.options();
        options.validate(&self.path)?;

        let active = options.max_procs.map_or(true, |n| parent.rank() < n);
        self.comm = parent.split(active.then_some(0))?;

        if options.distributed_property {
            let diagnostic = Diagnostic::DeprecatedOption {
                component: self.path.clone(),
                option: "distributed".to_owned(),
            };
            diagnostics::warn_once(&diagnostic);
            diagnostics.push(diagnostic);
        }

        self.distributed = options.distributed && parent.is_distributed();
        if options.distributed && !parent.is_distributed() {
            let diagnostic = Diagnostic::DistributedFallback {
                component: self.path.clone(),
            };
            diagnostics::warn_once(&diagnostic);
            diagnostics.push(diagnostic);
        }

        let local = match &self.comm {
            Some(comm) => {
                let mut decl = Declarations::new(comm, &self.path, self.distributed);
                Some(self.kind.setup(&mut decl).map(|_| decl.finish()))
            }
            None => None,
        };

        // Every rank learns the declared names, including ranks where the component is idle.
        let summary = local.as_ref().map(|outcome| match outcome {
            Ok(vars) => Ok(vars
                .iter()
                .map(|var| (var.name.clone(), var.role))
                .collect::<Vec<_>>()),
            Err(err) => Err(err.clone()),
        });
        let summaries = parent.all_gather(summary)?;
        if let Some(err) = summaries.iter().flatten().find_map(|s| s.as_ref().err()) {
            return Err(err.clone().into());
        }
        let mut declared = summaries.into_iter().flatten().flatten();
        let names = declared.next().unwrap_or_default();
        if declared.any(|other| other != names) {
            return Err(SetupError::InconsistentDeclaration(self.path.clone()).into());
        }

        self.vars = match local {
            Some(Ok(vars)) => vars,
            _ => names
                .into_iter()
                .map(|(name, role)| VarMeta::inactive(name, role))
                .collect(),
        };
        self.vectors = Vectors::allocate(&self.vars);

        log::debug!(
            "Set up {} on {} rank(s){}",
            self.path,
            self.comm.as_ref().map_or(0, Comm::size),
            if self.distributed { ", distributed" } else { "" }
        );
        Ok(())
    }

    /// Bring the outputs in line with the current inputs.
    pub(crate) fn solve_nonlinear(&mut self) -> Result<(), Failure> {
        if !self.is_active() {
            return Ok(());
        }
        let v = &mut self.vectors;
        match &self.kind {
            Kind::Explicit(c) => c.compute(&v.inputs, &mut v.outputs)?,
            Kind::Implicit(c) => match c.solve_nonlinear(&v.inputs, &mut v.outputs) {
                Some(result) => result?,
                None => {
                    // Newton step: u -= (dR/du)^-1 R(u)
                    c.apply_nonlinear(&v.inputs, &v.outputs, &mut v.residuals)?;
                    v.scratch_residuals.copy_from(&v.residuals);
                    v.scratch_outputs.fill(0.0);
                    c.solve_linear(
                        &mut v.scratch_outputs,
                        &mut v.scratch_residuals,
                        LinearMode::Fwd,
                    )?;
                    v.outputs
                        .as_mut_slice()
                        .iter_mut()
                        .zip(v.scratch_outputs.as_slice())
                        .for_each(|(u, du)| *u -= du);
                }
            },
        }
        self.check_finite(VectorKind::Outputs)
    }

    pub(crate) fn apply_nonlinear(&mut self) -> Result<(), Failure> {
        if !self.is_active() {
            return Ok(());
        }
        let v = &mut self.vectors;
        match &self.kind {
            Kind::Explicit(c) => {
                v.scratch_outputs.copy_from(&v.outputs);
                c.compute(&v.inputs, &mut v.scratch_outputs)?;
                v.residuals
                    .as_mut_slice()
                    .iter_mut()
                    .zip(v.outputs.as_slice().iter().zip(v.scratch_outputs.as_slice()))
                    .for_each(|(r, (u, f))| *r = u - f);
            }
            Kind::Implicit(c) => c.apply_nonlinear(&v.inputs, &v.outputs, &mut v.residuals)?,
        }
        self.check_finite(VectorKind::Residuals)
    }

    /// Forward: `d_residuals = dR/du * d_outputs + dR/dx * d_inputs`.
    /// Reverse: `d_outputs = (dR/du)^T * d_residuals`, `d_inputs = (dR/dx)^T * d_residuals`.
    pub(crate) fn apply_linear(&mut self, mode: LinearMode) -> Result<(), Failure> {
        if !self.is_active() {
            return Ok(());
        }
        let v = &mut self.vectors;
        match (&self.kind, mode) {
            (Kind::Explicit(c), LinearMode::Fwd) => {
                v.scratch_outputs.fill(0.0);
                c.compute_jacvec_product(
                    &v.inputs,
                    &mut v.d_inputs,
                    &mut v.scratch_outputs,
                    mode,
                )?;
                v.d_residuals
                    .as_mut_slice()
                    .iter_mut()
                    .zip(v.d_outputs.as_slice().iter().zip(v.scratch_outputs.as_slice()))
                    .for_each(|(r, (du, jdx))| *r = du - jdx);
            }
            (Kind::Explicit(c), LinearMode::Rev) => {
                v.scratch_outputs.copy_from(&v.d_residuals);
                v.d_inputs.fill(0.0);
                c.compute_jacvec_product(
                    &v.inputs,
                    &mut v.d_inputs,
                    &mut v.scratch_outputs,
                    mode,
                )?;
                v.d_inputs.scale(-1.0);
                v.d_outputs.copy_from(&v.d_residuals);
            }
            (Kind::Implicit(c), LinearMode::Fwd) => {
                v.d_residuals.fill(0.0);
                c.apply_linear(
                    &v.inputs,
                    &v.outputs,
                    &mut v.d_inputs,
                    &mut v.d_outputs,
                    &mut v.d_residuals,
                    mode,
                )?;
            }
            (Kind::Implicit(c), LinearMode::Rev) => {
                v.d_inputs.fill(0.0);
                v.d_outputs.fill(0.0);
                c.apply_linear(
                    &v.inputs,
                    &v.outputs,
                    &mut v.d_inputs,
                    &mut v.d_outputs,
                    &mut v.d_residuals,
                    mode,
                )?;
            }
        }
        match mode {
            LinearMode::Fwd => self.check_finite(VectorKind::DResiduals),
            LinearMode::Rev => self
                .check_finite(VectorKind::DOutputs)
                .and_then(|_| self.check_finite(VectorKind::DInputs)),
        }
    }

    pub(crate) fn solve_linear(&mut self, mode: LinearMode) -> Result<(), Failure> {
        if !self.is_active() {
            return Ok(());
        }
        let v = &mut self.vectors;
        match (&self.kind, mode) {
            (Kind::Explicit(_), LinearMode::Fwd) => v.d_outputs.copy_from(&v.d_residuals),
            (Kind::Explicit(_), LinearMode::Rev) => v.d_residuals.copy_from(&v.d_outputs),
            (Kind::Implicit(c), _) => c.solve_linear(&mut v.d_outputs, &mut v.d_residuals, mode)?,
        }
        match mode {
            LinearMode::Fwd => self.check_finite(VectorKind::DOutputs),
            LinearMode::Rev => self.check_finite(VectorKind::DResiduals),
        }
    }

    fn check_finite(&self, kind: VectorKind) -> Result<(), Failure> {
        match self.vectors.get(kind).first_non_finite() {
            Some(name) => Err(Failure::NonFinite(name.to_owned())),
            None => Ok(()),
        }
    }
}
