//! Variable declarations made by components during setup.

use mdao_dist::Comm;

use crate::SetupError;

/// Whether a variable is read or computed by its component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Input,
    Output,
}

/// Declaration of a single input or output.
///
/// ```rust
/// # use mdao::VarSpec;
/// let spec = VarSpec::vector(3).with_val([1.0, 2.0, 3.0]).with_src_indices([0, 2, -1]);
/// assert_eq!(spec.size(), 3);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct VarSpec {
    shape: Vec<usize>,
    val: Option<Vec<f64>>,
    fill: f64,
    src_indices: Option<Vec<i64>>,
}

impl VarSpec {
    pub fn scalar() -> Self {
        Self::shape([1])
    }

    pub fn vector(len: usize) -> Self {
        Self::shape([len])
    }

    pub fn shape(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
            val: None,
            fill: 1.0,
            src_indices: None,
        }
    }

    /// Initial value, in row-major order.
    pub fn with_val(mut self, val: impl Into<Vec<f64>>) -> Self {
        self.val = Some(val.into());
        self
    }

    /// Initial value for every entry. Defaults to `1.0`.
    pub fn with_fill(mut self, value: f64) -> Self {
        self.fill = value;
        self
    }

    /// Entries of the connected source this input reads. Negative indices count from the end of
    /// the global source.
    pub fn with_src_indices(mut self, indices: impl IntoIterator<Item = i64>) -> Self {
        self.src_indices = Some(indices.into_iter().collect());
        self
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Resolved metadata of a declared variable, as held by one rank.
#[derive(Clone, Debug, PartialEq)]
pub struct VarMeta {
    pub name: String,
    pub role: Role,
    pub shape: Vec<usize>,
    pub src_indices: Option<Vec<i64>>,
    pub initial: Vec<f64>,
}

impl VarMeta {
    /// Placeholder for a variable of a component that is not active on this rank.
    pub(crate) fn inactive(name: String, role: Role) -> Self {
        Self {
            name,
            role,
            shape: vec![0],
            src_indices: None,
            initial: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.initial.len()
    }
}

/// Collects the variables a component declares in its `setup`.
#[derive(Debug)]
pub struct Declarations<'a> {
    comm: &'a Comm,
    path: &'a str,
    distributed: bool,
    vars: Vec<VarMeta>,
}

impl<'a> Declarations<'a> {
    pub(crate) fn new(comm: &'a Comm, path: &'a str, distributed: bool) -> Self {
        Self {
            comm,
            path,
            distributed,
            vars: Vec::new(),
        }
    }

    /// The communicator the component runs on.
    pub fn comm(&self) -> &Comm {
        self.comm
    }

    /// Dotted path of the component in the model.
    pub fn path(&self) -> &str {
        self.path
    }

    /// Whether the component's variables are partitioned across ranks.
    ///
    /// This is `false` when the component asked to be distributed but the communicator can't
    /// partition data.
    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn add_input(&mut self, name: &str, spec: VarSpec) -> Result<(), SetupError> {
        self.add(name, Role::Input, spec)
    }

    pub fn add_output(&mut self, name: &str, spec: VarSpec) -> Result<(), SetupError> {
        if spec.src_indices.is_some() {
            return Err(SetupError::SourceIndicesOnOutput(self.qualify(name)));
        }
        self.add(name, Role::Output, spec)
    }

    pub(crate) fn finish(self) -> Vec<VarMeta> {
        self.vars
    }

    fn add(&mut self, name: &str, role: Role, spec: VarSpec) -> Result<(), SetupError> {
        if name.is_empty() || name.contains('.') {
            return Err(SetupError::InvalidName(self.qualify(name)));
        }
        if self.vars.iter().any(|var| var.name == name) {
            return Err(SetupError::DuplicateVariable {
                component: self.path.to_owned(),
                name: name.to_owned(),
            });
        }

        let size = spec.size();
        let initial = match spec.val {
            Some(val) if val.len() != size => {
                return Err(SetupError::ShapeMismatch {
                    variable: self.qualify(name),
                    expected: size,
                    found: val.len(),
                })
            }
            Some(val) => val,
            None => vec![spec.fill; size],
        };
        if let Some(indices) = &spec.src_indices {
            if indices.len() != size {
                return Err(SetupError::ShapeMismatch {
                    variable: self.qualify(name),
                    expected: size,
                    found: indices.len(),
                });
            }
        }

        log::trace!("Declared {role:?} {}[{size}]", self.qualify(name));
        self.vars.push(VarMeta {
            name: name.to_owned(),
            role,
            shape: spec.shape,
            src_indices: spec.src_indices,
            initial,
        });
        Ok(())
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}.{name}", self.path)
    }
}
