//! Groups own subsystems, the connections between them and the solvers that converge them.

use std::{cmp::Ordering, collections::HashMap};

use mdao_dist::{Comm, ReduceOp};

use crate::{
    component::{Component, Failure},
    diagnostics::{Diagnostic, SetupReport},
    solver::{LinearRunOnce, LinearSolver, NonlinearRunOnce, NonlinearSolver, SolveReport},
    transfer::{Endpoints, Locator, RankEndpoints, Transfer, TransferPlan},
    vector::VectorKind,
    Error, LinearMode, SetupError,
};

/// A node of the model tree.
pub enum System {
    Component(Component),
    Group(Group),
}

impl From<Component> for System {
    fn from(component: Component) -> Self {
        System::Component(component)
    }
}

impl From<Group> for System {
    fn from(group: Group) -> Self {
        System::Group(group)
    }
}

impl System {
    fn for_each_leaf<'a>(&'a self, f: &mut dyn FnMut(&'a Component)) {
        match self {
            System::Component(c) => f(c),
            System::Group(g) => g
                .system
                .subsystems
                .iter()
                .for_each(|sub| sub.system.for_each_leaf(f)),
        }
    }

    fn for_each_leaf_mut(&mut self, f: &mut dyn FnMut(&mut Component)) {
        match self {
            System::Component(c) => f(c),
            System::Group(g) => g
                .system
                .subsystems
                .iter_mut()
                .for_each(|sub| sub.system.for_each_leaf_mut(f)),
        }
    }

    fn leaf(&self, path: &[usize]) -> Option<&Component> {
        match (self, path.split_first()) {
            (System::Component(c), None) => Some(c),
            (System::Group(g), Some(_)) => g.system.leaf(path),
            _ => None,
        }
    }

    fn leaf_mut(&mut self, path: &[usize]) -> Option<&mut Component> {
        match (self, path.split_first()) {
            (System::Component(c), None) => Some(c),
            (System::Group(g), Some(_)) => g.system.leaf_mut(path),
            _ => None,
        }
    }

    fn is_set_up(&self) -> bool {
        match self {
            System::Component(_) => true,
            System::Group(g) => g.is_set_up(),
        }
    }
}

struct Subsystem {
    name: String,
    system: System,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Connection {
    src: String,
    dst: String,
}

/// Which pair of vectors a forward transfer moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    /// `outputs` into `inputs`.
    Nonlinear,
    /// `d_outputs` into `d_inputs`.
    Linear,
}

/// The subsystems of a group and the transfers between them, as seen by its solvers.
///
/// Every operation here is collective over the group's communicator: all ranks must call the same
/// operations in the same order. Child indices follow declaration order.
pub struct BlockSystem {
    path: String,
    comm: Comm,
    subsystems: Vec<Subsystem>,
    transfers: Vec<Transfer>,
    ready: bool,
}

impl BlockSystem {
    fn new() -> Self {
        Self {
            path: String::new(),
            comm: Comm::serial(),
            subsystems: Vec::new(),
            transfers: Vec::new(),
            ready: false,
        }
    }

    /// Dotted path of the group, `model` for the root.
    pub fn path(&self) -> &str {
        if self.path.is_empty() {
            "model"
        } else {
            &self.path
        }
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// Number of subsystems.
    pub fn len(&self) -> usize {
        self.subsystems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsystems.is_empty()
    }

    /// Run the transfers feeding `child`.
    pub fn transfer_in(&mut self, child: usize, kind: TransferKind) -> Result<(), Error> {
        let (src_kind, dst_kind) = match kind {
            TransferKind::Nonlinear => (VectorKind::Outputs, VectorKind::Inputs),
            TransferKind::Linear => (VectorKind::DOutputs, VectorKind::DInputs),
        };
        for transfer in self.transfers.iter().filter(|t| t.dst.child() == child) {
            let (src, dst) = pair_mut(&mut self.subsystems, transfer.src.child(), child)
                .ok_or(SetupError::NotSetUp)?;
            let src = src
                .system
                .leaf(&transfer.src.path[1..])
                .ok_or(SetupError::NotSetUp)?;
            let dst = dst
                .system
                .leaf_mut(&transfer.dst.path[1..])
                .ok_or(SetupError::NotSetUp)?;
            transfer.plan.forward(
                &self.comm,
                &src.vector(src_kind)[transfer.src.var],
                &mut dst.vector_mut(dst_kind)[transfer.dst.var],
            )?;
        }
        Ok(())
    }

    /// Accumulate the `d_inputs` of every consumer of `child` into its `d_outputs`.
    pub fn transfer_rev_into(&mut self, child: usize) -> Result<(), Error> {
        for transfer in self.transfers.iter().filter(|t| t.src.child() == child) {
            let (src, dst) = pair_mut(&mut self.subsystems, child, transfer.dst.child())
                .ok_or(SetupError::NotSetUp)?;
            let src = src
                .system
                .leaf_mut(&transfer.src.path[1..])
                .ok_or(SetupError::NotSetUp)?;
            let dst = dst
                .system
                .leaf(&transfer.dst.path[1..])
                .ok_or(SetupError::NotSetUp)?;
            transfer.plan.reverse(
                &self.comm,
                &dst.vector(VectorKind::DInputs)[transfer.dst.var],
                &mut src.vector_mut(VectorKind::DOutputs)[transfer.src.var],
            )?;
        }
        Ok(())
    }

    pub fn solve_nonlinear_child(&mut self, child: usize) -> Result<(), Error> {
        let failure = match &mut self.subsystems[child].system {
            System::Component(c) => c.solve_nonlinear().err(),
            System::Group(g) => return g.solve_nonlinear().map(drop),
        };
        self.agree(child, failure)
    }

    pub fn apply_nonlinear_child(&mut self, child: usize) -> Result<(), Error> {
        let failure = match &mut self.subsystems[child].system {
            System::Component(c) => c.apply_nonlinear().err(),
            System::Group(g) => return g.system.apply_nonlinear(),
        };
        self.agree(child, failure)
    }

    pub fn apply_linear_child(&mut self, child: usize, mode: LinearMode) -> Result<(), Error> {
        let failure = match &mut self.subsystems[child].system {
            System::Component(c) => c.apply_linear(mode).err(),
            System::Group(g) => return g.system.apply_linear(mode),
        };
        self.agree(child, failure)
    }

    pub fn solve_linear_child(&mut self, child: usize, mode: LinearMode) -> Result<(), Error> {
        let failure = match &mut self.subsystems[child].system {
            System::Component(c) => c.solve_linear(mode).err(),
            System::Group(g) => return g.solve_linear(mode).map(drop),
        };
        self.agree(child, failure)
    }

    /// Compute the residuals of every subsystem from freshly transferred inputs.
    pub fn apply_nonlinear(&mut self) -> Result<(), Error> {
        for child in 0..self.len() {
            self.transfer_in(child, TransferKind::Nonlinear)?;
            self.apply_nonlinear_child(child)?;
        }
        Ok(())
    }

    /// Apply the Jacobian of the whole group: `d_residuals = J d_outputs` in forward mode,
    /// `d_outputs = J^T d_residuals` in reverse mode.
    pub fn apply_linear(&mut self, mode: LinearMode) -> Result<(), Error> {
        match mode {
            LinearMode::Fwd => {
                for child in 0..self.len() {
                    self.transfer_in(child, TransferKind::Linear)?;
                    self.apply_linear_child(child, mode)?;
                }
            }
            LinearMode::Rev => {
                for child in 0..self.len() {
                    self.apply_linear_child(child, mode)?;
                }
                for child in 0..self.len() {
                    self.transfer_rev_into(child)?;
                }
            }
        }
        Ok(())
    }

    /// The values of `kind` held by `child`, leaf by leaf.
    pub fn snapshot(&self, child: usize, kind: VectorKind) -> Vec<f64> {
        let mut values = Vec::new();
        self.subsystems[child]
            .system
            .for_each_leaf(&mut |leaf| values.extend_from_slice(leaf.vector(kind).as_slice()));
        values
    }

    pub fn restore(&mut self, child: usize, kind: VectorKind, values: &[f64]) {
        self.combine(child, kind, values, |v, saved| *v = saved);
    }

    pub fn fill(&mut self, child: usize, kind: VectorKind, value: f64) {
        self.subsystems[child]
            .system
            .for_each_leaf_mut(&mut |leaf| leaf.vector_mut(kind).fill(value));
    }

    /// `v = old + factor * (v - old)`
    pub fn relax(&mut self, child: usize, kind: VectorKind, old: &[f64], factor: f64) {
        self.combine(child, kind, old, |v, old| *v = old + factor * (*v - old));
    }

    /// `v = old + factor * v`
    pub fn apply_increment(&mut self, child: usize, kind: VectorKind, old: &[f64], factor: f64) {
        self.combine(child, kind, old, |v, old| *v = old + factor * *v);
    }

    /// `v = rhs - v`
    pub fn subtract_from(&mut self, child: usize, kind: VectorKind, rhs: &[f64]) {
        self.combine(child, kind, rhs, |v, rhs| *v = rhs - *v);
    }

    /// Global 2-norm of `kind` over all subsystems. Replicated values are counted once.
    pub fn norm(&self, kind: VectorKind) -> Result<f64, Error> {
        let mut local = 0.0;
        for sub in &self.subsystems {
            sub.system.for_each_leaf(&mut |leaf| {
                if leaf.owns_norm() {
                    local += leaf.vector(kind).sq_norm();
                }
            });
        }
        Ok(self.comm.all_reduce_scalar(local, ReduceOp::Sum)?.sqrt())
    }

    fn combine(
        &mut self,
        child: usize,
        kind: VectorKind,
        values: &[f64],
        f: impl Fn(&mut f64, f64),
    ) {
        let mut values = values.iter();
        self.subsystems[child].system.for_each_leaf_mut(&mut |leaf| {
            leaf.vector_mut(kind)
                .as_mut_slice()
                .iter_mut()
                .zip(values.by_ref())
                .for_each(|(v, x)| f(v, *x));
        });
    }

    /// Turn the local outcome of a leaf evaluation into the same result on every rank.
    fn agree(&self, child: usize, failure: Option<Failure>) -> Result<(), Error> {
        let failures = self.comm.all_gather(failure)?;
        match failures
            .into_iter()
            .enumerate()
            .find_map(|(rank, failure)| Some((rank, failure?)))
        {
            None => Ok(()),
            Some((rank, failure)) => {
                let path = match &self.subsystems[child].system {
                    System::Component(c) => c.path(),
                    System::Group(g) => g.system.path(),
                };
                log::error!("{path} failed on rank {rank}: {failure:?}");
                Err(failure.into_error(path, rank))
            }
        }
    }

    fn leaf(&self, path: &[usize]) -> Option<&Component> {
        let (first, rest) = path.split_first()?;
        self.subsystems.get(*first)?.system.leaf(rest)
    }

    fn leaf_mut(&mut self, path: &[usize]) -> Option<&mut Component> {
        let (first, rest) = path.split_first()?;
        self.subsystems.get_mut(*first)?.system.leaf_mut(rest)
    }

    /// Subsystem indices leading to the component at the dotted `path`.
    fn locate_component(&self, path: &str) -> Option<Vec<usize>> {
        let mut indices = Vec::new();
        let mut subsystems = &self.subsystems;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let index = subsystems.iter().position(|sub| sub.name == segment)?;
            indices.push(index);
            match (&subsystems[index].system, segments.peek()) {
                (System::Component(_), None) => return Some(indices),
                (System::Group(g), Some(_)) => subsystems = &g.system.subsystems,
                _ => return None,
            }
        }
        None
    }

    fn resolve(&self, conn: &Connection) -> Result<Transfer, Error> {
        let src_path = qualify(&self.path, &conn.src);
        let dst_path = qualify(&self.path, &conn.dst);
        let endpoint = |path: &str| {
            let (component, var) = path.rsplit_once('.')?;
            let indices = self.locate_component(component)?;
            let leaf = self.leaf(&indices)?;
            Some((indices, leaf, var.to_owned()))
        };
        let (src_indices, src, src_var) = endpoint(&conn.src)
            .ok_or_else(|| SetupError::UnresolvedConnection(src_path.clone()))?;
        let (dst_indices, dst, dst_var) = endpoint(&conn.dst)
            .ok_or_else(|| SetupError::UnresolvedConnection(dst_path.clone()))?;

        let src_id = match src.vector(VectorKind::Outputs).id(&src_var) {
            Some(id) => id,
            None if src.vector(VectorKind::Inputs).contains(&src_var) => {
                return Err(SetupError::NotAnOutput(src_path).into())
            }
            None => return Err(SetupError::UnresolvedConnection(src_path).into()),
        };
        let dst_id = match dst.vector(VectorKind::Inputs).id(&dst_var) {
            Some(id) => id,
            None if dst.vector(VectorKind::Outputs).contains(&dst_var) => {
                return Err(SetupError::NotAnInput(dst_path).into())
            }
            None => return Err(SetupError::UnresolvedConnection(dst_path).into()),
        };

        let local = RankEndpoints {
            src_active: src.is_active(),
            src_size: src.vector(VectorKind::Outputs)[src_id].len(),
            dst_active: dst.is_active(),
            dst_size: dst.vector(VectorKind::Inputs)[dst_id].len(),
            src_indices: dst.meta(&dst_var).and_then(|var| var.src_indices.clone()),
        };
        let ranks = self.comm.all_gather(local)?;
        let ends = Endpoints {
            src: &src_path,
            dst: &dst_path,
            src_distributed: src.is_distributed(),
            dst_distributed: dst.is_distributed(),
        };
        let plan = TransferPlan::build(self.comm.rank(), ends, &ranks)?;
        log::debug!(
            "Transfer {src_path} -> {dst_path}: {:?} -> {:?}{}",
            plan.src_distribution(),
            plan.dst_distribution(),
            if plan.is_local() { "" } else { ", gathered" }
        );

        Ok(Transfer {
            src: Locator {
                path: src_indices,
                var: src_id,
            },
            dst: Locator {
                path: dst_indices,
                var: dst_id,
            },
            plan,
        })
    }
}

/// A container of components and other groups.
///
/// Subsystems are visited in the order they were added. Connections are declared with dotted
/// paths relative to the group and may reach into nested groups.
pub struct Group {
    system: BlockSystem,
    connections: Vec<Connection>,
    nonlinear_solver: Box<dyn NonlinearSolver>,
    linear_solver: Box<dyn LinearSolver>,
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl Group {
    /// An empty group that runs each subsystem once per solve.
    pub fn new() -> Self {
        Self {
            system: BlockSystem::new(),
            connections: Vec::new(),
            nonlinear_solver: Box::new(NonlinearRunOnce),
            linear_solver: Box::new(LinearRunOnce),
        }
    }

    pub fn add_subsystem(&mut self, name: &str, system: impl Into<System>) -> &mut Self {
        self.system.subsystems.push(Subsystem {
            name: name.to_owned(),
            system: system.into(),
        });
        self.system.ready = false;
        self
    }

    /// Connect the output at `src` to the input at `dst`.
    pub fn connect(&mut self, src: &str, dst: &str) -> &mut Self {
        self.connections.push(Connection {
            src: src.to_owned(),
            dst: dst.to_owned(),
        });
        self.system.ready = false;
        self
    }

    pub fn set_nonlinear_solver(&mut self, solver: impl NonlinearSolver + 'static) -> &mut Self {
        self.nonlinear_solver = Box::new(solver);
        self
    }

    pub fn set_linear_solver(&mut self, solver: impl LinearSolver + 'static) -> &mut Self {
        self.linear_solver = Box::new(solver);
        self
    }

    pub fn subsystem(&self, name: &str) -> Option<&System> {
        self.system
            .subsystems
            .iter()
            .find(|sub| sub.name == name)
            .map(|sub| &sub.system)
    }

    /// Allocate every component on `comm` and resolve all transfers.
    ///
    /// Collective: every rank of `comm` must set up an identical model.
    pub fn setup(&mut self, comm: &Comm) -> Result<SetupReport, Error> {
        let mut connections = Vec::new();
        self.collect_connections("", &mut connections);
        let mut sources = HashMap::new();
        for (src, dst) in &connections {
            if let Some(first) = sources.insert(dst.as_str(), src.as_str()) {
                return Err(SetupError::MultipleSources {
                    target: dst.clone(),
                    first: first.to_owned(),
                    second: src.clone(),
                }
                .into());
            }
        }

        let mut diagnostics = Vec::new();
        self.setup_in(String::new(), comm, Vec::new(), &mut diagnostics)?;
        log::info!(
            "Set up {} subsystems and {} connections on {} rank(s)",
            self.system.len(),
            connections.len(),
            comm.size()
        );
        Ok(SetupReport { diagnostics })
    }

    /// Whether the model can run: set up, with no topology change since.
    pub fn is_set_up(&self) -> bool {
        self.system.ready
            && self
                .system
                .subsystems
                .iter()
                .all(|sub| sub.system.is_set_up())
    }

    pub fn run_solve_nonlinear(&mut self) -> Result<SolveReport, Error> {
        self.ensure_set_up()?;
        self.solve_nonlinear()
    }

    pub fn run_apply_nonlinear(&mut self) -> Result<(), Error> {
        self.ensure_set_up()?;
        self.system.apply_nonlinear()
    }

    pub fn run_solve_linear(&mut self, mode: LinearMode) -> Result<SolveReport, Error> {
        self.ensure_set_up()?;
        self.solve_linear(mode)
    }

    pub fn run_apply_linear(&mut self, mode: LinearMode) -> Result<(), Error> {
        self.ensure_set_up()?;
        self.system.apply_linear(mode)
    }

    /// The component at the dotted `path`.
    pub fn component(&self, path: &str) -> Option<&Component> {
        let indices = self.system.locate_component(path)?;
        self.system.leaf(&indices)
    }

    /// Local values of the variable at `path`, an output if there is one, otherwise an input.
    pub fn get(&self, path: &str) -> Result<&[f64], Error> {
        self.vector(path, VectorKind::Outputs)
            .or_else(|_| self.vector(path, VectorKind::Inputs))
    }

    pub fn set(&mut self, path: &str, values: &[f64]) -> Result<(), Error> {
        let kind = if self.vector(path, VectorKind::Outputs).is_ok() {
            VectorKind::Outputs
        } else {
            VectorKind::Inputs
        };
        let slot = self.vector_mut(path, kind)?;
        if slot.len() != values.len() {
            return Err(Error::SizeMismatch {
                variable: path.to_owned(),
                expected: slot.len(),
                found: values.len(),
            });
        }
        slot.copy_from_slice(values);
        Ok(())
    }

    /// Local values of the variable at `path` in the vector `kind`.
    pub fn vector(&self, path: &str, kind: VectorKind) -> Result<&[f64], Error> {
        path.rsplit_once('.')
            .and_then(|(component, var)| self.component(component)?.vector(kind).get(var))
            .ok_or_else(|| Error::UnknownVariable(path.to_owned()))
    }

    pub fn vector_mut(&mut self, path: &str, kind: VectorKind) -> Result<&mut [f64], Error> {
        let (component, var) = path
            .rsplit_once('.')
            .ok_or_else(|| Error::UnknownVariable(path.to_owned()))?;
        self.system
            .locate_component(component)
            .and_then(|indices| self.system.leaf_mut(&indices))
            .and_then(|leaf| leaf.vector_mut(kind).get_mut(var))
            .ok_or_else(|| Error::UnknownVariable(path.to_owned()))
    }

    fn solve_nonlinear(&mut self) -> Result<SolveReport, Error> {
        self.nonlinear_solver.solve(&mut self.system)
    }

    fn solve_linear(&mut self, mode: LinearMode) -> Result<SolveReport, Error> {
        self.linear_solver.solve(&mut self.system, mode)
    }

    fn ensure_set_up(&self) -> Result<(), SetupError> {
        if self.is_set_up() {
            Ok(())
        } else {
            Err(SetupError::NotSetUp)
        }
    }

    fn collect_connections(&self, prefix: &str, out: &mut Vec<(String, String)>) {
        out.extend(
            self.connections
                .iter()
                .map(|conn| (qualify(prefix, &conn.src), qualify(prefix, &conn.dst))),
        );
        for sub in &self.system.subsystems {
            if let System::Group(g) = &sub.system {
                g.collect_connections(&qualify(prefix, &sub.name), out);
            }
        }
    }

    fn setup_in(
        &mut self,
        path: String,
        comm: &Comm,
        inherited: Vec<Connection>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<(), Error> {
        self.system.ready = false;
        self.system.path = path;
        self.system.comm = comm.clone();
        self.system.transfers.clear();
        self.nonlinear_solver.validate()?;
        self.linear_solver.validate()?;

        let subsystems = &self.system.subsystems;
        for (i, sub) in subsystems.iter().enumerate() {
            if sub.name.is_empty() || sub.name.contains('.') {
                return Err(SetupError::InvalidName(qualify(&self.system.path, &sub.name)).into());
            }
            if subsystems[..i].iter().any(|other| other.name == sub.name) {
                return Err(SetupError::DuplicateSubsystem {
                    group: self.system.path().to_owned(),
                    name: sub.name.clone(),
                }
                .into());
            }
        }

        // Connections between two variables of the same subgroup belong to that subgroup.
        let mut local = Vec::new();
        let mut pushed = vec![Vec::new(); subsystems.len()];
        for conn in self.connections.iter().cloned().chain(inherited) {
            let unresolved =
                |path: &str| SetupError::UnresolvedConnection(qualify(&self.system.path, path));
            let (src_head, src_tail) = conn
                .src
                .split_once('.')
                .ok_or_else(|| unresolved(&conn.src))?;
            let (dst_head, dst_tail) = conn
                .dst
                .split_once('.')
                .ok_or_else(|| unresolved(&conn.dst))?;
            if src_head != dst_head {
                local.push(conn);
                continue;
            }
            let index = subsystems
                .iter()
                .position(|sub| sub.name == src_head)
                .ok_or_else(|| unresolved(&conn.src))?;
            match &subsystems[index].system {
                System::Group(_) => pushed[index].push(Connection {
                    src: src_tail.to_owned(),
                    dst: dst_tail.to_owned(),
                }),
                System::Component(_) => {
                    return Err(SetupError::SelfConnection {
                        output: qualify(&self.system.path, &conn.src),
                        input: qualify(&self.system.path, &conn.dst),
                    }
                    .into())
                }
            }
        }

        for (sub, pushed) in self.system.subsystems.iter_mut().zip(pushed) {
            let path = qualify(&self.system.path, &sub.name);
            match &mut sub.system {
                System::Component(c) => c.setup(path, comm, diagnostics)?,
                System::Group(g) => g.setup_in(path, comm, pushed, diagnostics)?,
            }
        }

        for conn in &local {
            let transfer = self.system.resolve(conn)?;
            self.system.transfers.push(transfer);
        }

        log::debug!(
            "Set up {} with {} subsystems and {} transfers",
            self.system.path(),
            self.system.len(),
            self.system.transfers.len()
        );
        self.system.ready = true;
        Ok(())
    }
}

fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Mutable references to two distinct items.
fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> Option<(&mut T, &mut T)> {
    match a.cmp(&b) {
        Ordering::Less => {
            let (left, right) = items.split_at_mut(b);
            Some((left.get_mut(a)?, right.first_mut()?))
        }
        Ordering::Greater => {
            let (left, right) = items.split_at_mut(a);
            Some((right.first_mut()?, left.get_mut(b)?))
        }
        Ordering::Equal => None,
    }
}
