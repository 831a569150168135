#![doc = include_str!("../README.md")]
#![deny(clippy::all)]

use std::ops::Range;

use mdao::{
    Component, ComponentOptions, ComputeError, ComputeResult, Declarations, ExplicitComponent,
    Group, ImplicitComponent, LinearBlockGs, LinearMode, NonlinearBlockGs, SetupError,
    SolverOptions, VarSpec, Vector,
};
use mdao_dist::{
    partition::{evenly_distrib_idxs, take_nth},
    run_spmd, Comm, ReduceOp,
};

/// Run `f` once per rank, on the serial backend for a single rank and on threads otherwise.
/// Returns the per-rank results in rank order.
pub fn run_on<T, F>(ranks: usize, f: F) -> Vec<T>
where
    F: Fn(Comm) -> T + Sync,
    T: Send,
{
    match ranks {
        1 => vec![f(Comm::serial())],
        n => run_spmd(n, f),
    }
}

fn set_up(comm: &Option<Comm>) -> Result<&Comm, ComputeError> {
    comm.as_ref()
        .ok_or_else(|| ComputeError::new("component is not set up"))
}

/// The contiguous block of `arr_size` entries owned by this rank: `(sizes, offsets, range)`.
fn even_block(comm: &Comm, arr_size: usize) -> (Vec<usize>, Vec<usize>, Range<i64>) {
    let (sizes, offsets) = evenly_distrib_idxs(comm.size(), arr_size);
    let start = offsets[comm.rank()] as i64;
    let end = start + sizes[comm.rank()] as i64;
    (sizes, offsets, start..end)
}

fn scale_into(output: &mut [f64], input: &[f64], factor: f64) {
    output
        .iter_mut()
        .zip(input)
        .for_each(|(y, x)| *y = factor * x);
}

/// `d_y += factor * d_x` forward, `d_x += factor * d_y` reverse.
fn scale_jacvec(
    d_inputs: &mut Vector,
    d_outputs: &mut Vector,
    (input, output): (&str, &str),
    factor: f64,
    mode: LinearMode,
) {
    match mode {
        LinearMode::Fwd => d_outputs[output]
            .iter_mut()
            .zip(&d_inputs[input])
            .for_each(|(dy, dx)| *dy += factor * dx),
        LinearMode::Rev => d_inputs[input]
            .iter_mut()
            .zip(&d_outputs[output])
            .for_each(|(dx, dy)| *dx += factor * dy),
    }
}

/// Replicated array component: `outvec = 2 * invec`.
#[derive(Debug)]
pub struct InOutArrayComp {
    arr_size: usize,
}

impl InOutArrayComp {
    pub fn new(arr_size: usize) -> Self {
        Self { arr_size }
    }
}

impl ExplicitComponent for InOutArrayComp {
    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        decl.add_input("invec", VarSpec::vector(self.arr_size))?;
        decl.add_output("outvec", VarSpec::vector(self.arr_size))
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        scale_into(&mut outputs["outvec"], &inputs["invec"], 2.0);
        Ok(())
    }

    fn compute_jacvec_product(
        &self,
        _inputs: &Vector,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult {
        scale_jacvec(d_inputs, d_outputs, ("invec", "outvec"), 2.0, mode);
        Ok(())
    }
}

/// Runs on at most two ranks and takes the full input on each of them. Every rank scales its copy
/// by a different factor and the copies are summed, so the output is `0.75 * invec` everywhere.
#[derive(Debug)]
pub struct DistribCompSimple {
    arr_size: usize,
    comm: Option<Comm>,
}

impl DistribCompSimple {
    pub fn new(arr_size: usize) -> Self {
        Self {
            arr_size,
            comm: None,
        }
    }
}

impl ExplicitComponent for DistribCompSimple {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::default().with_max_procs(2)
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        self.comm = Some(decl.comm().clone());
        decl.add_input("invec", VarSpec::vector(self.arr_size))?;
        decl.add_output("outvec", VarSpec::vector(self.arr_size))
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        let comm = set_up(&self.comm)?;
        let factor = match (comm.size(), comm.rank()) {
            (1, _) => 0.75,
            (_, 0) => 0.25,
            _ => 0.5,
        };
        let local = inputs["invec"]
            .iter()
            .map(|x| factor * x)
            .collect::<Vec<_>>();
        let total = comm.all_reduce(&local, ReduceOp::Sum)?;
        outputs["outvec"].copy_from_slice(&total);
        Ok(())
    }
}

/// Reads an even contiguous slice of its source and gathers `2 * invec` into a full-size output
/// on every rank.
#[derive(Debug)]
pub struct DistribInputComp {
    arr_size: usize,
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    comm: Option<Comm>,
}

impl DistribInputComp {
    pub fn new(arr_size: usize) -> Self {
        Self {
            arr_size,
            sizes: Vec::new(),
            offsets: Vec::new(),
            comm: None,
        }
    }
}

impl ExplicitComponent for DistribInputComp {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::distributed()
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        let (sizes, offsets, block) = even_block(decl.comm(), self.arr_size);
        let rank = decl.comm().rank();
        decl.add_input("invec", VarSpec::vector(sizes[rank]).with_src_indices(block))?;
        decl.add_output("outvec", VarSpec::vector(self.arr_size))?;

        self.comm = Some(decl.comm().clone());
        self.sizes = sizes;
        self.offsets = offsets;
        Ok(())
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        let comm = set_up(&self.comm)?;
        let doubled = inputs["invec"].iter().map(|x| 2.0 * x).collect::<Vec<_>>();
        let full = comm.all_gather_variable(&doubled, &self.sizes, &self.offsets)?;
        outputs["outvec"].copy_from_slice(&full);
        Ok(())
    }
}

/// [`DistribInputComp`] that asks for distribution through the deprecated `distributed`
/// property.
#[derive(Debug)]
pub struct DeprecatedDistribInputComp(DistribInputComp);

impl DeprecatedDistribInputComp {
    pub fn new(arr_size: usize) -> Self {
        Self(DistribInputComp::new(arr_size))
    }
}

impl ExplicitComponent for DeprecatedDistribInputComp {
    #[allow(deprecated)]
    fn options(&self) -> ComponentOptions {
        ComponentOptions::default().with_distributed_property(true)
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        self.0.setup(decl)
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        self.0.compute(inputs, outputs)
    }
}

/// Runs on at most two ranks whose input slices overlap: rank 0 reads `[0, 8)` and rank 1 reads
/// `[4, 11)` of an 11-entry source. The output adds both doubled slices into place, so the overlap
/// ends up at four times the source and the rest at twice.
#[derive(Debug, Default)]
pub struct DistribOverlappingInputComp {
    comm: Option<Comm>,
}

impl DistribOverlappingInputComp {
    pub const ARR_SIZE: usize = 11;
    const SLICES: [Range<usize>; 2] = [0..8, 4..11];

    pub fn new() -> Self {
        Self::default()
    }
}

impl ExplicitComponent for DistribOverlappingInputComp {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::distributed().with_max_procs(2)
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        let local = match decl.comm().size() {
            1 => 0..Self::ARR_SIZE,
            _ => Self::SLICES[decl.comm().rank()].clone(),
        };
        decl.add_output("outvec", VarSpec::vector(Self::ARR_SIZE).with_fill(0.0))?;
        decl.add_input(
            "invec",
            VarSpec::vector(local.len()).with_src_indices(local.start as i64..local.end as i64),
        )?;
        self.comm = Some(decl.comm().clone());
        Ok(())
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        let comm = set_up(&self.comm)?;
        let doubled = inputs["invec"].iter().map(|x| 2.0 * x).collect::<Vec<_>>();
        let parts: Vec<Vec<f64>> = match comm.size() {
            1 => Self::SLICES
                .iter()
                .map(|slice| doubled[slice.clone()].to_vec())
                .collect(),
            _ => comm.all_gather(doubled)?,
        };

        let out = &mut outputs["outvec"];
        out.fill(0.0);
        for (slice, part) in Self::SLICES.iter().zip(&parts) {
            out[slice.clone()]
                .iter_mut()
                .zip(part)
                .for_each(|(y, x)| *y += x);
        }
        Ok(())
    }
}

/// Partitioned input and output: each rank doubles its own even block.
#[derive(Debug)]
pub struct DistribInputDistribOutputComp {
    arr_size: usize,
}

impl DistribInputDistribOutputComp {
    pub fn new(arr_size: usize) -> Self {
        Self { arr_size }
    }
}

impl ExplicitComponent for DistribInputDistribOutputComp {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::distributed()
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        let (sizes, _, block) = even_block(decl.comm(), self.arr_size);
        let size = sizes[decl.comm().rank()];
        decl.add_input("invec", VarSpec::vector(size).with_src_indices(block))?;
        decl.add_output("outvec", VarSpec::vector(size))
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        scale_into(&mut outputs["outvec"], &inputs["invec"], 2.0);
        Ok(())
    }

    fn compute_jacvec_product(
        &self,
        _inputs: &Vector,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult {
        scale_jacvec(d_inputs, d_outputs, ("invec", "outvec"), 2.0, mode);
        Ok(())
    }
}

/// Rank `r` of `n` reads every `n`-th source entry starting at `r` and doubles it.
#[derive(Debug)]
pub struct DistribNoncontiguousComp {
    arr_size: usize,
}

impl DistribNoncontiguousComp {
    pub fn new(arr_size: usize) -> Self {
        Self { arr_size }
    }
}

impl ExplicitComponent for DistribNoncontiguousComp {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::distributed()
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        let comm = decl.comm();
        let indices =
            take_nth(comm.rank(), comm.size(), 0..self.arr_size as i64).collect::<Vec<_>>();
        decl.add_input(
            "invec",
            VarSpec::vector(indices.len()).with_src_indices(indices.iter().copied()),
        )?;
        decl.add_output("outvec", VarSpec::vector(indices.len()))
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        scale_into(&mut outputs["outvec"], &inputs["invec"], 2.0);
        Ok(())
    }
}

/// Reads an even contiguous block and gathers it into a full-size output on every rank.
#[derive(Debug)]
pub struct DistribGatherComp {
    arr_size: usize,
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    comm: Option<Comm>,
}

impl DistribGatherComp {
    pub fn new(arr_size: usize) -> Self {
        Self {
            arr_size,
            sizes: Vec::new(),
            offsets: Vec::new(),
            comm: None,
        }
    }
}

impl ExplicitComponent for DistribGatherComp {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::distributed()
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        let (sizes, offsets, block) = even_block(decl.comm(), self.arr_size);
        let size = sizes[decl.comm().rank()];
        decl.add_input("invec", VarSpec::vector(size).with_src_indices(block))?;
        decl.add_output("outvec", VarSpec::vector(self.arr_size))?;

        self.comm = Some(decl.comm().clone());
        self.sizes = sizes;
        self.offsets = offsets;
        Ok(())
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        let comm = set_up(&self.comm)?;
        let full = comm.all_gather_variable(&inputs["invec"], &self.sizes, &self.offsets)?;
        outputs["outvec"].copy_from_slice(&full);
        Ok(())
    }
}

/// Replicated copy of its input. Fed by a distributed output, its input receives the whole
/// gathered array without declaring source indices.
#[derive(Debug)]
pub struct NonDistribGatherComp {
    size: usize,
}

impl NonDistribGatherComp {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl ExplicitComponent for NonDistribGatherComp {
    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        decl.add_input("invec", VarSpec::vector(self.size))?;
        decl.add_output("outvec", VarSpec::vector(self.size))
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        outputs["outvec"].copy_from_slice(&inputs["invec"]);
        Ok(())
    }

    fn compute_jacvec_product(
        &self,
        _inputs: &Vector,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult {
        scale_jacvec(d_inputs, d_outputs, ("invec", "outvec"), 1.0, mode);
        Ok(())
    }
}

/// Partitioned in and out; rank 0 doubles its block and every other rank multiplies by `-3`.
#[derive(Debug)]
pub struct DistribComp {
    size: usize,
    comm: Option<Comm>,
}

impl DistribComp {
    pub fn new(size: usize) -> Self {
        Self { size, comm: None }
    }

    fn factor(&self) -> Result<f64, ComputeError> {
        Ok(match set_up(&self.comm)?.rank() {
            0 => 2.0,
            _ => -3.0,
        })
    }
}

impl ExplicitComponent for DistribComp {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::distributed()
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        let (sizes, _, block) = even_block(decl.comm(), self.size);
        let size = sizes[decl.comm().rank()];
        decl.add_input("invec", VarSpec::vector(size).with_src_indices(block))?;
        decl.add_output("outvec", VarSpec::vector(size))?;
        self.comm = Some(decl.comm().clone());
        Ok(())
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        scale_into(&mut outputs["outvec"], &inputs["invec"], self.factor()?);
        Ok(())
    }

    fn compute_jacvec_product(
        &self,
        _inputs: &Vector,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult {
        scale_jacvec(d_inputs, d_outputs, ("invec", "outvec"), self.factor()?, mode);
        Ok(())
    }
}

/// Sums a partitioned input into a replicated scalar `out`.
///
/// The input is not declared distributed; its source indices select this rank's even block.
#[derive(Debug)]
pub struct Summer {
    size: usize,
    comm: Option<Comm>,
}

impl Summer {
    pub fn new(size: usize) -> Self {
        Self { size, comm: None }
    }
}

impl ExplicitComponent for Summer {
    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        let (sizes, _, block) = even_block(decl.comm(), self.size);
        let size = sizes[decl.comm().rank()];
        decl.add_input("invec", VarSpec::vector(size).with_src_indices(block))?;
        decl.add_output("out", VarSpec::scalar().with_fill(0.0))?;
        self.comm = Some(decl.comm().clone());
        Ok(())
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        let comm = set_up(&self.comm)?;
        let local = inputs["invec"].iter().sum::<f64>();
        outputs["out"][0] = comm.all_reduce_scalar(local, ReduceOp::Sum)?;
        Ok(())
    }

    fn compute_jacvec_product(
        &self,
        _inputs: &Vector,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult {
        match mode {
            LinearMode::Fwd => {
                let comm = set_up(&self.comm)?;
                let local = d_inputs["invec"].iter().sum::<f64>();
                d_outputs["out"][0] += comm.all_reduce_scalar(local, ReduceOp::Sum)?;
            }
            LinearMode::Rev => {
                let seed = d_outputs["out"][0];
                d_inputs["invec"].iter_mut().for_each(|dx| *dx += seed);
            }
        }
        Ok(())
    }
}

/// Runs on at most two ranks. Rank 0 reads entries `[0, 1, 2]` of its source, rank 1 reads
/// `[3, -1]`, and each computes `y = 2 * sum(x)` from what it holds.
#[derive(Debug, Default)]
pub struct SliceSumComp;

impl SliceSumComp {
    pub fn indices(rank: usize) -> &'static [i64] {
        match rank {
            0 => &[0, 1, 2],
            _ => &[3, -1],
        }
    }
}

impl ExplicitComponent for SliceSumComp {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::default().with_max_procs(2)
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        let indices = Self::indices(decl.comm().rank());
        decl.add_input(
            "x",
            VarSpec::vector(indices.len()).with_src_indices(indices.iter().copied()),
        )?;
        decl.add_output("y", VarSpec::scalar())
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        outputs["y"][0] = 2.0 * inputs["x"].iter().sum::<f64>();
        Ok(())
    }

    fn compute_jacvec_product(
        &self,
        _inputs: &Vector,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult {
        match mode {
            LinearMode::Fwd => d_outputs["y"][0] += 2.0 * d_inputs["x"].iter().sum::<f64>(),
            LinearMode::Rev => {
                let seed = 2.0 * d_outputs["y"][0];
                d_inputs["x"].iter_mut().for_each(|dx| *dx += seed);
            }
        }
        Ok(())
    }
}

/// Distributed `y = scale * x`, where rank `r` reads the source range `slices[r]`.
///
/// On fewer ranks than slices the component runs on one rank and reads all slices back to back,
/// so the same source entries are read the same number of times on any number of ranks.
#[derive(Debug)]
pub struct SliceScaleComp {
    scale: f64,
    slices: Vec<Range<i64>>,
}

impl SliceScaleComp {
    pub fn new(scale: f64, slices: impl IntoIterator<Item = Range<i64>>) -> Self {
        Self {
            scale,
            slices: slices.into_iter().collect(),
        }
    }

    fn local_indices(&self, comm: &Comm) -> Vec<i64> {
        if comm.size() == self.slices.len() {
            self.slices[comm.rank()].clone().collect()
        } else {
            self.slices.iter().cloned().flatten().collect()
        }
    }
}

impl ExplicitComponent for SliceScaleComp {
    fn options(&self) -> ComponentOptions {
        ComponentOptions::distributed().with_max_procs(self.slices.len().max(1))
    }

    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        let indices = self.local_indices(decl.comm());
        decl.add_input(
            "x",
            VarSpec::vector(indices.len()).with_src_indices(indices.iter().copied()),
        )?;
        decl.add_output("y", VarSpec::vector(indices.len()))
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        scale_into(&mut outputs["y"], &inputs["x"], self.scale);
        Ok(())
    }

    fn compute_jacvec_product(
        &self,
        _inputs: &Vector,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult {
        scale_jacvec(d_inputs, d_outputs, ("x", "y"), self.scale, mode);
        Ok(())
    }
}

/// How [`FaultyComp`] misbehaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Return a [`ComputeError`].
    Error,
    /// Produce a NaN output.
    NotANumber,
}

/// Copies `x` to `y`, except on one rank where it fails.
#[derive(Debug)]
pub struct FaultyComp {
    rank: usize,
    fault: Fault,
    while_negative: bool,
    comm: Option<Comm>,
}

impl FaultyComp {
    pub fn new(rank: usize, fault: Fault) -> Self {
        Self {
            rank,
            fault,
            while_negative: false,
            comm: None,
        }
    }

    /// Fail only while `x` is negative.
    pub fn while_negative(mut self) -> Self {
        self.while_negative = true;
        self
    }
}

impl ExplicitComponent for FaultyComp {
    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        self.comm = Some(decl.comm().clone());
        decl.add_input("x", VarSpec::scalar())?;
        decl.add_output("y", VarSpec::scalar())
    }

    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult {
        let x = inputs["x"][0];
        let armed = !self.while_negative || x < 0.0;
        if set_up(&self.comm)?.rank() != self.rank || !armed {
            outputs["y"][0] = x;
            return Ok(());
        }
        match self.fault {
            Fault::Error => Err(ComputeError::new("injected failure")),
            Fault::NotANumber => {
                outputs["y"][0] = f64::NAN;
                Ok(())
            }
        }
    }
}

/// The output/input pairs of [`CoupledComp`] and the coefficient linking them.
pub const COUPLINGS: [(&str, &str, f64); 4] = [
    ("w", "a", 2.0),
    ("x", "b", 3.0),
    ("y", "c", 4.0),
    ("z", "d", 5.0),
];

/// Implicit component with residuals `R_u = u + scale * k_u * in_u - bias` for each coupling
/// `(u, in_u, k_u)` of [`COUPLINGS`].
///
/// Two of them wired output to input form a feedback loop whose fixed point is
/// `u = bias / (1 + scale * k_u)`. Block Gauss-Seidel contracts by `(scale * k_u)^2` per sweep, so
/// the loop converges for `scale * 5 < 1`.
#[derive(Clone, Copy, Debug)]
pub struct CoupledComp {
    scale: f64,
    bias: f64,
}

impl CoupledComp {
    pub fn new(scale: f64, bias: f64) -> Self {
        Self { scale, bias }
    }

    /// Fixed point of two coupled instances, in [`COUPLINGS`] order.
    pub fn coupled_solution(&self) -> [f64; 4] {
        COUPLINGS.map(|(_, _, k)| self.bias / (1.0 + self.scale * k))
    }

    /// Solution of the coupled linear system for a unit right-hand side, forward or reverse.
    pub fn coupled_unit_response(&self) -> [f64; 4] {
        COUPLINGS.map(|(_, _, k)| 1.0 / (1.0 + self.scale * k))
    }
}

impl ImplicitComponent for CoupledComp {
    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        for (output, input, _) in COUPLINGS {
            decl.add_input(input, VarSpec::scalar())?;
            decl.add_output(output, VarSpec::scalar())?;
        }
        Ok(())
    }

    fn apply_nonlinear(
        &self,
        inputs: &Vector,
        outputs: &Vector,
        residuals: &mut Vector,
    ) -> ComputeResult {
        for (output, input, k) in COUPLINGS {
            residuals[output][0] =
                outputs[output][0] + self.scale * k * inputs[input][0] - self.bias;
        }
        Ok(())
    }

    fn apply_linear(
        &self,
        _inputs: &Vector,
        _outputs: &Vector,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        d_residuals: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult {
        for (output, input, k) in COUPLINGS {
            let c = self.scale * k;
            match mode {
                LinearMode::Fwd => {
                    d_residuals[output][0] += d_outputs[output][0] + c * d_inputs[input][0];
                }
                LinearMode::Rev => {
                    d_outputs[output][0] += d_residuals[output][0];
                    d_inputs[input][0] += c * d_residuals[output][0];
                }
            }
        }
        Ok(())
    }

    fn solve_linear(
        &self,
        d_outputs: &mut Vector,
        d_residuals: &mut Vector,
        mode: LinearMode,
    ) -> ComputeResult {
        match mode {
            LinearMode::Fwd => d_outputs.copy_from(d_residuals),
            LinearMode::Rev => d_residuals.copy_from(d_outputs),
        }
        Ok(())
    }
}

/// Connect every output of `a` to the matching input of `b` and the other way around.
pub fn connect_coupled(group: &mut Group, a: &str, b: &str) {
    for (output, input, _) in COUPLINGS {
        group.connect(&format!("{a}.{output}"), &format!("{b}.{input}"));
        group.connect(&format!("{b}.{output}"), &format!("{a}.{input}"));
    }
}

/// Solver settings tight enough to reach the fixed point of a contracting coupled pair.
pub fn coupled_solver_options() -> SolverOptions {
    SolverOptions::default()
        .with_maxiter(100)
        .with_atol(1e-14)
        .with_rtol(1e-14)
}

/// Two [`CoupledComp`]s, `C1` and `C2`, in feedback, converged by block Gauss-Seidel.
pub fn coupled_implicit_group(comp: CoupledComp) -> Group {
    let mut group = Group::new();
    group
        .add_subsystem("C1", Component::implicit(comp))
        .add_subsystem("C2", Component::implicit(comp))
        .set_nonlinear_solver(NonlinearBlockGs::new(coupled_solver_options()))
        .set_linear_solver(LinearBlockGs::new(coupled_solver_options()));
    connect_coupled(&mut group, "C1", "C2");
    group
}
