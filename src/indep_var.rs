use crate::{
    ComputeResult, Declarations, ExplicitComponent, LinearMode, SetupError, VarSpec, Vector,
};

/// A component with outputs only, holding values set from outside the model.
#[derive(Clone, Debug, Default)]
pub struct IndepVarComp {
    outputs: Vec<(String, VarSpec)>,
}

impl IndepVarComp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, name: &str, spec: VarSpec) -> Self {
        self.outputs.push((name.to_owned(), spec));
        self
    }
}

impl ExplicitComponent for IndepVarComp {
    fn setup(&mut self, decl: &mut Declarations<'_>) -> Result<(), SetupError> {
        for (name, spec) in &self.outputs {
            decl.add_output(name, spec.clone())?;
        }
        Ok(())
    }

    fn compute(&self, _inputs: &Vector, _outputs: &mut Vector) -> ComputeResult {
        Ok(())
    }

    fn compute_jacvec_product(
        &self,
        _inputs: &Vector,
        _d_inputs: &mut Vector,
        _d_outputs: &mut Vector,
        _mode: LinearMode,
    ) -> ComputeResult {
        Ok(())
    }
}
