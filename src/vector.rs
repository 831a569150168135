//! Name-addressable numeric buffers.
//!
//! A [`Vector`] is one flat `Vec<f64>` plus a shared [`Layout`] that maps variable names to fixed
//! slots. Names are resolved to a [`VarId`] once; indexing by `VarId` never hashes.

use std::{
    ops::{Index, IndexMut, Range},
    sync::Arc,
};

use indexmap::IndexMap;

/// Position of a variable inside a [`Layout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VarId(usize);

/// The vectors every component owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VectorKind {
    Inputs,
    Outputs,
    Residuals,
    DInputs,
    DOutputs,
    DResiduals,
}

/// Maps variable names to contiguous slots of a flat buffer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Layout {
    slots: IndexMap<String, Range<usize>>,
    len: usize,
}

impl Layout {
    /// Pack the variables back to back, in the given order.
    pub fn new<'a>(vars: impl IntoIterator<Item = (&'a str, usize)>) -> Self {
        let mut len = 0;
        let slots = vars
            .into_iter()
            .map(|(name, size)| {
                let slot = len..len + size;
                len += size;
                (name.to_owned(), slot)
            })
            .collect();
        Self { slots, len }
    }

    pub fn id(&self, name: &str) -> Option<VarId> {
        self.slots.get_index_of(name).map(VarId)
    }

    pub fn name(&self, id: VarId) -> &str {
        self.slots
            .get_index(id.0)
            .map(|(name, _)| name.as_str())
            .unwrap_or_default()
    }

    pub fn slot(&self, id: VarId) -> Range<usize> {
        self.slots
            .get_index(id.0)
            .map(|(_, slot)| slot.clone())
            .unwrap_or(0..0)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Vector {
    layout: Arc<Layout>,
    data: Vec<f64>,
}

impl Vector {
    pub fn zeros(layout: Arc<Layout>) -> Self {
        let data = vec![0.0; layout.len()];
        Self { layout, data }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn id(&self, name: &str) -> Option<VarId> {
        self.layout.id(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layout.id(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.id(name).map(|id| &self[id])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut [f64]> {
        self.id(name).map(|id| &mut self[id])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// Overwrite with the contents of a vector sharing the same layout.
    pub fn copy_from(&mut self, other: &Vector) {
        self.data.copy_from_slice(&other.data);
    }

    /// Local sum of squares.
    pub fn sq_norm(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Name of the first variable holding a NaN or infinity.
    pub fn first_non_finite(&self) -> Option<&str> {
        self.layout
            .slots
            .iter()
            .find(|(_, slot)| self.data[(*slot).clone()].iter().any(|v| !v.is_finite()))
            .map(|(name, _)| name.as_str())
    }
}

impl Index<VarId> for Vector {
    type Output = [f64];

    fn index(&self, id: VarId) -> &Self::Output {
        &self.data[self.layout.slot(id)]
    }
}

impl IndexMut<VarId> for Vector {
    fn index_mut(&mut self, id: VarId) -> &mut Self::Output {
        let slot = self.layout.slot(id);
        &mut self.data[slot]
    }
}

impl Index<&str> for Vector {
    type Output = [f64];

    /// # Panics
    /// If no variable called `name` exists.
    fn index(&self, name: &str) -> &Self::Output {
        match self.id(name) {
            Some(id) => &self[id],
            None => panic!("Unknown variable '{name}'"),
        }
    }
}

impl IndexMut<&str> for Vector {
    fn index_mut(&mut self, name: &str) -> &mut Self::Output {
        match self.id(name) {
            Some(id) => &mut self[id],
            None => panic!("Unknown variable '{name}'"),
        }
    }
}
