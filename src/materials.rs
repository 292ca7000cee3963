//! Stateful material property storage and the RAII swap that traversals use
//! to borrow an element's stored state.

use crate::mesh::Mesh;
use parking_lot::Mutex;

/// Index of a registered material property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyId(pub u32);

#[derive(Debug, Default)]
struct ElementState {
    values: Vec<f64>,
    swapped: bool,
}

/// Per-element stored property state, indexed by [`Mesh::element_index`].
///
/// During a traversal, an element's state is accessed through
/// [`MaterialStateStore::swap`]: the guard moves the values out of the store
/// for its lifetime and restores them on drop, on success and error paths
/// alike. The element partitioning of a traversal guarantees distinct
/// elements for distinct workers, so guards on different slots never
/// contend; taking a second guard on the same slot while one is live is a
/// programming error and panics.
#[derive(Debug)]
pub struct MaterialStateStore {
    num_properties: usize,
    states: Vec<Mutex<ElementState>>,
}

impl MaterialStateStore {
    pub fn new(mesh: &Mesh, num_properties: usize) -> Self {
        let states = (0..mesh.num_element_slots())
            .map(|_| {
                Mutex::new(ElementState {
                    values: vec![0.0; num_properties],
                    swapped: false,
                })
            })
            .collect();
        Self {
            num_properties,
            states,
        }
    }

    pub fn num_properties(&self) -> usize {
        self.num_properties
    }

    pub fn num_slots(&self) -> usize {
        self.states.len()
    }

    /// Add zero-initialized slots for elements created by refinement.
    pub fn resize_for(&mut self, mesh: &Mesh) {
        while self.states.len() < mesh.num_element_slots() {
            self.states.push(Mutex::new(ElementState {
                values: vec![0.0; self.num_properties],
                swapped: false,
            }));
        }
    }

    /// Take the element's stored state out for the lifetime of the returned
    /// guard.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already swapped out.
    pub fn swap(&self, element_index: usize) -> MaterialSwap<'_> {
        let slot = &self.states[element_index];
        let values = {
            let mut state = slot.lock();
            if state.swapped {
                panic!("material state of element slot {element_index} is already swapped out");
            }
            state.swapped = true;
            std::mem::take(&mut state.values)
        };
        MaterialSwap { slot, values }
    }

    /// Overwrite an element's stored state between traversals.
    pub fn store(&self, element_index: usize, values: &[f64]) {
        assert_eq!(values.len(), self.num_properties);
        let mut state = self.states[element_index].lock();
        assert!(
            !state.swapped,
            "cannot store into a swapped-out state slot"
        );
        state.values.copy_from_slice(values);
    }

    pub fn snapshot(&self, element_index: usize) -> Vec<f64> {
        let state = self.states[element_index].lock();
        assert!(
            !state.swapped,
            "cannot snapshot a swapped-out state slot"
        );
        state.values.clone()
    }
}

/// RAII guard holding one element's stored property state.
#[derive(Debug)]
pub struct MaterialSwap<'a> {
    slot: &'a Mutex<ElementState>,
    values: Vec<f64>,
}

impl MaterialSwap<'_> {
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }
}

impl Drop for MaterialSwap<'_> {
    fn drop(&mut self) {
        let mut state = self.slot.lock();
        state.values = std::mem::take(&mut self.values);
        state.swapped = false;
    }
}
