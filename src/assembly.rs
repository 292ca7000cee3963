//! Per-worker accumulation buffers and the evaluation contexts handed to
//! physics hooks.
//!
//! Workers never write straight to the shared targets: contributions are
//! staged element by element in an [`AssemblyScratch`] and committed in
//! batches, so the lock on the target is taken once per
//! [`FLUSH_BATCH_SIZE`] elements instead of once per contribution.

use crate::materials::PropertyId;
use crate::mesh::{BoundaryId, Element, Mesh, NodeId};
use crate::system::{FieldStore, NonlinearSystem, SharedMatrix, SharedVector, VariableId};
use crate::warehouse::DependencySet;
use crate::ThreadId;
use nalgebra::{DMatrix, DVector, Point2, Vector2};

/// Number of finished elements a worker caches before committing its staged
/// contributions to the shared target in one locked section.
pub const FLUSH_BATCH_SIZE: usize = 20;

/// Staging buffers owned by one fork-join copy of a loop body.
///
/// Staged data survives until a flush; the final flush in a body's `post`
/// hook is what guarantees no contribution is dropped when the element count
/// is not a multiple of the batch size.
#[derive(Debug, Default)]
pub struct AssemblyScratch {
    thread: ThreadId,
    elements_since_flush: usize,
    vector_batch: Vec<(Vec<usize>, DVector<f64>)>,
    matrix_batch: Vec<(Vec<usize>, Vec<usize>, DMatrix<f64>)>,
    entry_batch: Vec<(usize, f64)>,
    matrix_entry_batch: Vec<(usize, usize, f64)>,
}

impl AssemblyScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn set_thread(&mut self, thread: ThreadId) {
        self.thread = thread;
    }

    pub fn stage_vector(&mut self, dofs: Vec<usize>, local: DVector<f64>) {
        self.vector_batch.push((dofs, local));
    }

    pub fn stage_matrix(&mut self, rows: Vec<usize>, cols: Vec<usize>, local: DMatrix<f64>) {
        self.matrix_batch.push((rows, cols, local));
    }

    pub fn stage_entry(&mut self, dof: usize, value: f64) {
        self.entry_batch.push((dof, value));
    }

    pub fn stage_matrix_entry(&mut self, row: usize, col: usize, value: f64) {
        self.matrix_entry_batch.push((row, col, value));
    }

    /// Note a finished element; returns true when the batch is due for a
    /// flush.
    pub fn element_finished(&mut self) -> bool {
        self.elements_since_flush += 1;
        self.elements_since_flush >= FLUSH_BATCH_SIZE
    }

    pub fn flush_vectors(&mut self, target: &SharedVector) {
        target.add_element_vectors(&self.vector_batch);
        self.vector_batch.clear();
        target.add_entries(&self.entry_batch);
        self.entry_batch.clear();
        self.elements_since_flush = 0;
    }

    pub fn flush_matrices(&mut self, target: &SharedMatrix) {
        target.add_element_matrices(&self.matrix_batch);
        self.matrix_batch.clear();
        target.add_entries(&self.matrix_entry_batch);
        self.matrix_entry_batch.clear();
        self.elements_since_flush = 0;
    }
}

/// Local solution values gathered once per element for the variables in
/// the current dependency set.
///
/// Slots of variables outside the set are left untouched, so an object
/// reading a variable it never declared sees whatever an earlier gather
/// wrote there, or zero on a fresh split copy. That staleness is the
/// observable cost of under-reporting a dependency and is kept rather than
/// papered over with an exact fallback.
#[derive(Debug, Clone)]
pub struct LocalValues {
    values: Vec<f64>,
    old_values: Vec<f64>,
}

impl LocalValues {
    pub fn new(num_variables: usize) -> Self {
        Self {
            values: vec![0.0; num_variables],
            old_values: vec![0.0; num_variables],
        }
    }

    /// Gather current and old vertex-averages of the listed variables.
    pub fn gather(
        &mut self,
        system: &NonlinearSystem,
        elem: &Element,
        needed: &DependencySet<VariableId>,
    ) {
        for var in needed.iter() {
            self.values[var.0 as usize] = system.element_average(elem, var);
            self.old_values[var.0 as usize] = system.element_average_old(elem, var);
        }
    }

    pub fn value(&self, var: VariableId) -> f64 {
        self.values[var.0 as usize]
    }

    pub fn old_value(&self, var: VariableId) -> f64 {
        self.old_values[var.0 as usize]
    }
}

/// Per-element data handed to volumetric hooks.
#[derive(Clone, Copy)]
pub struct ElementContext<'a> {
    pub mesh: &'a Mesh,
    pub system: &'a NonlinearSystem,
    pub element: &'a Element,
    pub values: &'a LocalValues,
    pub properties: &'a [f64],
    pub thread: ThreadId,
}

impl ElementContext<'_> {
    pub fn measure(&self) -> f64 {
        self.mesh.element_measure(self.element.id())
    }

    pub fn centroid(&self) -> Point2<f64> {
        self.mesh.element_centroid(self.element.id())
    }

    /// Vertex-averaged value of a variable on this element, gathered for
    /// the declared dependency set.
    pub fn value(&self, var: VariableId) -> f64 {
        self.values.value(var)
    }

    pub fn old_value(&self, var: VariableId) -> f64 {
        self.values.old_value(var)
    }

    pub fn dofs(&self, var: VariableId) -> Vec<usize> {
        self.system.dof_map().element_dofs(self.element, var)
    }

    pub fn property(&self, id: PropertyId) -> f64 {
        self.properties[id.0 as usize]
    }
}

/// Per-side data handed to boundary hooks, fired once per `(side, boundary)`.
#[derive(Clone, Copy)]
pub struct SideContext<'a> {
    pub mesh: &'a Mesh,
    pub system: &'a NonlinearSystem,
    pub element: &'a Element,
    pub side: u32,
    pub boundary: BoundaryId,
    pub values: &'a LocalValues,
    pub properties: &'a [f64],
    pub thread: ThreadId,
}

impl SideContext<'_> {
    pub fn side_length(&self) -> f64 {
        self.mesh.side_length(self.element.id(), self.side)
    }

    pub fn side_normal(&self) -> Vector2<f64> {
        self.mesh.side_normal(self.element.id(), self.side)
    }

    pub fn side_midpoint(&self) -> Point2<f64> {
        self.mesh.side_midpoint(self.element.id(), self.side)
    }

    pub fn value(&self, var: VariableId) -> f64 {
        self.values.value(var)
    }

    pub fn dofs(&self, var: VariableId) -> Vec<usize> {
        self.system.dof_map().element_dofs(self.element, var)
    }

    pub fn property(&self, id: PropertyId) -> f64 {
        self.properties[id.0 as usize]
    }
}

/// Per-face data for interior-side hooks.
///
/// `boundary` is `None` for plain interior faces and carries the tag when
/// the dispatch came from an interface boundary.
#[derive(Clone, Copy)]
pub struct InternalSideContext<'a> {
    pub mesh: &'a Mesh,
    pub system: &'a NonlinearSystem,
    pub element: &'a Element,
    pub neighbor: &'a Element,
    pub side: u32,
    pub boundary: Option<BoundaryId>,
    pub values: &'a LocalValues,
    pub neighbor_values: &'a LocalValues,
    pub properties: &'a [f64],
    pub neighbor_properties: &'a [f64],
    pub thread: ThreadId,
}

impl InternalSideContext<'_> {
    pub fn side_length(&self) -> f64 {
        self.mesh.side_length(self.element.id(), self.side)
    }

    pub fn side_normal(&self) -> Vector2<f64> {
        self.mesh.side_normal(self.element.id(), self.side)
    }

    pub fn side_midpoint(&self) -> Point2<f64> {
        self.mesh.side_midpoint(self.element.id(), self.side)
    }

    pub fn value(&self, var: VariableId) -> f64 {
        self.values.value(var)
    }

    pub fn neighbor_value(&self, var: VariableId) -> f64 {
        self.neighbor_values.value(var)
    }

    pub fn dofs(&self, var: VariableId) -> Vec<usize> {
        self.system.dof_map().element_dofs(self.element, var)
    }

    pub fn neighbor_dofs(&self, var: VariableId) -> Vec<usize> {
        self.system.dof_map().element_dofs(self.neighbor, var)
    }

    pub fn property(&self, id: PropertyId) -> f64 {
        self.properties[id.0 as usize]
    }

    pub fn neighbor_property(&self, id: PropertyId) -> f64 {
        self.neighbor_properties[id.0 as usize]
    }
}

/// Per-node data handed to nodal hooks.
#[derive(Clone, Copy)]
pub struct NodalContext<'a> {
    pub mesh: &'a Mesh,
    pub system: &'a NonlinearSystem,
    pub node: NodeId,
    pub thread: ThreadId,
}

impl NodalContext<'_> {
    pub fn point(&self) -> &Point2<f64> {
        self.mesh.vertex(self.node)
    }

    pub fn value(&self, var: VariableId) -> f64 {
        self.system.nodal_value(self.node, var)
    }

    pub fn old_value(&self, var: VariableId) -> f64 {
        self.system.nodal_value_old(self.node, var)
    }

    pub fn dof(&self, var: VariableId) -> usize {
        self.system.dof_map().dof_index(self.node, var)
    }
}

/// Element data plus the stored state handed to material evaluation.
#[derive(Clone, Copy)]
pub struct MaterialContext<'a> {
    pub mesh: &'a Mesh,
    pub system: &'a NonlinearSystem,
    pub element: &'a Element,
    pub state: &'a [f64],
    pub thread: ThreadId,
}

impl MaterialContext<'_> {
    pub fn centroid(&self) -> Point2<f64> {
        self.mesh.element_centroid(self.element.id())
    }

    pub fn value(&self, var: VariableId) -> f64 {
        self.system.element_average(self.element, var)
    }

    /// Stored (previous-state) value of a property.
    pub fn stored(&self, id: PropertyId) -> f64 {
        self.state[id.0 as usize]
    }
}

/// Element data plus read access to indicator fields, handed to markers.
#[derive(Clone, Copy)]
pub struct MarkerContext<'a> {
    pub mesh: &'a Mesh,
    pub element: &'a Element,
    pub fields: &'a FieldStore,
    pub thread: ThreadId,
}

impl MarkerContext<'_> {
    /// Finalized indicator value of `name` on this element, if such a field
    /// exists.
    pub fn indicator(&self, name: &str) -> Option<f64> {
        let index = self.mesh.element_index(self.element.id());
        self.fields.field(name).map(|field| field.get(index))
    }
}

/// Element data plus the proposed Newton increment, handed to dampers.
#[derive(Clone, Copy)]
pub struct DampingContext<'a> {
    pub mesh: &'a Mesh,
    pub system: &'a NonlinearSystem,
    pub element: &'a Element,
    pub increment: &'a DVector<f64>,
    pub thread: ThreadId,
}

impl DampingContext<'_> {
    pub fn current(&self, node: NodeId, var: VariableId) -> f64 {
        self.system.nodal_value(node, var)
    }

    pub fn nodal_increment(&self, node: NodeId, var: VariableId) -> f64 {
        self.increment[self.system.dof_map().dof_index(node, var)]
    }

    /// The value a full, undamped update would produce at a node.
    pub fn proposed(&self, node: NodeId, var: VariableId) -> f64 {
        self.current(node, var) + self.nodal_increment(node, var)
    }
}
