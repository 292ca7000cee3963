//! Degree-of-freedom bookkeeping, solution storage and the shared targets
//! that concurrent traversals assemble into.
//!
//! During a traversal the solution vectors are read-only; workers accumulate
//! into private buffers and commit them to a [`SharedVector`] or
//! [`SharedMatrix`] in short critical sections. The targets deliberately do
//! not expose element-wise getters while assembly is in flight.

use crate::mesh::{Element, Mesh, NodeId};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Index of a solution variable within a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableId(pub u32);

/// Node-major degree-of-freedom layout for first-order nodal variables.
///
/// The dof of `(node, var)` is `node * num_variables + var`, so all
/// variables of a node are adjacent. Every node carries every variable;
/// subdomain restriction of physics happens in the object warehouses, not in
/// the dof layout.
#[derive(Debug, Clone)]
pub struct DofMap {
    num_nodes: usize,
    variables: Vec<String>,
}

impl DofMap {
    pub fn new(mesh: &Mesh, variables: Vec<String>) -> Self {
        assert!(!variables.is_empty(), "a system needs at least one variable");
        Self {
            num_nodes: mesh.num_vertices(),
            variables,
        }
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn num_dofs(&self) -> usize {
        self.num_nodes * self.variables.len()
    }

    pub fn variable_name(&self, var: VariableId) -> &str {
        &self.variables[var.0 as usize]
    }

    pub fn variable_id(&self, name: &str) -> Option<VariableId> {
        self.variables
            .iter()
            .position(|n| n == name)
            .map(|i| VariableId(i as u32))
    }

    pub fn variable_ids(&self) -> impl Iterator<Item = VariableId> + '_ {
        (0..self.variables.len() as u32).map(VariableId)
    }

    pub fn dof_index(&self, node: NodeId, var: VariableId) -> usize {
        debug_assert!((node.0 as usize) < self.num_nodes);
        node.0 as usize * self.variables.len() + var.0 as usize
    }

    /// Dofs of one variable on one element, in local vertex order.
    pub fn element_dofs(&self, elem: &Element, var: VariableId) -> Vec<usize> {
        elem.vertex_ids()
            .iter()
            .map(|&node| self.dof_index(node, var))
            .collect()
    }

    /// Number of dofs carried by an element across all variables.
    pub fn num_element_dofs(&self, elem: &Element) -> usize {
        elem.num_vertices() * self.variables.len()
    }
}

/// Solution state of a nonlinear system: the current Newton iterate and the
/// previous time step.
#[derive(Debug, Clone)]
pub struct NonlinearSystem {
    dof_map: DofMap,
    solution: DVector<f64>,
    solution_old: DVector<f64>,
}

impl NonlinearSystem {
    pub fn new(dof_map: DofMap) -> Self {
        let n = dof_map.num_dofs();
        Self {
            dof_map,
            solution: DVector::zeros(n),
            solution_old: DVector::zeros(n),
        }
    }

    pub fn dof_map(&self) -> &DofMap {
        &self.dof_map
    }

    pub fn solution(&self) -> &DVector<f64> {
        &self.solution
    }

    pub fn solution_mut(&mut self) -> &mut DVector<f64> {
        &mut self.solution
    }

    pub fn set_solution(&mut self, solution: DVector<f64>) {
        assert_eq!(solution.len(), self.dof_map.num_dofs());
        self.solution = solution;
    }

    /// Copy the current solution into the old state, starting a new time
    /// step.
    pub fn advance_state(&mut self) {
        self.solution_old.copy_from(&self.solution);
    }

    /// Apply a (possibly damped) Newton update `u += factor * du`.
    pub fn apply_update(&mut self, increment: &DVector<f64>, factor: f64) {
        assert_eq!(increment.len(), self.solution.len());
        self.solution.axpy(factor, increment, 1.0);
    }

    /// Grow the system after mesh refinement. Nodes are append-only and the
    /// layout is node-major, so existing dofs keep their indices; dofs of
    /// new nodes start at zero.
    pub fn resize_for(&mut self, mesh: &Mesh) {
        let dof_map = DofMap::new(mesh, self.dof_map.variables.clone());
        let num_dofs = dof_map.num_dofs();
        let old_len = self.solution.len();
        let mut solution = DVector::zeros(num_dofs);
        let mut solution_old = DVector::zeros(num_dofs);
        solution.rows_mut(0, old_len).copy_from(&self.solution);
        solution_old.rows_mut(0, old_len).copy_from(&self.solution_old);
        self.dof_map = dof_map;
        self.solution = solution;
        self.solution_old = solution_old;
    }

    pub fn nodal_value(&self, node: NodeId, var: VariableId) -> f64 {
        self.solution[self.dof_map.dof_index(node, var)]
    }

    pub fn nodal_value_old(&self, node: NodeId, var: VariableId) -> f64 {
        self.solution_old[self.dof_map.dof_index(node, var)]
    }

    /// Vertex-average of a variable over an element, the piecewise-constant
    /// value the first-order kernels integrate against.
    pub fn element_average(&self, elem: &Element, var: VariableId) -> f64 {
        let sum: f64 = elem
            .vertex_ids()
            .iter()
            .map(|&node| self.nodal_value(node, var))
            .sum();
        sum / elem.num_vertices() as f64
    }

    /// Vertex-average of a variable's previous time step value.
    pub fn element_average_old(&self, elem: &Element, var: VariableId) -> f64 {
        let sum: f64 = elem
            .vertex_ids()
            .iter()
            .map(|&node| self.nodal_value_old(node, var))
            .sum();
        sum / elem.num_vertices() as f64
    }
}

/// A dense vector assembled concurrently, e.g. the global residual.
///
/// Workers commit whole batches of element contributions under one lock
/// acquisition; the commit counter lets callers verify that every element
/// contribution arrived, including partially filled final batches.
#[derive(Debug)]
pub struct SharedVector {
    values: Mutex<DVector<f64>>,
    commits: AtomicUsize,
}

impl SharedVector {
    pub fn zeros(n: usize) -> Self {
        Self {
            values: Mutex::new(DVector::zeros(n)),
            commits: AtomicUsize::new(0),
        }
    }

    /// Scatter-add a batch of element vectors: for each `(dofs, local)`,
    /// `values[dofs[k]] += local[k]`.
    pub fn add_element_vectors(&self, batch: &[(Vec<usize>, DVector<f64>)]) {
        if batch.is_empty() {
            return;
        }
        let mut values = self.values.lock();
        for (dofs, local) in batch {
            debug_assert_eq!(dofs.len(), local.len());
            for (k, &dof) in dofs.iter().enumerate() {
                values[dof] += local[k];
            }
        }
        self.commits.fetch_add(batch.len(), Ordering::Relaxed);
    }

    /// Scatter-add individual entries, used by nodal accumulation.
    pub fn add_entries(&self, entries: &[(usize, f64)]) {
        if entries.is_empty() {
            return;
        }
        let mut values = self.values.lock();
        for &(dof, value) in entries {
            values[dof] += value;
        }
        self.commits.fetch_add(entries.len(), Ordering::Relaxed);
    }

    /// Number of element vectors / entries committed so far.
    pub fn num_commits(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vector(self) -> DVector<f64> {
        self.values.into_inner()
    }

    pub fn clone_vector(&self) -> DVector<f64> {
        self.values.lock().clone()
    }
}

/// A sparse matrix assembled concurrently in triplet form, e.g. the global
/// Jacobian.
///
/// Duplicate triplets are summed on conversion to CSR, so workers never need
/// to coordinate beyond the push lock.
#[derive(Debug)]
pub struct SharedMatrix {
    triplets: Mutex<CooMatrix<f64>>,
    commits: AtomicUsize,
}

impl SharedMatrix {
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self {
            triplets: Mutex::new(CooMatrix::new(nrows, ncols)),
            commits: AtomicUsize::new(0),
        }
    }

    /// Scatter-add a batch of local matrices: for each
    /// `(row_dofs, col_dofs, local)`, push `local[(i, j)]` at
    /// `(row_dofs[i], col_dofs[j])`.
    pub fn add_element_matrices(&self, batch: &[(Vec<usize>, Vec<usize>, DMatrix<f64>)]) {
        if batch.is_empty() {
            return;
        }
        let mut triplets = self.triplets.lock();
        for (row_dofs, col_dofs, local) in batch {
            debug_assert_eq!(local.nrows(), row_dofs.len());
            debug_assert_eq!(local.ncols(), col_dofs.len());
            for (j, &col) in col_dofs.iter().enumerate() {
                for (i, &row) in row_dofs.iter().enumerate() {
                    triplets.push(row, col, local[(i, j)]);
                }
            }
        }
        self.commits.fetch_add(batch.len(), Ordering::Relaxed);
    }

    pub fn add_entries(&self, entries: &[(usize, usize, f64)]) {
        if entries.is_empty() {
            return;
        }
        let mut triplets = self.triplets.lock();
        for &(row, col, value) in entries {
            triplets.push(row, col, value);
        }
        self.commits.fetch_add(entries.len(), Ordering::Relaxed);
    }

    pub fn num_commits(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn into_csr(self) -> CsrMatrix<f64> {
        CsrMatrix::from(&self.triplets.into_inner())
    }

    pub fn clone_csr(&self) -> CsrMatrix<f64> {
        CsrMatrix::from(&*self.triplets.lock())
    }
}

/// A dense per-element-slot scalar field with concurrent scatter access,
/// used for error indicator and marker output.
///
/// Slots are indexed by [`Mesh::element_index`], so refined-away parents
/// keep a (zero) slot and indices stay stable across refinement.
#[derive(Debug)]
pub struct ElementField {
    values: Mutex<Vec<f64>>,
}

impl ElementField {
    pub fn zeros(len: usize) -> Self {
        Self {
            values: Mutex::new(vec![0.0; len]),
        }
    }

    pub fn for_mesh(mesh: &Mesh) -> Self {
        Self::zeros(mesh.num_element_slots())
    }

    pub fn add_batch(&self, entries: &[(usize, f64)]) {
        if entries.is_empty() {
            return;
        }
        let mut values = self.values.lock();
        for &(index, value) in entries {
            values[index] += value;
        }
    }

    pub fn set(&self, index: usize, value: f64) {
        self.values.lock()[index] = value;
    }

    pub fn get(&self, index: usize) -> f64 {
        self.values.lock()[index]
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values.into_inner()
    }

    pub fn clone_values(&self) -> Vec<f64> {
        self.values.lock().clone()
    }
}

/// Named element fields holding indicator and marker output.
///
/// Fields are created sized to the mesh before the traversal that writes
/// them; markers then read indicator fields through the same store.
#[derive(Debug, Default)]
pub struct FieldStore {
    fields: FxHashMap<String, ElementField>,
}

impl FieldStore {
    /// Create or reset the named field to `len` zeroed slots. Indicator and
    /// marker output is per-invocation; values never carry over from an
    /// earlier traversal round.
    pub fn reset(&mut self, name: &str, len: usize) {
        self.fields.insert(name.to_owned(), ElementField::zeros(len));
    }

    pub fn field(&self, name: &str) -> Option<&ElementField> {
        self.fields.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}
