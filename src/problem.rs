//! The problem facade: owns the mesh, the system, the registered objects
//! and all traversal entry points.
//!
//! Everything a traversal reads is borrowed immutably from here, which is
//! what lets loop bodies be copied freely across workers. Mutation (setting
//! solutions, refining the mesh) happens between traversals through `&mut`
//! methods.

use crate::assembly::MaterialContext;
use crate::loops::{
    self, DampingLoop, IndicatorLoop, IndicatorPhase, JacobianLoop, MarkerLoop, MaxDofsLoop,
    NodalJacobianLoop, NodalResidualLoop, ResidualLoop, UserObjectLoop, UserObjectStats,
};
use crate::materials::{MaterialStateStore, PropertyId};
use crate::mesh::range::PartitionRange;
use crate::mesh::{Element, ElementId, Mesh, NodeId, ProcessorId};
use crate::physics::{EvaluationError, KernelSet, MarkerValue};
use crate::system::{DofMap, FieldStore, NonlinearSystem, SharedMatrix, SharedVector};
use crate::warehouse::{DependencySet, Registry};
use crate::ThreadId;
use eyre::Result;
use log::{debug, info};
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;

/// Parallel execution settings for traversals.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionOptions {
    /// Smallest range a split may produce. `None` derives a grain from the
    /// population size and the worker pool width; `Some(usize::MAX)` forces
    /// serial traversal.
    pub grain: Option<usize>,
}

/// A multiphysics problem assembled by threaded traversals.
pub struct Problem {
    mesh: Mesh,
    system: NonlinearSystem,
    registry: Registry,
    material_state: MaterialStateStore,
    fields: FieldStore,
    processor: ProcessorId,
    options: ExecutionOptions,
}

impl Problem {
    pub fn new(mesh: Mesh, variables: Vec<String>, mut registry: Registry) -> Self {
        registry.finalize(&mesh);
        let dof_map = DofMap::new(&mesh, variables);
        let system = NonlinearSystem::new(dof_map);
        let material_state = MaterialStateStore::new(&mesh, registry.num_properties());
        Self {
            mesh,
            system,
            registry,
            material_state,
            fields: FieldStore::default(),
            processor: ProcessorId::default(),
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Which partition of the mesh this process traverses.
    pub fn set_processor(&mut self, processor: ProcessorId) {
        self.processor = processor;
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn system(&self) -> &NonlinearSystem {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut NonlinearSystem {
        &mut self.system
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn fields(&self) -> &FieldStore {
        &self.fields
    }

    pub fn material_state(&self) -> &MaterialStateStore {
        &self.material_state
    }

    pub fn processor(&self) -> ProcessorId {
        self.processor
    }

    /// The element population of one traversal on this process.
    pub fn local_elements(&self) -> Vec<ElementId> {
        self.mesh.active_local_elements(self.processor)
    }

    /// The node population of one nodal traversal on this process.
    pub fn local_nodes(&self) -> Vec<NodeId> {
        self.mesh.local_nodes(self.processor)
    }

    fn grain_for(&self, population: usize) -> usize {
        match self.options.grain {
            Some(grain) => grain,
            None => (population / (4 * rayon::current_num_threads().max(1))).max(1),
        }
    }

    /// Assemble the global residual: volumetric, boundary, DG and interface
    /// contributions from the element loop, then nodal kernel contributions
    /// from the node loop.
    pub fn compute_residual(&self) -> Result<DVector<f64>> {
        self.compute_residual_for(KernelSet::All)
    }

    /// Assemble one kernel set of the residual. `Time` covers only the
    /// time-derivative kernels; side and nodal terms belong to the steady
    /// part, so `Time` plus `Steady` sums to `All`.
    pub fn compute_residual_for(&self, set: KernelSet) -> Result<DVector<f64>> {
        let target = SharedVector::zeros(self.system.dof_map().num_dofs());
        let elements = self.local_elements();
        debug!("assembling {set:?} residual over {} elements", elements.len());
        let range = PartitionRange::new(&elements, self.grain_for(elements.len()));
        let mut body = ResidualLoop::for_set(self, &target, set);
        loops::run_elements(&self.mesh, range, &mut body)?;

        if set != KernelSet::Time {
            let nodes = self.local_nodes();
            let node_range = PartitionRange::new(&nodes, self.grain_for(nodes.len()));
            let mut nodal = NodalResidualLoop::new(self, &target);
            loops::run_nodes(node_range, &mut nodal)?;
        }
        Ok(target.into_vector())
    }

    /// Assemble the global Jacobian, summed from triplets on conversion.
    pub fn compute_jacobian(&self) -> Result<CsrMatrix<f64>> {
        self.compute_jacobian_for(KernelSet::All)
    }

    /// Assemble one kernel set of the Jacobian, partitioned like
    /// [`Problem::compute_residual_for`].
    pub fn compute_jacobian_for(&self, set: KernelSet) -> Result<CsrMatrix<f64>> {
        let num_dofs = self.system.dof_map().num_dofs();
        let target = SharedMatrix::zeros(num_dofs, num_dofs);
        let elements = self.local_elements();
        debug!("assembling {set:?} jacobian over {} elements", elements.len());
        let range = PartitionRange::new(&elements, self.grain_for(elements.len()));
        let mut body = JacobianLoop::for_set(self, &target, set);
        loops::run_elements(&self.mesh, range, &mut body)?;

        if set != KernelSet::Time {
            let nodes = self.local_nodes();
            let node_range = PartitionRange::new(&nodes, self.grain_for(nodes.len()));
            let mut nodal = NodalJacobianLoop::new(self, &target);
            loops::run_nodes(node_range, &mut nodal)?;
        }
        Ok(target.into_csr())
    }

    /// Run the indicator compute pass followed by the finalize pass,
    /// (re)creating one field per registered indicator.
    pub fn compute_indicators(&mut self) -> Result<()> {
        let len = self.mesh.num_element_slots();
        let names: Vec<String> = self
            .registry
            .indicators()
            .objects()
            .map(|indicator| indicator.name().to_owned())
            .collect();
        for name in &names {
            self.fields.reset(name, len);
        }

        let elements = self.local_elements();
        let range = PartitionRange::new(&elements, self.grain_for(elements.len()));
        let mut compute = IndicatorLoop::new(self, IndicatorPhase::Compute);
        loops::run_elements(&self.mesh, range, &mut compute)?;
        let mut finalize = IndicatorLoop::new(self, IndicatorPhase::Finalize);
        loops::run_elements(&self.mesh, range, &mut finalize)?;
        Ok(())
    }

    /// Evaluate all markers into their fields. Indicator fields must be
    /// current; run [`Problem::compute_indicators`] first.
    pub fn compute_markers(&mut self) -> Result<()> {
        let len = self.mesh.num_element_slots();
        let names: Vec<String> = self
            .registry
            .markers()
            .objects()
            .map(|marker| marker.name().to_owned())
            .collect();
        for name in &names {
            self.fields.reset(name, len);
        }

        let elements = self.local_elements();
        let range = PartitionRange::new(&elements, self.grain_for(elements.len()));
        let mut body = MarkerLoop::new(self);
        loops::run_elements(&self.mesh, range, &mut body)?;
        Ok(())
    }

    /// Minimum damping factor over all elements and dampers for the
    /// proposed Newton increment; 1.0 when nothing damps.
    pub fn compute_damping(&self, increment: &DVector<f64>) -> Result<f64> {
        eyre::ensure!(
            increment.len() == self.system.dof_map().num_dofs(),
            "increment has {} entries for {} dofs",
            increment.len(),
            self.system.dof_map().num_dofs()
        );
        let elements = self.local_elements();
        let range = PartitionRange::new(&elements, self.grain_for(elements.len()));
        let mut body = DampingLoop::new(self, increment);
        loops::run_elements(&self.mesh, range, &mut body)?;
        let factor = body.min_factor();
        if factor < 1.0 {
            debug!("damping newton update by {factor}");
        }
        Ok(factor)
    }

    /// Apply a Newton increment damped by [`Problem::compute_damping`];
    /// returns the factor used.
    pub fn apply_update(&mut self, increment: &DVector<f64>) -> Result<f64> {
        let factor = self.compute_damping(increment)?;
        self.system.apply_update(increment, factor);
        Ok(factor)
    }

    /// Largest dof count any single element carries.
    pub fn max_element_dofs(&self) -> Result<usize> {
        let elements = self.local_elements();
        let range = PartitionRange::new(&elements, self.grain_for(elements.len()));
        let mut body = MaxDofsLoop::new(self);
        loops::run_elements(&self.mesh, range, &mut body)?;
        Ok(body.max_dofs())
    }

    /// Run all element user objects and return their reduction stats in
    /// registration order.
    pub fn execute_user_objects(&self) -> Result<Vec<UserObjectStats>> {
        let elements = self.local_elements();
        let range = PartitionRange::new(&elements, self.grain_for(elements.len()));
        let mut body = UserObjectLoop::new(self);
        loops::run_elements(&self.mesh, range, &mut body)?;
        Ok(body.into_stats())
    }

    /// Refine the given elements and bring dof map, solution, material
    /// state and warehouses up to date with the grown mesh.
    pub fn refine_elements(&mut self, ids: &[ElementId]) -> Result<Vec<ElementId>> {
        let mut children = Vec::with_capacity(4 * ids.len());
        for &id in ids {
            children.extend(self.mesh.refine(id)?);
        }
        info!("refined {} elements into {}", ids.len(), children.len());
        self.material_state.resize_for(&self.mesh);
        self.system.resize_for(&self.mesh);
        self.registry.finalize(&self.mesh);
        Ok(children)
    }

    /// Refine every element any marker field flags for refinement.
    ///
    /// Coarsening decisions stay recorded in the marker fields; only
    /// refinement is applied here.
    pub fn apply_markers(&mut self) -> Result<Vec<ElementId>> {
        let elements = self.local_elements();
        let mut to_refine = Vec::new();
        for marker in self.registry.markers().objects() {
            let field = match self.fields.field(marker.name()) {
                Some(field) => field,
                None => continue,
            };
            for &id in &elements {
                let slot = self.mesh.element_index(id);
                if MarkerValue::from_f64(field.get(slot)) == MarkerValue::Refine {
                    to_refine.push(id);
                }
            }
        }
        to_refine.sort_unstable();
        to_refine.dedup();
        self.refine_elements(&to_refine)
    }

    /// Evaluate the element's materials into `out`, but only when the
    /// running loop declared at least one property dependency. Skipped
    /// elements keep `out` zeroed and their stored state does not advance.
    pub(crate) fn evaluate_volume_materials(
        &self,
        elem: &Element,
        thread: ThreadId,
        needed: &DependencySet<PropertyId>,
        out: &mut Vec<f64>,
    ) -> Result<(), EvaluationError> {
        out.clear();
        out.resize(self.registry.num_properties(), 0.0);
        if needed.is_empty() {
            return Ok(());
        }
        let active = self
            .registry
            .materials()
            .active_on_subdomain(elem.subdomain_id());
        if active.is_empty() {
            return Ok(());
        }
        let mut swap = self
            .material_state
            .swap(self.mesh.element_index(elem.id()));
        {
            let ctx = MaterialContext {
                mesh: &self.mesh,
                system: &self.system,
                element: elem,
                state: swap.values(),
                thread,
            };
            for &index in active {
                self.registry.materials().object(index).evaluate(&ctx, out)?;
            }
        }
        // Swap back: the computed values become the stored state. An error
        // above skips this, leaving the stored state of the failing element
        // untouched.
        swap.values_mut().copy_from_slice(out);
        Ok(())
    }

    /// Face-side evaluation of a neighbor's materials. Stored state belongs
    /// to the element's own interior visit, so the neighbor sees
    /// instantaneous properties computed against zero state.
    pub(crate) fn evaluate_neighbor_materials(
        &self,
        elem: &Element,
        thread: ThreadId,
        needed: &DependencySet<PropertyId>,
        out: &mut Vec<f64>,
    ) -> Result<(), EvaluationError> {
        out.clear();
        out.resize(self.registry.num_properties(), 0.0);
        if needed.is_empty() {
            return Ok(());
        }
        let active = self
            .registry
            .materials()
            .active_on_subdomain(elem.subdomain_id());
        if active.is_empty() {
            return Ok(());
        }
        let state = vec![0.0; self.registry.num_properties()];
        let ctx = MaterialContext {
            mesh: &self.mesh,
            system: &self.system,
            element: elem,
            state: &state,
            thread,
        };
        for &index in active {
            self.registry.materials().object(index).evaluate(&ctx, out)?;
        }
        Ok(())
    }
}
