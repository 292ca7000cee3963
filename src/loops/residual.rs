//! Residual assembly over element interiors, boundary sides and interior
//! faces.

use crate::assembly::{AssemblyScratch, ElementContext, InternalSideContext, LocalValues, SideContext};
use crate::loops::{collect_assembly_dependencies, owns_internal_side, ElementVisitor};
use crate::materials::PropertyId;
use crate::mesh::{BoundaryId, Element, SubdomainId};
use crate::physics::{EvaluationError, KernelSet};
use crate::problem::Problem;
use crate::system::{SharedVector, VariableId};
use crate::warehouse::DependencySet;
use crate::ThreadId;
use nalgebra::DVector;

/// Assembles the global residual vector.
///
/// Volumetric kernels fire on element interiors, integrated boundary
/// conditions once per tagged side, DG kernels on owned interior faces, and
/// interface kernels where a tagged side also has a neighbor. Contributions
/// are staged in the worker's scratch and committed in batches; the final
/// flush in `post` covers ranges whose element count is not a multiple of
/// the batch size.
pub struct ResidualLoop<'a> {
    problem: &'a Problem,
    target: &'a SharedVector,
    set: KernelSet,
    scratch: AssemblyScratch,
    properties: Vec<f64>,
    neighbor_properties: Vec<f64>,
    values: LocalValues,
    neighbor_values: LocalValues,
    variable_deps: DependencySet<VariableId>,
    property_deps: DependencySet<PropertyId>,
    active_kernels: Vec<u32>,
    active_dg: &'a [u32],
}

impl<'a> ResidualLoop<'a> {
    pub fn new(problem: &'a Problem, target: &'a SharedVector) -> Self {
        Self::for_set(problem, target, KernelSet::All)
    }

    /// Assemble only the volumetric kernels of `set`. A `Time` pass skips
    /// boundary, DG and interface terms; those belong to the steady part.
    pub fn for_set(problem: &'a Problem, target: &'a SharedVector, set: KernelSet) -> Self {
        let num_variables = problem.system().dof_map().num_variables();
        Self {
            problem,
            target,
            set,
            scratch: AssemblyScratch::new(),
            properties: Vec::new(),
            neighbor_properties: Vec::new(),
            values: LocalValues::new(num_variables),
            neighbor_values: LocalValues::new(num_variables),
            variable_deps: DependencySet::new(),
            property_deps: DependencySet::new(),
            active_kernels: Vec::new(),
            active_dg: &[],
        }
    }
}

impl ElementVisitor for ResidualLoop<'_> {
    fn begin_range(&mut self, thread: ThreadId) {
        self.scratch.set_thread(thread);
    }

    fn subdomain_changed(
        &mut self,
        current: SubdomainId,
        _previous: SubdomainId,
    ) -> Result<(), EvaluationError> {
        let registry = self.problem.registry();
        let kernels = registry.kernels();
        let set = self.set;
        self.active_kernels.clear();
        self.active_kernels.extend(
            kernels
                .active_on_subdomain(current)
                .iter()
                .copied()
                .filter(|&index| set.includes(kernels.object(index))),
        );
        self.active_dg = registry.dg_kernels().active_on_subdomain(current);
        collect_assembly_dependencies(
            registry,
            self.set,
            &self.active_kernels,
            self.active_dg,
            &mut self.variable_deps,
            &mut self.property_deps,
        );
        Ok(())
    }

    fn on_element(&mut self, elem: &Element) -> Result<(), EvaluationError> {
        let thread = self.scratch.thread();
        self.values
            .gather(self.problem.system(), elem, &self.variable_deps);
        self.problem.evaluate_volume_materials(
            elem,
            thread,
            &self.property_deps,
            &mut self.properties,
        )?;
        if self.active_kernels.is_empty() {
            return Ok(());
        }
        let ctx = ElementContext {
            mesh: self.problem.mesh(),
            system: self.problem.system(),
            element: elem,
            values: &self.values,
            properties: &self.properties,
            thread,
        };
        for &index in &self.active_kernels {
            let kernel = self.problem.registry().kernels().object(index);
            let dofs = ctx.dofs(kernel.variable());
            let mut local = DVector::zeros(dofs.len());
            kernel.element_residual(&ctx, &mut local)?;
            self.scratch.stage_vector(dofs, local);
        }
        Ok(())
    }

    fn on_boundary(
        &mut self,
        elem: &Element,
        side: u32,
        boundary: BoundaryId,
    ) -> Result<(), EvaluationError> {
        if self.set == KernelSet::Time {
            return Ok(());
        }
        let registry = self.problem.registry();
        let bcs = registry.integrated_bcs().active_on_boundary(boundary);
        let interface = registry.interface_kernels().active_on_boundary(boundary);
        let thread = self.scratch.thread();

        if !bcs.is_empty() {
            let ctx = SideContext {
                mesh: self.problem.mesh(),
                system: self.problem.system(),
                element: elem,
                side,
                boundary,
                values: &self.values,
                properties: &self.properties,
                thread,
            };
            for &index in bcs {
                let bc = registry.integrated_bcs().object(index);
                let dofs = ctx.dofs(bc.variable());
                let mut local = DVector::zeros(dofs.len());
                bc.side_residual(&ctx, &mut local)?;
                self.scratch.stage_vector(dofs, local);
            }
        }

        // Interface kernels are dispatched from the tagged side; the tag
        // placement decides the elem/neighbor roles.
        if !interface.is_empty() {
            if let Some(neighbor_id) = elem.neighbor(side) {
                let neighbor = self.problem.mesh().element(neighbor_id);
                self.neighbor_values
                    .gather(self.problem.system(), neighbor, &self.variable_deps);
                self.problem.evaluate_neighbor_materials(
                    neighbor,
                    thread,
                    &self.property_deps,
                    &mut self.neighbor_properties,
                )?;
                let ctx = InternalSideContext {
                    mesh: self.problem.mesh(),
                    system: self.problem.system(),
                    element: elem,
                    neighbor,
                    side,
                    boundary: Some(boundary),
                    values: &self.values,
                    neighbor_values: &self.neighbor_values,
                    properties: &self.properties,
                    neighbor_properties: &self.neighbor_properties,
                    thread,
                };
                for &index in interface {
                    let kernel = registry.interface_kernels().object(index);
                    let elem_dofs = ctx.dofs(kernel.variable());
                    let neighbor_dofs = ctx.neighbor_dofs(kernel.variable());
                    let mut elem_local = DVector::zeros(elem_dofs.len());
                    let mut neighbor_local = DVector::zeros(neighbor_dofs.len());
                    kernel.interface_residual(&ctx, &mut elem_local, &mut neighbor_local)?;
                    self.scratch.stage_vector(elem_dofs, elem_local);
                    self.scratch.stage_vector(neighbor_dofs, neighbor_local);
                }
            }
        }
        Ok(())
    }

    fn on_internal_side(
        &mut self,
        elem: &Element,
        neighbor: &Element,
        side: u32,
    ) -> Result<(), EvaluationError> {
        if self.set == KernelSet::Time
            || self.active_dg.is_empty()
            || !owns_internal_side(elem, neighbor)
        {
            return Ok(());
        }
        let thread = self.scratch.thread();
        self.neighbor_values
            .gather(self.problem.system(), neighbor, &self.variable_deps);
        self.problem.evaluate_neighbor_materials(
            neighbor,
            thread,
            &self.property_deps,
            &mut self.neighbor_properties,
        )?;
        let ctx = InternalSideContext {
            mesh: self.problem.mesh(),
            system: self.problem.system(),
            element: elem,
            neighbor,
            side,
            boundary: None,
            values: &self.values,
            neighbor_values: &self.neighbor_values,
            properties: &self.properties,
            neighbor_properties: &self.neighbor_properties,
            thread,
        };
        for &index in self.active_dg {
            let kernel = self.problem.registry().dg_kernels().object(index);
            let elem_dofs = ctx.dofs(kernel.variable());
            let neighbor_dofs = ctx.neighbor_dofs(kernel.variable());
            let mut elem_local = DVector::zeros(elem_dofs.len());
            let mut neighbor_local = DVector::zeros(neighbor_dofs.len());
            kernel.side_residual(&ctx, &mut elem_local, &mut neighbor_local)?;
            self.scratch.stage_vector(elem_dofs, elem_local);
            self.scratch.stage_vector(neighbor_dofs, neighbor_local);
        }
        Ok(())
    }

    fn post_element(&mut self, _elem: &Element) {
        if self.scratch.element_finished() {
            self.scratch.flush_vectors(self.target);
        }
    }

    fn post(&mut self) {
        self.scratch.flush_vectors(self.target);
    }

    fn split(&self) -> Self {
        Self::for_set(self.problem, self.target, self.set)
    }

    // The target is shared and every copy flushes itself in `post`; there is
    // no body-local accumulation to fold.
    fn join(&mut self, _other: Self) {}
}
