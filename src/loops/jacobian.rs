//! Jacobian assembly over element interiors, boundary sides and interior
//! faces.

use crate::assembly::{AssemblyScratch, ElementContext, InternalSideContext, LocalValues, SideContext};
use crate::loops::{collect_assembly_dependencies, owns_internal_side, ElementVisitor};
use crate::materials::PropertyId;
use crate::mesh::{BoundaryId, Element, SubdomainId};
use crate::physics::{DgJacobianBlocks, EvaluationError, KernelSet};
use crate::problem::Problem;
use crate::system::{SharedMatrix, VariableId};
use crate::warehouse::DependencySet;
use crate::ThreadId;
use nalgebra::DMatrix;

/// Assembles the global Jacobian in triplet form.
///
/// Kernels and boundary conditions contribute the diagonal block of their
/// variable; DG and interface kernels contribute all four elem/neighbor
/// coupling blocks of an owned face in one dispatch. Staging and batched
/// flushing mirror [`super::ResidualLoop`].
pub struct JacobianLoop<'a> {
    problem: &'a Problem,
    target: &'a SharedMatrix,
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

impl<'a> JacobianLoop<'a> {
    pub fn new(problem: &'a Problem, target: &'a SharedMatrix) -> Self {
        Self::for_set(problem, target, KernelSet::All)
    }

    /// Assemble only the volumetric kernels of `set`, mirroring
    /// [`super::ResidualLoop::for_set`].
    pub fn for_set(problem: &'a Problem, target: &'a SharedMatrix, set: KernelSet) -> Self {
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

impl ElementVisitor for JacobianLoop<'_> {
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
            let mut local = DMatrix::zeros(dofs.len(), dofs.len());
            kernel.element_jacobian(&ctx, &mut local)?;
            self.scratch.stage_matrix(dofs.clone(), dofs, local);
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
                let mut local = DMatrix::zeros(dofs.len(), dofs.len());
                bc.side_jacobian(&ctx, &mut local)?;
                self.scratch.stage_matrix(dofs.clone(), dofs, local);
            }
        }

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
                    let mut blocks = DgJacobianBlocks::zeros(elem_dofs.len(), neighbor_dofs.len());
                    kernel.interface_jacobian(&ctx, &mut blocks)?;
                    stage_blocks(&mut self.scratch, &elem_dofs, &neighbor_dofs, blocks);
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
            let mut blocks = DgJacobianBlocks::zeros(elem_dofs.len(), neighbor_dofs.len());
            kernel.side_jacobian(&ctx, &mut blocks)?;
            stage_blocks(&mut self.scratch, &elem_dofs, &neighbor_dofs, blocks);
        }
        Ok(())
    }

    fn post_element(&mut self, _elem: &Element) {
        if self.scratch.element_finished() {
            self.scratch.flush_matrices(self.target);
        }
    }

    fn post(&mut self) {
        self.scratch.flush_matrices(self.target);
    }

    fn split(&self) -> Self {
        Self::for_set(self.problem, self.target, self.set)
    }

    fn join(&mut self, _other: Self) {}
}

fn stage_blocks(
    scratch: &mut AssemblyScratch,
    elem_dofs: &[usize],
    neighbor_dofs: &[usize],
    blocks: DgJacobianBlocks,
) {
    scratch.stage_matrix(elem_dofs.to_vec(), elem_dofs.to_vec(), blocks.elem_elem);
    scratch.stage_matrix(
        elem_dofs.to_vec(),
        neighbor_dofs.to_vec(),
        blocks.elem_neighbor,
    );
    scratch.stage_matrix(
        neighbor_dofs.to_vec(),
        elem_dofs.to_vec(),
        blocks.neighbor_elem,
    );
    scratch.stage_matrix(
        neighbor_dofs.to_vec(),
        neighbor_dofs.to_vec(),
        blocks.neighbor_neighbor,
    );
}
