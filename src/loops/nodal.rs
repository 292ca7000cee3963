//! Nodal kernel accumulation over local nodes.

use crate::assembly::{AssemblyScratch, NodalContext};
use crate::loops::NodeVisitor;
use crate::mesh::NodeId;
use crate::physics::EvaluationError;
use crate::problem::Problem;
use crate::system::{SharedMatrix, SharedVector};
use crate::ThreadId;

/// Kernels active at a node: subdomain-restricted kernels whose restriction
/// meets any of the node's subdomains, boundary-restricted kernels whose
/// tag the node carries, and unrestricted kernels everywhere. Sorted and
/// deduplicated, so a kernel fires exactly once per node even when the node
/// sits on several of its subdomains.
fn collect_active(problem: &Problem, node: NodeId, active: &mut Vec<u32>) {
    active.clear();
    let warehouse = problem.registry().nodal_kernels();
    for &subdomain in problem.mesh().node_subdomains(node) {
        active.extend_from_slice(warehouse.active_on_subdomain(subdomain));
    }
    for &boundary in problem.mesh().boundary_info().node_ids(node) {
        active.extend_from_slice(warehouse.active_on_boundary(boundary));
    }
    active.sort_unstable();
    active.dedup();
}

/// Accumulates nodal kernel residual values into the shared residual
/// vector, batching entries across nodes.
pub struct NodalResidualLoop<'a> {
    problem: &'a Problem,
    target: &'a SharedVector,
    scratch: AssemblyScratch,
    active: Vec<u32>,
}

impl<'a> NodalResidualLoop<'a> {
    pub fn new(problem: &'a Problem, target: &'a SharedVector) -> Self {
        Self {
            problem,
            target,
            scratch: AssemblyScratch::new(),
            active: Vec::new(),
        }
    }
}

impl NodeVisitor for NodalResidualLoop<'_> {
    fn begin_range(&mut self, thread: ThreadId) {
        self.scratch.set_thread(thread);
    }

    fn on_node(&mut self, node: NodeId) -> Result<(), EvaluationError> {
        collect_active(self.problem, node, &mut self.active);
        if self.active.is_empty() {
            return Ok(());
        }
        let ctx = NodalContext {
            mesh: self.problem.mesh(),
            system: self.problem.system(),
            node,
            thread: self.scratch.thread(),
        };
        for &index in &self.active {
            let kernel = self.problem.registry().nodal_kernels().object(index);
            let value = kernel.residual(&ctx)?;
            self.scratch.stage_entry(ctx.dof(kernel.variable()), value);
        }
        if self.scratch.element_finished() {
            self.scratch.flush_vectors(self.target);
        }
        Ok(())
    }

    fn post(&mut self) {
        self.scratch.flush_vectors(self.target);
    }

    fn split(&self) -> Self {
        Self::new(self.problem, self.target)
    }

    fn join(&mut self, _other: Self) {}
}

/// Accumulates nodal kernel Jacobian entries.
///
/// The diagonal entry of each kernel's variable is always requested;
/// off-diagonal entries are requested only for the couplings the kernel
/// declares, so a coupling that is computed but not declared contributes
/// nothing.
pub struct NodalJacobianLoop<'a> {
    problem: &'a Problem,
    target: &'a SharedMatrix,
    scratch: AssemblyScratch,
    active: Vec<u32>,
}

impl<'a> NodalJacobianLoop<'a> {
    pub fn new(problem: &'a Problem, target: &'a SharedMatrix) -> Self {
        Self {
            problem,
            target,
            scratch: AssemblyScratch::new(),
            active: Vec::new(),
        }
    }
}

impl NodeVisitor for NodalJacobianLoop<'_> {
    fn begin_range(&mut self, thread: ThreadId) {
        self.scratch.set_thread(thread);
    }

    fn on_node(&mut self, node: NodeId) -> Result<(), EvaluationError> {
        collect_active(self.problem, node, &mut self.active);
        if self.active.is_empty() {
            return Ok(());
        }
        let ctx = NodalContext {
            mesh: self.problem.mesh(),
            system: self.problem.system(),
            node,
            thread: self.scratch.thread(),
        };
        for &index in &self.active {
            let kernel = self.problem.registry().nodal_kernels().object(index);
            let row = ctx.dof(kernel.variable());
            let value = kernel.jacobian(&ctx)?;
            self.scratch.stage_matrix_entry(row, row, value);
            for &coupled in kernel.coupled_variables() {
                if coupled == kernel.variable() {
                    continue;
                }
                let value = kernel.off_diagonal_jacobian(&ctx, coupled)?;
                self.scratch.stage_matrix_entry(row, ctx.dof(coupled), value);
            }
        }
        if self.scratch.element_finished() {
            self.scratch.flush_matrices(self.target);
        }
        Ok(())
    }

    fn post(&mut self) {
        self.scratch.flush_matrices(self.target);
    }

    fn split(&self) -> Self {
        Self::new(self.problem, self.target)
    }

    fn join(&mut self, _other: Self) {}
}
