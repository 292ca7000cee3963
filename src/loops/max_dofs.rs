//! Maximum per-element dof count, the simplest reduction loop.

use crate::loops::ElementVisitor;
use crate::mesh::Element;
use crate::physics::EvaluationError;
use crate::problem::Problem;

/// Folds the maximum number of dofs any single element carries, across all
/// variables. Solvers size their element work buffers from this.
pub struct MaxDofsLoop<'a> {
    problem: &'a Problem,
    max_dofs: usize,
}

impl<'a> MaxDofsLoop<'a> {
    pub fn new(problem: &'a Problem) -> Self {
        Self {
            problem,
            max_dofs: 0,
        }
    }

    pub fn max_dofs(&self) -> usize {
        self.max_dofs
    }
}

impl ElementVisitor for MaxDofsLoop<'_> {
    fn on_element(&mut self, elem: &Element) -> Result<(), EvaluationError> {
        let dofs = self.problem.system().dof_map().num_element_dofs(elem);
        self.max_dofs = self.max_dofs.max(dofs);
        Ok(())
    }

    fn split(&self) -> Self {
        Self::new(self.problem)
    }

    fn join(&mut self, other: Self) {
        self.max_dofs = self.max_dofs.max(other.max_dofs);
    }
}
