//! Newton update damping as a minimum reduction over elements.

use crate::assembly::DampingContext;
use crate::loops::ElementVisitor;
use crate::mesh::{Element, SubdomainId};
use crate::physics::EvaluationError;
use crate::problem::Problem;
use crate::ThreadId;
use nalgebra::DVector;
use ordered_float::NotNan;

/// Folds the minimum damping factor over all elements and dampers.
///
/// The identity is 1.0, an undamped update: a traversal with no active
/// damper, or a split copy with an empty range, leaves the factor at 1.0.
/// Factors outside `(0, 1]` (including NaN) are evaluation errors rather
/// than silently clamped values.
pub struct DampingLoop<'a> {
    problem: &'a Problem,
    increment: &'a DVector<f64>,
    active: &'a [u32],
    min_factor: NotNan<f64>,
    thread: ThreadId,
}

impl<'a> DampingLoop<'a> {
    pub fn new(problem: &'a Problem, increment: &'a DVector<f64>) -> Self {
        Self {
            problem,
            increment,
            active: &[],
            min_factor: NotNan::new(1.0).unwrap(),
            thread: ThreadId::default(),
        }
    }

    pub fn min_factor(&self) -> f64 {
        self.min_factor.into_inner()
    }
}

impl ElementVisitor for DampingLoop<'_> {
    fn begin_range(&mut self, thread: ThreadId) {
        self.thread = thread;
    }

    fn subdomain_changed(
        &mut self,
        current: SubdomainId,
        _previous: SubdomainId,
    ) -> Result<(), EvaluationError> {
        self.active = self.problem.registry().dampers().active_on_subdomain(current);
        Ok(())
    }

    fn on_element(&mut self, elem: &Element) -> Result<(), EvaluationError> {
        if self.active.is_empty() {
            return Ok(());
        }
        let ctx = DampingContext {
            mesh: self.problem.mesh(),
            system: self.problem.system(),
            element: elem,
            increment: self.increment,
            thread: self.thread,
        };
        for &index in self.active {
            let damper = self.problem.registry().dampers().object(index);
            let factor = damper.compute_damping(&ctx)?;
            let factor = NotNan::new(factor).map_err(|_| {
                EvaluationError::at_element(
                    format!("damper '{}' produced a NaN factor", damper.name()),
                    elem.id(),
                )
            })?;
            if factor.into_inner() <= 0.0 || factor.into_inner() > 1.0 {
                return Err(EvaluationError::at_element(
                    format!(
                        "damper '{}' produced factor {} outside (0, 1]",
                        damper.name(),
                        factor
                    ),
                    elem.id(),
                ));
            }
            self.min_factor = self.min_factor.min(factor);
        }
        Ok(())
    }

    fn split(&self) -> Self {
        Self::new(self.problem, self.increment)
    }

    fn join(&mut self, other: Self) {
        self.min_factor = self.min_factor.min(other.min_factor);
    }
}
