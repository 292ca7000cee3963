//! Refinement marking from finalized indicator fields.

use crate::assembly::MarkerContext;
use crate::loops::ElementVisitor;
use crate::mesh::{Element, SubdomainId};
use crate::physics::EvaluationError;
use crate::problem::Problem;
use crate::system::ElementField;
use crate::ThreadId;

/// Writes each marker's refinement decision into its named field.
///
/// Markers only read finalized indicator fields and element geometry, so
/// the loop touches neither materials nor the solution. The decisions are
/// applied to the mesh between traversals, never here.
pub struct MarkerLoop<'a> {
    problem: &'a Problem,
    active: Vec<(u32, &'a ElementField)>,
    thread: ThreadId,
}

impl<'a> MarkerLoop<'a> {
    /// The caller must have created a field per registered marker, named
    /// after the marker.
    pub fn new(problem: &'a Problem) -> Self {
        Self {
            problem,
            active: Vec::new(),
            thread: ThreadId::default(),
        }
    }
}

impl ElementVisitor for MarkerLoop<'_> {
    fn begin_range(&mut self, thread: ThreadId) {
        self.thread = thread;
    }

    fn subdomain_changed(
        &mut self,
        current: SubdomainId,
        _previous: SubdomainId,
    ) -> Result<(), EvaluationError> {
        self.active.clear();
        let registry = self.problem.registry();
        let fields = self.problem.fields();
        for &index in registry.markers().active_on_subdomain(current) {
            let name = registry.markers().object(index).name();
            if let Some(field) = fields.field(name) {
                self.active.push((index, field));
            }
        }
        Ok(())
    }

    fn on_element(&mut self, elem: &Element) -> Result<(), EvaluationError> {
        if self.active.is_empty() {
            return Ok(());
        }
        let slot = self.problem.mesh().element_index(elem.id());
        let ctx = MarkerContext {
            mesh: self.problem.mesh(),
            element: elem,
            fields: self.problem.fields(),
            thread: self.thread,
        };
        for &(index, field) in &self.active {
            let marker = self.problem.registry().markers().object(index);
            let value = marker.mark(&ctx)?;
            field.set(slot, value.to_f64());
        }
        Ok(())
    }

    fn split(&self) -> Self {
        Self::new(self.problem)
    }

    fn join(&mut self, _other: Self) {}
}
