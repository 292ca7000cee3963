//! Error indicator computation in two passes.

use crate::assembly::{ElementContext, InternalSideContext, LocalValues};
use crate::loops::{owns_internal_side, ElementVisitor};
use crate::materials::PropertyId;
use crate::mesh::{Element, SubdomainId};
use crate::physics::EvaluationError;
use crate::problem::Problem;
use crate::system::{ElementField, VariableId};
use crate::warehouse::DependencySet;
use crate::ThreadId;

/// Which of the two indicator passes is running.
///
/// The compute pass accumulates element and side parts; the finalize pass
/// maps each accumulated value once and deliberately visits element
/// interiors only, so side parts are never finalized twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorPhase {
    Compute,
    Finalize,
}

/// Writes per-element error estimates into each indicator's named field.
///
/// Side parts are computed once per interior face, from the owning side,
/// and added to the slots of both adjacent elements; a neighbor therefore
/// receives side contributions even when it lives on a subdomain the
/// indicator is not active on, matching the flux-jump interpretation.
pub struct IndicatorLoop<'a> {
    problem: &'a Problem,
    phase: IndicatorPhase,
    properties: Vec<f64>,
    neighbor_properties: Vec<f64>,
    values: LocalValues,
    neighbor_values: LocalValues,
    variable_deps: DependencySet<VariableId>,
    property_deps: DependencySet<PropertyId>,
    active: Vec<(u32, &'a ElementField)>,
    thread: ThreadId,
}

impl<'a> IndicatorLoop<'a> {
    /// The caller must have created a field per registered indicator, named
    /// after the indicator, before running either pass.
    pub fn new(problem: &'a Problem, phase: IndicatorPhase) -> Self {
        let num_variables = problem.system().dof_map().num_variables();
        Self {
            problem,
            phase,
            properties: Vec::new(),
            neighbor_properties: Vec::new(),
            values: LocalValues::new(num_variables),
            neighbor_values: LocalValues::new(num_variables),
            variable_deps: DependencySet::new(),
            property_deps: DependencySet::new(),
            active: Vec::new(),
            thread: ThreadId::default(),
        }
    }
}

impl ElementVisitor for IndicatorLoop<'_> {
    fn begin_range(&mut self, thread: ThreadId) {
        self.thread = thread;
    }

    fn subdomain_changed(
        &mut self,
        current: SubdomainId,
        _previous: SubdomainId,
    ) -> Result<(), EvaluationError> {
        self.active.clear();
        self.variable_deps.clear();
        self.property_deps.clear();
        let registry = self.problem.registry();
        let fields = self.problem.fields();
        let indicators = registry.indicators();
        let active = indicators.active_on_subdomain(current);
        indicators.update_variable_dependency(active, &mut self.variable_deps);
        indicators.update_matprop_dependency(active, &mut self.property_deps);
        for &index in active {
            let name = indicators.object(index).name();
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
        match self.phase {
            IndicatorPhase::Compute => {
                self.values
                    .gather(self.problem.system(), elem, &self.variable_deps);
                self.problem.evaluate_volume_materials(
                    elem,
                    self.thread,
                    &self.property_deps,
                    &mut self.properties,
                )?;
                let ctx = ElementContext {
                    mesh: self.problem.mesh(),
                    system: self.problem.system(),
                    element: elem,
                    values: &self.values,
                    properties: &self.properties,
                    thread: self.thread,
                };
                for &(index, field) in &self.active {
                    let indicator = self.problem.registry().indicators().object(index);
                    let value = indicator.element_indicator(&ctx)?;
                    if value != 0.0 {
                        field.add_batch(&[(slot, value)]);
                    }
                }
            }
            IndicatorPhase::Finalize => {
                for &(index, field) in &self.active {
                    let indicator = self.problem.registry().indicators().object(index);
                    field.set(slot, indicator.finalize(field.get(slot)));
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
        if self.phase != IndicatorPhase::Compute {
            return Ok(());
        }
        if self.active.is_empty() || !owns_internal_side(elem, neighbor) {
            return Ok(());
        }
        self.neighbor_values
            .gather(self.problem.system(), neighbor, &self.variable_deps);
        self.problem.evaluate_neighbor_materials(
            neighbor,
            self.thread,
            &self.property_deps,
            &mut self.neighbor_properties,
        )?;
        let elem_slot = self.problem.mesh().element_index(elem.id());
        let neighbor_slot = self.problem.mesh().element_index(neighbor.id());
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
            thread: self.thread,
        };
        for &(index, field) in &self.active {
            let indicator = self.problem.registry().indicators().object(index);
            let value = indicator.side_indicator(&ctx)?;
            if value != 0.0 {
                field.add_batch(&[(elem_slot, value), (neighbor_slot, value)]);
            }
        }
        Ok(())
    }

    fn split(&self) -> Self {
        Self::new(self.problem, self.phase)
    }

    // Field writes go straight to the shared fields per element; copies
    // carry no residual accumulation.
    fn join(&mut self, _other: Self) {}
}
