//! Element user object reductions.

use crate::assembly::{ElementContext, LocalValues};
use crate::loops::ElementVisitor;
use crate::materials::PropertyId;
use crate::mesh::{Element, SubdomainId};
use crate::physics::EvaluationError;
use crate::problem::Problem;
use crate::system::VariableId;
use crate::warehouse::DependencySet;
use crate::ThreadId;
use itertools::izip;
use ordered_float::NotNan;

/// Componentwise reduction state of one user object.
#[derive(Debug, Clone, Copy)]
pub struct UserObjectStats {
    sum: f64,
    count: u64,
    min: NotNan<f64>,
    max: NotNan<f64>,
}

impl UserObjectStats {
    fn identity() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            min: NotNan::new(f64::INFINITY).unwrap(),
            max: NotNan::new(f64::NEG_INFINITY).unwrap(),
        }
    }

    fn accumulate(&mut self, value: NotNan<f64>) {
        self.sum += value.into_inner();
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then(|| self.min.into_inner())
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then(|| self.max.into_inner())
    }
}

/// Folds sum, count, minimum and maximum of every registered element user
/// object over the elements it is active on.
///
/// Each split copy carries a stats slot per registered object (not per
/// active object), so copies that traversed disjoint subdomains still join
/// slot by slot. A NaN value from a user object is an evaluation error; it
/// cannot be folded meaningfully.
pub struct UserObjectLoop<'a> {
    problem: &'a Problem,
    properties: Vec<f64>,
    values: LocalValues,
    variable_deps: DependencySet<VariableId>,
    property_deps: DependencySet<PropertyId>,
    active: &'a [u32],
    stats: Vec<UserObjectStats>,
    thread: ThreadId,
}

impl<'a> UserObjectLoop<'a> {
    pub fn new(problem: &'a Problem) -> Self {
        Self {
            problem,
            properties: Vec::new(),
            values: LocalValues::new(problem.system().dof_map().num_variables()),
            variable_deps: DependencySet::new(),
            property_deps: DependencySet::new(),
            active: &[],
            stats: vec![UserObjectStats::identity(); problem.registry().user_objects().len()],
            thread: ThreadId::default(),
        }
    }

    /// Reduction results indexed by registration order.
    pub fn stats(&self) -> &[UserObjectStats] {
        &self.stats
    }

    pub fn into_stats(self) -> Vec<UserObjectStats> {
        self.stats
    }
}

impl ElementVisitor for UserObjectLoop<'_> {
    fn begin_range(&mut self, thread: ThreadId) {
        self.thread = thread;
    }

    fn subdomain_changed(
        &mut self,
        current: SubdomainId,
        _previous: SubdomainId,
    ) -> Result<(), EvaluationError> {
        let user_objects = self.problem.registry().user_objects();
        self.active = user_objects.active_on_subdomain(current);
        self.variable_deps.clear();
        self.property_deps.clear();
        user_objects.update_variable_dependency(self.active, &mut self.variable_deps);
        user_objects.update_matprop_dependency(self.active, &mut self.property_deps);
        Ok(())
    }

    fn on_element(&mut self, elem: &Element) -> Result<(), EvaluationError> {
        if self.active.is_empty() {
            return Ok(());
        }
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
        for &index in self.active {
            let object = self.problem.registry().user_objects().object(index);
            let value = object.element_value(&ctx)?;
            let value = NotNan::new(value).map_err(|_| {
                EvaluationError::at_element(
                    format!("user object '{}' produced NaN", object.name()),
                    elem.id(),
                )
            })?;
            self.stats[index as usize].accumulate(value);
        }
        Ok(())
    }

    fn split(&self) -> Self {
        Self::new(self.problem)
    }

    fn join(&mut self, other: Self) {
        for (mine, theirs) in izip!(&mut self.stats, other.stats) {
            mine.merge(theirs);
        }
    }
}
