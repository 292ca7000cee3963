//! The threaded traversal engine: visitor traits, the fork-join driver and
//! the interior-side ownership rule.
//!
//! A traversal takes a splittable range over a population (elements or
//! nodes) and a loop body implementing a visitor trait. The driver splits
//! the range recursively down to its grain, giving each half of a split a
//! body copy, runs the hooks over each leaf range, and joins copies pairwise
//! on the way back up. Bodies therefore never share mutable state; whatever
//! they accumulate is folded by `join`.

pub mod damping;
pub mod indicator;
pub mod jacobian;
pub mod marker;
pub mod max_dofs;
pub mod nodal;
pub mod residual;
pub mod user_object;

pub use damping::DampingLoop;
pub use indicator::{IndicatorLoop, IndicatorPhase};
pub use jacobian::JacobianLoop;
pub use marker::MarkerLoop;
pub use max_dofs::MaxDofsLoop;
pub use nodal::{NodalJacobianLoop, NodalResidualLoop};
pub use residual::ResidualLoop;
pub use user_object::{UserObjectLoop, UserObjectStats};

use crate::materials::PropertyId;
use crate::mesh::range::{ElementRange, NodeRange};
use crate::mesh::{BoundaryId, Element, ElementId, Mesh, NodeId, SubdomainId};
use crate::physics::{EvaluationError, KernelSet};
use crate::system::VariableId;
use crate::warehouse::{DependencySet, Registry};
use crate::ThreadId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation state of one traversal.
///
/// The first raised error wins; later ones are dropped. Workers poll
/// [`TraversalGuard::stop_requested`] once per element, so cancellation is
/// cooperative: the element in flight finishes its hooks, nothing is torn
/// down mid-element.
#[derive(Debug, Default)]
pub struct TraversalGuard {
    stop: AtomicBool,
    error: Mutex<Option<EvaluationError>>,
}

impl TraversalGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn raise(&self, error: EvaluationError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn finish(self) -> Result<(), EvaluationError> {
        match self.error.into_inner() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A loop body for element traversals.
///
/// For each element of a leaf range the driver fires, in order:
///
/// 1. [`subdomain_changed`](ElementVisitor::subdomain_changed) when the
///    element's subdomain differs from the previous element's; the first
///    element of every leaf range fires it with [`SubdomainId::INVALID`] as
///    `previous`,
/// 2. [`on_element`](ElementVisitor::on_element),
/// 3. per side, in side order: [`on_boundary`](ElementVisitor::on_boundary)
///    once per boundary tag on the side, then
///    [`on_internal_side`](ElementVisitor::on_internal_side) if the side has
///    a neighbor. The two dispatches are independent: a tagged side that
///    also has a neighbor fires both,
/// 4. [`post_element`](ElementVisitor::post_element).
///
/// [`pre`](ElementVisitor::pre) runs before the first element of a leaf
/// range and [`post`](ElementVisitor::post) after the last. `post` also runs
/// when the range stops early on error or cancellation, so buffered
/// contributions can always be flushed.
pub trait ElementVisitor: Send + Sized {
    /// First call on a leaf range, carrying the executing worker's index.
    fn begin_range(&mut self, _thread: ThreadId) {}

    fn pre(&mut self) -> Result<(), EvaluationError> {
        Ok(())
    }

    fn subdomain_changed(
        &mut self,
        _current: SubdomainId,
        _previous: SubdomainId,
    ) -> Result<(), EvaluationError> {
        Ok(())
    }

    fn on_element(&mut self, _elem: &Element) -> Result<(), EvaluationError> {
        Ok(())
    }

    fn on_boundary(
        &mut self,
        _elem: &Element,
        _side: u32,
        _boundary: BoundaryId,
    ) -> Result<(), EvaluationError> {
        Ok(())
    }

    fn on_internal_side(
        &mut self,
        _elem: &Element,
        _neighbor: &Element,
        _side: u32,
    ) -> Result<(), EvaluationError> {
        Ok(())
    }

    fn post_element(&mut self, _elem: &Element) {}

    fn post(&mut self) {}

    /// A copy of this body for the right half of a split range: shared
    /// references are copied, accumulation state starts at its identity.
    fn split(&self) -> Self;

    /// Fold a finished right-half copy back into `self`. The fold must be
    /// associative and commutative in the accumulated state, and a copy
    /// whose range turned out empty must join as the identity.
    fn join(&mut self, other: Self);
}

/// A loop body for nodal traversals.
pub trait NodeVisitor: Send + Sized {
    fn begin_range(&mut self, _thread: ThreadId) {}

    fn pre(&mut self) -> Result<(), EvaluationError> {
        Ok(())
    }

    fn on_node(&mut self, _node: NodeId) -> Result<(), EvaluationError> {
        Ok(())
    }

    fn post(&mut self) {}

    fn split(&self) -> Self;

    fn join(&mut self, other: Self);
}

/// Whether `elem` owns the work on the interior side it shares with
/// `neighbor`.
///
/// Every interior face is dispatched to both adjacent elements over the
/// course of a traversal; bodies that must touch each face exactly once
/// apply this rule. At equal refinement level the lower id wins, and the
/// neighbor must additionally be active, which hands faces against
/// refined-away parents to the finer side. Across levels the finer element
/// always owns the face, active or not, so a coarse element never double
/// counts a face its refined neighbor's children already cover.
pub fn owns_internal_side(elem: &Element, neighbor: &Element) -> bool {
    (neighbor.is_active() && neighbor.level() == elem.level() && elem.id() < neighbor.id())
        || neighbor.level() < elem.level()
}

/// Rebuild the variable and material property dependency sets of the
/// residual/Jacobian assembly bodies for one subdomain.
///
/// Volumetric and DG kernels contribute their own variable plus whatever
/// they declare; boundary conditions and interface kernels are keyed by
/// boundary tag, not subdomain, so every registered one contributes. A
/// `Time` pass assembles no side terms, so only the volumetric kernels
/// count there.
pub(crate) fn collect_assembly_dependencies(
    registry: &Registry,
    set: KernelSet,
    active_kernels: &[u32],
    active_dg: &[u32],
    variables: &mut DependencySet<VariableId>,
    properties: &mut DependencySet<PropertyId>,
) {
    variables.clear();
    properties.clear();

    let kernels = registry.kernels();
    for &index in active_kernels {
        variables.insert(kernels.object(index).variable());
    }
    kernels.update_variable_dependency(active_kernels, variables);
    kernels.update_matprop_dependency(active_kernels, properties);

    if set == KernelSet::Time {
        return;
    }

    let dg = registry.dg_kernels();
    for &index in active_dg {
        variables.insert(dg.object(index).variable());
    }
    dg.update_variable_dependency(active_dg, variables);
    dg.update_matprop_dependency(active_dg, properties);

    let bcs = registry.integrated_bcs();
    for bc in bcs.objects() {
        variables.insert(bc.variable());
    }
    bcs.update_boundary_variable_dependency(variables);
    bcs.update_boundary_matprop_dependency(properties);

    let interface = registry.interface_kernels();
    for kernel in interface.objects() {
        variables.insert(kernel.variable());
    }
    interface.update_boundary_variable_dependency(variables);
    interface.update_boundary_matprop_dependency(properties);
}

/// Run an element loop over `range`, splitting down to the range's grain
/// and joining body copies pairwise.
///
/// Returns the first error raised by any hook; the visitor's accumulated
/// state is available to the caller afterwards either way.
pub fn run_elements<V: ElementVisitor>(
    mesh: &Mesh,
    range: ElementRange<'_>,
    visitor: &mut V,
) -> Result<(), EvaluationError> {
    let guard = TraversalGuard::new();
    split_run_elements(mesh, &guard, range, visitor);
    guard.finish()
}

fn split_run_elements<V: ElementVisitor>(
    mesh: &Mesh,
    guard: &TraversalGuard,
    range: ElementRange<'_>,
    visitor: &mut V,
) {
    match range.try_split() {
        Some((left, right)) => {
            let mut right_visitor = visitor.split();
            rayon::join(
                || split_run_elements(mesh, guard, left, &mut *visitor),
                || split_run_elements(mesh, guard, right, &mut right_visitor),
            );
            visitor.join(right_visitor);
        }
        None => {
            visitor.begin_range(current_thread());
            if let Err(error) = visit_elements(mesh, guard, range.items(), visitor) {
                guard.raise(error);
            }
            visitor.post();
        }
    }
}

fn visit_elements<V: ElementVisitor>(
    mesh: &Mesh,
    guard: &TraversalGuard,
    elements: &[ElementId],
    visitor: &mut V,
) -> Result<(), EvaluationError> {
    visitor.pre()?;
    let mut current_subdomain = SubdomainId::INVALID;
    for &id in elements {
        if guard.stop_requested() {
            break;
        }
        let elem = mesh.element(id);
        if elem.subdomain_id() != current_subdomain {
            let previous = current_subdomain;
            current_subdomain = elem.subdomain_id();
            visitor.subdomain_changed(current_subdomain, previous)?;
        }
        visitor.on_element(elem)?;
        for side in 0..elem.num_sides() {
            for &boundary in mesh.boundary_ids_for_side(id, side) {
                visitor.on_boundary(elem, side, boundary)?;
            }
            if let Some(neighbor_id) = elem.neighbor(side) {
                visitor.on_internal_side(elem, mesh.element(neighbor_id), side)?;
            }
        }
        visitor.post_element(elem);
    }
    Ok(())
}

/// Run a nodal loop over `range`; the nodal counterpart of
/// [`run_elements`].
pub fn run_nodes<V: NodeVisitor>(
    range: NodeRange<'_>,
    visitor: &mut V,
) -> Result<(), EvaluationError> {
    let guard = TraversalGuard::new();
    split_run_nodes(&guard, range, visitor);
    guard.finish()
}

fn split_run_nodes<V: NodeVisitor>(guard: &TraversalGuard, range: NodeRange<'_>, visitor: &mut V) {
    match range.try_split() {
        Some((left, right)) => {
            let mut right_visitor = visitor.split();
            rayon::join(
                || split_run_nodes(guard, left, &mut *visitor),
                || split_run_nodes(guard, right, &mut right_visitor),
            );
            visitor.join(right_visitor);
        }
        None => {
            visitor.begin_range(current_thread());
            if let Err(error) = visit_nodes(guard, range.items(), visitor) {
                guard.raise(error);
            }
            visitor.post();
        }
    }
}

fn visit_nodes<V: NodeVisitor>(
    guard: &TraversalGuard,
    nodes: &[NodeId],
    visitor: &mut V,
) -> Result<(), EvaluationError> {
    visitor.pre()?;
    for &node in nodes {
        if guard.stop_requested() {
            break;
        }
        visitor.on_node(node)?;
    }
    Ok(())
}

fn current_thread() -> ThreadId {
    // Outside a rayon pool (serial ranges on the caller thread) there is no
    // pool index; all such callers share worker zero.
    ThreadId(rayon::current_thread_index().unwrap_or(0))
}
