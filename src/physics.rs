//! Traits implemented by user physics objects and the error type their
//! hooks raise.
//!
//! Objects are registered once, shared immutably across traversal workers,
//! and dispatched through trait objects. Hooks that assemble write into
//! caller-provided buffers so local allocations can be reused across
//! elements.

use crate::assembly::{
    DampingContext, ElementContext, InternalSideContext, MaterialContext, MarkerContext,
    NodalContext, SideContext,
};
use crate::materials::PropertyId;
use crate::mesh::{BoundaryId, ElementId, NodeId, SubdomainId};
use crate::system::VariableId;
use nalgebra::{DMatrix, DVector};
use std::fmt;

/// Error raised by a physics hook, carrying the mesh entity it occurred on.
///
/// Traversals stop cooperatively on the first raised error and surface it to
/// the caller once all workers have drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationError {
    message: String,
    element: Option<ElementId>,
    node: Option<NodeId>,
}

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            element: None,
            node: None,
        }
    }

    pub fn at_element(message: impl Into<String>, element: ElementId) -> Self {
        Self {
            message: message.into(),
            element: Some(element),
            node: None,
        }
    }

    pub fn at_node(message: impl Into<String>, node: NodeId) -> Self {
        Self {
            message: message.into(),
            element: None,
            node: Some(node),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn element(&self) -> Option<ElementId> {
        self.element
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(element) = self.element {
            write!(f, " (element {element})")?;
        }
        if let Some(node) = self.node {
            write!(f, " (node {})", node.0)?;
        }
        Ok(())
    }
}

impl std::error::Error for EvaluationError {}

/// Identity, activity restriction and dependency declarations shared by
/// every physics object.
///
/// `subdomains`/`boundaries` returning `None` means unrestricted; the
/// warehouses expand that against the mesh when activity lists are built.
pub trait PhysicsObject: Send + Sync {
    fn name(&self) -> &str;

    fn subdomains(&self) -> Option<&[SubdomainId]> {
        None
    }

    fn boundaries(&self) -> Option<&[BoundaryId]> {
        None
    }

    /// Variables this object reads beyond the ones implied by its role,
    /// such as [`Kernel::variable`].
    ///
    /// Local solution values are gathered per element for declared
    /// variables only; an undeclared read sees whatever an earlier gather
    /// left behind. Off-diagonal nodal Jacobian entries are likewise only
    /// requested for declared couplings.
    fn coupled_variables(&self) -> &[VariableId] {
        &[]
    }

    /// Material properties this object reads.
    ///
    /// Materials are evaluated only on elements where at least one active
    /// object declares a property; an undeclared property read sees zeros.
    fn material_properties(&self) -> &[PropertyId] {
        &[]
    }
}

/// Which volumetric kernels a residual or Jacobian traversal assembles.
///
/// Time integration assembles the time-derivative terms and the steady
/// terms in separate passes; `All` is the plain single-pass assembly. Side
/// terms (boundary, DG, interface) belong to the steady part, so a `Time`
/// pass visits no sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelSet {
    #[default]
    All,
    Time,
    Steady,
}

impl KernelSet {
    pub fn includes(self, kernel: &dyn Kernel) -> bool {
        match self {
            KernelSet::All => true,
            KernelSet::Time => kernel.is_time_kernel(),
            KernelSet::Steady => !kernel.is_time_kernel(),
        }
    }
}

/// A volumetric weak-form term of one variable.
///
/// Hooks add into `out`, a zeroed buffer sized to the element dof count of
/// [`Kernel::variable`]; the loop stages one such buffer per kernel and the
/// shared target sums overlapping dofs.
pub trait Kernel: PhysicsObject {
    fn variable(&self) -> VariableId;

    /// Time-derivative terms are assembled by the [`KernelSet::Time`] pass
    /// and skipped by [`KernelSet::Steady`].
    fn is_time_kernel(&self) -> bool {
        false
    }

    fn element_residual(
        &self,
        ctx: &ElementContext<'_>,
        out: &mut DVector<f64>,
    ) -> Result<(), EvaluationError>;

    fn element_jacobian(
        &self,
        ctx: &ElementContext<'_>,
        out: &mut DMatrix<f64>,
    ) -> Result<(), EvaluationError>;
}

/// A weakly-enforced boundary term, fired once per `(side, boundary)` pair.
pub trait IntegratedBc: PhysicsObject {
    fn variable(&self) -> VariableId;

    fn side_residual(
        &self,
        ctx: &SideContext<'_>,
        out: &mut DVector<f64>,
    ) -> Result<(), EvaluationError>;

    fn side_jacobian(
        &self,
        _ctx: &SideContext<'_>,
        _out: &mut DMatrix<f64>,
    ) -> Result<(), EvaluationError> {
        Ok(())
    }
}

/// The four coupling blocks of an internal-side Jacobian contribution.
#[derive(Debug, Clone)]
pub struct DgJacobianBlocks {
    pub elem_elem: DMatrix<f64>,
    pub elem_neighbor: DMatrix<f64>,
    pub neighbor_elem: DMatrix<f64>,
    pub neighbor_neighbor: DMatrix<f64>,
}

impl DgJacobianBlocks {
    pub fn zeros(elem_dofs: usize, neighbor_dofs: usize) -> Self {
        Self {
            elem_elem: DMatrix::zeros(elem_dofs, elem_dofs),
            elem_neighbor: DMatrix::zeros(elem_dofs, neighbor_dofs),
            neighbor_elem: DMatrix::zeros(neighbor_dofs, elem_dofs),
            neighbor_neighbor: DMatrix::zeros(neighbor_dofs, neighbor_dofs),
        }
    }

    pub fn set_zero(&mut self) {
        self.elem_elem.fill(0.0);
        self.elem_neighbor.fill(0.0);
        self.neighbor_elem.fill(0.0);
        self.neighbor_neighbor.fill(0.0);
    }
}

/// A discontinuous-Galerkin flux term on interior sides.
///
/// Fired once per interior face from the owning element; contributions for
/// both adjacent elements are produced in the same call.
pub trait DgKernel: PhysicsObject {
    fn variable(&self) -> VariableId;

    fn side_residual(
        &self,
        ctx: &InternalSideContext<'_>,
        elem_out: &mut DVector<f64>,
        neighbor_out: &mut DVector<f64>,
    ) -> Result<(), EvaluationError>;

    fn side_jacobian(
        &self,
        _ctx: &InternalSideContext<'_>,
        _blocks: &mut DgJacobianBlocks,
    ) -> Result<(), EvaluationError> {
        Ok(())
    }
}

/// A coupling term on a tagged internal interface between two subdomains.
///
/// Interface kernels must be boundary-restricted; they fire where a tagged
/// side also has a neighbor, from the side the tag was placed on.
pub trait InterfaceKernel: PhysicsObject {
    fn variable(&self) -> VariableId;

    fn interface_residual(
        &self,
        ctx: &InternalSideContext<'_>,
        elem_out: &mut DVector<f64>,
        neighbor_out: &mut DVector<f64>,
    ) -> Result<(), EvaluationError>;

    fn interface_jacobian(
        &self,
        _ctx: &InternalSideContext<'_>,
        _blocks: &mut DgJacobianBlocks,
    ) -> Result<(), EvaluationError> {
        Ok(())
    }
}

/// A pointwise term evaluated at nodes.
///
/// Off-diagonal Jacobian entries are only requested for variables declared
/// in [`PhysicsObject::coupled_variables`]; couplings an implementation
/// computes but does not declare are never dispatched.
pub trait NodalKernel: PhysicsObject {
    fn variable(&self) -> VariableId;

    fn residual(&self, ctx: &NodalContext<'_>) -> Result<f64, EvaluationError>;

    fn jacobian(&self, _ctx: &NodalContext<'_>) -> Result<f64, EvaluationError> {
        Ok(0.0)
    }

    fn off_diagonal_jacobian(
        &self,
        _ctx: &NodalContext<'_>,
        _coupled: VariableId,
    ) -> Result<f64, EvaluationError> {
        Ok(0.0)
    }
}

/// An error indicator contributing a per-element estimate.
///
/// Element and side parts accumulate during the compute pass; `finalize`
/// maps the accumulated value once at the end (for instance taking a square
/// root), in a pass that visits element interiors only.
pub trait Indicator: PhysicsObject {
    fn element_indicator(&self, _ctx: &ElementContext<'_>) -> Result<f64, EvaluationError> {
        Ok(0.0)
    }

    fn side_indicator(&self, _ctx: &InternalSideContext<'_>) -> Result<f64, EvaluationError> {
        Ok(0.0)
    }

    fn finalize(&self, accumulated: f64) -> f64 {
        accumulated
    }
}

/// Decision of a marker for one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerValue {
    Coarsen,
    DoNothing,
    Refine,
}

impl MarkerValue {
    /// Field encoding, chosen so that `DoNothing` is the zero state of a
    /// freshly allocated field.
    pub fn to_f64(self) -> f64 {
        match self {
            MarkerValue::Coarsen => -1.0,
            MarkerValue::DoNothing => 0.0,
            MarkerValue::Refine => 1.0,
        }
    }

    pub fn from_f64(value: f64) -> Self {
        if value > 0.5 {
            MarkerValue::Refine
        } else if value < -0.5 {
            MarkerValue::Coarsen
        } else {
            MarkerValue::DoNothing
        }
    }
}

/// Maps indicator output to refinement decisions, one element at a time.
pub trait Marker: PhysicsObject {
    fn mark(&self, ctx: &MarkerContext<'_>) -> Result<MarkerValue, EvaluationError>;
}

/// Limits the Newton update; the loop folds the minimum factor over all
/// elements and dampers.
///
/// Returned factors must lie in `(0, 1]`; anything else is reported as an
/// evaluation error.
pub trait Damper: PhysicsObject {
    fn compute_damping(&self, ctx: &DampingContext<'_>) -> Result<f64, EvaluationError>;
}

/// A reduction over element interiors: the loop folds sum, count, minimum
/// and maximum of the returned values.
pub trait ElementUserObject: PhysicsObject {
    fn element_value(&self, ctx: &ElementContext<'_>) -> Result<f64, EvaluationError>;
}

/// Computes instantaneous material property values for one element into the
/// registered property slots.
pub trait Material: PhysicsObject {
    fn evaluate(
        &self,
        ctx: &MaterialContext<'_>,
        properties: &mut [f64],
    ) -> Result<(), EvaluationError>;
}
