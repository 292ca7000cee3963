//! Residual and Jacobian assembly through the problem facade and the raw
//! loop bodies.

use super::helpers::{
    fine_grained, serial, single_var_problem, two_var_problem, CountingKernel, CouplingInterface,
    CrossReadKernel, FailingKernel, FailingMaterial, FluxBc, JumpDg, MassKernel, PropertyKernel,
    ReactionKernel, TimeDerivativeKernel, TraversalCounter, V,
};
use matrixcompare::{assert_matrix_eq, assert_scalar_eq, prop_assert_matrix_eq};
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use proptest::collection::vec;
use proptest::prelude::*;
use skoll::assembly::FLUSH_BATCH_SIZE;
use skoll::loops::{self, ResidualLoop};
use skoll::mesh::range::PartitionRange;
use skoll::mesh::{BoundaryId, ElementId, Mesh, NodeId, SubdomainId};
use skoll::physics::{EvaluationError, KernelSet};
use skoll::problem::Problem;
use skoll::system::SharedVector;
use skoll::warehouse::Registry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn entry(csr: &CsrMatrix<f64>, row: usize, col: usize) -> f64 {
    csr.get_entry(row, col)
        .map(|e| e.into_value())
        .unwrap_or(0.0)
}

#[test]
fn residual_sums_kernel_and_boundary_contributions() {
    let mut mesh = Mesh::quad_strip(3, SubdomainId(1));
    mesh.tag_side(ElementId(0), 3, BoundaryId(1));
    let mut registry = Registry::new();
    registry.add_kernel(ReactionKernel {
        name: "reaction",
        rate: 2.0,
        subdomains: None,
    });
    registry.add_integrated_bc(FluxBc {
        name: "influx",
        flux: 4.0,
        boundaries: vec![BoundaryId(1)],
        dispatches: Arc::default(),
    });
    let problem = single_var_problem(mesh, registry).with_options(serial());

    let residual = problem.compute_residual().unwrap();
    assert_eq!(residual.len(), 8);
    assert_scalar_eq!(residual.sum(), 2.0 * 3.0 + 4.0, comp = abs, tol = 1e-12);
    // Node 4 sits between the second and third element and collects the
    // kernel share of both; no boundary touches it.
    assert_scalar_eq!(residual[4], 1.0, comp = abs, tol = 1e-12);
    // Node 0 is a left-edge corner: one kernel share plus the flux share.
    assert_scalar_eq!(residual[0], 1.5, comp = abs, tol = 1e-12);
}

#[test]
fn trailing_batch_commits_on_post() {
    let n = FLUSH_BATCH_SIZE + 3;
    let mesh = Mesh::quad_strip(n, SubdomainId(1));
    let mut registry = Registry::new();
    registry.add_kernel(ReactionKernel {
        name: "reaction",
        rate: 1.0,
        subdomains: None,
    });
    let problem = single_var_problem(mesh, registry);

    let target = SharedVector::zeros(problem.system().dof_map().num_dofs());
    let elements = problem.local_elements();
    let mut body = ResidualLoop::new(&problem, &target);
    loops::run_elements(problem.mesh(), PartitionRange::serial(&elements), &mut body).unwrap();

    // One staged vector per element. The count is not a multiple of the
    // flush batch size, so the last three only arrive with the final flush.
    assert_eq!(target.num_commits(), n);
    assert_scalar_eq!(
        target.into_vector().sum(),
        n as f64,
        comp = abs,
        tol = 1e-12
    );
}

fn grid_problem(solution: &[f64]) -> Problem {
    let mesh = Mesh::quad_grid(4, 3, SubdomainId(1));
    let mut registry = Registry::new();
    registry.add_kernel(MassKernel { name: "mass" });
    registry.add_kernel(ReactionKernel {
        name: "reaction",
        rate: 0.5,
        subdomains: None,
    });
    let mut problem = single_var_problem(mesh, registry);
    problem
        .system_mut()
        .set_solution(DVector::from_column_slice(solution));
    problem
}

proptest! {
    #[test]
    fn serial_and_parallel_residuals_match(solution in vec(-10.0..10.0f64, 20)) {
        let reference = grid_problem(&solution)
            .with_options(serial())
            .compute_residual()
            .unwrap();
        let parallel = grid_problem(&solution)
            .with_options(fine_grained())
            .compute_residual()
            .unwrap();
        prop_assert_matrix_eq!(parallel, reference, comp = abs, tol = 1e-12);
    }
}

#[test]
fn restricted_kernel_skips_foreign_subdomains() {
    let mut mesh = Mesh::quad_strip(3, SubdomainId(1));
    mesh.set_subdomain(ElementId(2), SubdomainId(2));
    let dispatches = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.add_kernel(CountingKernel {
        name: "counter",
        dispatches: dispatches.clone(),
        subdomains: Some(vec![SubdomainId(1)]),
    });
    let problem = single_var_problem(mesh, registry).with_options(serial());

    problem.compute_residual().unwrap();
    assert_eq!(dispatches.load(Ordering::Relaxed), 2);
    problem.compute_jacobian().unwrap();
    assert_eq!(dispatches.load(Ordering::Relaxed), 4);
}

#[test]
fn kernel_error_names_the_element_and_stops_the_range() {
    let survived = Arc::new(AtomicUsize::new(0));
    let mesh = Mesh::quad_strip(4, SubdomainId(1));
    let mut registry = Registry::new();
    registry.add_kernel(FailingKernel {
        name: "flaky",
        fail_on: ElementId(2),
        survived: survived.clone(),
    });
    let problem = single_var_problem(mesh, registry).with_options(serial());

    let error = problem.compute_residual().unwrap_err();
    let error = error.downcast_ref::<EvaluationError>().unwrap();
    assert_eq!(error.element(), Some(ElementId(2)));
    assert!(
        error.to_string().contains("manufactured kernel failure"),
        "{error}"
    );
    assert!(error.to_string().contains("(element 2)"), "{error}");
    // The two elements before the failure ran; the one after did not.
    assert_eq!(survived.load(Ordering::Relaxed), 2);
}

#[test]
fn jacobian_sums_duplicate_dofs_across_elements() {
    let mesh = Mesh::quad_strip(2, SubdomainId(1));
    let mut registry = Registry::new();
    registry.add_kernel(ReactionKernel {
        name: "reaction",
        rate: 4.0,
        subdomains: None,
    });
    let problem = single_var_problem(mesh, registry).with_options(serial());

    let csr = problem.compute_jacobian().unwrap();
    // Nodes 2 and 3 lie on the shared edge and collect both element shares.
    assert_scalar_eq!(entry(&csr, 2, 2), 2.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(entry(&csr, 3, 3), 2.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(entry(&csr, 0, 0), 1.0, comp = abs, tol = 1e-12);
    // This kernel writes nothing off the diagonal.
    assert_scalar_eq!(entry(&csr, 0, 2), 0.0, comp = abs, tol = 1e-12);
}

#[test]
fn dg_kernel_handles_each_interior_face_once() {
    let faces = Arc::new(AtomicUsize::new(0));
    let build = |faces: &Arc<AtomicUsize>| {
        let mesh = Mesh::quad_strip(4, SubdomainId(1));
        let mut registry = Registry::new();
        registry.add_dg_kernel(JumpDg {
            name: "jump",
            jump: 2.0,
            faces: faces.clone(),
        });
        single_var_problem(mesh, registry)
    };

    let residual = build(&faces)
        .with_options(serial())
        .compute_residual()
        .unwrap();
    assert_eq!(faces.load(Ordering::Relaxed), 3);
    // The jump only moves mass between the two sides of each face.
    assert_scalar_eq!(residual.sum(), 0.0, comp = abs, tol = 1e-12);

    faces.store(0, Ordering::Relaxed);
    build(&faces)
        .with_options(fine_grained())
        .compute_residual()
        .unwrap();
    assert_eq!(faces.load(Ordering::Relaxed), 3);
}

#[test]
fn dg_jacobian_places_all_four_coupling_blocks() {
    let mesh = Mesh::quad_strip(4, SubdomainId(1));
    let mut registry = Registry::new();
    registry.add_dg_kernel(JumpDg {
        name: "jump",
        jump: 2.0,
        faces: Arc::default(),
    });
    let problem = single_var_problem(mesh, registry).with_options(serial());

    let csr = problem.compute_jacobian().unwrap();
    // First vertex dofs of the elements are nodes 0, 2, 4, 6. Element 0
    // owns the face to element 1, element 1 the face to element 2, and so
    // on; the mock writes 1/2/3/4 into the four blocks of each owned face.
    assert_scalar_eq!(entry(&csr, 0, 0), 1.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(entry(&csr, 0, 2), 2.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(entry(&csr, 2, 0), 3.0, comp = abs, tol = 1e-12);
    // Element 1 is the neighbor of one face and the owner of the next.
    assert_scalar_eq!(entry(&csr, 2, 2), 5.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(entry(&csr, 4, 4), 5.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(entry(&csr, 6, 6), 4.0, comp = abs, tol = 1e-12);
}

#[test]
fn interface_kernel_needs_both_tag_and_neighbor() {
    let mut mesh = Mesh::quad_strip(3, SubdomainId(1));
    // One tag on an interior face, one on the exterior right edge.
    mesh.tag_side(ElementId(1), 1, BoundaryId(5));
    mesh.tag_side(ElementId(2), 1, BoundaryId(5));
    let dispatches = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.add_interface_kernel(CouplingInterface {
        name: "coupling",
        boundaries: vec![BoundaryId(5)],
        dispatches: dispatches.clone(),
    });
    let problem = single_var_problem(mesh, registry).with_options(serial());

    let residual = problem.compute_residual().unwrap();
    // Only the tagged side with a neighbor dispatches; the exterior tag
    // has nothing to couple to.
    assert_eq!(dispatches.load(Ordering::Relaxed), 1);
    assert_scalar_eq!(residual[2], 1.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(residual[4], -1.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(residual.sum(), 0.0, comp = abs, tol = 1e-12);
}

#[test]
fn material_state_advances_with_each_traversal() {
    let mesh = Mesh::quad_strip(2, SubdomainId(1));
    let mut registry = Registry::new();
    let age = registry.register_property("age");
    registry.add_material(TraversalCounter {
        name: "age_counter",
        property: age,
    });
    registry.add_kernel(PropertyKernel {
        name: "aged_source",
        property: age,
        declare_property: true,
    });
    let problem = single_var_problem(mesh, registry).with_options(serial());

    let first = problem.compute_residual().unwrap();
    assert_scalar_eq!(first.sum(), 2.0, comp = abs, tol = 1e-12);
    // The swapped-back state makes the second traversal see age 1.
    let second = problem.compute_residual().unwrap();
    assert_scalar_eq!(second.sum(), 4.0, comp = abs, tol = 1e-12);

    let slot = problem.mesh().element_index(ElementId(0));
    assert_eq!(problem.material_state().snapshot(slot), vec![2.0]);
}

#[test]
fn failing_material_leaves_stored_state_untouched() {
    let mesh = Mesh::quad_strip(3, SubdomainId(1));
    let mut registry = Registry::new();
    let age = registry.register_property("age");
    registry.add_material(TraversalCounter {
        name: "age_counter",
        property: age,
    });
    registry.add_material(FailingMaterial {
        name: "unstable",
        fail_on: ElementId(1),
    });
    registry.add_kernel(PropertyKernel {
        name: "aged_source",
        property: age,
        declare_property: true,
    });
    let problem = single_var_problem(mesh, registry).with_options(serial());

    let error = problem.compute_residual().unwrap_err();
    let error = error.downcast_ref::<EvaluationError>().unwrap();
    assert_eq!(error.element(), Some(ElementId(1)));

    // The element before the failure swapped back, the failing element kept
    // its old state, everything after it was never visited.
    let slot = |id: u64| problem.mesh().element_index(ElementId(id));
    assert_eq!(problem.material_state().snapshot(slot(0)), vec![1.0]);
    assert_eq!(problem.material_state().snapshot(slot(1)), vec![0.0]);
    assert_eq!(problem.material_state().snapshot(slot(2)), vec![0.0]);

    // The failing element's swap guard was released; the traversal can run
    // again and fail the same way instead of panicking on a held slot.
    let again = problem.compute_residual().unwrap_err();
    let again = again.downcast_ref::<EvaluationError>().unwrap();
    assert_eq!(again.element(), Some(ElementId(1)));
}

/// Two elements on two subdomains, each with its own reader of `v`. The
/// nodal values of `v` average to 2.0 on the first element and 6.0 on the
/// second.
fn cross_read_problem(
    declare_on_second: bool,
) -> (Problem, Arc<Mutex<Vec<f64>>>, Arc<Mutex<Vec<f64>>>) {
    let mut mesh = Mesh::quad_strip(2, SubdomainId(1));
    mesh.set_subdomain(ElementId(1), SubdomainId(2));
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry.add_kernel(CrossReadKernel {
        name: "first_reader",
        declare: true,
        subdomains: Some(vec![SubdomainId(1)]),
        seen: first.clone(),
    });
    registry.add_kernel(CrossReadKernel {
        name: "second_reader",
        declare: declare_on_second,
        subdomains: Some(vec![SubdomainId(2)]),
        seen: second.clone(),
    });
    let mut problem = two_var_problem(mesh, registry);
    let dof_map = problem.system().dof_map();
    let mut solution = DVector::zeros(dof_map.num_dofs());
    for node in 0..6u32 {
        let value = if node < 4 { 2.0 } else { 10.0 };
        solution[dof_map.dof_index(NodeId(node), V)] = value;
    }
    problem.system_mut().set_solution(solution);
    (problem.with_options(serial()), first, second)
}

#[test]
fn undeclared_coupling_reads_stale_local_values() {
    let (problem, declared, undeclared) = cross_read_problem(false);
    problem.compute_residual().unwrap();
    assert_eq!(*declared.lock().unwrap(), vec![2.0]);
    // The second reader never declared `v`, so the gather on its element
    // skipped the slot and it sees the first element's average, not 6.0.
    assert_eq!(*undeclared.lock().unwrap(), vec![2.0]);

    let (problem, _, second) = cross_read_problem(true);
    problem.compute_residual().unwrap();
    assert_eq!(*second.lock().unwrap(), vec![6.0]);
}

#[test]
fn undeclared_property_read_skips_material_evaluation() {
    let mesh = Mesh::quad_strip(2, SubdomainId(1));
    let mut registry = Registry::new();
    let age = registry.register_property("age");
    registry.add_material(TraversalCounter {
        name: "age_counter",
        property: age,
    });
    registry.add_kernel(PropertyKernel {
        name: "aged_source",
        property: age,
        declare_property: false,
    });
    let problem = single_var_problem(mesh, registry).with_options(serial());

    // No active object declares the property, so the material never runs:
    // the kernel reads zeros and the stored state does not advance.
    let residual = problem.compute_residual().unwrap();
    assert_scalar_eq!(residual.sum(), 0.0, comp = abs, tol = 1e-12);
    let slot = problem.mesh().element_index(ElementId(0));
    assert_eq!(problem.material_state().snapshot(slot), vec![0.0]);
}

#[test]
fn kernel_sets_partition_time_and_steady_terms() {
    let mut mesh = Mesh::quad_strip(2, SubdomainId(1));
    mesh.tag_side(ElementId(0), 3, BoundaryId(1));
    let mut registry = Registry::new();
    registry.add_kernel(ReactionKernel {
        name: "reaction",
        rate: 2.0,
        subdomains: None,
    });
    registry.add_kernel(TimeDerivativeKernel { name: "du_dt" });
    registry.add_integrated_bc(FluxBc {
        name: "influx",
        flux: 4.0,
        boundaries: vec![BoundaryId(1)],
        dispatches: Arc::default(),
    });
    let mut problem = single_var_problem(mesh, registry).with_options(serial());
    let num_dofs = problem.system().dof_map().num_dofs();
    problem
        .system_mut()
        .set_solution(DVector::from_element(num_dofs, 3.0));

    let all = problem.compute_residual().unwrap();
    let time = problem.compute_residual_for(KernelSet::Time).unwrap();
    let steady = problem.compute_residual_for(KernelSet::Steady).unwrap();

    // The old solution is still zero, so du/dt contributes 3.0 per element;
    // the time pass carries neither the reaction nor the boundary flux.
    assert_scalar_eq!(time.sum(), 6.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(steady.sum(), 2.0 * 2.0 + 4.0, comp = abs, tol = 1e-12);
    assert_matrix_eq!(&time + &steady, all, comp = abs, tol = 1e-12);
}
