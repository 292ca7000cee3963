//! Nodal kernel dispatch: once per node, activity unions, and coupling
//! declarations.

use super::helpers::{
    fine_grained, serial, single_var_problem, two_var_problem, CoupledNodal, NodalSource,
};
use matrixcompare::assert_scalar_eq;
use nalgebra_sparse::CsrMatrix;
use skoll::mesh::{BoundaryId, ElementId, Mesh, SubdomainId};
use skoll::warehouse::Registry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn entry(csr: &CsrMatrix<f64>, row: usize, col: usize) -> f64 {
    csr.get_entry(row, col)
        .map(|e| e.into_value())
        .unwrap_or(0.0)
}

#[test]
fn unrestricted_kernel_fires_once_per_node() {
    let dispatches = Arc::new(AtomicUsize::new(0));
    let build = |dispatches: &Arc<AtomicUsize>| {
        let mesh = Mesh::quad_strip(3, SubdomainId(1));
        let mut registry = Registry::new();
        registry.add_nodal_kernel(NodalSource {
            name: "source",
            value: 2.5,
            subdomains: None,
            boundaries: None,
            dispatches: dispatches.clone(),
        });
        single_var_problem(mesh, registry)
    };

    let residual = build(&dispatches)
        .with_options(serial())
        .compute_residual()
        .unwrap();
    // Every node exactly once, shared elements notwithstanding.
    assert_eq!(dispatches.load(Ordering::Relaxed), 8);
    for node in 0..8 {
        assert_scalar_eq!(residual[node], 2.5, comp = abs, tol = 1e-12);
    }

    dispatches.store(0, Ordering::Relaxed);
    build(&dispatches)
        .with_options(fine_grained())
        .compute_residual()
        .unwrap();
    assert_eq!(dispatches.load(Ordering::Relaxed), 8);
}

#[test]
fn boundary_restriction_selects_tagged_nodes() {
    let mut mesh = Mesh::quad_strip(3, SubdomainId(1));
    mesh.tag_side(ElementId(0), 3, BoundaryId(2));
    let dispatches = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.add_nodal_kernel(NodalSource {
        name: "clamp",
        value: 1.0,
        subdomains: None,
        boundaries: Some(vec![BoundaryId(2)]),
        dispatches: dispatches.clone(),
    });
    let problem = single_var_problem(mesh, registry).with_options(serial());

    let residual = problem.compute_residual().unwrap();
    // Tagging the left edge of the first element tags its two end nodes.
    assert_eq!(dispatches.load(Ordering::Relaxed), 2);
    assert_scalar_eq!(residual[0], 1.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(residual[1], 1.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(residual.sum(), 2.0, comp = abs, tol = 1e-12);
}

#[test]
fn subdomain_restriction_includes_interface_nodes() {
    let restricted = Arc::new(AtomicUsize::new(0));
    let everywhere = Arc::new(AtomicUsize::new(0));
    let build = |subdomains, dispatches: &Arc<AtomicUsize>| {
        let mut mesh = Mesh::quad_strip(2, SubdomainId(1));
        mesh.set_subdomain(ElementId(1), SubdomainId(2));
        let mut registry = Registry::new();
        registry.add_nodal_kernel(NodalSource {
            name: "source",
            value: 1.0,
            subdomains,
            boundaries: None,
            dispatches: dispatches.clone(),
        });
        single_var_problem(mesh, registry).with_options(serial())
    };

    let residual = build(Some(vec![SubdomainId(1)]), &restricted)
        .compute_residual()
        .unwrap();
    // The interface nodes 2 and 3 belong to elements of both subdomains and
    // count as part of subdomain 1.
    assert_eq!(restricted.load(Ordering::Relaxed), 4);
    for node in 0..4 {
        assert_scalar_eq!(residual[node], 1.0, comp = abs, tol = 1e-12);
    }
    assert_scalar_eq!(residual[4], 0.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(residual[5], 0.0, comp = abs, tol = 1e-12);

    build(None, &everywhere).compute_residual().unwrap();
    assert_eq!(everywhere.load(Ordering::Relaxed), 6);
}

#[test]
fn off_diagonal_entries_need_declared_coupling() {
    let build = |declare_coupling| {
        let mesh = Mesh::quad_strip(1, SubdomainId(1));
        let mut registry = Registry::new();
        registry.add_nodal_kernel(CoupledNodal {
            name: "coupled",
            declare_coupling,
        });
        two_var_problem(mesh, registry).with_options(serial())
    };

    let declared = build(true).compute_jacobian().unwrap();
    for node in 0..4 {
        let u = 2 * node;
        let v = 2 * node + 1;
        assert_scalar_eq!(entry(&declared, u, u), 2.0, comp = abs, tol = 1e-12);
        assert_scalar_eq!(entry(&declared, u, v), 3.0, comp = abs, tol = 1e-12);
        // The kernel acts on u only; the v row stays empty.
        assert_scalar_eq!(entry(&declared, v, v), 0.0, comp = abs, tol = 1e-12);
    }

    // Without the declaration the off-diagonal entry is never requested.
    let undeclared = build(false).compute_jacobian().unwrap();
    assert_scalar_eq!(entry(&undeclared, 0, 0), 2.0, comp = abs, tol = 1e-12);
    assert_scalar_eq!(entry(&undeclared, 0, 1), 0.0, comp = abs, tol = 1e-12);
}
