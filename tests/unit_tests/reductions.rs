//! Reduction loops: damping factors, user object statistics, and the dof
//! count maximum.

use super::helpers::{
    fine_grained, serial, single_var_problem, two_var_problem, PresetDamper, PresetValueObject,
};
use matrixcompare::assert_scalar_eq;
use nalgebra::DVector;
use rustc_hash::FxHashMap;
use skoll::mesh::{ElementId, Mesh, SubdomainId};
use skoll::physics::EvaluationError;
use skoll::problem::Problem;
use skoll::warehouse::Registry;

fn damped_problem(factors: FxHashMap<ElementId, f64>) -> Problem {
    let mesh = Mesh::quad_strip(5, SubdomainId(1));
    let mut registry = Registry::new();
    registry.add_damper(PresetDamper {
        name: "preset",
        factors,
    });
    single_var_problem(mesh, registry)
}

#[test]
fn damping_folds_the_minimum_factor() {
    let factors: FxHashMap<_, _> = [
        (ElementId(1), 0.4),
        (ElementId(2), 0.9),
        (ElementId(3), 0.4),
    ]
    .into_iter()
    .collect();
    let increment = DVector::from_element(12, 0.1);

    let serial_factor = damped_problem(factors.clone())
        .with_options(serial())
        .compute_damping(&increment)
        .unwrap();
    assert_scalar_eq!(serial_factor, 0.4, comp = abs, tol = 1e-12);

    let parallel_factor = damped_problem(factors)
        .with_options(fine_grained())
        .compute_damping(&increment)
        .unwrap();
    assert_scalar_eq!(parallel_factor, 0.4, comp = abs, tol = 1e-12);
}

#[test]
fn no_damper_means_an_undamped_update() {
    let mesh = Mesh::quad_strip(2, SubdomainId(1));
    let problem = single_var_problem(mesh, Registry::new()).with_options(serial());
    let factor = problem
        .compute_damping(&DVector::from_element(6, 1.0))
        .unwrap();
    assert_scalar_eq!(factor, 1.0, comp = abs, tol = 1e-12);
}

#[test]
fn invalid_damping_factors_are_evaluation_errors() {
    let increment = DVector::from_element(12, 0.1);
    for (bad, needle) in [
        (f64::NAN, "produced a NaN factor"),
        (1.5, "outside (0, 1]"),
        (0.0, "outside (0, 1]"),
    ] {
        let factors: FxHashMap<_, _> = [(ElementId(1), bad)].into_iter().collect();
        let error = damped_problem(factors)
            .with_options(serial())
            .compute_damping(&increment)
            .unwrap_err();
        let error = error.downcast_ref::<EvaluationError>().unwrap();
        assert!(error.to_string().contains(needle), "{error}");
        assert_eq!(error.element(), Some(ElementId(1)));
    }
}

#[test]
fn mismatched_increment_length_is_rejected() {
    let mesh = Mesh::quad_strip(2, SubdomainId(1));
    let problem = single_var_problem(mesh, Registry::new());
    let error = problem.compute_damping(&DVector::zeros(3)).unwrap_err();
    assert!(error.to_string().contains("3 entries for 6 dofs"));
}

#[test]
fn apply_update_scales_the_increment_by_the_factor() {
    let factors: FxHashMap<_, _> = [(ElementId(1), 0.5)].into_iter().collect();
    let mesh = Mesh::quad_strip(2, SubdomainId(1));
    let mut registry = Registry::new();
    registry.add_damper(PresetDamper {
        name: "preset",
        factors,
    });
    let mut problem = single_var_problem(mesh, registry).with_options(serial());

    let factor = problem
        .apply_update(&DVector::from_element(6, 1.0))
        .unwrap();
    assert_scalar_eq!(factor, 0.5, comp = abs, tol = 1e-12);
    for dof in 0..6 {
        assert_scalar_eq!(
            problem.system().solution()[dof],
            0.5,
            comp = abs,
            tol = 1e-12
        );
    }
}

fn preset_object_problem(
    values: FxHashMap<ElementId, f64>,
    subdomains: Option<Vec<SubdomainId>>,
) -> Problem {
    let mesh = Mesh::quad_strip(4, SubdomainId(1));
    let mut registry = Registry::new();
    registry.add_user_object(PresetValueObject {
        name: "probe",
        values,
        subdomains,
    });
    single_var_problem(mesh, registry)
}

#[test]
fn user_object_stats_reduce_over_all_elements() {
    let values: FxHashMap<_, _> = [
        (ElementId(0), 3.0),
        (ElementId(1), -1.0),
        (ElementId(2), 7.0),
        (ElementId(3), 5.0),
    ]
    .into_iter()
    .collect();

    for options in [serial(), fine_grained()] {
        let problem = preset_object_problem(values.clone(), None).with_options(options);
        let stats = problem.execute_user_objects().unwrap();
        assert_eq!(stats.len(), 1);
        let probe = &stats[0];
        assert_scalar_eq!(probe.sum(), 14.0, comp = abs, tol = 1e-12);
        assert_eq!(probe.count(), 4);
        assert_scalar_eq!(probe.mean().unwrap(), 3.5, comp = abs, tol = 1e-12);
        assert_scalar_eq!(probe.min().unwrap(), -1.0, comp = abs, tol = 1e-12);
        assert_scalar_eq!(probe.max().unwrap(), 7.0, comp = abs, tol = 1e-12);
    }
}

#[test]
fn object_active_nowhere_reports_an_empty_reduction() {
    let problem = preset_object_problem(FxHashMap::default(), Some(vec![SubdomainId(9)]))
        .with_options(serial());
    let stats = problem.execute_user_objects().unwrap();
    let probe = &stats[0];
    assert_eq!(probe.count(), 0);
    assert_scalar_eq!(probe.sum(), 0.0, comp = abs, tol = 1e-12);
    assert!(probe.mean().is_none());
    assert!(probe.min().is_none());
    assert!(probe.max().is_none());
}

#[test]
fn nan_user_object_value_is_an_evaluation_error() {
    let values: FxHashMap<_, _> = [(ElementId(1), f64::NAN)].into_iter().collect();
    let problem = preset_object_problem(values, None).with_options(serial());
    let error = problem.execute_user_objects().unwrap_err();
    let error = error.downcast_ref::<EvaluationError>().unwrap();
    assert!(error.to_string().contains("produced NaN"), "{error}");
    assert_eq!(error.element(), Some(ElementId(1)));
}

#[test]
fn max_element_dofs_counts_all_variables() {
    let mesh = Mesh::quad_strip(3, SubdomainId(1));
    let problem = two_var_problem(mesh, Registry::new()).with_options(serial());
    assert_eq!(problem.max_element_dofs().unwrap(), 8);
}
