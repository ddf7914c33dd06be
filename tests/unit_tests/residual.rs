use crate::unit_tests::{dirichlet_params, make_system, make_transient_diffusion};
use nalgebra::DVector;
use skarn::error::{FaultSite, SetupError, SolveError};
use skarn::mesh::{IntervalMesh, SubdomainId};
use skarn::params::{ParameterValue, Parameters};
use skarn::system::{NonlinearSystem, SystemState};
use skarn::time::TimeScheme;
use skarn::coupling::RstarProximitySearch;
use std::sync::Arc;

#[test]
fn spatial_residual_of_linear_solution() {
    // Two elements on [0, 1], h = 1/2, diffusion only. For nodal values
    // (1, 1/2, 0) the interior node is in balance and the right end carries
    // the outflow.
    let mut system = make_transient_diffusion(2, TimeScheme::ImplicitEuler);
    system
        .add_boundary_condition("Dirichlet", "left", &dirichlet_params(0, 1.0))
        .unwrap();
    system.init().unwrap();

    system.set_solution(&DVector::from_column_slice(&[1.0, 0.5, 0.0]));
    let mut residual = DVector::zeros(3);
    system.compute_residual(&mut residual).unwrap();

    assert!((residual[0] - 0.0).abs() < 1e-14, "BC row: u(0) - 1 = 0");
    assert!((residual[1] - 0.0).abs() < 1e-14, "interior node in balance");
    assert!((residual[2] - (-1.0)).abs() < 1e-14);

    // The finalized residual is mirrored into the copy and ghosted forms.
    assert_eq!(system.residual_copy(), &residual);
    assert_eq!(system.residual_ghosted(), &residual);
}

#[test]
fn boundary_condition_replaces_residual_row() {
    let mut system = make_transient_diffusion(2, TimeScheme::ImplicitEuler);
    system
        .add_boundary_condition("Dirichlet", "left", &dirichlet_params(0, 1.0))
        .unwrap();
    system.init().unwrap();

    // Presets write the prescribed value into the solution at init.
    assert_eq!(system.solution().current()[0], 1.0);

    // Violate the condition by hand; the residual row reports the violation
    // instead of the kernel contribution.
    system.set_solution(&DVector::from_column_slice(&[3.0, 0.0, 0.0]));
    let mut residual = DVector::zeros(3);
    system.compute_residual(&mut residual).unwrap();
    assert!((residual[0] - 2.0).abs() < 1e-14);
}

#[test]
fn registration_order_does_not_change_totals() {
    let params_a = Parameters::new().with_real("diffusivity", 0.25);
    let params_b = Parameters::new().with_real("diffusivity", 0.75);
    let u = DVector::from_column_slice(&[1.0, -0.5, 0.25, 2.0, 0.0]);

    let mut residuals = Vec::new();
    for order in [["a", "b"], ["b", "a"]] {
        let mut system = make_system(4, TimeScheme::ImplicitEuler);
        for name in order {
            let params = if name == "a" { &params_a } else { &params_b };
            system.add_kernel("Diffusion", name, params).unwrap();
        }
        system.init().unwrap();
        system.set_solution(&u);
        let mut residual = DVector::zeros(5);
        system.compute_residual(&mut residual).unwrap();
        residuals.push(residual);
    }
    assert!((&residuals[0] - &residuals[1]).norm() < 1e-14);
}

#[test]
fn fault_leaves_residual_zeroed() {
    let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
    system
        .add_kernel("Faulting", "bad", &Parameters::new())
        .unwrap();
    system.init().unwrap();

    system.set_solution(&DVector::from_element(5, 1.0));
    let mut residual = DVector::from_element(5, 42.0);
    let err = system.compute_residual(&mut residual).unwrap_err();
    match err {
        SolveError::Fault(fault) => {
            assert_eq!(fault.object, "bad");
            assert!(matches!(fault.site, FaultSite::Element(_)));
        }
        other => panic!("expected a fault, got {:?}", other),
    }
    assert_eq!(residual, DVector::zeros(5));
}

#[test]
fn dirac_point_source_hits_nearest_element_node() {
    let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
    let params = Parameters::new()
        .set(
            "point",
            ParameterValue::RealVec(vec![0.77, 0.0, 0.0]),
        )
        .with_real("strength", 3.0);
    system.add_dirac_kernel("PointSource", "source", &params).unwrap();
    system.init().unwrap();

    let mut residual = DVector::zeros(5);
    system.compute_residual(&mut residual).unwrap();
    // x = 0.77 lies in the last element [0.75, 1.0], nearest node x = 0.75.
    assert!((residual[3] - (-3.0)).abs() < 1e-14);
    assert_eq!(residual[4], 0.0);
}

#[test]
fn dirac_point_outside_mesh_is_fatal_at_init() {
    let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
    let params = Parameters::new()
        .set("point", ParameterValue::RealVec(vec![2.0, 0.0, 0.0]))
        .with_real("strength", 1.0);
    system.add_dirac_kernel("PointSource", "outside", &params).unwrap();

    let err = system.init().unwrap_err();
    let setup = err.downcast_ref::<SetupError>().unwrap();
    assert!(matches!(
        setup,
        SetupError::DiracPointOutsideMesh { point_index: 0, .. }
    ));
}

#[test]
fn scalar_kernel_contributes_to_tail_block() {
    let mut system = make_transient_diffusion(2, TimeScheme::ImplicitEuler);
    let params = Parameters::new()
        .with_real("rate", 2.0)
        .set("count", ParameterValue::Int(2));
    system.add_scalar_kernel("Decay", "decay", &params).unwrap();
    system.init().unwrap();

    assert_eq!(system.dof_map().num_dofs(), 5);
    let mut u = DVector::zeros(5);
    u[3] = 3.0;
    u[4] = 4.0;
    system.set_solution(&u);

    let mut residual = DVector::zeros(5);
    system.compute_residual(&mut residual).unwrap();
    assert!((residual[3] - 6.0).abs() < 1e-14);
    assert!((residual[4] - 8.0).abs() < 1e-14);
}

#[test]
fn dg_kernel_contributes_to_both_face_sides() {
    let u = DVector::zeros(3);
    let mut with_dg = make_transient_diffusion(2, TimeScheme::ImplicitEuler);
    with_dg.add_dg_kernel("Marker", "marker", &Parameters::new()).unwrap();
    with_dg.init().unwrap();
    with_dg.set_solution(&u);
    let mut residual = DVector::zeros(3);
    with_dg.compute_residual(&mut residual).unwrap();

    // One interior face between the two elements: the element side adds 1 at
    // its first node, the neighbor side adds 2 at its first node.
    assert_eq!(residual[0], 1.0);
    assert_eq!(residual[1], 2.0);
    assert_eq!(residual[2], 0.0);
}

#[test]
fn kernel_coverage_reports_exactly_the_uncovered_subdomains() {
    let mesh = Arc::new(
        IntervalMesh::<f64>::new(0.0, 1.0, 4).with_subdomains(vec![
            SubdomainId(0),
            SubdomainId(0),
            SubdomainId(1),
            SubdomainId(1),
        ]),
    );
    let search = Arc::new(RstarProximitySearch::from_mesh(&*mesh));
    let mut system = NonlinearSystem::new(mesh, search, 1, 2, TimeScheme::ImplicitEuler);
    crate::unit_tests::register_test_objects(system.registry_mut());

    let params = Parameters::new().with_subdomains("blocks", vec![SubdomainId(0)]);
    system.add_kernel("Diffusion", "restricted", &params).unwrap();

    let err = system.init().unwrap_err();
    let setup = err.downcast_ref::<SetupError>().unwrap();
    assert_eq!(
        *setup,
        SetupError::MissingKernelCoverage {
            subdomains: vec![SubdomainId(1)]
        }
    );
}

#[test]
fn unknown_object_type_is_rejected_with_its_name() {
    let mut system = make_system(2, TimeScheme::ImplicitEuler);
    let err = system
        .add_kernel("NoSuchKernel", "k", &Parameters::new())
        .unwrap_err();
    let setup = err.downcast_ref::<SetupError>().unwrap();
    assert_eq!(
        *setup,
        SetupError::UnknownObjectType {
            class: "kernel",
            type_name: "NoSuchKernel".to_string(),
        }
    );
}

#[test]
fn lifecycle_violations_are_fatal() {
    let mut system = make_transient_diffusion(2, TimeScheme::ImplicitEuler);

    // Evaluation before init.
    let mut residual = DVector::zeros(3);
    let err = system.compute_residual(&mut residual).unwrap_err();
    assert!(matches!(
        err,
        SolveError::Setup(SetupError::InvalidState { .. })
    ));

    system.init().unwrap();
    assert_eq!(system.state(), SystemState::Initialized);

    // Registration after init.
    let err = system
        .add_kernel("Diffusion", "late", &Parameters::new())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SetupError>().unwrap(),
        SetupError::InvalidState { .. }
    ));
}

#[test]
fn transient_step_requires_a_time_kernel() {
    let mut system = make_system(2, TimeScheme::ImplicitEuler);
    system.add_kernel("Diffusion", "diff", &Parameters::new()).unwrap();
    system.init().unwrap();
    assert!(!system.contains_time_kernel());

    let err = system.timestep_setup(0.1).unwrap_err();
    assert!(matches!(
        err,
        SolveError::Setup(SetupError::MissingTimeKernel)
    ));
}

#[test]
fn time_residual_blends_with_weights() {
    // Single element, lumped mass h/2 = 1/2 per node. After one implicit
    // Euler step of dt = 0.1, u_dot = (u - u_old)/0.1.
    let mut system = make_transient_diffusion(1, TimeScheme::ImplicitEuler);
    system.init().unwrap();
    system.timestep_setup(0.1).unwrap();

    let u = DVector::from_column_slice(&[0.2, 0.2]);
    system.set_solution(&u);
    let mut residual = DVector::zeros(2);
    system.compute_residual(&mut residual).unwrap();

    // Diffusion vanishes on the constant field; only the mass term remains:
    // (u - u_old)/dt * h/2 = 2 * 0.5 = 1 at both nodes.
    assert!((residual[0] - 1.0).abs() < 1e-12);
    assert!((residual[1] - 1.0).abs() < 1e-12);
}
