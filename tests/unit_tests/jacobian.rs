use crate::unit_tests::{dirichlet_params, make_transient_diffusion};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use skarn::params::Parameters;
use skarn::time::TimeScheme;

#[test]
fn implicit_euler_jacobian_combines_stiffness_and_mass() {
    // Two elements, h = 1/2, k/h = 2, lumped mass h/2 = 1/4, dt = 1/10.
    let mut system = make_transient_diffusion(2, TimeScheme::ImplicitEuler);
    system.init().unwrap();
    system.timestep_setup(0.1).unwrap();

    let mut jacobian = system.create_jacobian();
    system.compute_jacobian(&mut jacobian).unwrap();

    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(3, 3, &[
        2.0 + 2.5, -2.0, 0.0,
        -2.0, 4.0 + 5.0, -2.0,
        0.0, -2.0, 2.0 + 2.5,
    ]);
    assert_matrix_eq!(DMatrix::from(&jacobian), expected, comp = abs, tol = 1e-12);
}

#[test]
fn boundary_condition_replaces_jacobian_row_with_diagonal() {
    let mut system = make_transient_diffusion(2, TimeScheme::ImplicitEuler);
    system
        .add_boundary_condition("Dirichlet", "left", &dirichlet_params(0, 1.0))
        .unwrap();
    system.init().unwrap();

    let mut jacobian = system.create_jacobian();
    system.compute_jacobian(&mut jacobian).unwrap();
    let dense = DMatrix::from(&jacobian);

    assert_eq!(dense[(0, 0)], 1.0);
    assert_eq!(dense[(0, 1)], 0.0);
    // Other rows keep their stiffness entries.
    assert_eq!(dense[(1, 0)], -2.0);
}

#[test]
fn explicit_euler_jacobian_is_mass_only() {
    let mut system = make_transient_diffusion(4, TimeScheme::ExplicitEuler);
    system.init().unwrap();
    system.timestep_setup(0.1).unwrap();

    let mut jacobian = system.create_jacobian();
    system.compute_jacobian(&mut jacobian).unwrap();
    let dense = DMatrix::from(&jacobian);

    // h = 1/4, lumped mass h/2 = 1/8, du_dot/du = 10.
    for i in 0..5 {
        let mass = if i == 0 || i == 4 { 1.25 } else { 2.5 };
        assert!((dense[(i, i)] - mass).abs() < 1e-12);
        for j in 0..5 {
            if i != j {
                assert_eq!(dense[(i, j)], 0.0, "({}, {}) must carry no stiffness", i, j);
            }
        }
    }
}

#[test]
fn finite_differenced_jacobian_matches_analytic_one() {
    let build = |fd: bool| {
        let mut system = make_transient_diffusion(3, TimeScheme::ImplicitEuler);
        system
            .add_boundary_condition("Dirichlet", "left", &dirichlet_params(0, 1.0))
            .unwrap();
        system.use_finite_differenced_jacobian(fd);
        system.init().unwrap();
        system.timestep_setup(0.1).unwrap();
        system.set_solution(&DVector::from_column_slice(&[1.0, 0.6, 0.3, 0.1]));
        let mut jacobian = system.create_jacobian();
        system.compute_jacobian(&mut jacobian).unwrap();
        DMatrix::from(&jacobian)
    };

    let analytic = build(false);
    let fd = build(true);
    assert_matrix_eq!(fd, analytic, comp = abs, tol = 1e-5);
}

#[test]
fn dg_jacobian_blocks_land_on_their_dof_pairs() {
    let u = DVector::zeros(3);

    let assemble = |with_dg: bool| {
        let mut system = make_transient_diffusion(2, TimeScheme::ImplicitEuler);
        if with_dg {
            system
                .add_dg_kernel("Marker", "marker", &Parameters::new())
                .unwrap();
        }
        system.init().unwrap();
        system.set_solution(&u);
        let mut jacobian = system.create_jacobian();
        system.compute_jacobian(&mut jacobian).unwrap();
        DMatrix::from(&jacobian)
    };

    let baseline = assemble(false);
    let with_dg = assemble(true);
    let difference = &with_dg - &baseline;

    // Face (element 0, neighbor 1): element nodes (0, 1), neighbor (1, 2).
    // The marker writes block values 1..4 at each block's first local pair.
    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(3, 3, &[
        1.0, 2.0, 0.0,
        3.0, 4.0, 0.0,
        0.0, 0.0, 0.0,
    ]);
    assert_matrix_eq!(difference, expected, comp = abs, tol = 1e-14);
}

#[test]
fn scalar_kernel_jacobian_fills_its_diagonal_block() {
    let mut system = make_transient_diffusion(2, TimeScheme::ImplicitEuler);
    let params = Parameters::new()
        .with_real("rate", 2.0)
        .set("count", skarn::params::ParameterValue::Int(2));
    system.add_scalar_kernel("Decay", "decay", &params).unwrap();
    system.init().unwrap();

    let mut jacobian = system.create_jacobian();
    system.compute_jacobian(&mut jacobian).unwrap();
    let dense = DMatrix::from(&jacobian);

    assert_eq!(dense[(3, 3)], 2.0);
    assert_eq!(dense[(4, 4)], 2.0);
    assert_eq!(dense[(3, 4)], 0.0);
    assert_eq!(dense[(3, 0)], 0.0);
}
