use crate::unit_tests::make_transient_diffusion;
use nalgebra::DVector;
use skarn::params::Parameters;
use skarn::time::TimeScheme;

#[test]
fn no_dampers_means_unit_factor() {
    let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
    system.init().unwrap();

    let update = DVector::from_element(5, -3.0);
    assert_eq!(system.compute_damping(&update).unwrap(), 1.0);
}

#[test]
fn minimum_proposed_factor_wins() {
    let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
    system
        .add_damper("Constant", "mild", &Parameters::new().with_real("factor", 0.9))
        .unwrap();
    system
        .add_damper("Constant", "strict", &Parameters::new().with_real("factor", 0.4))
        .unwrap();
    system.init().unwrap();

    let update = DVector::zeros(5);
    assert_eq!(system.compute_damping(&update).unwrap(), 0.4);
}

#[test]
fn factors_above_one_are_clamped() {
    let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
    system
        .add_damper("Constant", "eager", &Parameters::new().with_real("factor", 1.7))
        .unwrap();
    system.init().unwrap();

    let update = DVector::zeros(5);
    assert_eq!(system.compute_damping(&update).unwrap(), 1.0);
}

#[test]
fn nonpositive_factors_are_numerical_faults() {
    let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
    system
        .add_damper("Constant", "broken", &Parameters::new().with_real("factor", 0.0))
        .unwrap();
    system.init().unwrap();

    let update = DVector::zeros(5);
    let fault = system.compute_damping(&update).unwrap_err();
    assert_eq!(fault.object, "broken");
}
