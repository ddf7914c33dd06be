use crate::unit_tests::{make_transient_diffusion, tied_constraint_params};
use nalgebra::{DMatrix, DVector};
use skarn::time::TimeScheme;

fn assemble_with_blocks(blocks: &str) -> (DMatrix<f64>, DMatrix<f64>) {
    let assemble = |constraint_blocks: Option<&str>| {
        let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
        if let Some(blocks) = constraint_blocks {
            system
                .add_constraint("TiedValue", "tie", &tied_constraint_params(1, 3, 10.0, blocks))
                .unwrap();
        }
        system.init().unwrap();
        let mut jacobian = system.create_jacobian();
        system.compute_jacobian(&mut jacobian).unwrap();
        DMatrix::from(&jacobian)
    };
    (assemble(None), assemble(Some(blocks)))
}

#[test]
fn all_four_blocks_contribute_when_defined() {
    let (baseline, constrained) = assemble_with_blocks("ss,sm,ms,mm");
    let difference = &constrained - &baseline;

    assert_eq!(difference[(1, 1)], 10.0);
    assert_eq!(difference[(1, 3)], -10.0);
    assert_eq!(difference[(3, 1)], -10.0);
    assert_eq!(difference[(3, 3)], 10.0);
    // Nothing else moves.
    assert!((difference.sum() - 0.0).abs() < 1e-12);
}

#[test]
fn undefined_blocks_leave_entries_at_their_pre_constraint_values() {
    let (baseline, constrained) = assemble_with_blocks("ss");
    let difference = &constrained - &baseline;

    assert_eq!(difference[(1, 1)], 10.0);
    // The three undefined blocks contribute nothing: the cross entries stay
    // at their structural zero and the master diagonal keeps its kernel
    // value.
    assert_eq!(difference[(1, 3)], 0.0);
    assert_eq!(difference[(3, 1)], 0.0);
    assert_eq!(difference[(3, 3)], 0.0);
}

#[test]
fn constraint_pairs_enter_the_sparsity_pattern() {
    let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
    system
        .add_constraint("TiedValue", "tie", &tied_constraint_params(1, 3, 10.0, "ss"))
        .unwrap();
    system.init().unwrap();

    let pattern = system.sparsity_pattern().unwrap();
    // Nodes 1 and 3 are not topologically adjacent on a four-element line,
    // yet the pair injects both cross entries.
    assert!(pattern.lane(1).contains(&3));
    assert!(pattern.lane(3).contains(&1));

    // The coupled DOFs are scheduled for ghost exchange.
    assert!(system.send_list().contains(&1));
    assert!(system.send_list().contains(&3));
}

#[test]
fn constraint_residual_corrections_are_additive() {
    let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
    system
        .add_constraint("TiedValue", "tie", &tied_constraint_params(1, 3, 10.0, "ss,sm,ms,mm"))
        .unwrap();
    system.init().unwrap();

    // A constant field keeps the kernels silent; only the tie responds to
    // the mismatch between slave and master.
    let mut u = DVector::from_element(5, 1.0);
    u[1] = 1.5;
    system.set_solution(&u);

    let mut with_tie = DVector::zeros(5);
    system.compute_residual(&mut with_tie).unwrap();

    // Slave violation: 10 (1.5 - 1.0) = 5, reacted on the master.
    let diffusion_at_1 = (1.5 - 1.0) / 0.25 * 2.0;
    assert!((with_tie[1] - (diffusion_at_1 + 5.0)).abs() < 1e-12);
    assert!((with_tie[3] - (-5.0)).abs() < 1e-12);
}
