use crate::unit_tests::make_transient_diffusion;
use proptest::prelude::*;
use skarn::coupling::{augment_sparsity, find_implicit_coupling_entries, CouplingGraph};
use skarn::mesh::DofMap;
use skarn::time::TimeScheme;
use nalgebra_sparse::pattern::SparsityPattern;

fn diagonal_pattern(n: usize) -> SparsityPattern {
    SparsityPattern::try_from_offsets_and_indices(n, n, (0..=n).collect(), (0..n).collect())
        .unwrap()
}

#[test]
fn augmentation_is_idempotent() {
    let pattern = diagonal_pattern(6);
    let mut graph = CouplingGraph::new();
    graph.add_coupling(0, 4);
    graph.add_coupling(2, 5);

    let once = augment_sparsity(&pattern, &graph);
    let twice = augment_sparsity(&once, &graph);
    assert_eq!(once, twice);
    assert_eq!(once.nnz(), 6 + 4);
}

#[test]
fn augmentation_never_removes_entries() {
    let pattern = diagonal_pattern(4);
    let mut graph = CouplingGraph::new();
    graph.add_coupling(0, 3);
    let augmented = augment_sparsity(&pattern, &graph);

    for row in 0..4 {
        for col in pattern.lane(row) {
            assert!(augmented.lane(row).contains(col));
        }
    }
    assert!(augmented.lane(0).contains(&3));
    assert!(augmented.lane(3).contains(&0));
}

#[test]
fn node_pairs_couple_all_components() {
    let dof_map = DofMap::new(4, 2);
    let graph = find_implicit_coupling_entries(&[(0, 2)], &dof_map);

    // Node 0 owns DOFs 0, 1; node 2 owns DOFs 4, 5.
    for dof_a in [0, 1] {
        for dof_b in [4, 5] {
            assert!(graph.couplings_of(dof_a).unwrap().contains(&dof_b));
            assert!(graph.couplings_of(dof_b).unwrap().contains(&dof_a));
        }
    }
}

#[test]
fn geometric_coupling_entries_are_gated_by_the_flag() {
    let mut system = make_transient_diffusion(4, TimeScheme::ImplicitEuler);
    system.init().unwrap();
    system.add_geometric_coupling_pairs(&[(0, 4)]);

    // Disabled: the pattern stays topological.
    system.rebuild_sparsity();
    assert!(!system.sparsity_pattern().unwrap().lane(0).contains(&4));

    // Enabled: the pair appears, and rebuilding again changes nothing.
    system.set_add_implicit_geometric_coupling(true);
    system.rebuild_sparsity();
    let first = system.sparsity_pattern().unwrap().clone();
    assert!(first.lane(0).contains(&4));
    system.rebuild_sparsity();
    assert_eq!(system.sparsity_pattern().unwrap(), &first);

    assert!(system.send_list().contains(&0));
    assert!(system.send_list().contains(&4));
}

proptest! {
    #[test]
    fn random_graph_augmentation_is_idempotent(
        pairs in proptest::collection::vec((0usize..12, 0usize..12), 0..30)
    ) {
        let dof_map = DofMap::new(12, 1);
        let pattern = diagonal_pattern(12);
        let graph = find_implicit_coupling_entries(&pairs, &dof_map);

        let once = augment_sparsity(&pattern, &graph);
        let twice = augment_sparsity(&once, &graph);
        prop_assert_eq!(&once, &twice);
        prop_assert!(once.nnz() >= pattern.nnz());
    }
}
