//! Implicit geometric coupling.
//!
//! Contact-like physics and finite-difference preconditioning need Jacobian
//! storage for DOF pairs that are geometrically close but not topologically
//! connected, for example across a gap. This module finds such couplings
//! from a proximity search and injects the corresponding structural entries
//! into the sparsity pattern. Augmentation only ever grows the pattern and
//! is idempotent for unchanged search data, so repeated calls within one
//! mesh topology epoch cannot corrupt matrix preallocation.
use crate::mesh::{DofMap, MeshQuery};
use crate::Real;
use nalgebra::Point3;
use nalgebra_sparse::pattern::SparsityPattern;
use rstar::primitives::GeomWithData;
use rstar::{RTree, RTreeNum};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// Nearest-node queries over mesh geometry.
///
/// The search structure is a read-only snapshot; on a displaced mesh it must
/// be rebuilt (and couplings re-found) whenever node positions change.
pub trait ProximitySearch<T: Real>: Send + Sync {
    fn nearest_node(&self, point: &Point3<T>) -> Option<usize>;

    /// Nodes within `radius` of the given point, in ascending node order.
    fn nodes_within(&self, point: &Point3<T>, radius: T) -> Vec<usize>;
}

/// R*-tree backed proximity search over mesh nodes.
pub struct RstarProximitySearch<T: RTreeNum> {
    tree: RTree<GeomWithData<[T; 3], usize>>,
}

impl<T: Real + RTreeNum> RstarProximitySearch<T> {
    pub fn from_mesh(mesh: &dyn MeshQuery<T>) -> Self {
        let nodes = (0..mesh.num_nodes())
            .map(|node| {
                let p = mesh.node_coords(node);
                GeomWithData::new([p.x, p.y, p.z], node)
            })
            .collect();
        Self {
            tree: RTree::bulk_load(nodes),
        }
    }
}

impl<T: Real + RTreeNum> ProximitySearch<T> for RstarProximitySearch<T> {
    fn nearest_node(&self, point: &Point3<T>) -> Option<usize> {
        self.tree
            .nearest_neighbor(&[point.x, point.y, point.z])
            .map(|entry| entry.data)
    }

    fn nodes_within(&self, point: &Point3<T>, radius: T) -> Vec<usize> {
        let mut nodes: Vec<_> = self
            .tree
            .locate_within_distance([point.x, point.y, point.z], radius * radius)
            .map(|entry| entry.data)
            .collect();
        nodes.sort_unstable();
        nodes
    }
}

/// Symmetric adjacency of implicitly coupled DOFs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CouplingGraph {
    edges: FxHashMap<usize, BTreeSet<usize>>,
}

impl CouplingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a coupling between two DOFs in both directions.
    pub fn add_coupling(&mut self, dof_i: usize, dof_j: usize) {
        if dof_i == dof_j {
            return;
        }
        self.edges.entry(dof_i).or_default().insert(dof_j);
        self.edges.entry(dof_j).or_default().insert(dof_i);
    }

    pub fn couplings_of(&self, dof: usize) -> Option<&BTreeSet<usize>> {
        self.edges.get(&dof)
    }

    /// DOFs with at least one coupling, in ascending order.
    pub fn dofs(&self) -> Vec<usize> {
        let mut dofs: Vec<_> = self.edges.keys().copied().collect();
        dofs.sort_unstable();
        dofs
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.values().map(|set| set.len()).sum()
    }

    pub fn merge(&mut self, other: &CouplingGraph) {
        for (&dof, targets) in &other.edges {
            self.edges.entry(dof).or_default().extend(targets);
        }
    }
}

/// Builds the coupling graph induced by geometrically related node pairs.
///
/// Every solution component of one node is coupled to every component of
/// the other, in both directions.
pub fn find_implicit_coupling_entries(
    node_pairs: &[(usize, usize)],
    dof_map: &DofMap,
) -> CouplingGraph {
    let mut graph = CouplingGraph::new();
    let sdim = dof_map.solution_dim();
    for &(node_a, node_b) in node_pairs {
        for comp_a in 0..sdim {
            for comp_b in 0..sdim {
                graph.add_coupling(
                    dof_map.node_dof(node_a, comp_a),
                    dof_map.node_dof(node_b, comp_b),
                );
            }
        }
    }
    graph
}

/// Returns the union of the pattern with the coupling graph's entries.
///
/// Entries already present are kept, so the result never shrinks and the
/// operation is idempotent for a fixed graph.
pub fn augment_sparsity(pattern: &SparsityPattern, graph: &CouplingGraph) -> SparsityPattern {
    let num_rows = pattern.major_dim();
    let mut offsets = Vec::with_capacity(num_rows + 1);
    let mut indices = Vec::with_capacity(pattern.nnz() + graph.num_edges());
    let mut row_union = BTreeSet::new();

    offsets.push(0);
    for row in 0..num_rows {
        row_union.clear();
        row_union.extend(pattern.lane(row).iter().copied());
        if let Some(couplings) = graph.couplings_of(row) {
            row_union.extend(couplings.iter().copied());
        }
        indices.extend(row_union.iter().copied());
        offsets.push(indices.len());
    }

    SparsityPattern::try_from_offsets_and_indices(num_rows, pattern.minor_dim(), offsets, indices)
        .expect("Internal error: row-wise union of valid patterns must be valid")
}
