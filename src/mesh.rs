//! The narrow mesh query interface consumed by assembly.
//!
//! The mesh data structure itself, its partitioning and its refinement are
//! external concerns. Assembly only needs connectivity, region ids, node
//! coordinates and element measures, which this module's [`MeshQuery`] trait
//! exposes. A small procedural [`IntervalMesh`] is provided for tests,
//! examples and benchmarks.
use crate::Real;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a mesh subdomain (block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubdomainId(pub u32);

/// Identifier of a mesh boundary (sideset/nodeset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BoundaryId(pub u32);

impl fmt::Display for SubdomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subdomain({})", self.0)
    }
}

impl fmt::Display for BoundaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "boundary({})", self.0)
    }
}

/// An interior face between two elements, as needed by DG kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteriorFace {
    pub element: usize,
    pub neighbor: usize,
}

/// Read-only mesh queries needed by assembly.
///
/// Node coordinates are always three-dimensional; lower-dimensional meshes
/// leave the trailing components at zero. Implementations must be cheap to
/// query since assembly calls these per element.
pub trait MeshQuery<T: Real>: Send + Sync {
    fn num_nodes(&self) -> usize;

    fn num_elements(&self) -> usize;

    /// Global node indices of the element, in the element's local order.
    fn element_nodes(&self, element: usize) -> &[usize];

    fn element_subdomain(&self, element: usize) -> SubdomainId;

    /// Volume (or area/length) of the element.
    fn element_measure(&self, element: usize) -> T;

    fn node_coords(&self, node: usize) -> Point3<T>;

    fn subdomains(&self) -> BTreeSet<SubdomainId>;

    fn boundaries(&self) -> BTreeSet<BoundaryId>;

    /// Nodes belonging to the given boundary. Empty for unknown ids.
    fn boundary_nodes(&self, boundary: BoundaryId) -> &[usize];

    /// Interior faces, for DG contributions. Empty when the mesh does not
    /// provide neighbor information.
    fn interior_faces(&self) -> &[InteriorFace];

    /// The element geometrically containing the given point, if any.
    fn element_containing(&self, point: &Point3<T>) -> Option<usize>;
}

/// Node-major degree-of-freedom numbering.
///
/// Field DOFs come first (`solution_dim` components per node), followed by a
/// tail block owned by scalar variables that live off the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DofMap {
    num_nodes: usize,
    solution_dim: usize,
    num_scalar_dofs: usize,
}

impl DofMap {
    pub fn new(num_nodes: usize, solution_dim: usize) -> Self {
        assert!(solution_dim >= 1, "solution dimension must be at least 1");
        Self {
            num_nodes,
            solution_dim,
            num_scalar_dofs: 0,
        }
    }

    /// Appends `count` scalar DOFs to the tail block, returning the offset of
    /// the first appended DOF.
    pub fn allocate_scalar_dofs(&mut self, count: usize) -> usize {
        let offset = self.num_field_dofs() + self.num_scalar_dofs;
        self.num_scalar_dofs += count;
        offset
    }

    pub fn solution_dim(&self) -> usize {
        self.solution_dim
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn node_dof(&self, node: usize, component: usize) -> usize {
        debug_assert!(node < self.num_nodes);
        debug_assert!(component < self.solution_dim);
        self.solution_dim * node + component
    }

    /// The node and component owning a field DOF, or `None` for scalar DOFs.
    pub fn dof_node(&self, dof: usize) -> Option<(usize, usize)> {
        (dof < self.num_field_dofs()).then(|| (dof / self.solution_dim, dof % self.solution_dim))
    }

    pub fn num_field_dofs(&self) -> usize {
        self.solution_dim * self.num_nodes
    }

    pub fn num_scalar_dofs(&self) -> usize {
        self.num_scalar_dofs
    }

    pub fn num_dofs(&self) -> usize {
        self.num_field_dofs() + self.num_scalar_dofs
    }
}

/// A uniform mesh of line elements on `[a, b]`.
///
/// Nodes are numbered left to right. Boundary 0 holds the leftmost node and
/// boundary 1 the rightmost. All elements belong to subdomain 0 unless a
/// per-element assignment is supplied.
#[derive(Debug, Clone)]
pub struct IntervalMesh<T: Real> {
    a: T,
    h: T,
    connectivity: Vec<[usize; 2]>,
    subdomain_ids: Vec<SubdomainId>,
    boundary_nodes: Vec<(BoundaryId, Vec<usize>)>,
    interior_faces: Vec<InteriorFace>,
}

impl<T: Real> IntervalMesh<T> {
    pub fn new(a: T, b: T, num_elements: usize) -> Self {
        assert!(num_elements > 0, "mesh must have at least one element");
        assert!(b > a, "interval must be non-degenerate");
        let h = (b - a) / T::from_usize(num_elements).unwrap();
        let connectivity = (0..num_elements).map(|i| [i, i + 1]).collect();
        let interior_faces = (1..num_elements)
            .map(|i| InteriorFace {
                element: i - 1,
                neighbor: i,
            })
            .collect();
        Self {
            a,
            h,
            connectivity,
            subdomain_ids: vec![SubdomainId(0); num_elements],
            boundary_nodes: vec![
                (BoundaryId(0), vec![0]),
                (BoundaryId(1), vec![num_elements]),
            ],
            interior_faces,
        }
    }

    /// Replaces the per-element subdomain assignment.
    pub fn with_subdomains(mut self, subdomain_ids: Vec<SubdomainId>) -> Self {
        assert_eq!(subdomain_ids.len(), self.connectivity.len());
        self.subdomain_ids = subdomain_ids;
        self
    }

    pub fn num_elements(&self) -> usize {
        self.connectivity.len()
    }
}

impl<T: Real> MeshQuery<T> for IntervalMesh<T> {
    fn num_nodes(&self) -> usize {
        self.connectivity.len() + 1
    }

    fn num_elements(&self) -> usize {
        self.connectivity.len()
    }

    fn element_nodes(&self, element: usize) -> &[usize] {
        &self.connectivity[element]
    }

    fn element_subdomain(&self, element: usize) -> SubdomainId {
        self.subdomain_ids[element]
    }

    fn element_measure(&self, _element: usize) -> T {
        self.h
    }

    fn node_coords(&self, node: usize) -> Point3<T> {
        let x = self.a + T::from_usize(node).unwrap() * self.h;
        Point3::new(x, T::zero(), T::zero())
    }

    fn subdomains(&self) -> BTreeSet<SubdomainId> {
        self.subdomain_ids.iter().copied().collect()
    }

    fn boundaries(&self) -> BTreeSet<BoundaryId> {
        self.boundary_nodes.iter().map(|(id, _)| *id).collect()
    }

    fn boundary_nodes(&self, boundary: BoundaryId) -> &[usize] {
        self.boundary_nodes
            .iter()
            .find(|(id, _)| *id == boundary)
            .map(|(_, nodes)| nodes.as_slice())
            .unwrap_or(&[])
    }

    fn interior_faces(&self) -> &[InteriorFace] {
        &self.interior_faces
    }

    fn element_containing(&self, point: &Point3<T>) -> Option<usize> {
        let num_elements = self.num_elements();
        let b = self.a + self.h * T::from_usize(num_elements).unwrap();
        if point.x < self.a || point.x > b {
            return None;
        }
        let index = ((point.x - self.a) / self.h).floor();
        let index = index.to_usize().unwrap_or(0);
        Some(index.min(num_elements - 1))
    }
}
