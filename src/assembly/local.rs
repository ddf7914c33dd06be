//! Element-local data and local-to-global transfer.
use crate::error::NumericalFault;
use crate::mesh::{DofMap, SubdomainId};
use crate::Real;
use nalgebra::{DVector, DVectorView, Point3};
use nalgebra_sparse::{CsrMatrix, SparseEntryMut};

/// Read-only element-local data handed to kernels.
///
/// Local vectors are laid out node-major: entry `solution_dim * i + c` is
/// component `c` at the element's `i`-th node. Kernel output buffers use the
/// same layout.
pub struct ElementContext<'a, T: Real> {
    pub element: usize,
    pub subdomain: SubdomainId,
    /// Global node indices of the element.
    pub nodes: &'a [usize],
    /// Coordinates of the element's nodes.
    pub coords: &'a [Point3<T>],
    /// Element-local current solution.
    pub u: DVectorView<'a, T>,
    /// Element-local solution at the previous time step.
    pub u_old: DVectorView<'a, T>,
    /// Element-local discrete time derivative.
    pub u_dot: DVectorView<'a, T>,
    /// Derivative of the time derivative with respect to the solution.
    pub du_dot_du: T,
    pub time: T,
    /// Volume (or area/length) of the element.
    pub measure: T,
    pub solution_dim: usize,
}

impl<'a, T: Real> ElementContext<'a, T> {
    /// Number of element-local DOFs.
    pub fn num_local_dofs(&self) -> usize {
        self.solution_dim * self.nodes.len()
    }
}

/// Read-only face-local data handed to DG kernels.
///
/// Both sides use the same node-major layout as [`ElementContext`].
pub struct FaceContext<'a, T: Real> {
    pub element: usize,
    pub neighbor: usize,
    pub element_nodes: &'a [usize],
    pub neighbor_nodes: &'a [usize],
    pub element_coords: &'a [Point3<T>],
    pub neighbor_coords: &'a [Point3<T>],
    pub u_element: DVectorView<'a, T>,
    pub u_neighbor: DVectorView<'a, T>,
    pub element_measure: T,
    pub neighbor_measure: T,
    pub time: T,
    pub solution_dim: usize,
}

/// Gathers global solution entries into an element-local vector.
///
/// The local vector is resized to `solution_dim * nodes.len()`.
pub fn gather_global_to_local<T: Real>(
    global: &DVector<T>,
    local: &mut DVector<T>,
    nodes: &[usize],
    dof_map: &DofMap,
) {
    let sdim = dof_map.solution_dim();
    local.resize_vertically_mut(sdim * nodes.len(), T::zero());
    for (local_node, &node) in nodes.iter().enumerate() {
        for comp in 0..sdim {
            local[sdim * local_node + comp] = global[dof_map.node_dof(node, comp)];
        }
    }
}

/// Scatters a scaled element-local vector additively into a global vector.
pub fn scatter_local_to_global<T: Real>(
    local: &DVector<T>,
    global: &mut DVector<T>,
    nodes: &[usize],
    dof_map: &DofMap,
    scale: T,
) {
    let sdim = dof_map.solution_dim();
    debug_assert_eq!(local.len(), sdim * nodes.len());
    for (local_node, &node) in nodes.iter().enumerate() {
        for comp in 0..sdim {
            global[dof_map.node_dof(node, comp)] += scale * local[sdim * local_node + comp];
        }
    }
}

/// Adds a value to an existing entry of a CSR matrix.
///
/// # Panics
///
/// Panics if `(row, col)` is not present in the matrix's sparsity pattern.
/// Assembly only ever writes inside the preallocated pattern; a miss means
/// the pattern was not built for the objects being assembled.
pub fn add_to_csr<T: Real>(matrix: &mut CsrMatrix<T>, row: usize, col: usize, value: T) {
    match matrix.get_entry_mut(row, col) {
        Some(SparseEntryMut::NonZero(entry)) => *entry += value,
        _ => panic!(
            "entry ({}, {}) is not present in the Jacobian sparsity pattern",
            row, col
        ),
    }
}

/// Replaces a row of a CSR matrix with a single diagonal entry.
///
/// Every off-diagonal stored entry of the row is zeroed and the diagonal is
/// set to `diagonal`. Used for nodal boundary condition rows.
pub fn set_csr_row_to_diagonal<T: Real>(matrix: &mut CsrMatrix<T>, row: usize, diagonal: T) {
    let mut csr_row = matrix.row_mut(row);
    let (cols, values) = csr_row.cols_and_values_mut();
    let mut diagonal_found = false;
    for (&col, value) in cols.iter().zip(values.iter_mut()) {
        if col == row {
            *value = diagonal;
            diagonal_found = true;
        } else {
            *value = T::zero();
        }
    }
    assert!(
        diagonal_found,
        "row {} has no diagonal entry in the sparsity pattern",
        row
    );
}

/// Wraps a fault with the element it occurred at, unless the object already
/// recorded a more specific site.
pub fn fault_at_element(fault: NumericalFault, element: usize) -> NumericalFault {
    if matches!(fault.site, crate::error::FaultSite::Unknown) {
        fault.at_element(element)
    } else {
        fault
    }
}
